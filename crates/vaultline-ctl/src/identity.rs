//! Persistent client identity: the server-issued id and the RSA key pair.
//!
//! Stored as JSON with hex-encoded fields so a later run can `Reconnect`
//! instead of registering again.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use vaultline_core::crypto::RsaKeypair;
use vaultline_core::ClientId;

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    username: String,
    client_id: String,
    /// PKCS#8 DER, hex.
    private_key: String,
}

pub struct Identity {
    pub username: String,
    pub client_id: ClientId,
    pub keypair: RsaKeypair,
}

/// `Ok(None)` when no identity has been saved yet.
pub fn load(path: &Path) -> Result<Option<Identity>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    let file: IdentityFile = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a valid identity file", path.display()))?;

    let client_id = ClientId::from_hex(&file.client_id).context("bad client_id in identity")?;
    let der = hex::decode(&file.private_key).context("bad private_key hex in identity")?;
    let keypair = RsaKeypair::from_private_der(&der).context("bad private key in identity")?;

    Ok(Some(Identity {
        username: file.username,
        client_id,
        keypair,
    }))
}

/// Write the identity atomically (temp file + rename), owner-only on unix.
pub fn save(path: &Path, username: &str, client_id: ClientId, keypair: &RsaKeypair) -> Result<()> {
    let der = keypair.private_der()?;
    let file = IdentityFile {
        username: username.to_string(),
        client_id: client_id.to_hex(),
        private_key: hex::encode(der.as_slice()),
    };
    let json = serde_json::to_string_pretty(&file)?;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, path).with_context(|| format!("failed to write {}", path.display()))?;
    tracing::debug!(path = %path.display(), client = %client_id, "identity saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vaultline-ctl-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn missing_file_is_none() {
        let dir = scratch("missing");
        assert!(load(&dir.join("identity.json")).unwrap().is_none());
    }

    #[test]
    fn saved_identity_loads_back() {
        let dir = scratch("saved");
        let path = dir.join("nested").join("identity.json");
        let keypair = RsaKeypair::generate().unwrap();
        let id = ClientId([0xAB; 16]);

        save(&path, "bob", id, &keypair).unwrap();
        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.username, "bob");
        assert_eq!(loaded.client_id, id);
        assert_eq!(loaded.keypair.public_der().unwrap(), keypair.public_der().unwrap());
        assert!(!path.with_extension("json.tmp").exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = scratch("corrupt");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("identity.json");
        std::fs::write(&path, "{\"username\":\"x\"}").unwrap();
        assert!(load(&path).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
