//! Client registry: per-client identity and negotiated key material.
//!
//! Sharded concurrent maps, no global lock. Entries are locked one at a
//! time and never across an `.await`. When both maps are touched, the
//! username index is always locked before the session map.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use vaultline_core::crypto::{AesKey, RsaPublicKey};
use vaultline_core::message::{ClientId, MAX_NAME_LEN};

/// Server-side record of one registered client.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub client_id: ClientId,
    pub username: String,
    /// Set by the first successful `SendPublicKey`.
    pub rsa_public_key: Option<RsaPublicKey>,
    /// Replaced wholesale by every key exchange or reconnect.
    pub aes_key: Option<AesKey>,
    pub registered_at: SystemTime,
    pub last_active: Instant,
}

impl ClientSession {
    fn new(client_id: ClientId, username: String) -> Self {
        Self {
            client_id,
            username,
            rsa_public_key: None,
            aes_key: None,
            registered_at: SystemTime::now(),
            last_active: Instant::now(),
        }
    }

    /// Key exchange has completed at least once.
    pub fn has_session_key(&self) -> bool {
        self.aes_key.is_some()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown client {0}")]
    NotFound(ClientId),

    #[error("username {0:?} is already registered")]
    UsernameTaken(String),

    #[error("invalid username: {0}")]
    InvalidUsername(&'static str),
}

/// Cheap to clone; all clones share the same tables.
#[derive(Clone)]
pub struct ClientRegistry {
    sessions: Arc<DashMap<ClientId, ClientSession>>,
    usernames: Arc<DashMap<String, ClientId>>,
    unique_usernames: bool,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ClientRegistry {
    pub fn new(unique_usernames: bool) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            usernames: Arc::new(DashMap::new()),
            unique_usernames,
        }
    }

    /// Create a session for `username` and return its fresh id.
    ///
    /// With `unique_usernames` a taken name is refused; otherwise every call
    /// yields a distinct session.
    pub fn register(&self, username: &str) -> Result<ClientId, RegistryError> {
        validate_username(username)?;

        if !self.unique_usernames {
            let id = self.insert_fresh(username);
            tracing::debug!(client = %id, username, "client registered");
            return Ok(id);
        }

        match self.usernames.entry(username.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::UsernameTaken(username.to_string())),
            Entry::Vacant(slot) => {
                let id = self.insert_fresh(username);
                slot.insert(id);
                tracing::debug!(client = %id, username, "client registered");
                Ok(id)
            }
        }
    }

    fn insert_fresh(&self, username: &str) -> ClientId {
        loop {
            let id = ClientId::generate();
            if let Entry::Vacant(slot) = self.sessions.entry(id) {
                slot.insert(ClientSession::new(id, username.to_string()));
                return id;
            }
        }
    }

    pub fn store_public_key(&self, id: &ClientId, key: RsaPublicKey) -> Result<(), RegistryError> {
        let mut session = self.sessions.get_mut(id).ok_or(RegistryError::NotFound(*id))?;
        session.rsa_public_key = Some(key);
        session.last_active = Instant::now();
        Ok(())
    }

    /// Install a session key, overwriting any previous key entirely.
    pub fn store_aes_key(&self, id: &ClientId, key: AesKey) -> Result<(), RegistryError> {
        let mut session = self.sessions.get_mut(id).ok_or(RegistryError::NotFound(*id))?;
        session.aes_key = Some(key);
        session.last_active = Instant::now();
        Ok(())
    }

    /// Snapshot of a client's session.
    pub fn lookup(&self, id: &ClientId) -> Result<ClientSession, RegistryError> {
        self.sessions
            .get(id)
            .map(|s| s.clone())
            .ok_or(RegistryError::NotFound(*id))
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Mark activity. Returns false for an unknown client.
    pub fn touch(&self, id: &ClientId) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut s) => {
                s.last_active = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove sessions idle for longer than `max_idle`. Returns the removed ids.
    pub fn sweep_idle(&self, max_idle: Duration) -> Vec<ClientId> {
        let mut expired = Vec::new();
        self.sessions.retain(|id, session| {
            let keep = session.last_active.elapsed() <= max_idle;
            if !keep {
                expired.push((*id, session.username.clone()));
            }
            keep
        });

        // Index cleanup happens after `retain` has released the session shards.
        for (id, username) in &expired {
            self.usernames.remove_if(username, |_, owner| owner == id);
            tracing::info!(client = %id, username = %username, "idle session swept");
        }
        expired.into_iter().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn validate_username(username: &str) -> Result<(), RegistryError> {
    if username.is_empty() {
        return Err(RegistryError::InvalidUsername("empty"));
    }
    if username.len() > MAX_NAME_LEN {
        return Err(RegistryError::InvalidUsername("longer than 255 bytes"));
    }
    if username.chars().any(char::is_control) {
        return Err(RegistryError::InvalidUsername("contains control characters"));
    }
    Ok(())
}
