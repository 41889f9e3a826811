use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use libvaultline::{ClientError, ClientState, CryptoContext};
use vaultline_core::crypto::RsaKeypair;
use vaultline_core::transport::{read_message, write_request};
use vaultline_core::{ClientId, Codec, ErrorCode, FileChunk, Request, Response};
use vaultline_services::ProtocolEvent;

use crate::*;

#[tokio::test]
async fn test_register_and_key_exchange() {
    let server = TestServer::start("register").await.unwrap();
    let mut c = client(server.addr, "alice").await.unwrap();

    let id = c.connect().await.unwrap();
    let session = server.dispatcher.registry().lookup(&id).unwrap();
    assert_eq!(session.username, "alice");
    assert!(session.rsa_public_key.is_some());
    assert_eq!(session.aes_key.as_ref(), c.crypto().session_key());
}

#[tokio::test]
async fn test_small_file_committed_first_try() {
    let server = TestServer::start("small").await.unwrap();
    let mut c = client(server.addr, "alice").await.unwrap();

    let report = c.run("notes.txt", b"0123456789").await.unwrap();
    assert_eq!(report.attempts, 1);
    assert_eq!(report.ciphertext_size, 16);
    assert_eq!(c.state(), ClientState::Done);

    assert_eq!(
        server.committed(&report.client_id, "notes.txt").unwrap(),
        b"0123456789"
    );
    let meta = server.store.path_for(&report.client_id, "notes.txt.meta.json");
    assert!(meta.exists(), "sidecar missing at {}", meta.display());
    assert_eq!(
        server
            .events
            .count(|e| matches!(e, ProtocolEvent::FileCommitted { .. })),
        1
    );
}

#[tokio::test]
async fn test_empty_file_round_trips() {
    let server = TestServer::start("empty").await.unwrap();
    let mut c = client(server.addr, "alice").await.unwrap();

    let report = c.run("empty", b"").await.unwrap();
    assert_eq!(report.ciphertext_size, 16);
    assert_eq!(server.committed(&report.client_id, "empty").unwrap(), b"");
}

#[tokio::test]
async fn test_multi_chunk_file_in_subdirectory() {
    let server = TestServer::start("multi").await.unwrap();
    let mut c = client(server.addr, "alice").await.unwrap();
    let data = payload(300 * 1024 + 7, 3);

    let report = c.run("photos/2024/big.bin", &data).await.unwrap();
    assert_eq!(report.plaintext_size, data.len() as u64);
    assert_eq!(
        server.committed(&report.client_id, "photos/2024/big.bin").unwrap(),
        data
    );
    assert_eq!(server.store.pending_count(), 0);
    assert!(server.dispatcher.transfers().is_empty());
}

#[tokio::test]
async fn test_concurrent_clients_are_isolated() {
    let server = TestServer::start("concurrent").await.unwrap();
    let addr = server.addr;

    let tasks: Vec<_> = (0..4u8)
        .map(|n| {
            tokio::spawn(async move {
                let mut c = client(addr, &format!("user{n}")).await.unwrap();
                let data = payload(40_000 + n as usize * 1000, n);
                let report = c.run("same-name.bin", &data).await.unwrap();
                (report.client_id, data)
            })
        })
        .collect();

    let mut ids = Vec::new();
    for task in tasks {
        let (id, data) = task.await.unwrap();
        assert_eq!(server.committed(&id, "same-name.bin").unwrap(), data);
        ids.push(id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert_eq!(server.dispatcher.registry().len(), 4);
}

#[tokio::test]
async fn test_duplicate_username_refused() {
    let server = TestServer::start("dupe").await.unwrap();

    let mut first = client(server.addr, "carol").await.unwrap();
    first.connect().await.unwrap();

    let mut second = client(server.addr, "carol").await.unwrap();
    assert!(matches!(
        second.connect().await,
        Err(ClientError::RegistrationRefused(name)) if name == "carol"
    ));
    assert_eq!(server.dispatcher.registry().len(), 1);
}

#[tokio::test]
async fn test_reconnect_with_saved_identity() {
    let server = TestServer::start("reconnect").await.unwrap();

    let keypair = RsaKeypair::generate().unwrap();
    let der = keypair.private_der().unwrap();

    let mut first = client_with(
        server.addr,
        CryptoContext::from_keypair(keypair),
        options("dave"),
    )
    .await
    .unwrap();
    let id = first.connect().await.unwrap();
    drop(first);

    let restored = RsaKeypair::from_private_der(&der).unwrap();
    let mut second = client_with(
        server.addr,
        CryptoContext::from_keypair(restored),
        options("dave"),
    )
    .await
    .unwrap()
    .with_client_id(id);

    let report = second.run("after-reconnect.txt", b"still me").await.unwrap();
    assert_eq!(report.client_id, id);
    assert_eq!(
        server.committed(&id, "after-reconnect.txt").unwrap(),
        b"still me"
    );
    assert_eq!(
        server
            .events
            .count(|e| matches!(e, ProtocolEvent::ClientReconnected { .. })),
        1
    );
    assert_eq!(
        server
            .events
            .count(|e| matches!(e, ProtocolEvent::ClientRegistered { .. })),
        1
    );
}

#[tokio::test]
async fn test_reconnect_unknown_id_registers_afresh() {
    let server = TestServer::start("reconnect-unknown").await.unwrap();
    let stale = ClientId([0xEE; 16]);

    let mut c = client(server.addr, "erin").await.unwrap().with_client_id(stale);
    let id = c.connect().await.unwrap();
    assert_ne!(id, stale);
    assert!(server.dispatcher.registry().contains(&id));
}

#[tokio::test]
async fn test_chunk_before_registration_is_rejected() {
    let server = TestServer::start("unbound").await.unwrap();
    let codec = Codec::default();
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let chunk = FileChunk {
        client_id: ClientId([1; 16]),
        content_size: 16,
        orig_size: 3,
        packet_number: 1,
        total_packets: 1,
        filename: "x".into(),
        data: vec![0u8; 16].into(),
    };
    write_request(&mut stream, &codec, &Request::SendFile(chunk))
        .await
        .unwrap();

    let msg = read_message(&mut stream, &codec).await.unwrap();
    match Response::from_message(&msg).unwrap() {
        Response::GeneralError { code, .. } => assert_eq!(code, ErrorCode::Violation),
        other => panic!("unexpected {other:?}"),
    }
    // Violations close the connection.
    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_idle_connection_is_reclaimed() {
    let server = TestServer::start_with("idle", |c| c.server.idle_timeout_secs = 1)
        .await
        .unwrap();
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("server should close an idle connection");
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_connection_limit_refuses_excess() {
    let server = TestServer::start_with("limit", |c| c.server.max_connections = 1)
        .await
        .unwrap();

    let mut held = client(server.addr, "first").await.unwrap();
    held.connect().await.unwrap();

    let mut refused = client(server.addr, "second").await.unwrap();
    assert!(refused.connect().await.is_err());
    assert_eq!(refused.state(), ClientState::Aborted);

    // The held connection is unaffected.
    held.send_file("ok.txt", b"fine").await.unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let server = TestServer::start("shutdown").await.unwrap();
    let addr = server.addr;
    server.stop().await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(addr)).await;
    assert!(matches!(outcome, Ok(Err(_))), "listener still accepting");
}
