use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use libvaultline::{ClientError, ClientState};
use vaultline_core::transport::{read_message, write_request};
use vaultline_core::{Codec, ProtocolError, Request};
use vaultline_services::ProtocolEvent;

use crate::*;

// ── CorruptingProxy ───────────────────────────────────────────────────────────

/// Frame-aware TCP proxy between client and server. While `corrupt_left`
/// is positive it flips the first data byte of every `SendFile` chunk; each
/// final chunk it corrupts uses up one attempt. Responses pass through
/// untouched. The proxy task is aborted on drop.
pub struct CorruptingProxy {
    pub addr: SocketAddr,
    corrupt_left: Arc<AtomicU32>,
    task: JoinHandle<()>,
}

impl CorruptingProxy {
    pub async fn start(upstream: SocketAddr, corrupt_attempts: u32) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let corrupt_left = Arc::new(AtomicU32::new(corrupt_attempts));

        let left = corrupt_left.clone();
        let task = tokio::spawn(async move {
            while let Ok((downstream, _)) = listener.accept().await {
                let left = left.clone();
                tokio::spawn(async move {
                    if let Ok(upstream) = TcpStream::connect(upstream).await {
                        relay(downstream, upstream, left).await;
                    }
                });
            }
        });

        Ok(Self {
            addr,
            corrupt_left,
            task,
        })
    }

    pub fn remaining(&self) -> u32 {
        self.corrupt_left.load(Ordering::SeqCst)
    }
}

impl Drop for CorruptingProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn relay(downstream: TcpStream, upstream: TcpStream, left: Arc<AtomicU32>) {
    let (mut client_rx, mut client_tx) = downstream.into_split();
    let (mut server_rx, mut server_tx) = upstream.into_split();

    let back = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut server_rx, &mut client_tx).await;
    });

    let codec = Codec::default();
    while let Ok(msg) = read_message(&mut client_rx, &codec).await {
        let Ok(mut request) = Request::from_message(&msg) else {
            break;
        };
        if let Request::SendFile(chunk) = &mut request {
            if left.load(Ordering::SeqCst) > 0 && !chunk.data.is_empty() {
                let mut data = chunk.data.to_vec();
                data[0] ^= 0xFF;
                chunk.data = data.into();
                if chunk.is_final() {
                    left.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        if write_request(&mut server_tx, &codec, &request).await.is_err() {
            break;
        }
    }
    drop(server_tx);
    let _ = back.await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_corruptions_then_commit() {
    let server = TestServer::start("fault-retry").await.unwrap();
    let proxy = CorruptingProxy::start(server.addr, 2).await.unwrap();
    let data = payload(10_000, 9);

    let mut c = client(proxy.addr, "frank").await.unwrap();
    let report = c.run("flaky.bin", &data).await.unwrap();

    assert_eq!(report.attempts, 3);
    assert_eq!(proxy.remaining(), 0);
    assert_eq!(server.committed(&report.client_id, "flaky.bin").unwrap(), data);
    assert_eq!(
        server
            .events
            .count(|e| matches!(e, ProtocolEvent::ChecksumReported { .. })),
        3
    );
}

#[tokio::test]
async fn test_three_corruptions_abort_without_commit() {
    let server = TestServer::start("fault-abort").await.unwrap();
    let proxy = CorruptingProxy::start(server.addr, 3).await.unwrap();

    let mut c = client(proxy.addr, "grace").await.unwrap();
    let id = c.connect().await.unwrap();
    let err = c
        .send_file("doomed.bin", &payload(5_000, 1))
        .await
        .unwrap_err();

    match err {
        ClientError::TransferFailed { attempts, source } => {
            assert_eq!(attempts, 3);
            assert!(matches!(
                source,
                ProtocolError::IntegrityMismatch { attempt: 3, .. }
            ));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(c.state(), ClientState::Aborted);

    assert!(server.committed(&id, "doomed.bin").is_none());
    assert!(!server
        .store
        .path_for(&id, "doomed.bin.part")
        .exists());
    assert_eq!(server.store.pending_count(), 0);
    assert!(server.dispatcher.transfers().is_empty());
    assert_eq!(
        server
            .events
            .count(|e| matches!(e, ProtocolEvent::TransferAborted { .. })),
        1
    );
}

#[tokio::test]
async fn test_corruption_on_one_client_does_not_affect_another() {
    let server = TestServer::start("fault-isolation").await.unwrap();
    let proxy = CorruptingProxy::start(server.addr, 3).await.unwrap();

    let mut bad = client(proxy.addr, "mallory").await.unwrap();
    let mut good = client(server.addr, "heidi").await.unwrap();
    let data = payload(20_000, 4);
    let bad_data = payload(20_000, 5);

    let (bad_result, good_result) = tokio::join!(
        bad.run("shared.bin", &bad_data),
        good.run("shared.bin", &data)
    );

    assert!(matches!(
        bad_result,
        Err(ClientError::TransferFailed { attempts: 3, .. })
    ));
    let report = good_result.unwrap();
    assert_eq!(report.attempts, 1);
    assert_eq!(server.committed(&report.client_id, "shared.bin").unwrap(), data);
}
