//! Per-connection request/response loop.
//!
//! Reads one frame, dispatches it, writes exactly one response. Reads and
//! writes are both bounded by the idle timeout. A connection-fatal error is answered with a
//! best-effort `GeneralError` and the connection is closed; other
//! connections are never affected.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use vaultline_core::message::{Request, Response};
use vaultline_core::transport::{read_message, write_response};
use vaultline_core::{Codec, ProtocolError, TransportError};

use crate::dispatch::{ConnectionState, Dispatcher};

pub struct Connection<S> {
    stream: S,
    state: ConnectionState,
    dispatcher: Arc<Dispatcher>,
    codec: Codec,
    idle_timeout: Duration,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        codec: Codec,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            stream,
            state: ConnectionState::new(peer),
            dispatcher,
            codec,
            idle_timeout,
        }
    }

    /// Serve until the peer hangs up, goes idle, or breaks the protocol.
    /// Cleanup runs on every exit path.
    pub async fn run(mut self) -> Result<(), ProtocolError> {
        tracing::debug!(peer = %self.state.peer, "connection opened");
        let result = self.serve().await;
        self.dispatcher
            .connection_closed(&self.state, result.as_ref().err());
        result
    }

    async fn serve(&mut self) -> Result<(), ProtocolError> {
        loop {
            let msg = match tokio::time::timeout(
                self.idle_timeout,
                read_message(&mut self.stream, &self.codec),
            )
            .await
            {
                Err(_) => return Err(TransportError::Timeout(self.idle_timeout).into()),
                Ok(Err(ProtocolError::Transport(TransportError::Closed))) => return Ok(()),
                Ok(Err(e)) => return self.fail(e).await,
                Ok(Ok(msg)) => msg,
            };

            tracing::trace!(peer = %self.state.peer, opcode = ?msg.opcode, len = msg.payload_length(), "request");

            let response = match Request::from_message(&msg)
                .and_then(|req| self.dispatcher.handle(&mut self.state, req))
            {
                Ok(response) => response,
                Err(e) if e.is_connection_fatal() => return self.fail(e).await,
                Err(e) => Response::from_error(&e),
            };

            self.send(&response).await?;
        }
    }

    /// A peer that stops reading is treated like one that stops writing.
    async fn send(&mut self, response: &Response) -> Result<(), ProtocolError> {
        tokio::time::timeout(
            self.idle_timeout,
            write_response(&mut self.stream, &self.codec, response),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.idle_timeout))?
    }

    /// Tell the peer why, then give up on the connection.
    async fn fail(&mut self, err: ProtocolError) -> Result<(), ProtocolError> {
        if !matches!(err, ProtocolError::Transport(_)) {
            let notice = Response::from_error(&err);
            if let Err(e) = self.send(&notice).await {
                tracing::debug!(peer = %self.state.peer, error = %e, "could not deliver error notice");
            }
        }
        Err(err)
    }
}
