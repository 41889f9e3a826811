//! Async frame I/O over any byte stream.
//!
//! The header is read and validated first; the payload buffer is only
//! allocated once the declared length has passed the codec's bound.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, TransportError};
use crate::message::{Request, Response};
use crate::wire::{Codec, Message, Opcode, HEADER_LEN};

/// Read one frame. A clean EOF before the first header byte is
/// [`TransportError::Closed`]; EOF mid-frame is an I/O error.
pub async fn read_message<R>(reader: &mut R, codec: &Codec) -> Result<Message, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let first = reader.read(&mut header[..1]).await.map_err(TransportError::Io)?;
    if first == 0 {
        return Err(TransportError::Closed.into());
    }
    reader
        .read_exact(&mut header[1..])
        .await
        .map_err(TransportError::Io)?;

    let (opcode, len) = codec.decode_header(&header)?;

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(TransportError::Io)?;

    Ok(Message::new(opcode, Bytes::from(payload)))
}

/// Encode and write one frame, then flush.
pub async fn write_message<W>(
    writer: &mut W,
    codec: &Codec,
    opcode: Opcode,
    payload: &[u8],
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let frame = codec.encode(opcode, payload)?;
    writer.write_all(&frame).await.map_err(TransportError::Io)?;
    writer.flush().await.map_err(TransportError::Io)?;
    Ok(())
}

pub async fn write_request<W>(writer: &mut W, codec: &Codec, req: &Request) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    write_message(writer, codec, req.opcode(), &req.encode_payload()?).await
}

pub async fn write_response<W>(
    writer: &mut W,
    codec: &Codec,
    resp: &Response,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    write_message(writer, codec, resp.opcode(), &resp.encode_payload()?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{FramingError, PROTOCOL_VERSION};

    #[tokio::test]
    async fn frame_survives_a_duplex_stream() {
        let codec = Codec::default();
        let (mut a, mut b) = tokio::io::duplex(64);

        let req = Request::Register {
            username: "alice".into(),
        };
        let writer = tokio::spawn(async move {
            write_request(&mut a, &Codec::default(), &req).await.unwrap();
        });

        let msg = read_message(&mut b, &codec).await.unwrap();
        writer.await.unwrap();
        assert_eq!(msg.opcode, Opcode::Register);
        assert_eq!(&msg.payload[..], b"\x05alice");
    }

    #[tokio::test]
    async fn eof_before_header_is_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = read_message(&mut b, &Codec::default()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Transport(TransportError::Closed)));
    }

    #[tokio::test]
    async fn oversized_header_fails_before_payload_read() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut header = vec![PROTOCOL_VERSION];
        header.extend_from_slice(&u16::from(Opcode::SendFile).to_le_bytes());
        header.extend_from_slice(&u32::MAX.to_le_bytes());
        a.write_all(&header).await.unwrap();

        let err = read_message(&mut b, &Codec::default()).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Framing(FramingError::PayloadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn eof_mid_payload_is_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let frame = Codec::default().encode(Opcode::Register, b"\x05alice").unwrap();
        a.write_all(&frame[..frame.len() - 2]).await.unwrap();
        drop(a);

        let err = read_message(&mut b, &Codec::default()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Transport(TransportError::Io(_))));
    }
}
