//! Length-prefixed framing shared by the IPC pipes and peer links.
//!
//! Every frame is a 4-byte big-endian length followed by exactly that many
//! payload bytes. A writer issues the length and the payload as two writes.
//! A reader that hits end-of-file before a full frame reports end-of-stream
//! (`Ok(None)`), not an error.

use crate::error::WireError;
use courier_types::Envelope;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Maximum single frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or(WireError::FrameTooLarge {
            size: payload.len().min(u32::MAX as usize) as u32,
            max: MAX_FRAME_SIZE,
        })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the stream.
///
/// Not cancel-safe: dropping the future mid-frame loses the partial frame.
/// Run it from a single dedicated task.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            debug!("Stream closed between frames");
            return Ok(None);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    match reader.read_exact(&mut body).await {
        Ok(_) => Ok(Some(body)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            info!(expected = len, "Stream closed in the middle of a frame");
            Ok(None)
        }
        Err(e) => Err(WireError::Io(e)),
    }
}

/// Encode an envelope and write it as one frame.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &envelope.encode()).await
}

/// Read one frame and decode it as an envelope.
pub async fn read_envelope<R>(reader: &mut R) -> Result<Option<Envelope>, WireError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(body) => Ok(Some(Envelope::decode(&body)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::PublicId;

    fn envelope(n: usize) -> Envelope {
        let protocol: PublicId = "courier/default:0.1.0".parse().unwrap();
        Envelope::new("node-b", "node-a", protocol, format!("msg-{n}").into_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_frames_in_order() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            for n in 0..10 {
                write_envelope(&mut a, &envelope(n)).await.unwrap();
            }
        });
        for n in 0..10 {
            let got = read_envelope(&mut b).await.unwrap().unwrap();
            assert_eq!(got, envelope(n));
        }
        writer.await.unwrap();
        assert!(read_envelope(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_header_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"abc").await.unwrap();
        assert_eq!(buf, [0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn test_clean_eof() {
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_end_of_stream() {
        let mut partial: &[u8] = &[0, 0, 0, 10, 1, 2, 3];
        assert!(read_frame(&mut partial).await.unwrap().is_none());

        let mut partial_header: &[u8] = &[0, 0];
        assert!(read_frame(&mut partial_header).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_is_error() {
        let header = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let mut input: &[u8] = &header;
        let err = read_frame(&mut input).await.unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_garbage_payload_is_envelope_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"\x00\x00\x00\x09short").await.unwrap();
        let mut input: &[u8] = &buf;
        let err = read_envelope(&mut input).await.unwrap_err();
        assert!(matches!(err, WireError::Envelope(_)));
    }
}
