//! # Stream Message Framing
//!
//! WebTransport carries the engine over a single bidirectional byte stream
//! that has no message boundaries of its own, so frames are delimited with
//! an internal prefix: one marker byte distinguishing text from binary,
//! followed by a little-endian u32 length and the frame bytes.

use crate::parser::WireFrame;
use bytes::Bytes;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Marker byte for textual frames
const MARKER_TEXT: u8 = 0;

/// Marker byte for binary frames
const MARKER_BINARY: u8 = 1;

/// Frames larger than this are rejected as corrupt
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Write one frame to the stream
pub async fn write_frame<W>(writer: &mut W, frame: &WireFrame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (marker, bytes): (u8, &[u8]) = match frame {
        WireFrame::Text(text) => (MARKER_TEXT, text.as_bytes()),
        WireFrame::Binary(data) => (MARKER_BINARY, data.as_ref()),
    };

    writer.write_all(&[marker]).await?;
    writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from the stream.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<WireFrame>>
where
    R: AsyncRead + Unpin,
{
    let mut marker = [0u8; 1];
    match reader.read_exact(&mut marker).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", len),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;

    match marker[0] {
        MARKER_TEXT => {
            let text = String::from_utf8(data)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid utf-8 frame"))?;
            Ok(Some(WireFrame::Text(text)))
        }
        MARKER_BINARY => Ok(Some(WireFrame::Binary(Bytes::from(data)))),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown frame marker: {}", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_through_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_frame(&mut a, &WireFrame::Text("4hello".to_string()))
            .await
            .unwrap();
        write_frame(&mut a, &WireFrame::Binary(Bytes::from_static(&[1, 2, 3])))
            .await
            .unwrap();
        drop(a);

        let first = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(first, WireFrame::Text("4hello".to_string()));

        let second = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(second, WireFrame::Binary(Bytes::from_static(&[1, 2, 3])));

        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0u8]).await.unwrap();
        a.write_all(&u32::MAX.to_le_bytes()).await.unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
