//! RTSP interleaved binary framing (RFC 2326 §10.12).
//!
//! When RTP runs over the RTSP TCP connection, each packet is prefixed with
//! a 4-byte header:
//!
//! ```text
//! +------+---------+----------------+
//! | '$'  | channel | length (16 BE) |
//! +------+---------+----------------+
//! ```
//!
//! Text messages and binary frames share the stream, so the message reader
//! has to step over any `$` frame it meets while waiting for a response.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{CastError, ParseErrorKind, Result};

pub const INTERLEAVED_MAGIC: u8 = b'$';

/// Limits applied while reading one RTSP message.
#[derive(Debug, Clone, Copy)]
pub struct MessageLimits {
    pub max_header: usize,
    pub max_body: usize,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_header: 16 * 1024,
            max_body: 256 * 1024,
        }
    }
}

/// `$`, channel, 16-bit big-endian length.
pub fn frame_header(channel: u8, len: usize) -> Result<[u8; 4]> {
    let len = u16::try_from(len).map_err(|_| {
        CastError::InvalidParameter(format!("interleaved frame of {len} bytes exceeds 65535"))
    })?;
    let [hi, lo] = len.to_be_bytes();
    Ok([INTERLEAVED_MAGIC, channel, hi, lo])
}

/// Read the next RTSP request or response as text, skipping interleaved
/// binary frames and stray line breaks in front of it.
///
/// Returns `Ok(None)` when the peer closed the stream.
pub async fn read_message<R>(reader: &mut R, limits: &MessageLimits) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let first = loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match byte {
            INTERLEAVED_MAGIC => skip_frame(reader).await?,
            b'\r' | b'\n' => {}
            other => break other,
        }
    };

    let mut head = vec![first];
    let mut content_length = 0usize;
    let mut line = Vec::new();
    let mut start_line = true;
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(None);
        }
        head.extend_from_slice(&line);
        if head.len() > limits.max_header {
            return Err(CastError::Parse {
                kind: ParseErrorKind::HeaderTooLarge,
            });
        }

        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(['\r', '\n']);
        if text.is_empty() && !start_line {
            break;
        }
        start_line = false;
        if let Some((name, value)) = text.split_once(':')
            && name.trim().eq_ignore_ascii_case("Content-Length")
        {
            content_length = value.trim().parse().unwrap_or(content_length);
        }
    }

    if content_length > limits.max_body {
        return Err(CastError::Parse {
            kind: ParseErrorKind::BodyTooLarge,
        });
    }
    if content_length > 0 {
        let start = head.len();
        head.resize(start + content_length, 0);
        reader.read_exact(&mut head[start..]).await?;
    }

    Ok(Some(String::from_utf8_lossy(&head).into_owned()))
}

async fn skip_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<()> {
    let channel = reader.read_u8().await?;
    let len = reader.read_u16().await?;
    let mut payload = (&mut *reader).take(u64::from(len));
    let skipped = tokio::io::copy(&mut payload, &mut tokio::io::sink()).await?;
    if skipped < u64::from(len) {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
    }
    tracing::trace!(channel, len, "skipped interleaved frame");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        assert_eq!(frame_header(2, 0x0102).unwrap(), [b'$', 2, 0x01, 0x02]);
        assert!(frame_header(0, 70_000).is_err());
    }

    #[tokio::test]
    async fn skips_frames_before_response() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&frame_header(1, 3).unwrap());
        wire.extend_from_slice(&[9, 9, 9]);
        wire.extend_from_slice(b"RTSP/1.0 200 OK\r\nCSeq: 5\r\nContent-Length: 4\r\n\r\nbody");
        wire.extend_from_slice(b"RTSP/1.0 200 OK\r\nCSeq: 6\r\n\r\n");

        let mut reader = &wire[..];
        let limits = MessageLimits::default();
        let first = read_message(&mut reader, &limits).await.unwrap().unwrap();
        assert!(first.starts_with("RTSP/1.0 200 OK\r\nCSeq: 5"));
        assert!(first.ends_with("\r\n\r\nbody"));

        let second = read_message(&mut reader, &limits).await.unwrap().unwrap();
        assert!(second.contains("CSeq: 6"));
        assert!(read_message(&mut reader, &limits).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enforces_limits() {
        let limits = MessageLimits {
            max_header: 32,
            max_body: 2,
        };
        let long = format!("RTSP/1.0 200 OK\r\nX-Pad: {}\r\n\r\n", "a".repeat(64));
        let mut reader = long.as_bytes();
        assert!(matches!(
            read_message(&mut reader, &limits).await,
            Err(CastError::Parse {
                kind: ParseErrorKind::HeaderTooLarge
            })
        ));

        let limits = MessageLimits {
            max_header: 1024,
            max_body: 2,
        };
        let big = b"RTSP/1.0 200 OK\r\nContent-Length: 10\r\n\r\n0123456789";
        let mut reader = &big[..];
        assert!(matches!(
            read_message(&mut reader, &limits).await,
            Err(CastError::Parse {
                kind: ParseErrorKind::BodyTooLarge
            })
        ));
    }
}
