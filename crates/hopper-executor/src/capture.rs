//! Bounded output capture.

use hopper_core::outcome::CapturedOutput;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_BUFFER: usize = 8 * 1024;

/// Read `reader` to EOF, keeping the first `limit` bytes. Everything past the
/// limit is read and counted but dropped, so the child never blocks on a
/// full pipe.
pub async fn capture<R>(mut reader: R, limit: u64) -> CapturedOutput
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut dropped = 0u64;
    let mut buf = vec![0u8; READ_BUFFER];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // A broken pipe ends the stream like EOF does.
            Err(_) => break,
        };
        let room = limit.saturating_sub(kept.len() as u64).min(n as u64) as usize;
        kept.extend_from_slice(&buf[..room]);
        dropped += (n - room) as u64;
    }

    CapturedOutput::from_bytes(&kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_under_limit() {
        let out = capture(&b"hello"[..], 16).await;
        assert_eq!(out.data, "hello");
        assert!(!out.is_truncated());
    }

    #[tokio::test]
    async fn test_truncates_and_counts() {
        let data = vec![b'x'; 100_000];
        let out = capture(&data[..], 10).await;
        assert_eq!(out.data.len(), 10);
        assert_eq!(out.truncated, 99_990);
        assert!(out.render().ends_with("[... 99990 bytes truncated]"));
    }

    #[tokio::test]
    async fn test_zero_limit_drains() {
        let out = capture(&b"abc"[..], 0).await;
        assert!(out.data.is_empty());
        assert_eq!(out.truncated, 3);
    }
}
