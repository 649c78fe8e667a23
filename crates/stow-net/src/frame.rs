//! Length-prefixed frames: `[u64 big-endian payload length][payload]`.
//!
//! Reads and writes are progress-timed: each attempt waits at most one poll
//! interval, and the operation only fails once a whole timeout window passes
//! without a single byte moving. A peer that closes the connection halfway
//! through a frame therefore produces [`NetError::Timeout`] rather than a
//! decode error on truncated data.

use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::config::NetworkConfig;
use crate::error::{NetError, NetResult};

pub const FRAME_HEADER_SIZE: usize = 8;

/// Read one frame and return its payload.
pub async fn read_frame<R>(reader: &mut R, config: &NetworkConfig) -> NetResult<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    read_fully(reader, &mut header, config).await?;
    let len = u64::from_be_bytes(header);
    if len > config.max_frame_size {
        return Err(NetError::FrameTooLarge {
            size: len,
            max: config.max_frame_size,
        });
    }

    let mut payload = BytesMut::zeroed(len as usize);
    read_fully(reader, &mut payload, config).await?;
    debug!(bytes = len, "frame received");
    Ok(payload.freeze())
}

/// Write `payload` as one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], config: &NetworkConfig) -> NetResult<()>
where
    W: AsyncWrite + Unpin,
{
    let len = payload.len() as u64;
    if len > config.max_frame_size {
        return Err(NetError::FrameTooLarge {
            size: len,
            max: config.max_frame_size,
        });
    }
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.put_u64(len);
    frame.put_slice(payload);

    write_fully(writer, &frame, config).await?;
    match tokio::time::timeout(config.timeout(), writer.flush()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(NetError::Timeout {
                expected: frame.len() as u64,
                transferred: frame.len() as u64,
            })
        }
    }
    debug!(bytes = len, "frame sent");
    Ok(())
}

async fn read_fully<R>(reader: &mut R, buf: &mut [u8], config: &NetworkConfig) -> NetResult<()>
where
    R: AsyncRead + Unpin,
{
    let poll = config.poll_interval();
    let mut filled = 0;
    let mut last_progress = Instant::now();

    while filled < buf.len() {
        match tokio::time::timeout(poll, reader.read(&mut buf[filled..])).await {
            Ok(Ok(0)) => tokio::time::sleep(poll).await,
            Ok(Ok(n)) => {
                filled += n;
                last_progress = Instant::now();
                continue;
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {}
        }
        if last_progress.elapsed() >= config.timeout() {
            return Err(NetError::Timeout {
                expected: buf.len() as u64,
                transferred: filled as u64,
            });
        }
    }
    Ok(())
}

async fn write_fully<W>(writer: &mut W, buf: &[u8], config: &NetworkConfig) -> NetResult<()>
where
    W: AsyncWrite + Unpin,
{
    let poll = config.poll_interval();
    let mut written = 0;
    let mut last_progress = Instant::now();

    while written < buf.len() {
        match tokio::time::timeout(poll, writer.write(&buf[written..])).await {
            Ok(Ok(0)) => tokio::time::sleep(poll).await,
            Ok(Ok(n)) => {
                written += n;
                last_progress = Instant::now();
                continue;
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {}
        }
        if last_progress.elapsed() >= config.timeout() {
            return Err(NetError::Timeout {
                expected: buf.len() as u64,
                transferred: written as u64,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    fn quick() -> NetworkConfig {
        NetworkConfig {
            timeout_ms: 200,
            poll_interval_ms: 5,
            max_frame_size: 4096,
        }
    }

    #[tokio::test]
    async fn frame_roundtrip_in_pieces() {
        let (mut a, mut b) = duplex(16);
        let payload = vec![7u8; 300];
        let writer = tokio::spawn(async move {
            write_frame(&mut a, &payload, &quick()).await.unwrap();
        });
        let received = read_frame(&mut b, &quick()).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received.len(), 300);
        assert!(received.iter().all(|&b| b == 7));
    }

    #[tokio::test]
    async fn truncated_frame_times_out() {
        let (mut a, mut b) = duplex(4096);
        a.write_all(&1000u64.to_be_bytes()).await.unwrap();
        a.write_all(&[1u8; 400]).await.unwrap();
        drop(a);

        let err = read_frame(&mut b, &quick()).await.unwrap_err();
        assert!(matches!(
            err,
            NetError::Timeout {
                expected: 1000,
                transferred: 400
            }
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn silent_peer_times_out_on_header() {
        let (_a, mut b) = duplex(64);
        let err = read_frame(&mut b, &quick()).await.unwrap_err();
        assert!(matches!(err, NetError::Timeout { expected: 8, transferred: 0 }));
    }

    #[tokio::test]
    async fn stalled_reader_times_out_writer() {
        let (mut a, _b) = duplex(64);
        let err = write_frame(&mut a, &[0u8; 1000], &quick()).await.unwrap_err();
        assert!(matches!(
            err,
            NetError::Timeout {
                expected: 1008,
                transferred: 64
            }
        ));
    }

    #[tokio::test]
    async fn oversized_frames_are_refused() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&(1u64 << 40).to_be_bytes()).await.unwrap();
        let err = read_frame(&mut b, &quick()).await.unwrap_err();
        assert!(matches!(err, NetError::FrameTooLarge { max: 4096, .. }));

        let err = write_frame(&mut a, &[0u8; 5000], &quick()).await.unwrap_err();
        assert!(matches!(err, NetError::FrameTooLarge { size: 5000, .. }));
    }
}
