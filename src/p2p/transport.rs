//! TCP transport layer for the connection protocol
//!
//! One frame per connection: the sender writes the frame and half-closes its write side,
//! the receiver reads until EOF. Every step is bounded by a timeout.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::error::PeerError;

/// Maximum frame size (1MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Open a connection to `target`, optionally from a fixed local address.
pub async fn connect(
    target: SocketAddr,
    local: Option<IpAddr>,
    io_timeout: Duration,
) -> Result<TcpStream, PeerError> {
    let socket = match target {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };

    if let Some(local) = local {
        // Only pin the source when it matches the target's family
        if local.is_ipv4() == target.is_ipv4() {
            socket
                .bind(SocketAddr::new(local, 0))
                .map_err(|e| PeerError::Transport(format!("cannot bind to {}: {}", local, e)))?;
        }
    }

    match timeout(io_timeout, socket.connect(target)).await {
        Ok(Ok(stream)) => {
            debug!("Connected to {}", target);
            Ok(stream)
        }
        Ok(Err(e)) => Err(PeerError::Transport(format!(
            "failed to connect to {}: {}",
            target, e
        ))),
        Err(_) => Err(PeerError::Timeout(format!("connect to {}", target))),
    }
}

/// Write one frame and half-close the write side.
pub async fn write_frame<W>(stream: &mut W, frame: &str, io_timeout: Duration) -> Result<(), PeerError>
where
    W: AsyncWrite + Unpin,
{
    if frame.len() > MAX_FRAME_SIZE {
        return Err(PeerError::Protocol(format!(
            "frame too large: {} bytes",
            frame.len()
        )));
    }

    let write = async {
        stream.write_all(frame.as_bytes()).await?;
        stream.flush().await?;
        stream.shutdown().await
    };

    match timeout(io_timeout, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(PeerError::Transport(format!("failed to send frame: {}", e))),
        Err(_) => Err(PeerError::Timeout("sending frame".into())),
    }
}

/// Read one frame: everything up to EOF, at most [`MAX_FRAME_SIZE`] bytes.
pub async fn read_frame<R>(stream: &mut R, read_timeout: Duration) -> Result<String, PeerError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    let mut limited = stream.take(MAX_FRAME_SIZE as u64 + 1);

    match timeout(read_timeout, limited.read_to_end(&mut buffer)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            return Err(PeerError::Transport(format!("failed to read frame: {}", e)));
        }
        Err(_) => return Err(PeerError::Timeout("waiting for frame".into())),
    }

    if buffer.len() > MAX_FRAME_SIZE {
        return Err(PeerError::Protocol(format!(
            "frame exceeds {} bytes",
            MAX_FRAME_SIZE
        )));
    }
    if buffer.is_empty() {
        return Err(PeerError::Protocol("empty frame".into()));
    }

    String::from_utf8(buffer).map_err(|_| PeerError::Protocol("frame is not valid UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_frame_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_frame(&mut stream, TIMEOUT).await.unwrap();
            write_frame(&mut stream, &format!("echo:{}", request), TIMEOUT)
                .await
                .unwrap();
        });

        let mut stream = connect(addr, None, TIMEOUT).await.unwrap();
        write_frame(&mut stream, "PUBKEY:abc", TIMEOUT).await.unwrap();
        let reply = read_frame(&mut stream, TIMEOUT).await.unwrap();
        assert_eq!(reply, "echo:PUBKEY:abc");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_and_invalid_frames() {
        let mut empty: &[u8] = b"";
        assert!(matches!(
            read_frame(&mut empty, TIMEOUT).await,
            Err(PeerError::Protocol(_))
        ));

        let mut invalid: &[u8] = &[0xff, 0xfe];
        assert!(matches!(
            read_frame(&mut invalid, TIMEOUT).await,
            Err(PeerError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let big = vec![b'a'; MAX_FRAME_SIZE + 10];
        let mut reader: &[u8] = &big;
        assert!(matches!(
            read_frame(&mut reader, TIMEOUT).await,
            Err(PeerError::Protocol(_))
        ));

        let mut sink = Vec::new();
        let text = "a".repeat(MAX_FRAME_SIZE + 1);
        assert!(write_frame(&mut sink, &text, TIMEOUT).await.is_err());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (mut client, _server) = tokio::io::duplex(64);
        let result = read_frame(&mut client, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(PeerError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port with no listener
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect(addr, None, TIMEOUT).await;
        assert!(result.unwrap_err().is_transport());
    }
}
