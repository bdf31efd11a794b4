//! Raw bidirectional tunnel for upgraded connections.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BUFFER_SIZE: usize = 8192;

/// Bytes moved in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// Bytes read from the client and written to the backend.
    pub client_to_backend: u64,
    /// Bytes read from the backend and written to the client.
    pub backend_to_client: u64,
}

/// Copy bytes both ways until either side closes.
///
/// The first direction to reach EOF shuts down its writer and ends the
/// tunnel; the other direction is dropped mid-read so a peer that never
/// closes cannot pin the tunnel open. An error or idle timeout in either
/// direction ends the tunnel the same way.
pub async fn splice<C, B>(
    client: C,
    backend: B,
    idle_timeout: Option<Duration>,
) -> io::Result<TunnelStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let mut stats = TunnelStats::default();
    let result = tokio::select! {
        result = pump(
            &mut client_read,
            &mut backend_write,
            idle_timeout,
            &mut stats.client_to_backend,
        ) => result,
        result = pump(
            &mut backend_read,
            &mut client_write,
            idle_timeout,
            &mut stats.backend_to_client,
        ) => result,
    };
    result?;
    Ok(stats)
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Option<Duration>,
    total: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let read = match idle_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, reader.read(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            },
            None => reader.read(&mut buf).await?,
        };

        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read]).await?;
        writer.flush().await?;
        *total += read as u64;
    }
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (client, mut client_peer) = duplex(1024);
        let (backend, mut backend_peer) = duplex(1024);

        let tunnel = tokio::spawn(splice(client, backend, None));

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        backend_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        backend_peer.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client_peer);
        drop(backend_peer);

        let stats = tunnel.await.unwrap().unwrap();
        assert_eq!(stats.client_to_backend, 4);
        assert_eq!(stats.backend_to_client, 5);
    }

    #[tokio::test]
    async fn test_client_close_reaches_backend() {
        let (client, client_peer) = duplex(1024);
        let (backend, mut backend_peer) = duplex(1024);

        let tunnel = tokio::spawn(splice(client, backend, None));
        drop(client_peer);

        // Backend sees EOF once the client goes away.
        let mut buf = Vec::new();
        backend_peer.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        tokio::time::timeout(Duration::from_secs(1), tunnel)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_client_close_ends_tunnel_while_backend_stays_open() {
        let (client, mut client_peer) = duplex(1024);
        let (backend, mut backend_peer) = duplex(1024);

        let tunnel = tokio::spawn(splice(client, backend, None));

        client_peer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        backend_peer.read_exact(&mut buf).await.unwrap();
        drop(client_peer);

        let stats = tokio::time::timeout(Duration::from_secs(2), tunnel)
            .await
            .expect("tunnel outlived the client")
            .unwrap()
            .unwrap();
        assert_eq!(stats.client_to_backend, 5);
        assert_eq!(stats.backend_to_client, 0);
        drop(backend_peer);
    }

    #[tokio::test]
    async fn test_backend_close_ends_tunnel_while_client_stays_open() {
        let (client, mut client_peer) = duplex(1024);
        let (backend, mut backend_peer) = duplex(1024);

        let tunnel = tokio::spawn(splice(client, backend, None));

        backend_peer.write_all(b"bye").await.unwrap();
        drop(backend_peer);

        let mut buf = Vec::new();
        client_peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bye");

        let stats = tokio::time::timeout(Duration::from_secs(2), tunnel)
            .await
            .expect("tunnel outlived the backend")
            .unwrap()
            .unwrap();
        assert_eq!(stats.backend_to_client, 3);
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_tunnel() {
        let (client, _client_peer) = duplex(1024);
        let (backend, _backend_peer) = duplex(1024);

        let result = splice(client, backend, Some(Duration::from_millis(50))).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
    }
}
