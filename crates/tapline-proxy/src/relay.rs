//! Raw byte relay between a client and an origin.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Inbound client connection the proxy can serve.
///
/// Connections that support closing their write side on its own expose it
/// through [`ClientStream::into_tcp`]; the tunnel relay then closes each
/// direction as soon as its source is exhausted.
pub trait ClientStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Returns the underlying TCP stream, or `self` if there is none.
    fn into_tcp(self) -> Result<TcpStream, Self>
    where
        Self: Sized,
    {
        Err(self)
    }
}

impl ClientStream for TcpStream {
    fn into_tcp(self) -> Result<TcpStream, Self> {
        Ok(self)
    }
}

impl ClientStream for DuplexStream {}

/// Bytes moved in each direction by a relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Client to origin.
    pub sent: u64,
    /// Origin to client.
    pub received: u64,
}

/// Relays two TCP streams with independent half-close.
///
/// Each direction shuts down its destination's write side when its source
/// reaches EOF. Both sockets are dropped once both directions are done.
pub async fn relay_tcp(client: TcpStream, origin: TcpStream) -> RelayStats {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut origin_read, mut origin_write) = origin.into_split();

    let upstream = tokio::spawn(async move {
        let res = copy_then_shutdown(&mut client_read, &mut origin_write).await;
        (res, client_read, origin_write)
    });
    let downstream = tokio::spawn(async move {
        let res = copy_then_shutdown(&mut origin_read, &mut client_write).await;
        (res, origin_read, client_write)
    });

    let (upstream, downstream) = tokio::join!(upstream, downstream);
    RelayStats {
        sent: finished("client -> origin", upstream.map(|(res, ..)| res)),
        received: finished("origin -> client", downstream.map(|(res, ..)| res)),
    }
}

/// Relays two streams without independent half-close.
///
/// Each direction shuts down only its destination on EOF. If one peer never
/// closes, the other direction keeps waiting until that peer times out.
pub async fn relay_streams<A, B>(client: A, origin: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut origin_read, mut origin_write) = tokio::io::split(origin);

    let upstream =
        tokio::spawn(async move { copy_then_shutdown(&mut client_read, &mut origin_write).await });
    let downstream =
        tokio::spawn(async move { copy_then_shutdown(&mut origin_read, &mut client_write).await });

    let (upstream, downstream) = tokio::join!(upstream, downstream);
    RelayStats {
        sent: finished("client -> origin", upstream),
        received: finished("origin -> client", downstream),
    }
}

async fn copy_then_shutdown<R, W>(src: &mut R, dst: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let copied = tokio::io::copy(src, dst).await;
    if let Err(e) = dst.shutdown().await {
        trace!("Shutdown after relay failed: {}", e);
    }
    copied
}

fn finished(direction: &str, res: Result<io::Result<u64>, tokio::task::JoinError>) -> u64 {
    match res {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            debug!("Relay {} ended with error: {}", direction, e);
            0
        }
        Err(e) => {
            debug!("Relay {} task failed: {}", direction, e);
            0
        }
    }
}

/// Writes bytes a client sent ahead of the relay (still sitting in a read buffer).
pub async fn flush_leftover<W>(leftover: &[u8], dst: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if !leftover.is_empty() {
        dst.write_all(leftover).await?;
        dst.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn read_to_close<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await?;
        Ok(out)
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connect, accept) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connect.unwrap(), accept.unwrap().0)
    }

    #[tokio::test]
    async fn tcp_relay_half_closes_each_direction() {
        let (mut client, proxy_client_side) = tcp_pair().await;
        let (proxy_origin_side, mut origin) = tcp_pair().await;

        let relay = tokio::spawn(relay_tcp(proxy_client_side, proxy_origin_side));

        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();

        // Origin sees the data followed by EOF while its own side is still open.
        let got = read_to_close(&mut origin).await.unwrap();
        assert_eq!(got, b"ping");

        origin.write_all(b"pong").await.unwrap();
        origin.shutdown().await.unwrap();

        let got = read_to_close(&mut client).await.unwrap();
        assert_eq!(got, b"pong");

        let stats = relay.await.unwrap();
        assert_eq!(stats, RelayStats { sent: 4, received: 4 });
    }

    #[tokio::test]
    async fn stream_relay_copies_both_ways() {
        let (proxy_client_side, mut client) = tokio::io::duplex(64);
        let (proxy_origin_side, mut origin) = tokio::io::duplex(64);

        let relay = tokio::spawn(relay_streams(proxy_client_side, proxy_origin_side));

        client.write_all(b"hello").await.unwrap();
        client.shutdown().await.unwrap();
        let got = read_to_close(&mut origin).await.unwrap();
        assert_eq!(got, b"hello");

        origin.write_all(b"world").await.unwrap();
        drop(origin);
        let got = read_to_close(&mut client).await.unwrap();
        assert_eq!(got, b"world");

        let stats = relay.await.unwrap();
        assert_eq!(stats.sent, 5);
        assert_eq!(stats.received, 5);
    }

    #[tokio::test]
    async fn duplex_is_not_tcp() {
        let (a, _b) = tokio::io::duplex(8);
        assert!(a.into_tcp().is_err());
    }

    #[tokio::test]
    async fn leftover_is_written_first() {
        let mut out = Vec::new();
        flush_leftover(b"early", &mut out).await.unwrap();
        flush_leftover(b"", &mut out).await.unwrap();
        assert_eq!(out, b"early");
    }
}
