//! WebSocket pass-through after a successful upgrade.

use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};

/// Origin side of an upgraded connection.
pub type OriginUpgrade = TokioIo<Upgraded>;

/// Waits for hyper to release the origin connection of a `101` response.
pub async fn origin_upgrade(on_upgrade: OnUpgrade) -> Result<OriginUpgrade> {
    let upgraded = on_upgrade.await?;
    Ok(TokioIo::new(upgraded))
}

/// Waits for the origin side of `on_upgrade`, then relays it with `client`.
pub async fn serve_upgrade<C>(client: C, on_upgrade: OnUpgrade)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
{
    let origin = match origin_upgrade(on_upgrade).await {
        Ok(origin) => origin,
        Err(e) => {
            warn!("WebSocket upgrade failed: {}", e);
            return;
        }
    };
    if let Err(e) = relay_websocket(client, origin).await {
        debug!("WebSocket relay failed: {}", e);
    }
}

/// Copies bytes between `client` and `origin` until one direction ends.
///
/// Either peer's close handshake ends the session, so the relay returns as
/// soon as the first copy finishes and the other one is aborted. Both
/// connections are dropped by the time this returns.
pub async fn relay_websocket<C, O>(client: C, origin: O) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    O: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut origin_read, mut origin_write) = tokio::io::split(origin);

    let mut upstream = tokio::spawn(async move {
        let res = tokio::io::copy(&mut client_read, &mut origin_write).await;
        let _ = origin_write.shutdown().await;
        res
    });
    let mut downstream = tokio::spawn(async move {
        let res = tokio::io::copy(&mut origin_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        res
    });

    let (direction, res) = tokio::select! {
        res = &mut upstream => {
            downstream.abort();
            let _ = downstream.await;
            ("client -> origin", res)
        }
        res = &mut downstream => {
            upstream.abort();
            let _ = upstream.await;
            ("origin -> client", res)
        }
    };

    match res {
        Ok(Ok(n)) => {
            debug!("WebSocket relay ended after {} ({} bytes)", direction, n);
            Ok(())
        }
        Ok(Err(e)) => {
            let err = ProxyError::Io(e);
            if err.is_eof() {
                Ok(())
            } else {
                Err(err)
            }
        }
        Err(e) => Err(ProxyError::Proxy(format!("WebSocket relay task failed: {}", e))),
    }
}
