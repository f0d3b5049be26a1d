//! Intercepted tunnels: the request loop behind a CONNECT once the client
//! has been told the tunnel is up.

use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::certs::TlsConfigFn;
use crate::ctx::ProxyCtx;
use crate::exchange::{Exchange, LoopEnd, Target};
use crate::h2::relay_h2;
use crate::origin::DedicatedOrigin;
use crate::proxy::Proxy;
use crate::relay::ClientStream;
use crate::websocket::serve_upgrade;

/// Terminates the client's TLS session for `host` and serves the requests
/// it carries.
///
/// Handshake failures only get logged: the client has already been told the
/// tunnel exists.
pub(crate) async fn intercept_tls<S: ClientStream>(
    proxy: Arc<Proxy>,
    client: BufReader<S>,
    host: String,
    tls_config: TlsConfigFn,
    connect_ctx: ProxyCtx,
) {
    let server_config = match tls_config(&host, &connect_ctx) {
        Ok(config) => config,
        Err(e) => {
            warn!("Cannot build TLS configuration for {}: {}", host, e);
            return;
        }
    };
    let tls = match TlsAcceptor::from(server_config).accept(client).await {
        Ok(tls) => tls,
        Err(e) => {
            debug!("TLS handshake with client for {} failed: {}", host, e);
            return;
        }
    };
    debug!(
        "Client TLS established for {} (alpn: {:?})",
        host,
        tls.get_ref()
            .1
            .alpn_protocol()
            .map(String::from_utf8_lossy)
    );

    let conn = connect_ctx.cancel_token().clone();
    drop(connect_ctx);

    let target = Target::https(host.clone());
    let mut stream = BufReader::new(tls);
    let exchange = Exchange::tunnel(&proxy, &target, proxy.origin.as_ref());
    let end = exchange.serve_requests(&mut stream, &conn).await;

    match end {
        LoopEnd::H2Preface if proxy.config().allow_http2 => {
            let config = proxy.config();
            if let Err(e) = relay_h2(
                stream,
                &host,
                &config.origin_tls,
                config.max_frame_size,
                config.connect_timeout,
            )
            .await
            {
                if !e.is_eof() {
                    warn!("HTTP/2 relay to {} failed: {}", host, e);
                }
            }
            return;
        }
        LoopEnd::H2Preface => debug!("HTTP/2 preface in tunnel to {} but HTTP/2 is disabled", host),
        LoopEnd::Upgrade(on_upgrade) => {
            serve_upgrade(stream, on_upgrade).await;
            return;
        }
        LoopEnd::Connect(_) => debug!("Nested CONNECT in tunnel to {}", host),
        LoopEnd::Closed => {}
    }

    if let Err(e) = stream.shutdown().await {
        debug!("TLS shutdown for {} failed: {}", host, e);
    }
}

/// Serves cleartext HTTP requests sent through the tunnel to `host`.
///
/// Every request goes to the same origin over one lazily dialed connection.
pub(crate) async fn intercept_plain<S: ClientStream>(
    proxy: Arc<Proxy>,
    mut client: BufReader<S>,
    host: String,
    conn: CancellationToken,
) {
    let config = proxy.config();
    let origin = DedicatedOrigin::new(
        host.clone(),
        config.preserve_header_case,
        config.connect_timeout,
    );
    let target = Target::http(host.clone());
    let exchange = Exchange::tunnel(&proxy, &target, &origin);

    match exchange.serve_requests(&mut client, &conn).await {
        LoopEnd::Upgrade(on_upgrade) => {
            serve_upgrade(client, on_upgrade).await;
            return;
        }
        LoopEnd::H2Preface => debug!("Cleartext HTTP/2 in tunnel to {} is not relayed", host),
        LoopEnd::Connect(_) => debug!("Nested CONNECT in tunnel to {}", host),
        LoopEnd::Closed => {}
    }

    let _ = client.shutdown().await;
}
