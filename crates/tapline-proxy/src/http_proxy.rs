//! The proxy port: plain HTTP forwarding and dispatch of CONNECT requests.

use std::sync::Arc;

use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connect::handle_connect;
use crate::exchange::{Exchange, LoopEnd};
use crate::proxy::Proxy;
use crate::relay::ClientStream;
use crate::websocket::serve_upgrade;

/// Serves one connection accepted on the proxy port.
///
/// Requests with absolute targets are forwarded until the client asks to
/// close. A CONNECT hands the rest of the connection to the tunnel code.
pub(crate) async fn serve<S: ClientStream>(
    proxy: Arc<Proxy>,
    stream: S,
    conn: CancellationToken,
) {
    let mut client = BufReader::new(stream);
    let exchange = Exchange::plain(&proxy, proxy.origin.as_ref());
    let end = exchange.serve_requests(&mut client, &conn).await;

    match end {
        LoopEnd::Connect(req) => handle_connect(proxy, req, client, conn).await,
        LoopEnd::Upgrade(on_upgrade) => serve_upgrade(client, on_upgrade).await,
        LoopEnd::H2Preface => debug!("HTTP/2 prior knowledge is not served on the proxy port"),
        LoopEnd::Closed => {}
    }
}
