use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace};

use super::frame::FrameCodec;
use crate::error::{FrameError, ProxyError, Result};
use crate::http1::H2_PREFACE;
use crate::origin::{dial_tls, OriginTls};

/// ALPN offered to origins when relaying HTTP/2.
pub const ALPN_H2: &[&[u8]] = &[b"h2"];

/// Dials `addr` over TLS speaking HTTP/2 only, then relays frames between
/// it and `client`, whose preface has already been consumed.
pub async fn relay_h2<C>(
    client: C,
    addr: &str,
    tls: &OriginTls,
    max_frame_size: usize,
    connect_timeout: Duration,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut origin = dial_tls(addr, tls.client_config(ALPN_H2)?, connect_timeout).await?;
    if origin.get_ref().1.alpn_protocol() != Some(b"h2".as_slice()) {
        return Err(ProxyError::Tls(format!("{} did not negotiate h2", addr)));
    }

    origin.write_all(H2_PREFACE).await?;
    origin.flush().await?;
    debug!("HTTP/2 relay to {} started", addr);

    relay_frames(client, origin, max_frame_size).await
}

/// Relays frames in both directions until both are done.
///
/// A direction ends cleanly on EOF or right after forwarding a DATA frame
/// that ends its stream. Any other codec error is returned.
pub async fn relay_frames<C, O>(client: C, origin: O, max_frame_size: usize) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    O: AsyncRead + AsyncWrite + Send + 'static,
{
    let codec = FrameCodec::new(max_frame_size);
    let (client_read, client_write) = tokio::io::split(client);
    let (origin_read, origin_write) = tokio::io::split(origin);

    let upstream = tokio::spawn(pump(
        FramedRead::new(client_read, codec),
        FramedWrite::new(origin_write, codec),
        "client -> origin",
    ));
    let downstream = tokio::spawn(pump(
        FramedRead::new(origin_read, codec),
        FramedWrite::new(client_write, codec),
        "origin -> client",
    ));

    let (upstream, downstream) = tokio::join!(upstream, downstream);
    for res in [upstream, downstream] {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let err = ProxyError::Frame(e);
                if !err.is_eof() {
                    return Err(err);
                }
            }
            Err(e) => return Err(ProxyError::Proxy(format!("HTTP/2 relay task failed: {}", e))),
        }
    }
    Ok(())
}

async fn pump<R, W>(
    mut src: FramedRead<R, FrameCodec>,
    mut dst: FramedWrite<W, FrameCodec>,
    direction: &'static str,
) -> std::result::Result<(), FrameError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = src.next().await {
        let frame = frame?;
        trace!(
            "{}: {} stream={} flags={:#04x} len={}",
            direction,
            frame.kind.name(),
            frame.stream_id,
            frame.flags,
            frame.payload.len()
        );
        let ends = frame.is_data_end();
        dst.send(frame).await?;
        if ends {
            trace!("{}: stream ended", direction);
            return Ok(());
        }
    }
    Ok(())
}
