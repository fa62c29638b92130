//! Bidirectional byte pumping between an inbound client and a backend.

use std::io;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Upper bound on any single write or shutdown towards a peer.
pub const PEER_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// The inbound client closed its side.
    InboundClosed { bytes_up: u64 },

    /// The backend closed its side.
    BackendClosed { bytes_down: u64 },

    /// The relay is shutting down.
    Cancelled,
}

/// Relay bytes both ways until either side closes or `cancel` fires.
///
/// Whichever way it ends, both write sides are shut down before returning
/// so neither peer is left half-open. A peer that does not finish its
/// shutdown within [`PEER_IO_TIMEOUT`] is left behind.
pub async fn pump<I, B>(inbound: I, backend: B, cancel: &CancellationToken) -> io::Result<PumpEnd>
where
    I: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut inbound_rx, mut inbound_tx) = tokio::io::split(inbound);
    let (mut backend_rx, mut backend_tx) = tokio::io::split(backend);

    let end = {
        let upstream = tokio::io::copy(&mut inbound_rx, &mut backend_tx);
        let downstream = tokio::io::copy(&mut backend_rx, &mut inbound_tx);
        tokio::pin!(upstream, downstream);

        tokio::select! {
            up = &mut upstream => up.map(|bytes_up| PumpEnd::InboundClosed { bytes_up }),
            down = &mut downstream => down.map(|bytes_down| PumpEnd::BackendClosed { bytes_down }),
            _ = cancel.cancelled() => Ok(PumpEnd::Cancelled),
        }
    };

    tokio::join!(
        close_quietly("backend", &mut backend_tx),
        close_quietly("inbound", &mut inbound_tx),
    );
    end
}

/// Shut down `writer`, logging rather than returning failures.
pub(crate) async fn close_quietly<W: AsyncWrite + Unpin>(side: &str, writer: &mut W) {
    match tokio::time::timeout(PEER_IO_TIMEOUT, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("{} shutdown failed: {}", side, e),
        Err(_) => debug!("{} shutdown did not finish within {:?}", side, PEER_IO_TIMEOUT),
    }
}

/// A peer that never sends, swallows writes and never finishes closing.
#[cfg(test)]
pub(crate) struct WedgedStream;

#[cfg(test)]
impl AsyncRead for WedgedStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::task::Poll::Pending
    }
}

#[cfg(test)]
impl AsyncWrite for WedgedStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::task::Poll::Pending
    }
}
