pub mod ftp;
pub mod http;

use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::Connection;
use crate::error::DownloadError;
use crate::source::{DownloadSource, Protocol};

/// Result of a size/redirect probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// The server pointed elsewhere; the caller re-resolves and probes again.
    Redirect(String),
    /// Total length of the remote resource in bytes.
    Size(u64),
}

/// Per-protocol capability contract used uniformly by the engine.
///
/// Strategies are stateless; everything transient lives in the `Connection`
/// they hand back, so one strategy instance serves every part of a run.
#[async_trait]
pub trait Transfer: Send + Sync {
    /// Probe the source for its length (or a redirect) without downloading
    /// payload.
    async fn discover(&self, source: &DownloadSource) -> Result<Probe, DownloadError>;

    /// Bring up the channel(s) needed to fetch `[from, to)` for part `index`
    /// and send the request. The connection comes back in `RequestSent`.
    async fn open(
        &self,
        source: &DownloadSource,
        index: usize,
        from: u64,
        to: u64,
    ) -> Result<Connection, DownloadError>;

    /// Read available payload bytes into `buf`, never more than `budget`.
    ///
    /// A graceful peer close while `budget > 0` is a recoverable
    /// `SocketRecv` error: required bytes remain, so the part must retry.
    async fn receive(
        &self,
        conn: &mut Connection,
        buf: &mut [u8],
        budget: u64,
    ) -> Result<usize, DownloadError>;
}

/// Strategy instance for a protocol; HTTP and HTTPS share one, the
/// encryption flag on the source decides the transport.
pub fn strategy_for(protocol: Protocol) -> Arc<dyn Transfer> {
    match protocol {
        Protocol::Http | Protocol::Https => Arc::new(http::HttpTransfer),
        Protocol::Ftp => Arc::new(ftp::FtpTransfer),
    }
}
