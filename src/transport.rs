use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::DownloadError;

/// One bidirectional byte channel, plain or TLS-wrapped.
///
/// The engine and protocol strategies only ever see this abstraction; raw
/// socket construction lives entirely here.
pub enum ByteStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ByteStream {
    /// Connect to `addr`; with `tls_host` set, wrap the channel in TLS using
    /// that name for SNI and certificate validation.
    pub async fn connect(addr: SocketAddr, tls_host: Option<&str>) -> Result<Self, DownloadError> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| DownloadError::Connect(format!("{addr}: {e}")))?;

        match tls_host {
            None => Ok(ByteStream::Plain(tcp)),
            Some(host) => {
                debug!(%addr, host, "negotiating tls");
                let server_name = ServerName::try_from(host.to_string())
                    .map_err(|e| DownloadError::Connect(format!("bad tls name {host}: {e}")))?;
                let tls = tls_connector()
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| DownloadError::Connect(format!("tls handshake with {host}: {e}")))?;
                Ok(ByteStream::Tls(Box::new(tls)))
            }
        }
    }

    /// Write `bytes` in full, flushing before returning.
    pub async fn send_all(&mut self, bytes: &[u8]) -> Result<(), DownloadError> {
        self.write_all(bytes)
            .await
            .map_err(|e| DownloadError::SocketSend(e.to_string()))?;
        self.flush()
            .await
            .map_err(|e| DownloadError::SocketSend(e.to_string()))?;
        Ok(())
    }
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

impl AsyncRead for ByteStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ByteStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ByteStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ByteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ByteStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ByteStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ByteStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ByteStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ByteStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ByteStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
