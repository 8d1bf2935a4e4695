use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::connection::{ConnState, Connection};
use crate::error::DownloadError;
use crate::protocol::{Probe, Transfer};
use crate::source::DownloadSource;
use crate::transport::ByteStream;

const USER_AGENT: &str = concat!("zget/", env!("CARGO_PKG_VERSION"));

/// Response preambles larger than this are treated as a framing error.
const MAX_PREAMBLE: usize = 64 * 1024;

/// HTTP and HTTPS strategy; the source's encryption flag picks the transport.
pub struct HttpTransfer;

impl HttpTransfer {
    async fn connect(&self, source: &DownloadSource) -> Result<ByteStream, DownloadError> {
        let tls_host = source.protocol.encrypted().then_some(source.host.as_str());
        ByteStream::connect(source.connect_addr(), tls_host).await
    }

    /// Read and drop the response preamble, exactly once per connection.
    ///
    /// Payload bytes that arrive in the same read as the header tail are
    /// copied into `buf` (clamped to `budget`) and returned.
    async fn skip_preamble(
        &self,
        conn: &mut Connection,
        buf: &mut [u8],
        budget: u64,
    ) -> Result<usize, DownloadError> {
        loop {
            let n = conn
                .payload_mut()
                .read(buf)
                .await
                .map_err(|e| DownloadError::SocketRecv(e.to_string()))?;
            if n == 0 {
                conn.state = ConnState::Failed;
                return Err(DownloadError::SocketRecv(
                    "connection closed inside response preamble".into(),
                ));
            }
            conn.touch();
            conn.header_buf.extend_from_slice(&buf[..n]);
            if conn.header_buf.len() > MAX_PREAMBLE {
                return Err(DownloadError::ProtocolFraming(
                    "response preamble too large".into(),
                ));
            }

            let Some(body_start) = find_header_end(&conn.header_buf) else {
                continue;
            };

            let head = String::from_utf8_lossy(&conn.header_buf[..body_start]).into_owned();
            let status = parse_status_line(head.lines().next().unwrap_or_default())?;
            match status {
                206 => {}
                200 if conn.offset == 0 => {}
                200 => {
                    return Err(DownloadError::ProtocolFraming(
                        "server ignored the range request".into(),
                    ))
                }
                other => {
                    return Err(DownloadError::ProtocolFraming(format!(
                        "unexpected status {other}"
                    )))
                }
            }

            let body = conn.header_buf.split_off(body_start);
            conn.header_buf.clear();
            conn.header_done = true;
            conn.state = ConnState::Receiving;

            let take = body.len().min(budget as usize).min(buf.len());
            buf[..take].copy_from_slice(&body[..take]);
            return Ok(take);
        }
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    async fn discover(&self, source: &DownloadSource) -> Result<Probe, DownloadError> {
        let mut stream = self.connect(source).await?;
        stream
            .send_all(build_request(source, None).as_bytes())
            .await?;

        let mut preamble = Vec::new();
        let mut buf = [0u8; 4096];
        let body_start = loop {
            let n = stream
                .read(&mut buf)
                .await
                .map_err(|e| DownloadError::SocketRecv(e.to_string()))?;
            if n == 0 {
                return Err(DownloadError::ProtocolFraming(
                    "connection closed before the response preamble ended".into(),
                ));
            }
            preamble.extend_from_slice(&buf[..n]);
            if preamble.len() > MAX_PREAMBLE {
                return Err(DownloadError::ProtocolFraming(
                    "response preamble too large".into(),
                ));
            }
            if let Some(pos) = find_header_end(&preamble) {
                break pos;
            }
        };

        let head = String::from_utf8_lossy(&preamble[..body_start]).into_owned();
        let status = parse_status_line(head.lines().next().unwrap_or_default())?;
        debug!(status, url = %source.url, "discovery response");

        if (300..400).contains(&status) {
            let location = header_value(&head, "Location").ok_or_else(|| {
                DownloadError::ProtocolFraming(format!("status {status} without Location"))
            })?;
            return Ok(Probe::Redirect(location.to_string()));
        }
        if !(200..300).contains(&status) {
            return Err(DownloadError::ProtocolFraming(format!(
                "discovery got status {status}"
            )));
        }

        let length = header_value(&head, "Content-Length")
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                DownloadError::ProtocolFraming("missing or malformed Content-Length".into())
            })?;
        Ok(Probe::Size(length))
    }

    async fn open(
        &self,
        source: &DownloadSource,
        index: usize,
        from: u64,
        to: u64,
    ) -> Result<Connection, DownloadError> {
        let stream = self.connect(source).await?;
        let mut conn = Connection::new(index, stream);
        conn.offset = from;

        let request = build_request(source, Some((from, to)));
        conn.control.send_all(request.as_bytes()).await?;
        conn.state = ConnState::RequestSent;
        conn.touch();
        debug!(part = index, from, to, "range request sent");
        Ok(conn)
    }

    async fn receive(
        &self,
        conn: &mut Connection,
        buf: &mut [u8],
        budget: u64,
    ) -> Result<usize, DownloadError> {
        debug_assert!(budget > 0);
        if !conn.header_done {
            let carried = self.skip_preamble(conn, buf, budget).await?;
            if carried > 0 {
                return Ok(carried);
            }
        }

        let max = buf.len().min(budget as usize);
        let n = conn
            .payload_mut()
            .read(&mut buf[..max])
            .await
            .map_err(|e| DownloadError::SocketRecv(e.to_string()))?;
        if n == 0 {
            // Graceful close with bytes still owed: retryable.
            conn.state = ConnState::Failed;
            return Err(DownloadError::SocketRecv(
                "peer closed before the range completed".into(),
            ));
        }
        conn.state = ConnState::Receiving;
        conn.touch();
        Ok(n)
    }
}

/// Build the request preamble; `range` is half-open and rendered as the
/// inclusive wire form `bytes=from-(to-1)`.
pub(crate) fn build_request(source: &DownloadSource, range: Option<(u64, u64)>) -> String {
    // A plain-HTTP proxy expects the absolute URL as the request target.
    let target = if source.uses_proxy() {
        source.url.clone()
    } else {
        source.path.clone()
    };

    let mut request = format!("GET {target} HTTP/1.1\r\n");
    if let Some((from, to)) = range {
        request.push_str(&format!("Range: bytes={}-{}\r\n", from, to.saturating_sub(1)));
    }
    request.push_str(&format!(
        "User-Agent: {USER_AGENT}\r\nAccept: */*\r\nAccept-Encoding: identity\r\nHost: {}:{}\r\nConnection: close\r\n\r\n",
        source.host, source.port
    ));
    request
}

/// Parse `HTTP/<major>.<minor> <status> <reason>`; anything else is a
/// framing error.
pub(crate) fn parse_status_line(line: &str) -> Result<u16, DownloadError> {
    let malformed = || DownloadError::ProtocolFraming(format!("bad status line: {line:?}"));

    let rest = line.strip_prefix("HTTP/").ok_or_else(malformed)?;
    let (version, rest) = rest.split_once(' ').ok_or_else(malformed)?;
    let mut version_parts = version.split('.');
    let well_formed = version_parts.next().is_some_and(|p| p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty())
        && version_parts.next().is_some_and(|p| p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty())
        && version_parts.next().is_none();
    if !well_formed {
        return Err(malformed());
    }

    let status = rest.split(' ').next().ok_or_else(malformed)?;
    if status.len() != 3 || !status.chars().all(|c| c.is_ascii_digit()) {
        return Err(malformed());
    }
    status.parse::<u16>().map_err(|_| malformed())
}

/// Offset of the first payload byte, one past the `\r\n\r\n` boundary.
pub(crate) fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Case-insensitive header lookup over a parsed preamble.
pub(crate) fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}
