use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::connection::{ConnState, Connection};
use crate::error::DownloadError;
use crate::protocol::{Probe, Transfer};
use crate::source::DownloadSource;
use crate::transport::ByteStream;

/// FTP strategy: control channel for commands, separate passive-mode data
/// channel for payload. Only the subset needed to fetch one file with offset
/// resume (USER/PASS/TYPE I/CWD/SIZE/PASV/REST/RETR).
pub struct FtpTransfer;

impl FtpTransfer {
    /// Connect the control channel and authenticate up to the file's
    /// directory.
    async fn login(&self, source: &DownloadSource) -> Result<ByteStream, DownloadError> {
        let mut control = ByteStream::connect(SocketAddr::new(source.ip, source.port), None).await?;

        let (banner, _) = read_reply(&mut control).await?;
        if banner != 220 {
            return Err(DownloadError::Connect(format!(
                "ftp server not ready: {banner}"
            )));
        }

        let (code, reply) = command(&mut control, &format!("USER {}", source.username)).await?;
        match code {
            230 => {}
            331 => {
                let (code, reply) =
                    command(&mut control, &format!("PASS {}", source.password)).await?;
                if code != 230 {
                    return Err(DownloadError::Connect(format!("ftp login failed: {reply}")));
                }
            }
            _ => return Err(DownloadError::Connect(format!("ftp login failed: {reply}"))),
        }

        let (code, reply) = command(&mut control, "TYPE I").await?;
        if code != 200 {
            return Err(DownloadError::ProtocolFraming(format!(
                "TYPE I rejected: {reply}"
            )));
        }

        let dir = source.directory();
        if dir != "/" {
            let (code, reply) = command(&mut control, &format!("CWD {dir}")).await?;
            if code != 250 {
                return Err(DownloadError::ProtocolFraming(format!(
                    "CWD {dir} rejected: {reply}"
                )));
            }
        }

        Ok(control)
    }
}

#[async_trait]
impl Transfer for FtpTransfer {
    async fn discover(&self, source: &DownloadSource) -> Result<Probe, DownloadError> {
        let mut control = self.login(source).await?;
        let (code, reply) = command(&mut control, &format!("SIZE {}", source.file_name)).await?;
        if code != 213 {
            return Err(DownloadError::ProtocolFraming(format!(
                "SIZE not supported: {reply}"
            )));
        }
        let size = reply
            .split_whitespace()
            .nth(1)
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| DownloadError::ProtocolFraming(format!("bad SIZE reply: {reply}")))?;
        debug!(size, file = %source.file_name, "ftp size discovered");
        Ok(Probe::Size(size))
    }

    async fn open(
        &self,
        source: &DownloadSource,
        index: usize,
        from: u64,
        to: u64,
    ) -> Result<Connection, DownloadError> {
        let mut control = self.login(source).await?;

        let (code, reply) = command(&mut control, "PASV").await?;
        if code != 227 {
            return Err(DownloadError::ProtocolFraming(format!(
                "PASV rejected: {reply}"
            )));
        }
        let (ip, port) = parse_pasv(&reply)?;
        debug!(part = index, %ip, port, "passive data endpoint");

        // The data channel must be up before RETR starts streaming into it.
        let data = ByteStream::connect(SocketAddr::new(IpAddr::V4(ip), port), None).await?;

        if from > 0 {
            let (code, reply) = command(&mut control, &format!("REST {from}")).await?;
            if code != 350 {
                return Err(DownloadError::ProtocolFraming(format!(
                    "REST {from} rejected: {reply}"
                )));
            }
        }

        let (code, reply) = command(&mut control, &format!("RETR {}", source.file_name)).await?;
        if code != 150 && code != 125 {
            return Err(DownloadError::ProtocolFraming(format!(
                "RETR rejected: {reply}"
            )));
        }

        let mut conn = Connection::new(index, control);
        conn.offset = from;
        conn.data = Some(data);
        conn.state = ConnState::RequestSent;
        debug!(part = index, from, to, "ftp transfer started");
        Ok(conn)
    }

    async fn receive(
        &self,
        conn: &mut Connection,
        buf: &mut [u8],
        budget: u64,
    ) -> Result<usize, DownloadError> {
        debug_assert!(budget > 0);
        // RETR streams to end-of-file; reading at most `budget` keeps this
        // part inside its assigned range no matter what the peer sends.
        let max = buf.len().min(budget as usize);
        let n = conn
            .payload_mut()
            .read(&mut buf[..max])
            .await
            .map_err(|e| DownloadError::SocketRecv(e.to_string()))?;
        if n == 0 {
            conn.state = ConnState::Failed;
            return Err(DownloadError::SocketRecv(
                "data channel closed before the range completed".into(),
            ));
        }
        conn.state = ConnState::Receiving;
        conn.touch();
        Ok(n)
    }
}

/// Send one command line and wait for its reply.
async fn command(
    control: &mut ByteStream,
    line: &str,
) -> Result<(u16, String), DownloadError> {
    control.send_all(format!("{line}\r\n").as_bytes()).await?;
    read_reply(control).await
}

/// Read until a final reply line arrives.
///
/// A reply line is a three-digit code followed by a space; `ddd-` lines are
/// multiline continuations and are skipped.
async fn read_reply(control: &mut ByteStream) -> Result<(u16, String), DownloadError> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let n = control
            .read(&mut buf)
            .await
            .map_err(|e| DownloadError::SocketRecv(e.to_string()))?;
        if n == 0 {
            return Err(DownloadError::SocketRecv(
                "control channel closed mid-reply".into(),
            ));
        }
        collected.extend_from_slice(&buf[..n]);
        if collected.len() > 16 * 1024 {
            return Err(DownloadError::ProtocolFraming("oversized ftp reply".into()));
        }

        if !collected.ends_with(b"\n") {
            continue;
        }
        let text = String::from_utf8_lossy(&collected);
        if let Some(line) = text.lines().rev().find(|l| is_final_reply(l)) {
            let code = parse_reply_code(line)?;
            return Ok((code, line.trim().to_string()));
        }
    }
}

fn is_final_reply(line: &str) -> bool {
    let bytes = line.as_bytes();
    bytes.len() >= 4
        && bytes[..3].iter().all(u8::is_ascii_digit)
        && bytes[3] == b' '
}

/// Parse the leading `<three digits><space>` of a reply line.
pub(crate) fn parse_reply_code(line: &str) -> Result<u16, DownloadError> {
    if !is_final_reply(line) {
        return Err(DownloadError::ProtocolFraming(format!(
            "bad ftp reply: {line:?}"
        )));
    }
    line[..3]
        .parse::<u16>()
        .map_err(|_| DownloadError::ProtocolFraming(format!("bad ftp reply: {line:?}")))
}

/// Decode the `(h1,h2,h3,h4,p1,p2)` sextuple of a 227 reply.
///
/// The data port is `p1 << 8 | p2`.
pub(crate) fn parse_pasv(reply: &str) -> Result<(Ipv4Addr, u16), DownloadError> {
    let malformed = || DownloadError::ProtocolFraming(format!("bad PASV reply: {reply:?}"));

    let sextuple = reply
        .split(|c: char| !c.is_ascii_digit() && c != ',')
        .find(|token| token.split(',').count() == 6 && !token.ends_with(','))
        .ok_or_else(malformed)?;

    let fields: Vec<u8> = sextuple
        .split(',')
        .map(|f| f.parse::<u8>())
        .collect::<Result<_, _>>()
        .map_err(|_| malformed())?;

    let ip = Ipv4Addr::new(fields[0], fields[1], fields[2], fields[3]);
    let port = (fields[4] as u16) << 8 | fields[5] as u16;
    Ok((ip, port))
}
