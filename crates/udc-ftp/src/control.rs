use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use udc_core::{UdcError, UdcErrorKind, UdcResult};

/// A parsed server reply: three-digit code plus the text of its final line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    pub fn is(&self, code: u16) -> bool {
        self.code == code
    }
}

pub(crate) fn remote_err(message: impl Into<String>) -> UdcError {
    UdcError::with_message(UdcErrorKind::Remote, message)
}

/// Read one (possibly multi-line) reply. Multi-line replies start with `ddd-` and end at
/// the first line that starts with the same code followed by a space.
pub(crate) async fn read_reply<R>(reader: &mut R) -> UdcResult<Reply>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut pending: Option<u16> = None;
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|err| remote_err(format!("read FTP reply: {err}")))?;
        if n == 0 {
            return Err(remote_err("FTP control connection closed"));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let code = trimmed
            .get(..3)
            .and_then(|digits| digits.parse::<u16>().ok());
        let sep = trimmed.as_bytes().get(3).copied();
        match (pending, code, sep) {
            (None, Some(code), Some(b'-')) => pending = Some(code),
            (None, Some(code), Some(b' ') | None) => {
                return Ok(Reply {
                    code,
                    text: trimmed.get(4..).unwrap_or("").to_string(),
                });
            }
            (None, _, _) => {
                return Err(remote_err(format!("malformed FTP reply '{trimmed}'")));
            }
            (Some(open), Some(code), Some(b' ') | None) if code == open => {
                return Ok(Reply {
                    code,
                    text: trimmed.get(4..).unwrap_or("").to_string(),
                });
            }
            (Some(_), _, _) => {}
        }
    }
}

/// Parse the address out of a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply.
pub(crate) fn parse_pasv(text: &str) -> Option<SocketAddr> {
    let open = text.find('(')?;
    let close = text[open..].find(')')? + open;
    let nums: Vec<u8> = text[open + 1..close]
        .split(',')
        .map(|part| part.trim().parse::<u8>())
        .collect::<Result<_, _>>()
        .ok()?;
    if nums.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(nums[0], nums[1], nums[2], nums[3]);
    let port = u16::from(nums[4]) << 8 | u16::from(nums[5]);
    Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Parse an `MDTM` timestamp (`YYYYMMDDHHMMSS[.sss]`, UTC) into Unix seconds.
pub(crate) fn parse_mdtm(text: &str) -> Option<u64> {
    let stamp = text.trim().get(..14)?;
    let parsed = chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S").ok()?;
    u64::try_from(parsed.and_utc().timestamp()).ok()
}

/// Logged-in control connection.
pub(crate) struct Control {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    host: String,
    timeout: Duration,
}

impl Control {
    pub async fn login(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> UdcResult<Self> {
        tracing::debug!(host, port, user, "ftp connect");
        let stream = with_timeout(timeout, "connect", TcpStream::connect((host, port)))
            .await?
            .map_err(|err| remote_err(format!("connect {host}:{port}: {err}")))?;
        let (read, writer) = stream.into_split();
        let mut control = Self {
            reader: BufReader::new(read),
            writer,
            host: host.to_string(),
            timeout,
        };

        let greeting = control.reply().await?;
        if !greeting.is(220) {
            return Err(remote_err(format!(
                "unexpected FTP greeting {} {}",
                greeting.code, greeting.text
            )));
        }
        let reply = control.command(&format!("USER {user}")).await?;
        if reply.is(331) {
            control
                .expect(&format!("PASS {password}"), &[230, 202])
                .await?;
        } else if !reply.is(230) {
            return Err(remote_err(format!(
                "FTP login rejected: {} {}",
                reply.code, reply.text
            )));
        }
        control.expect("TYPE I", &[200]).await?;
        Ok(control)
    }

    pub async fn reply(&mut self) -> UdcResult<Reply> {
        let timeout = self.timeout;
        let reply = with_timeout(timeout, "read reply", read_reply(&mut self.reader)).await??;
        tracing::trace!(code = reply.code, text = %reply.text, "ftp reply");
        Ok(reply)
    }

    pub async fn command(&mut self, cmd: &str) -> UdcResult<Reply> {
        let verb = cmd.split(' ').next().unwrap_or(cmd);
        tracing::trace!(verb, "ftp command");
        self.writer
            .write_all(format!("{cmd}\r\n").as_bytes())
            .await
            .map_err(|err| remote_err(format!("send FTP {verb}: {err}")))?;
        self.reply().await
    }

    pub async fn expect(&mut self, cmd: &str, codes: &[u16]) -> UdcResult<Reply> {
        let reply = self.command(cmd).await?;
        if codes.contains(&reply.code) {
            return Ok(reply);
        }
        let verb = cmd.split(' ').next().unwrap_or(cmd);
        Err(remote_err(format!(
            "FTP {verb} failed: {} {}",
            reply.code, reply.text
        )))
    }

    /// Enter passive mode and open the data connection.
    pub async fn open_data(&mut self) -> UdcResult<TcpStream> {
        let reply = self.expect("PASV", &[227]).await?;
        let mut addr = parse_pasv(&reply.text)
            .ok_or_else(|| remote_err(format!("malformed PASV reply '{}'", reply.text)))?;
        if addr.ip().is_unspecified() {
            let peer = self
                .writer
                .peer_addr()
                .map_err(|err| remote_err(format!("control peer address: {err}")))?;
            addr.set_ip(peer.ip());
        }
        tracing::trace!(%addr, host = %self.host, "ftp data connect");
        with_timeout(self.timeout, "data connect", TcpStream::connect(addr))
            .await?
            .map_err(|err| remote_err(format!("connect data channel {addr}: {err}")))
    }

    pub async fn quit(mut self) {
        let _ = self
            .writer
            .write_all(b"QUIT\r\n")
            .await;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

pub(crate) async fn with_timeout<F, T>(timeout: Duration, op: &str, fut: F) -> UdcResult<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| remote_err(format!("FTP {op} timed out after {timeout:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_single_line_reply() {
        let mut input: &[u8] = b"213 4096\r\n";
        let reply = read_reply(&mut input).await.expect("reply");
        assert_eq!(
            reply,
            Reply {
                code: 213,
                text: "4096".into()
            }
        );
    }

    #[tokio::test]
    async fn reads_multi_line_reply() {
        let mut input: &[u8] = b"220-Welcome\r\n220-to the\r\n 220 not the end\r\n220 server\r\n";
        let reply = read_reply(&mut input).await.expect("reply");
        assert_eq!(reply.code, 220);
        assert_eq!(reply.text, "server");
    }

    #[tokio::test]
    async fn closed_connection_is_remote_error() {
        let mut input: &[u8] = b"";
        let err = read_reply(&mut input).await.expect_err("eof");
        assert_eq!(err.kind(), UdcErrorKind::Remote);
    }

    #[test]
    fn pasv_address() {
        assert_eq!(
            parse_pasv("Entering Passive Mode (127,0,0,1,195,80)."),
            Some("127.0.0.1:50000".parse().expect("addr"))
        );
        assert_eq!(parse_pasv("Entering Passive Mode (1,2,3)"), None);
        assert_eq!(parse_pasv("no address here"), None);
    }

    #[test]
    fn mdtm_timestamp() {
        assert_eq!(parse_mdtm("19951115045808"), Some(816_411_488));
        assert_eq!(parse_mdtm("19951115045808.123"), Some(816_411_488));
        assert_eq!(parse_mdtm("1995"), None);
    }
}
