//! Raw IMAP over implicit TLS (blocking I/O, run in spawn_blocking).
//!
//! Only the handful of commands the listener needs are spoken: LOGIN,
//! SELECT, FETCH, LIST and LOGOUT. Literal `{N}` payloads are read exactly,
//! so message bodies arrive byte-for-byte.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use regex::Regex;
use rustls::pki_types::ServerName;
use secrecy::ExposeSecret;
use tracing::debug;

use crate::error::MailError;
use crate::mail::{MailConnector, MailSession, RawMail, tls};
use crate::store::InboundAccount;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Port used when the account host carries none.
pub const DEFAULT_IMAP_PORT: u16 = 993;

const READ_TIMEOUT: Duration = Duration::from_secs(30);

static FETCH_SEQ: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\* (\d+) FETCH ").expect("static pattern"));

static INTERNAL_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"INTERNALDATE "([^"]+)""#).expect("static pattern"));

static EXISTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\* (\d+) EXISTS").expect("static pattern"));

static LIST_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\* LIST \([^)]*\) (?:"(?:[^"\\]|\\.)*"|NIL) (.+)$"#).expect("static pattern")
});

// ── Connector ───────────────────────────────────────────────────────

/// Opens [`ImapSession`]s for inbound accounts.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImapConnector;

#[async_trait]
impl MailConnector for ImapConnector {
    async fn connect(&self, account: &InboundAccount) -> Result<Box<dyn MailSession>, MailError> {
        let (host, port) = split_host_port(&account.host);
        let user = account.username.clone();
        let secret = account.secret.clone();
        let verify = account.verify_tls;

        let stream = tokio::task::spawn_blocking(move || {
            let mut stream = ImapStream::open(&host, port, verify)?;
            stream.login(&user, secret.expose_secret())?;
            Ok::<_, MailError>(stream)
        })
        .await
        .map_err(|e| MailError::Task(e.to_string()))??;

        debug!(host = %account.host, user = %account.username, "IMAP session opened");
        Ok(Box::new(ImapSession {
            stream: Some(stream),
            exists: 0,
        }))
    }
}

// ── Session ─────────────────────────────────────────────────────────

/// An authenticated IMAP connection.
pub struct ImapSession {
    stream: Option<ImapStream>,
    /// Message count of the selected mailbox.
    exists: u32,
}

impl ImapSession {
    /// Run a blocking operation on the stream off the async runtime.
    async fn run<T, F>(&mut self, op: F) -> Result<T, MailError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapStream) -> Result<T, MailError> + Send + 'static,
    {
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| MailError::Protocol("session is closed".into()))?;
        let (stream, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut stream);
            (stream, result)
        })
        .await
        .map_err(|e| MailError::Task(e.to_string()))?;
        self.stream = Some(stream);
        result
    }
}

#[async_trait]
impl MailSession for ImapSession {
    async fn select_mailbox(&mut self, name: &str) -> Result<u32, MailError> {
        let mailbox = name.to_string();
        let exists = self
            .run(move |s| {
                let resp = s.command(&format!("SELECT {}", quote(&mailbox)))?;
                let untagged = resp.into_ok(|detail| MailError::Mailbox {
                    mailbox: mailbox.clone(),
                    reason: detail,
                })?;
                Ok(untagged.iter().find_map(|u| parse_exists(&u.text)).unwrap_or(0))
            })
            .await?;
        self.exists = exists;
        Ok(exists)
    }

    async fn fetch_recent(&mut self, n: u32) -> Result<Vec<RawMail>, MailError> {
        let Some(range) = fetch_range(self.exists, n) else {
            return Ok(Vec::new());
        };
        self.run(move |s| {
            let resp = s.command(&format!("FETCH {range} (INTERNALDATE BODY.PEEK[])"))?;
            let untagged = resp.into_ok(MailError::Fetch)?;
            let mut mails: Vec<RawMail> = untagged.into_iter().filter_map(parse_fetch).collect();
            mails.sort_by_key(|m| m.seq);
            Ok(mails)
        })
        .await
    }

    async fn list_mailboxes(&mut self) -> Result<Vec<String>, MailError> {
        self.run(|s| {
            let resp = s.command(r#"LIST "" "*""#)?;
            let untagged = resp.into_ok(MailError::Protocol)?;
            Ok(untagged.iter().filter_map(parse_list_name).collect())
        })
        .await
    }

    async fn logout(&mut self) {
        if self.stream.is_some() {
            let _ = self.run(|s| s.command("LOGOUT").map(|_| ())).await;
        }
        self.stream = None;
    }
}

// ── Wire protocol ───────────────────────────────────────────────────

/// One untagged response, with any literals it carried.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Untagged {
    text: String,
    literals: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    No,
    Bad,
}

#[derive(Debug)]
struct Response {
    untagged: Vec<Untagged>,
    status: Status,
    detail: String,
}

impl Response {
    /// The untagged data on OK, otherwise the completion text mapped through `err`.
    fn into_ok(self, err: impl FnOnce(String) -> MailError) -> Result<Vec<Untagged>, MailError> {
        match self.status {
            Status::Ok => Ok(self.untagged),
            Status::No | Status::Bad => Err(err(self.detail)),
        }
    }
}

struct ImapStream {
    reader: BufReader<TlsStream>,
    next_tag: u32,
}

impl ImapStream {
    fn open(host: &str, port: u16, verify: bool) -> Result<Self, MailError> {
        let connect_err = |reason: String| MailError::Connect {
            host: format!("{host}:{port}"),
            reason,
        };

        let tcp = TcpStream::connect((host, port)).map_err(|e| connect_err(e.to_string()))?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))?;

        let server_name =
            ServerName::try_from(host.to_string()).map_err(|e| connect_err(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls::client_config(verify), server_name)
            .map_err(|e| connect_err(e.to_string()))?;

        let mut stream = Self {
            reader: BufReader::new(rustls::StreamOwned::new(conn, tcp)),
            next_tag: 1,
        };

        // The TLS handshake runs on this first read.
        let greeting = stream
            .read_line()
            .map_err(|e| connect_err(e.to_string()))?;
        if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
            return Err(connect_err(format!("unexpected greeting: {}", greeting.trim_end())));
        }
        Ok(stream)
    }

    fn login(&mut self, user: &str, secret: &str) -> Result<(), MailError> {
        let resp = self.command(&format!("LOGIN {} {}", quote(user), quote(secret)))?;
        resp.into_ok(|detail| MailError::Auth {
            user: user.to_string(),
            reason: detail,
        })
        .map(|_| ())
    }

    fn read_line(&mut self) -> Result<String, MailError> {
        let mut buf = Vec::new();
        let n = self.reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err(MailError::Protocol("connection closed by server".into()));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn read_literal(&mut self, len: usize) -> Result<Vec<u8>, MailError> {
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Send a tagged command and collect responses up to its completion.
    fn command(&mut self, cmd: &str) -> Result<Response, MailError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let writer = self.reader.get_mut();
        writer.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        writer.flush()?;

        let prefix = format!("{tag} ");
        let mut untagged = Vec::new();
        loop {
            let mut line = self.read_line()?;
            if let Some(rest) = line.strip_prefix(&prefix) {
                let rest = rest.trim_end();
                let (status, detail) = parse_status(rest);
                return Ok(Response {
                    untagged,
                    status,
                    detail: detail.to_string(),
                });
            }

            let mut item = Untagged::default();
            loop {
                let trimmed = line.trim_end_matches(['\r', '\n']);
                item.text.push_str(trimmed);
                match literal_len(trimmed) {
                    Some(len) => {
                        item.literals.push(self.read_literal(len)?);
                        line = self.read_line()?;
                    }
                    None => break,
                }
            }
            untagged.push(item);
        }
    }
}

// ── Parsing helpers ─────────────────────────────────────────────────

/// Split `host:port`, defaulting the port to 993.
pub fn split_host_port(host: &str) -> (String, u16) {
    if let Some((name, port)) = host.rsplit_once(':')
        && let Ok(port) = port.parse::<u16>()
    {
        return (name.to_string(), port);
    }
    (host.to_string(), DEFAULT_IMAP_PORT)
}

/// `host` with the default port appended when it has none.
pub fn with_default_port(host: &str) -> String {
    let (name, port) = split_host_port(host);
    format!("{name}:{port}")
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn parse_status(rest: &str) -> (Status, &str) {
    let (word, detail) = rest.split_once(' ').unwrap_or((rest, ""));
    let status = match word.to_ascii_uppercase().as_str() {
        "OK" => Status::Ok,
        "NO" => Status::No,
        _ => Status::Bad,
    };
    (status, detail)
}

/// Length of a `{N}` literal announced at the end of a line.
fn literal_len(line: &str) -> Option<usize> {
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].parse().ok()
}

fn parse_exists(text: &str) -> Option<u32> {
    EXISTS.captures(text)?.get(1)?.as_str().parse().ok()
}

/// Sequence range covering the newest `n` of `exists` messages.
fn fetch_range(exists: u32, n: u32) -> Option<String> {
    if exists == 0 || n == 0 {
        return None;
    }
    let start = exists.saturating_sub(n) + 1;
    Some(format!("{start}:{exists}"))
}

/// Parse an IMAP date-time such as `17-Jul-1996 02:44:25 -0700`.
fn parse_internal_date(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(raw.trim(), "%d-%b-%Y %H:%M:%S %z").ok()
}

fn parse_fetch(item: Untagged) -> Option<RawMail> {
    let seq = FETCH_SEQ.captures(&item.text)?.get(1)?.as_str().parse().ok()?;
    let internal_date = INTERNAL_DATE
        .captures(&item.text)
        .and_then(|c| c.get(1))
        .and_then(|m| parse_internal_date(m.as_str()));
    let body = item.literals.into_iter().next()?;
    Some(RawMail {
        seq,
        internal_date,
        body,
    })
}

fn parse_list_name(item: &Untagged) -> Option<String> {
    if let Some(literal) = item.literals.first() {
        return Some(String::from_utf8_lossy(literal).into_owned());
    }
    let raw = LIST_ENTRY.captures(&item.text)?.get(1)?.as_str().trim();
    match raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        Some(inner) => Some(inner.replace("\\\"", "\"").replace("\\\\", "\\")),
        None => Some(raw.to_string()),
    }
}
