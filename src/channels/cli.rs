//! CLI chat: stdin/stdout stand-in for a chat room, for local operation.
//!
//! Every line typed is a text event in room `cli`. `/file <path>` uploads a
//! local file into the room. Lines starting with `!` outside a draft are
//! bridge commands, parsed by [`parse_command`].

use async_trait::async_trait;
use futures::stream;
use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, warn};

use crate::bridge::{InboundSetup, OutboundSetup};
use crate::channels::{ChatEvent, ChatSink, EventStream};
use crate::config::parse_bool;
use crate::error::ChannelError;

pub const CLI_ROOM: &str = "cli";
const CLI_USER: &str = "local-user";

/// A chat room on the terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct CliChat;

impl CliChat {
    pub fn new() -> Self {
        Self
    }

    /// Read events from stdin until EOF.
    pub fn start(&self) -> EventStream {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let mut lines = BufReader::new(stdin).lines();
            eprint!("> ");

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim_end().to_string();
                        if line.trim().is_empty() {
                            eprint!("> ");
                            continue;
                        }
                        let Some(event) = read_event(&line).await else {
                            eprint!("> ");
                            continue;
                        };
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // EOF
                    Err(e) => {
                        error!(error = %e, "Error reading stdin");
                        break;
                    }
                }
            }
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Box::pin(stream)
    }
}

/// Turn a typed line into an event, loading `/file` uploads from disk.
async fn read_event(line: &str) -> Option<ChatEvent> {
    let Some(path) = line.strip_prefix("/file ") else {
        return Some(ChatEvent::text(CLI_ROOM, CLI_USER, line));
    };
    let path = std::path::Path::new(path.trim());
    match tokio::fs::read(path).await {
        Ok(data) => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            Some(ChatEvent::file(CLI_ROOM, CLI_USER, &name, data))
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read file");
            eprintln!("Could not read {}: {e}", path.display());
            None
        }
    }
}

#[async_trait]
impl ChatSink for CliChat {
    async fn send_text(&self, room: &str, text: &str) -> Result<(), ChannelError> {
        println!("\n[{room}] {text}\n");
        eprint!("> ");
        Ok(())
    }

    async fn send_formatted(
        &self,
        room: &str,
        plain: &str,
        _html: &str,
    ) -> Result<(), ChannelError> {
        self.send_text(room, plain).await
    }
}

// ── Commands ────────────────────────────────────────────────────────

/// A bridge command typed in the terminal.
#[derive(Debug, Clone)]
pub enum CliCommand {
    Help,
    SetupInbound(InboundSetup),
    SetupOutbound(OutboundSetup),
    Info,
    Write {
        recipients: Vec<String>,
        markdown: Option<bool>,
    },
    Mailboxes,
    Mailbox,
    SetMailbox(String),
    SetHtml(bool),
    Block(String),
    Unblock(String),
    ClearBlocklist,
    Blocklist,
    Unbridge,
    Quit,
    /// Anything that did not parse, with the usage hint to show.
    Invalid(String),
}

pub const HELP: &str = "\
!setup imap, host:port, username, password, mailbox, ignoreSSL - bridge inbound mail
!setup smtp, host:port, username, password, ignoreSSL - set up outbound mail
!ping - show the bridge settings of this room
!write <address> [address...] [markdown true/false] - write an email
!mailboxes - list the mailboxes of the IMAP account
!mailbox - show the current mailbox
!setmailbox <mailbox> - change the mailbox
!sethtml on/off - render HTML mail
!blocklist add/delete/clear/view <address> - suppress mail from senders (wildcards like *@spam.io work)
!logout - remove the bridge from this room
/file <path> - attach a file to the draft
/quit - exit";

/// Parse a `!command` line. Returns `None` for lines that are not commands.
pub fn parse_command(line: &str) -> Option<CliCommand> {
    let line = line.trim();
    if line == "/quit" {
        return Some(CliCommand::Quit);
    }
    let rest = line.strip_prefix('!')?;
    let (name, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let args = args.trim();

    let command = match name.to_lowercase().as_str() {
        "help" | "login" => CliCommand::Help,
        "setup" => parse_setup(args),
        "ping" => CliCommand::Info,
        "write" => parse_write(args),
        "mailboxes" => CliCommand::Mailboxes,
        "mailbox" => CliCommand::Mailbox,
        "setmailbox" if !args.is_empty() && !args.contains(' ') => {
            CliCommand::SetMailbox(args.to_string())
        }
        "setmailbox" => CliCommand::Invalid("Usage: !setmailbox <new mailbox>".into()),
        "sethtml" => match parse_bool(args) {
            Some(enabled) => CliCommand::SetHtml(enabled),
            None => CliCommand::Invalid("Usage: !sethtml on/off".into()),
        },
        "blocklist" | "bl" => parse_blocklist(args),
        "logout" | "leave" => CliCommand::Unbridge,
        _ => CliCommand::Invalid("command not found!".into()),
    };
    Some(command)
}

fn parse_setup(args: &str) -> CliCommand {
    const USAGE: &str = "Wrong syntax :/\nExample:\n!setup imap, host.com:993, mail@host.com, w0rdp4ss, INBOX, false\nor\n!setup smtp, host.com:587, mail@host.com, w0rdp4ss, false";

    let parts: Vec<String> = args.split(',').map(|p| p.replace(' ', "")).collect();
    if parts.len() < 4 || parts.len() > 6 {
        return CliCommand::Invalid(USAGE.into());
    }
    let ignore_tls = |idx: usize| {
        parts
            .get(idx)
            .and_then(|raw| parse_bool(raw))
            .unwrap_or(false)
    };

    match parts[0].to_lowercase().as_str() {
        "imap" => CliCommand::SetupInbound(InboundSetup {
            host: parts[1].clone(),
            username: parts[2].clone(),
            secret: SecretString::from(parts[3].clone()),
            mailbox: parts.get(4).cloned(),
            verify_tls: !ignore_tls(5),
        }),
        "smtp" if parts.len() <= 5 => CliCommand::SetupOutbound(OutboundSetup {
            host: parts[1].clone(),
            username: parts[2].clone(),
            secret: SecretString::from(parts[3].clone()),
            verify_tls: !ignore_tls(4),
        }),
        "smtp" => CliCommand::Invalid(USAGE.into()),
        other => CliCommand::Invalid(format!(
            "What? you can setup 'imap' and 'smtp', not \"{other}\""
        )),
    }
}

fn parse_write(args: &str) -> CliCommand {
    let mut words: Vec<&str> = args.split_whitespace().collect();
    let markdown = match words.last().and_then(|w| parse_bool(w)) {
        Some(flag) if words.len() > 1 => {
            words.pop();
            Some(flag)
        }
        _ => None,
    };
    if words.is_empty() {
        return CliCommand::Invalid("Usage: !write <emailaddress>".into());
    }
    CliCommand::Write {
        recipients: words
            .iter()
            .map(|w| w.trim_end_matches(',').to_string())
            .collect(),
        markdown,
    }
}

fn parse_blocklist(args: &str) -> CliCommand {
    const USAGE: &str = "Usage: !blocklist <add/delete/clear/view> <email address>";

    let mut words = args.split_whitespace();
    let action = words.next().map(str::to_lowercase);
    let address = words.next();
    match (action.as_deref(), address) {
        (Some("view" | "list"), None) => CliCommand::Blocklist,
        (Some("clear"), None) => CliCommand::ClearBlocklist,
        (Some("add"), Some(addr)) => CliCommand::Block(addr.to_string()),
        (Some("remove" | "delete" | "rm"), Some(addr)) => CliCommand::Unblock(addr.to_string()),
        _ => CliCommand::Invalid(USAGE.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn non_commands_pass_through() {
        assert!(parse_command("hello there").is_none());
    }

    #[test]
    fn setup_imap() {
        match parse_command("!setup imap, host.com:993, mail@host.com, w0rd, Archive, true") {
            Some(CliCommand::SetupInbound(setup)) => {
                assert_eq!(setup.host, "host.com:993");
                assert_eq!(setup.username, "mail@host.com");
                assert_eq!(setup.secret.expose_secret(), "w0rd");
                assert_eq!(setup.mailbox.as_deref(), Some("Archive"));
                assert!(!setup.verify_tls);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn setup_smtp_defaults_to_verifying() {
        match parse_command("!setup smtp, host.com:587, mail@host.com, w0rd") {
            Some(CliCommand::SetupOutbound(setup)) => {
                assert_eq!(setup.host, "host.com:587");
                assert!(setup.verify_tls);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn setup_rejects_unknown_kind_and_bad_arity() {
        assert!(matches!(
            parse_command("!setup pop3, a, b, c"),
            Some(CliCommand::Invalid(msg)) if msg.contains("pop3")
        ));
        assert!(matches!(
            parse_command("!setup imap, a"),
            Some(CliCommand::Invalid(_))
        ));
    }

    #[test]
    fn write_with_markdown_flag() {
        match parse_command("!write a@x.com, b@y.org false") {
            Some(CliCommand::Write {
                recipients,
                markdown,
            }) => {
                assert_eq!(recipients, vec!["a@x.com".to_string(), "b@y.org".to_string()]);
                assert_eq!(markdown, Some(false));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            parse_command("!write"),
            Some(CliCommand::Invalid(_))
        ));
    }

    #[test]
    fn blocklist_actions() {
        assert!(matches!(
            parse_command("!blocklist add *@spam.io"),
            Some(CliCommand::Block(p)) if p == "*@spam.io"
        ));
        assert!(matches!(
            parse_command("!bl rm *@spam.io"),
            Some(CliCommand::Unblock(_))
        ));
        assert!(matches!(parse_command("!blocklist view"), Some(CliCommand::Blocklist)));
        assert!(matches!(parse_command("!blocklist clear"), Some(CliCommand::ClearBlocklist)));
        assert!(matches!(parse_command("!blocklist"), Some(CliCommand::Invalid(_))));
    }

    #[test]
    fn sethtml_spellings() {
        assert!(matches!(parse_command("!sethtml on"), Some(CliCommand::SetHtml(true))));
        assert!(matches!(parse_command("!sethtml false"), Some(CliCommand::SetHtml(false))));
        assert!(matches!(parse_command("!sethtml maybe"), Some(CliCommand::Invalid(_))));
    }
}
