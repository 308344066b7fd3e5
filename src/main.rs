use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use mail_bridge::bridge::{Bridge, BridgeDeps};
use mail_bridge::channels::cli::{CLI_ROOM, CliCommand, HELP, parse_command};
use mail_bridge::channels::{ChatEventKind, ChatSink, CliChat};
use mail_bridge::config::BridgeConfig;
use mail_bridge::error::Error;
use mail_bridge::mail::{ImapConnector, SmtpMailer};
use mail_bridge::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("a rustls crypto provider is already installed"))?;

    let config = BridgeConfig::from_env().context("invalid configuration")?;
    config.ensure_data_dir().context("could not prepare the data directory")?;

    // Logs go to stderr and to a daily file under <data>/logs.
    let file_appender = tracing_appender::rolling::daily(config.log_dir(), "mail-bridge.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    eprintln!("📬 Mail bridge v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Data: {}", config.data_dir.display());
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Type !help for commands, /quit to exit.\n");

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Bridge ───────────────────────────────────────────────────────────
    let chat = Arc::new(CliChat::new());
    let bridge = Bridge::new(
        config,
        BridgeDeps {
            store,
            connector: Arc::new(ImapConnector),
            transport: Arc::new(SmtpMailer),
            chat: chat.clone(),
        },
    );
    let listeners = bridge
        .start()
        .await
        .context("could not load the bridged accounts")?;
    info!(listeners, "Mail bridge running");

    // ── Event loop ───────────────────────────────────────────────────────
    let mut events = chat.start();
    loop {
        let event = tokio::select! {
            event = events.next() => match event {
                Some(event) => event,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        };

        let command = match &event.kind {
            ChatEventKind::Text(text) => parse_command(text),
            ChatEventKind::File { .. } => None,
        };
        if matches!(command, Some(CliCommand::Quit)) {
            break;
        }
        let composing = bridge.is_composing(&event.room).await.unwrap_or(false);

        match command {
            Some(command) if !composing => run_command(&bridge, chat.as_ref(), command).await,
            _ => {
                if let Err(e) = bridge.handle_event(&event).await {
                    debug!(error = %e, "Chat event rejected");
                }
            }
        }
    }

    bridge.shutdown().await;
    info!("Mail bridge stopped");
    Ok(())
}

async fn run_command(bridge: &Bridge, chat: &dyn ChatSink, command: CliCommand) {
    let room = CLI_ROOM;
    let outcome: Result<(), Error> = match command {
        CliCommand::Help => chat.send_text(room, HELP).await.map_err(Into::into),
        CliCommand::Invalid(usage) => chat.send_text(room, &usage).await.map_err(Into::into),
        CliCommand::SetupInbound(setup) => bridge.setup_inbound(room, setup).await,
        CliCommand::SetupOutbound(setup) => bridge.setup_outbound(room, setup).await,
        CliCommand::Info => bridge.room_info(room).await.map(drop),
        CliCommand::Write {
            recipients,
            markdown,
        } => bridge.begin_compose(room, &recipients, markdown).await,
        CliCommand::Mailboxes => bridge.list_mailboxes(room).await.map(drop),
        CliCommand::Mailbox => bridge.current_mailbox(room).await.map(drop),
        CliCommand::SetMailbox(mailbox) => bridge.set_mailbox(room, &mailbox).await,
        CliCommand::SetHtml(enabled) => bridge.set_html(room, enabled).await,
        CliCommand::Block(pattern) => bridge.block_address(room, &pattern).await.map(drop),
        CliCommand::Unblock(pattern) => bridge.unblock_address(room, &pattern).await.map(drop),
        CliCommand::ClearBlocklist => bridge.clear_blocklist(room).await.map(drop),
        CliCommand::Blocklist => bridge.list_blocklist(room).await.map(drop),
        CliCommand::Unbridge => bridge.unbridge(room).await.map(drop),
        CliCommand::Quit => Ok(()),
    };
    if let Err(e) = outcome {
        debug!(error = %e, "Command failed");
    }
}
