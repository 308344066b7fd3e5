//! Per-room mail listener: one long-lived task per inbound account.
//!
//! States: `Connecting → Polling → (Reconnecting → Connecting)*`, with
//! `Stopped` reachable from anywhere through the cancel signal.
//!
//! The task owns its counters and publishes a snapshot through a watch
//! channel after every transition. Cancellation only interrupts sleeps: a
//! poll already in flight finishes, but the timer is not re-armed.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::ChatSink;
use crate::config::ListenerConfig;
use crate::delivery;
use crate::error::MailError;
use crate::mail::{MailConnector, MailSession};
use crate::pipeline::{ContentPipeline, Outcome};
use crate::store::{Database, InboundAccount, RoomInbound};

/// The live session, shared with the handle so mailboxes can be listed.
pub(crate) type SharedSession = Arc<Mutex<Option<Box<dyn MailSession>>>>;

/// Collaborators every listener needs.
#[derive(Clone)]
pub struct ListenerDeps {
    pub store: Arc<dyn Database>,
    pub connector: Arc<dyn MailConnector>,
    pub pipeline: Arc<ContentPipeline>,
    pub chat: Arc<dyn ChatSink>,
    pub config: ListenerConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ListenerState {
    #[default]
    Connecting,
    Polling,
    Reconnecting,
    Stopped,
}

/// Counters and state of one listener.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListenerStatus {
    pub state: ListenerState,
    /// Successful polls on the current connection.
    pub checks: u32,
    /// Consecutive failed polls.
    pub errors: u32,
    /// Forced reconnects caused by the error ceiling. Survives reconnects.
    pub login_errors: u32,
    /// Connections recycled, for any reason.
    pub reconnects: u32,
    /// Poll attempts, successful or not.
    pub polls: u64,
    /// Connection attempts, successful or not.
    pub connect_attempts: u64,
}

/// What one poll amounted to.
enum PollOutcome {
    Polled,
    /// Store trouble; the mail connection is fine.
    Skipped,
    /// The room was deleted under us.
    RoomGone,
}

/// Scheduler-side handle of a running listener.
pub struct ListenerHandle {
    pub account_id: i64,
    cancel: watch::Sender<bool>,
    status: watch::Receiver<ListenerStatus>,
    session: SharedSession,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Signal the listener to stop. Idempotent; does not wait.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn status(&self) -> ListenerStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<ListenerStatus> {
        self.status.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// List mailboxes over the listener's live connection.
    pub async fn list_mailboxes(&self) -> Result<Vec<String>, MailError> {
        let mut guard = self.session.lock().await;
        match guard.as_mut() {
            Some(session) => session.list_mailboxes().await,
            None => Err(MailError::Protocol("listener is not connected".into())),
        }
    }
}

/// Start a listener task for `entry`.
///
/// A `silent` listener marks the results of its first poll as seen without
/// delivering them.
pub fn spawn_listener(entry: RoomInbound, silent: bool, deps: ListenerDeps) -> ListenerHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (status_tx, status_rx) = watch::channel(ListenerStatus::default());
    let session: SharedSession = Arc::new(Mutex::new(None));
    let account_id = entry.account.id;

    let listener = MailListener {
        room_key: entry.room.key,
        interval: Duration::from_secs(entry.room.poll_interval_secs.max(1)),
        account: entry.account,
        silent,
        deps,
        session: Arc::clone(&session),
        status: status_tx,
        cancel: cancel_rx,
        counters: ListenerStatus::default(),
    };
    let task = tokio::spawn(listener.run());

    ListenerHandle {
        account_id,
        cancel: cancel_tx,
        status: status_rx,
        session,
        task,
    }
}

struct MailListener {
    room_key: String,
    account: InboundAccount,
    interval: Duration,
    silent: bool,
    deps: ListenerDeps,
    session: SharedSession,
    status: watch::Sender<ListenerStatus>,
    cancel: watch::Receiver<bool>,
    counters: ListenerStatus,
}

impl MailListener {
    async fn run(mut self) {
        info!(
            room = %self.room_key,
            account = %self.account.username,
            interval_secs = self.interval.as_secs(),
            silent = self.silent,
            "Mail listener started"
        );

        'connect: loop {
            self.publish(ListenerState::Connecting);
            let session = loop {
                if self.is_cancelled() {
                    break 'connect;
                }
                self.counters.connect_attempts += 1;
                match self.deps.connector.connect(&self.account).await {
                    Ok(session) => break session,
                    Err(e) => {
                        info!(
                            room = %self.room_key,
                            account = %self.account.username,
                            error = %e,
                            "Could not connect to mail server, retrying"
                        );
                        self.publish(ListenerState::Connecting);
                        if !self.sleep(self.deps.config.connect_retry_delay).await {
                            break 'connect;
                        }
                    }
                }
            };
            *self.session.lock().await = Some(session);
            debug!(room = %self.room_key, "Mail session established");
            self.publish(ListenerState::Polling);

            loop {
                if self.is_cancelled() {
                    break 'connect;
                }
                if self.counters.checks >= self.deps.config.max_checks {
                    debug!(room = %self.room_key, checks = self.counters.checks, "Recycling connection");
                    self.reconnect().await;
                    continue 'connect;
                }

                let result = self.poll().await;
                self.counters.polls += 1;
                self.silent = false;
                match result {
                    Ok(PollOutcome::Polled) => {
                        self.counters.checks += 1;
                        self.counters.errors = 0;
                    }
                    Ok(PollOutcome::Skipped) => {}
                    Ok(PollOutcome::RoomGone) => {
                        warn!(room = %self.room_key, "Room no longer exists, stopping listener");
                        break 'connect;
                    }
                    Err(e) => {
                        self.counters.errors += 1;
                        warn!(
                            room = %self.room_key,
                            errors = self.counters.errors,
                            error = %e,
                            "Mail poll failed"
                        );
                        if self.counters.errors > self.deps.config.max_errors {
                            self.counters.login_errors += 1;
                            if self.counters.login_errors > self.deps.config.login_error_warning {
                                warn!(
                                    room = %self.room_key,
                                    account = %self.account.username,
                                    login_errors = self.counters.login_errors,
                                    "Too many errors for this mail account"
                                );
                            }
                            self.reconnect().await;
                            continue 'connect;
                        }
                    }
                }
                self.publish(ListenerState::Polling);

                if !self.sleep(self.interval).await {
                    break 'connect;
                }
            }
        }

        self.drop_session().await;
        self.publish(ListenerState::Stopped);
        info!(room = %self.room_key, "Mail listener stopped");
    }

    /// Fetch the newest messages and run them through the pipeline.
    async fn poll(&mut self) -> Result<PollOutcome, MailError> {
        let room = match self.deps.store.get_room(&self.room_key).await {
            Ok(Some(room)) => room,
            Ok(None) => return Ok(PollOutcome::RoomGone),
            Err(e) => {
                error!(room = %self.room_key, error = %e, "Could not load room");
                return Ok(PollOutcome::Skipped);
            }
        };

        let mails = {
            let mut guard = self.session.lock().await;
            let session = guard
                .as_mut()
                .ok_or_else(|| MailError::Protocol("not connected".into()))?;
            let exists = session.select_mailbox(&self.account.mailbox).await?;
            if exists == 0 {
                return Err(MailError::Mailbox {
                    mailbox: self.account.mailbox.clone(),
                    reason: "mailbox is empty".into(),
                });
            }
            session.fetch_recent(self.deps.config.fetch_window).await?
        };

        let batch = self
            .deps
            .pipeline
            .process_batch(&room, self.account.id, &mails, self.silent)
            .await;

        // Whatever was recorded as seen is delivered now or never.
        for outcome in batch.outcomes {
            if let Outcome::Deliver(mail) = outcome
                && let Err(e) = delivery::deliver(self.deps.chat.as_ref(), &self.room_key, &mail).await
            {
                warn!(room = %self.room_key, error = %e, "Could not deliver mail to room");
            }
        }
        if let Some(e) = batch.failure {
            error!(room = %self.room_key, error = %e, "Could not record seen mail");
            return Ok(PollOutcome::Skipped);
        }
        Ok(PollOutcome::Polled)
    }

    /// Drop the connection and reset the per-connection counters.
    async fn reconnect(&mut self) {
        info!(room = %self.room_key, account = %self.account.username, "Reconnecting mail account");
        self.drop_session().await;
        self.counters.checks = 0;
        self.counters.errors = 0;
        self.counters.reconnects += 1;
        self.publish(ListenerState::Reconnecting);
    }

    async fn drop_session(&self) {
        let taken = self.session.lock().await.take();
        if let Some(mut session) = taken {
            session.logout().await;
        }
    }

    fn publish(&mut self, state: ListenerState) {
        self.counters.state = state;
        self.status.send_replace(self.counters.clone());
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow() || self.cancel.has_changed().is_err()
    }

    /// Sleep for `duration`. Returns false if cancelled first.
    async fn sleep(&mut self, duration: Duration) -> bool {
        let cancel = &mut self.cancel;
        let cancelled = tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            // An error means the handle was dropped, which also stops us.
            _ = cancel.wait_for(|c| *c) => true,
        };
        !cancelled && !self.is_cancelled()
    }
}
