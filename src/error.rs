//! Error types for the mail bridge.

/// Top-level error type for the bridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Compose error: {0}")]
    Compose(#[from] ComposeError),

    #[error("Setup error: {0}")]
    Setup(#[from] SetupError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Data path {0} exists but is not a directory")]
    NotADirectory(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Inbound (IMAP) and outbound (SMTP) mail protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Could not connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Authentication failed for {user}: {reason}")]
    Auth { user: String, reason: String },

    #[error("Mailbox {mailbox} could not be selected: {reason}")]
    Mailbox { mailbox: String, reason: String },

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Could not build message: {0}")]
    Build(String),

    #[error("Submission failed: {0}")]
    Send(String),

    #[error("Mail task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Chat-side delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send to room {room}: {reason}")]
    SendFailed { room: String, reason: String },

    #[error("Channel closed: {0}")]
    Closed(String),
}

/// Errors raised while assembling or dispatching a draft.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("No draft in progress")]
    NoDraft,

    #[error("The subject has to be a text message")]
    SubjectNotText,

    #[error("No valid recipient address in {0:?}")]
    InvalidRecipients(Vec<String>),

    #[error("No outbound account configured for this room")]
    NoOutboundAccount,

    #[error("Attachment {0} not found")]
    AttachmentNotFound(String),

    #[error("Could not stage attachment {name}: {reason}")]
    Staging { name: String, reason: String },

    #[error("Sending failed, outbound account removed: {0}")]
    Dispatch(#[source] MailError),

    #[error("Storage failure, draft discarded: {0}")]
    Storage(#[from] DatabaseError),
}

/// Policy rejections and failures of the account setup flows.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("This room already has an {0} account")]
    AlreadyConfigured(&'static str),

    #[error("The account {0} is already bridged to another room")]
    AccountInUse(String),

    #[error("The port must be a number, got {0:?}")]
    InvalidPort(String),

    #[error("{0} is not a valid email address")]
    InvalidAddress(String),

    #[error("The mailbox name must not be empty")]
    EmptyMailbox,

    #[error("This room has no {0} account")]
    NotConfigured(&'static str),

    #[error("Could not verify the account: {0}")]
    Verify(#[from] MailError),

    #[error("Storage failure: {0}")]
    Storage(#[from] DatabaseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_error_mentions_account_removal() {
        let err = ComposeError::Dispatch(MailError::Send("535 bad credentials".into()));
        let text = err.to_string();
        assert!(text.contains("outbound account removed"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn storage_errors_lift_into_top_level() {
        let err: Error = ComposeError::from(DatabaseError::Query("boom".into())).into();
        assert!(matches!(err, Error::Compose(ComposeError::Storage(_))));
    }
}
