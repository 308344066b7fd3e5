//! Chat-side abstraction: delivering to rooms and receiving room events.

pub mod cli;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ChannelError;

pub use cli::CliChat;

/// Delivers bridge output to chat rooms.
#[async_trait]
pub trait ChatSink: Send + Sync {
    /// Send a plain text message.
    async fn send_text(&self, room: &str, text: &str) -> Result<(), ChannelError>;

    /// Send a formatted message with a plain fallback.
    async fn send_formatted(&self, room: &str, plain: &str, html: &str)
    -> Result<(), ChannelError>;
}

/// What a room member posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEventKind {
    Text(String),
    /// An uploaded file, already downloaded.
    File { name: String, data: Vec<u8> },
}

/// An inbound chat event scoped to one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    pub room: String,
    pub sender: String,
    pub kind: ChatEventKind,
}

impl ChatEvent {
    pub fn text(room: &str, sender: &str, text: &str) -> Self {
        Self {
            room: room.to_string(),
            sender: sender.to_string(),
            kind: ChatEventKind::Text(text.to_string()),
        }
    }

    pub fn file(room: &str, sender: &str, name: &str, data: Vec<u8>) -> Self {
        Self {
            room: room.to_string(),
            sender: sender.to_string(),
            kind: ChatEventKind::File {
                name: name.to_string(),
                data,
            },
        }
    }
}

/// Stream of inbound chat events from an adapter.
pub type EventStream = Pin<Box<dyn Stream<Item = ChatEvent> + Send>>;
