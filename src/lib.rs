//! Mail bridge: binds chat rooms to IMAP/SMTP accounts.

pub mod bridge;
pub mod channels;
pub mod compose;
pub mod config;
pub mod delivery;
pub mod error;
pub mod listener;
pub mod mail;
pub mod pipeline;
pub mod staging;
pub mod store;
