//! Outgoing mail composed across chat turns.

pub mod markdown;
pub mod session;

pub use session::{ComposeSession, ComposeStep, validate_recipients};
