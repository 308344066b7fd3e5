//! Inbound content pipeline.
//!
//! Every fetched message flows through:
//! 1. `ParsedMail::parse()`: envelope, inline parts, attachment names
//! 2. Dedup gate: one seen record per (room, key), inserted atomically
//! 3. `blocklist::first_match()`: sender patterns of the inbound account
//! 4. Body selection: HTML or plain by the room's preference
//!
//! Blocked and silenced messages still count as seen.

pub mod blocklist;
pub mod content;
pub mod processor;
pub mod types;

pub use content::ParsedMail;
pub use processor::ContentPipeline;
pub use types::{BatchOutcome, DedupStrategy, InboundMail, Outcome};
