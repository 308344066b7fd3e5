//! Persistence layer: libSQL-backed storage for rooms, accounts and drafts.

pub mod libsql_backend;
pub mod migrations;
pub mod model;
pub mod secret;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use model::{
    Attachment, BlocklistEntry, ComposeStage, Draft, InboundAccount, NewInboundAccount,
    NewOutboundAccount, OutboundAccount, Room, RoomInbound,
};
pub use traits::Database;
