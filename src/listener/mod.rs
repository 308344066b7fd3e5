//! Mail polling: one listener task per bridged room, supervised by the scheduler.

pub mod mail_listener;
pub mod scheduler;

pub use mail_listener::{
    ListenerDeps, ListenerHandle, ListenerState, ListenerStatus, spawn_listener,
};
pub use scheduler::PollScheduler;
