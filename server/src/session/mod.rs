//! Session management for alarm subscribers
//!
//! This module handles:
//! - Tracking every open subscriber session
//! - Broadcasting alarm frames to all of them
//! - Enforcing the push-only contract on each session

mod connection;
mod manager;

pub use connection::{AlarmSession, SessionEnd, SessionHandle, SessionId};
pub use manager::{BroadcastReport, SessionManager};
