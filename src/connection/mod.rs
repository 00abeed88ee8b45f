//! Connection management for the persistent alarm subscription
//!
//! This module handles:
//! - The session lifecycle and automatic reconnection
//! - Observer registration and isolated fan-out
//! - Endpoint and limit configuration

pub mod config;
mod manager;
pub mod registry;

pub use config::{EndpointConfig, StreamConfig};
pub use manager::{ConnectionManager, StreamHooks};
pub use registry::{DispatchReport, ListenerHandle, ListenerRegistry, Observer, ObserverFault};
