//! porthole Core Library
//!
//! Shared functionality for porthole components:
//! - Tunnel process supervision (spawn, liveness, graceful stop)
//! - Status polling of the ngrok agent's local API
//! - Last-used configuration persistence
//! - Common error types

pub mod config;
pub mod error;
pub mod status;
pub mod supervisor;
pub mod tracing_init;

pub use config::LastUsed;
pub use error::{Error, Result};
pub use status::{PollPolicy, StatusClient, StatusError, TunnelState, TunnelStatus};
pub use supervisor::{SupervisorError, TunnelHandle, TunnelRequest, TunnelSupervisor};
