//! # Wiremux
//!
//! A multiplexed, encrypted point-to-point tunnel. Two peers share one
//! TCP link (the carrier) and relay up to 126 independent TCP
//! connections (channels) across it.
//!
//! ## Features
//!
//! - **Channel multiplexing** with per-channel flow control, so one
//!   stalled connection never blocks the rest
//! - **Continuous AES-128-CTR encryption**, one keyed stream per
//!   direction for the life of the link
//! - **Credit-based acknowledgements** in units of receive buffer space
//! - **Keepalive probes** and optional padding of outgoing bursts
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Tunnel Listeners                    │
//! │        (local TCP accept, one channel each)          │
//! ├─────────────────────────────────────────────────────┤
//! │                     Channels                         │
//! │      (per-socket relays, ring buffers, acks)         │
//! ├─────────────────────────────────────────────────────┤
//! │                     Carrier                          │
//! │     (slot table, frame scheduling, keepalive)        │
//! ├─────────────────────────────────────────────────────┤
//! │                Encrypted Transport                   │
//! │         (single TCP link, AES-128-CTR)               │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod buffer;
pub mod config;
pub mod crypto;
pub mod protocol;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
