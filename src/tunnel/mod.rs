//! Tunnel layer - multiplexed channels over one encrypted carrier
//!
//! Provides:
//! - Frame encoding/decoding
//! - Channel multiplexing over a single transport
//! - Credit-based flow control
//! - Keepalive probes and padding injection

mod carrier;
mod channel;
mod frame;

pub use carrier::{Carrier, CarrierHandle, CarrierOptions, ChannelOpener};
pub use frame::{Frame, Target, CON2_ACCEPTED, CON2_UNREACHABLE, CON2_UNSUPPORTED};

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid target address: {0:?}")]
    InvalidAddress(String),

    #[error("Unsupported target address: {0:?}")]
    UnsupportedAddress(String),

    #[error("All channel ids on this side are in use")]
    ChannelsExhausted,

    #[error("Carrier is closed")]
    CarrierClosed,

    #[error("Protocol violation: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
