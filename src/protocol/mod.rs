//! Wire protocol definitions and constants

use thiserror::Error;

/// Protocol violations. Every variant is fatal to the whole carrier
/// session: the stream cipher cannot be resynchronized once framing is
/// lost, so the connection is torn down and not retried.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown control opcode: {0}")]
    UnknownOpcode(u8),

    #[error("unknown target type: {0}")]
    UnknownTargetType(u8),

    #[error("illegal channel id: {0}")]
    IllegalChannelId(u8),

    #[error("channel id {cid} outside the remote side's half")]
    ChannelIdWrongHalf { cid: u8 },

    #[error("bad data frame length: {0}")]
    BadDataLength(u16),

    #[error("unexpected {frame} for channel {cid} in state {state}")]
    UnexpectedFrame {
        frame: &'static str,
        cid: u8,
        state: &'static str,
    },

    #[error("padding byte is not zero")]
    PaddingNotZero,

    #[error("receive buffer overflow on channel {cid}: {len} bytes, {free} free")]
    ReceiveOverflow { cid: u8, len: usize, free: usize },
}

/// Byte granularity of one flow-control credit.
pub const ACK_UNIT: usize = 4096;

/// Maximum ack units a single frame can carry (1-byte field).
pub const MAX_ACK: usize = 255;

/// Frame size ceiling on the wire.
pub const MAX_MESSAGE_SIZE: usize = 8192;

/// Maximum data frame payload (ceiling minus the 4-byte data header).
pub const MAX_DATA_SIZE: usize = MAX_MESSAGE_SIZE - 4;

/// Per-channel receive buffer, also the advertised window.
pub const CHANNEL_RECVBUF_SIZE: usize = 100 * ACK_UNIT;

/// Per-channel outbound staging buffer.
pub const CHANNEL_SENDBUF_SIZE: usize = MAX_DATA_SIZE;

/// Multiplexer fallback poll tick in milliseconds.
pub const POLL_INTERVAL_MS: u64 = 500;

/// Default keepalive interval in seconds (0 disables).
pub const KEEPALIVE_INTERVAL: u64 = 30;

/// Default outbound connect timeout in seconds.
pub const CONNECT_TIMEOUT: u64 = 10;
