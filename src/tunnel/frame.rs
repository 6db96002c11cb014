//! Frame encoding/decoding for the carrier protocol
//!
//! Every frame begins with one leading byte that selects the kind:
//! ```text
//! +----------+---------------------------------------------------+
//! | leading  | frame                                             |
//! +----------+---------------------------------------------------+
//! | 0x00     | control: opcode (1B), then opcode-specific fields |
//! | 1..=126  | ack-only for channel id: ack units (1B)           |
//! | 129..=254| data for channel id = leading - 128:              |
//! |          |   ack units (1B), length (2B BE), payload         |
//! | 127/128/ | illegal, no channel can have these ids            |
//! | 255      |                                                   |
//! +----------+---------------------------------------------------+
//! ```
//! Control opcodes: CON1 (channel open request), CON2 (open response),
//! TRDN (teardown), PING/PONG (keepalive), PADD (zero padding).
//!
//! `decode` is resumable: it consumes exactly one whole frame from the
//! front of the buffer, or returns `Ok(None)` leaving the buffer untouched
//! while the next frame is still incomplete.

use crate::protocol::{ProtocolError, MAX_DATA_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

pub(crate) const CTRL_CON1: u8 = 1;
pub(crate) const CTRL_CON2: u8 = 2;
pub(crate) const CTRL_TRDN: u8 = 3;
pub(crate) const CTRL_PING: u8 = 4;
pub(crate) const CTRL_PONG: u8 = 5;
pub(crate) const CTRL_PADD: u8 = 6;

/// CON2 reason: channel accepted, receive window follows.
pub const CON2_ACCEPTED: u8 = 0;
/// CON2 reason: the peer does not support this target type.
pub const CON2_UNSUPPORTED: u8 = 1;
/// CON2 reason: the target did not resolve or refused the connection.
pub const CON2_UNREACHABLE: u8 = 2;

/// Connect target carried by CON1.
///
/// Ipv6 and Socks are decoded for frame alignment but never acted on;
/// the receiver answers them with [`CON2_UNSUPPORTED`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Ipv4(Ipv4Addr, u16),
    Hostname(String, u16),
    Ipv6(Ipv6Addr, u16),
    Socks,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            Target::Hostname(host, port) => write!(f, "{}:{}", host, port),
            Target::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
            Target::Socks => write!(f, "socks"),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Channel open request
    Con1 {
        cid: u8,
        window_units: u16,
        target: Target,
    },
    /// Channel open response; `window_units` is meaningful only when
    /// `reason` is [`CON2_ACCEPTED`]
    Con2 {
        cid: u8,
        reason: u8,
        window_units: u16,
    },
    /// Channel teardown
    Teardown { cid: u8 },
    /// Keepalive probe
    Ping { nonce: u32, timestamp_ms: u64 },
    /// Keepalive response, echoes the probe
    Pong { nonce: u32, timestamp_ms: u64 },
    /// `len` zero bytes of padding
    Padding { len: u8 },
    /// Ack-only frame for one channel
    Ack { cid: u8, units: u8 },
    /// Data frame with piggybacked ack
    Data { cid: u8, units: u8, payload: Bytes },
}

impl Frame {
    /// Create a channel open request
    pub fn con1(cid: u8, window_units: u16, target: Target) -> Self {
        Frame::Con1 {
            cid,
            window_units,
            target,
        }
    }

    /// Create an accepting open response
    pub fn con2_ok(cid: u8, window_units: u16) -> Self {
        Frame::Con2 {
            cid,
            reason: CON2_ACCEPTED,
            window_units,
        }
    }

    /// Create a rejecting open response
    pub fn con2_reject(cid: u8, reason: u8) -> Self {
        debug_assert_ne!(reason, CON2_ACCEPTED);
        Frame::Con2 {
            cid,
            reason,
            window_units: 0,
        }
    }

    /// Create a teardown frame
    pub fn teardown(cid: u8) -> Self {
        Frame::Teardown { cid }
    }

    /// Create a keepalive probe
    pub fn ping(nonce: u32, timestamp_ms: u64) -> Self {
        Frame::Ping {
            nonce,
            timestamp_ms,
        }
    }

    /// Create a keepalive response
    pub fn pong(nonce: u32, timestamp_ms: u64) -> Self {
        Frame::Pong {
            nonce,
            timestamp_ms,
        }
    }

    /// Create a padding frame carrying `len` zero bytes
    pub fn padding(len: u8) -> Self {
        Frame::Padding { len }
    }

    /// Create an ack-only frame
    pub fn ack(cid: u8, units: u8) -> Self {
        Frame::Ack { cid, units }
    }

    /// Create a data frame
    pub fn data(cid: u8, units: u8, payload: Bytes) -> Self {
        debug_assert!(!payload.is_empty() && payload.len() <= MAX_DATA_SIZE);
        Frame::Data {
            cid,
            units,
            payload,
        }
    }

    /// Append the wire encoding of this frame to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::Con1 {
                cid,
                window_units,
                target,
            } => {
                buf.put_u8(0);
                buf.put_u8(CTRL_CON1);
                buf.put_u8(*cid);
                buf.put_u16(*window_units);
                match target {
                    Target::Ipv4(ip, port) => {
                        buf.put_u8(0);
                        buf.put_u16(*port);
                        buf.put_slice(&ip.octets());
                    }
                    Target::Ipv6(ip, port) => {
                        buf.put_u8(1);
                        buf.put_u16(*port);
                        buf.put_slice(&ip.octets());
                    }
                    Target::Hostname(host, port) => {
                        debug_assert!(host.len() <= 255);
                        buf.put_u8(2);
                        buf.put_u16(*port);
                        buf.put_u8(host.len() as u8);
                        buf.put_slice(host.as_bytes());
                    }
                    Target::Socks => {
                        buf.put_u8(3);
                    }
                }
            }
            Frame::Con2 {
                cid,
                reason,
                window_units,
            } => {
                buf.put_u8(0);
                buf.put_u8(CTRL_CON2);
                buf.put_u8(*cid);
                buf.put_u8(*reason);
                if *reason == CON2_ACCEPTED {
                    buf.put_u16(*window_units);
                }
            }
            Frame::Teardown { cid } => {
                buf.put_u8(0);
                buf.put_u8(CTRL_TRDN);
                buf.put_u8(*cid);
            }
            Frame::Ping {
                nonce,
                timestamp_ms,
            } => {
                buf.put_u8(0);
                buf.put_u8(CTRL_PING);
                buf.put_u32(*nonce);
                buf.put_u64(*timestamp_ms);
            }
            Frame::Pong {
                nonce,
                timestamp_ms,
            } => {
                buf.put_u8(0);
                buf.put_u8(CTRL_PONG);
                buf.put_u32(*nonce);
                buf.put_u64(*timestamp_ms);
            }
            Frame::Padding { len } => {
                buf.put_u8(0);
                buf.put_u8(CTRL_PADD);
                buf.put_u8(*len);
                buf.put_bytes(0, *len as usize);
            }
            Frame::Ack { cid, units } => {
                debug_assert!(*cid >= 1 && *cid <= 126);
                buf.put_u8(*cid);
                buf.put_u8(*units);
            }
            Frame::Data {
                cid,
                units,
                payload,
            } => {
                debug_assert!(*cid >= 1 && *cid <= 126);
                buf.put_u8(cid + 128);
                buf.put_u8(*units);
                buf.put_u16(payload.len() as u16);
                buf.put_slice(payload);
            }
        }
    }

    /// Total bytes this frame occupies on the wire
    pub fn encoded_size(&self) -> usize {
        match self {
            Frame::Con1 { target, .. } => {
                // leading + opcode + cid + window + type
                6 + match target {
                    Target::Ipv4(..) => 6,
                    Target::Ipv6(..) => 18,
                    Target::Hostname(host, _) => 3 + host.len(),
                    Target::Socks => 0,
                }
            }
            Frame::Con2 { reason, .. } => {
                if *reason == CON2_ACCEPTED {
                    6
                } else {
                    4
                }
            }
            Frame::Teardown { .. } => 3,
            Frame::Ping { .. } | Frame::Pong { .. } => 14,
            Frame::Padding { len } => 3 + *len as usize,
            Frame::Ack { .. } => 2,
            Frame::Data { payload, .. } => 4 + payload.len(),
        }
    }

    /// Decode one whole frame from the front of `buf`.
    ///
    /// Consumes exactly the frame's bytes on success. Returns `Ok(None)`
    /// without consuming anything when more bytes are needed. Any error is
    /// unrecoverable: the byte stream can no longer be framed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let total = match Self::wire_len(buf)? {
            Some(total) => total,
            None => return Ok(None),
        };
        if buf.len() < total {
            return Ok(None);
        }

        let mut frame = buf.split_to(total);
        let lead = frame.get_u8();

        if lead == 0 {
            let op = frame.get_u8();
            let decoded = match op {
                CTRL_CON1 => {
                    let cid = frame.get_u8();
                    let window_units = frame.get_u16();
                    let ty = frame.get_u8();
                    let target = match ty {
                        0 => {
                            let port = frame.get_u16();
                            let mut octets = [0u8; 4];
                            frame.copy_to_slice(&mut octets);
                            Target::Ipv4(Ipv4Addr::from(octets), port)
                        }
                        1 => {
                            let port = frame.get_u16();
                            let mut octets = [0u8; 16];
                            frame.copy_to_slice(&mut octets);
                            Target::Ipv6(Ipv6Addr::from(octets), port)
                        }
                        2 => {
                            let port = frame.get_u16();
                            frame.advance(1); // length, already sized
                            let host = String::from_utf8_lossy(&frame).into_owned();
                            Target::Hostname(host, port)
                        }
                        3 => Target::Socks,
                        _ => return Err(ProtocolError::UnknownTargetType(ty)),
                    };
                    Frame::Con1 {
                        cid,
                        window_units,
                        target,
                    }
                }
                CTRL_CON2 => {
                    let cid = frame.get_u8();
                    let reason = frame.get_u8();
                    let window_units = if reason == CON2_ACCEPTED {
                        frame.get_u16()
                    } else {
                        0
                    };
                    Frame::Con2 {
                        cid,
                        reason,
                        window_units,
                    }
                }
                CTRL_TRDN => Frame::Teardown {
                    cid: frame.get_u8(),
                },
                CTRL_PING => Frame::Ping {
                    nonce: frame.get_u32(),
                    timestamp_ms: frame.get_u64(),
                },
                CTRL_PONG => Frame::Pong {
                    nonce: frame.get_u32(),
                    timestamp_ms: frame.get_u64(),
                },
                CTRL_PADD => {
                    let len = frame.get_u8();
                    if frame.iter().any(|&b| b != 0) {
                        return Err(ProtocolError::PaddingNotZero);
                    }
                    Frame::Padding { len }
                }
                _ => return Err(ProtocolError::UnknownOpcode(op)),
            };
            Ok(Some(decoded))
        } else if lead <= 126 {
            Ok(Some(Frame::Ack {
                cid: lead,
                units: frame.get_u8(),
            }))
        } else if (129..=254).contains(&lead) {
            let cid = lead - 128;
            let units = frame.get_u8();
            let _len = frame.get_u16();
            Ok(Some(Frame::Data {
                cid,
                units,
                payload: frame.freeze(),
            }))
        } else {
            Err(ProtocolError::IllegalChannelId(lead & 0x7f))
        }
    }

    /// Size of the frame at the front of `buf`, or `None` when too few
    /// bytes have arrived to tell. Errors on prefixes that can never grow
    /// into a legal frame.
    fn wire_len(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
        let lead = match buf.first() {
            Some(&lead) => lead,
            None => return Ok(None),
        };

        if lead == 0 {
            let op = match buf.get(1) {
                Some(&op) => op,
                None => return Ok(None),
            };
            match op {
                CTRL_CON1 => {
                    // leading, opcode, cid, window (2), type, then per-type
                    let ty = match buf.get(5) {
                        Some(&ty) => ty,
                        None => return Ok(None),
                    };
                    match ty {
                        0 => Ok(Some(12)),
                        1 => Ok(Some(24)),
                        2 => Ok(buf.get(8).map(|&hlen| 9 + hlen as usize)),
                        3 => Ok(Some(6)),
                        _ => Err(ProtocolError::UnknownTargetType(ty)),
                    }
                }
                CTRL_CON2 => match buf.get(3) {
                    Some(&reason) => Ok(Some(if reason == CON2_ACCEPTED { 6 } else { 4 })),
                    None => Ok(None),
                },
                CTRL_TRDN => Ok(Some(3)),
                CTRL_PING | CTRL_PONG => Ok(Some(14)),
                CTRL_PADD => Ok(buf.get(2).map(|&len| 3 + len as usize)),
                _ => Err(ProtocolError::UnknownOpcode(op)),
            }
        } else if lead == 127 || lead == 128 || lead == 255 {
            Err(ProtocolError::IllegalChannelId(lead & 0x7f))
        } else if lead < 127 {
            Ok(Some(2))
        } else {
            let len = match buf.get(2..4) {
                Some(bytes) => u16::from_be_bytes([bytes[0], bytes[1]]),
                None => return Ok(None),
            };
            if len < 1 || len as usize > MAX_DATA_SIZE {
                return Err(ProtocolError::BadDataLength(len));
            }
            Ok(Some(4 + len as usize))
        }
    }
}
