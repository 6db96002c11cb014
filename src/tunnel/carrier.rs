//! The carrier: multiplexes up to 126 channels over one encrypted transport
//!
//! One task owns the transport, both stream ciphers and the whole slot
//! table. Everything else talks to it through commands: channel relays
//! signal pending data/acks, connect tasks report their result, handles
//! ask for new channels. The carrier stages outgoing frames into a
//! bounded send buffer, encrypts each newly staged span, and interleaves
//! transport reads and writes in one select loop.
//!
//! Channel ids are split by role so both sides can open channels without
//! coordination: the major side allocates 64..=126, the minor side
//! 1..=63. A protocol violation anywhere kills the whole carrier; the
//! continuous stream ciphers cannot recover from lost framing.

use super::channel::{self, ChannelState};
use super::frame::{Frame, Target, CON2_ACCEPTED, CON2_UNREACHABLE, CON2_UNSUPPORTED};
use super::TunnelError;
use crate::crypto::{CarrierCipher, CipherKey};
use crate::protocol::{
    ProtocolError, ACK_UNIT, CHANNEL_RECVBUF_SIZE, CHANNEL_SENDBUF_SIZE, CONNECT_TIMEOUT,
    KEEPALIVE_INTERVAL, MAX_DATA_SIZE, MAX_MESSAGE_SIZE, POLL_INTERVAL_MS,
};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Staging buffer size for each transport direction.
const CARRIER_BUF_SIZE: usize = MAX_MESSAGE_SIZE * 2;

/// Receive window advertised for every channel we open or accept.
const WINDOW_UNITS: u16 = (CHANNEL_RECVBUF_SIZE / ACK_UNIT) as u16;

/// Tuning knobs for a carrier session.
#[derive(Debug, Clone)]
pub struct CarrierOptions {
    /// Keepalive probe interval; `None` disables probes.
    pub keepalive: Option<Duration>,
    /// Pad each outgoing burst up to a multiple of this many bytes.
    pub pad_to: Option<usize>,
    /// Timeout for TCP connects made on behalf of the peer.
    pub connect_timeout: Duration,
}

impl Default for CarrierOptions {
    fn default() -> Self {
        Self {
            keepalive: Some(Duration::from_secs(KEEPALIVE_INTERVAL)),
            pad_to: None,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT),
        }
    }
}

/// Messages into the carrier task.
#[derive(Debug)]
pub(crate) enum Command {
    /// Open a channel relaying `socket` to `target` on the peer's side
    Open {
        socket: TcpStream,
        target: Target,
        reply: oneshot::Sender<Result<u8, TunnelError>>,
    },
    /// A channel's send ring has bytes ready
    HasData(u8),
    /// A channel owes the peer an ack
    HasAck(u8),
    /// A channel's local socket finished; tear the channel down
    ChannelEof(u8),
    /// TCP connect for a peer-opened channel finished
    ConnectDone {
        cid: u8,
        result: io::Result<TcpStream>,
    },
    /// Stop the carrier and close every channel
    Shutdown,
}

#[derive(Debug, Default)]
enum SlotState {
    #[default]
    Empty,
    /// CON1 sent for a local socket, waiting for the peer's verdict
    AwaitingCon2 { socket: TcpStream },
    /// Peer's CON1 accepted, TCP connect running in its own task
    Connecting { peer_units: u16 },
    Connected { channel: Arc<ChannelState> },
    /// TRDN sent, waiting for the peer's echo
    Tearing,
}

impl SlotState {
    fn name(&self) -> &'static str {
        match self {
            SlotState::Empty => "empty",
            SlotState::AwaitingCon2 { .. } => "awaiting-con2",
            SlotState::Connecting { .. } => "connecting",
            SlotState::Connected { .. } => "connected",
            SlotState::Tearing => "tearing",
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    state: SlotState,
    has_data: bool,
    has_ack: bool,
}

/// A carrier ready to be started on one transport.
///
/// Each direction runs its own AES-128-CTR stream, keyed once for the
/// life of the transport. `is_major` picks which half of the channel id
/// space this side allocates from; exactly one side of a connection must
/// be major.
pub struct Carrier<S> {
    transport: S,
    is_major: bool,
    enc: CarrierCipher,
    dec: CarrierCipher,
    options: CarrierOptions,
}

impl<S> Carrier<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(transport: S, is_major: bool, enc_key: &CipherKey, dec_key: &CipherKey) -> Self {
        Self::with_options(transport, is_major, enc_key, dec_key, CarrierOptions::default())
    }

    pub fn with_options(
        transport: S,
        is_major: bool,
        enc_key: &CipherKey,
        dec_key: &CipherKey,
        options: CarrierOptions,
    ) -> Self {
        Self {
            transport,
            is_major,
            enc: CarrierCipher::new(enc_key),
            dec: CarrierCipher::new(dec_key),
            options,
        }
    }

    /// Spawn the carrier task and return a handle to it.
    pub fn start(self) -> CarrierHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (rd, wr) = tokio::io::split(self.transport);
        let task = CarrierTask {
            rd,
            wr,
            is_major: self.is_major,
            enc: self.enc,
            dec: self.dec,
            options: self.options,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            slots: std::array::from_fn(|_| Slot::default()),
            has_any_data: false,
            control_queue: VecDeque::new(),
            sendbuf: BytesMut::with_capacity(CARRIER_BUF_SIZE),
            recvbuf: BytesMut::with_capacity(CARRIER_BUF_SIZE),
            rdbuf: vec![0u8; CARRIER_BUF_SIZE].into_boxed_slice(),
            last_ping: None,
        };
        let join = tokio::spawn(task.run());
        CarrierHandle { cmd_tx, join }
    }
}

/// Handle to a running carrier.
pub struct CarrierHandle {
    cmd_tx: mpsc::Sender<Command>,
    join: JoinHandle<Result<(), TunnelError>>,
}

impl CarrierHandle {
    /// A cheap cloneable handle for opening channels, e.g. one per
    /// tunnel listener.
    pub fn opener(&self) -> ChannelOpener {
        ChannelOpener {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Open a channel relaying `socket` to `host:port` on the peer side.
    pub async fn open_channel(
        &self,
        socket: TcpStream,
        host: &str,
        port: u16,
    ) -> Result<u8, TunnelError> {
        self.opener().open_channel(socket, host, port).await
    }

    /// Ask the carrier to stop and close every channel.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the carrier to finish. Clean shutdown and transport EOF
    /// are `Ok`; protocol violations and transport failures are errors.
    pub async fn join(self) -> Result<(), TunnelError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(TunnelError::Io(io::Error::new(io::ErrorKind::Other, e))),
        }
    }
}

/// Opens channels on a running carrier. Clones share the same carrier.
#[derive(Debug, Clone)]
pub struct ChannelOpener {
    cmd_tx: mpsc::Sender<Command>,
}

impl ChannelOpener {
    /// Open a channel relaying `socket` to `host:port` on the peer side.
    ///
    /// Returns the allocated channel id once the open request is queued;
    /// the data starts flowing as soon as the peer answers CON2. On any
    /// error the socket has already been dropped.
    pub async fn open_channel(
        &self,
        socket: TcpStream,
        host: &str,
        port: u16,
    ) -> Result<u8, TunnelError> {
        let target = classify_target(host, port)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Open {
                socket,
                target,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TunnelError::CarrierClosed)?;
        reply_rx.await.map_err(|_| TunnelError::CarrierClosed)?
    }
}

/// Turn a configured target address into a CON1 target.
///
/// IPv4 literals go as 4 raw octets; anything else travels as a hostname
/// string for the peer to resolve. IPv6 literals are refused here; the
/// wire carries them only far enough for a peer to reject them.
pub(crate) fn classify_target(host: &str, port: u16) -> Result<Target, TunnelError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(Target::Ipv4(ip, port));
    }
    if host.parse::<Ipv6Addr>().is_ok() {
        return Err(TunnelError::UnsupportedAddress(host.to_string()));
    }
    if host.is_empty() || host.len() > 255 {
        return Err(TunnelError::InvalidAddress(host.to_string()));
    }
    Ok(Target::Hostname(host.to_string(), port))
}

fn own_range(is_major: bool) -> (u8, u8) {
    if is_major {
        (64, 126)
    } else {
        (1, 63)
    }
}

fn remote_range(is_major: bool) -> (u8, u8) {
    own_range(!is_major)
}

fn find_free_slot(slots: &[Slot; 127], is_major: bool) -> Option<u8> {
    let (lo, hi) = own_range(is_major);
    (lo..=hi).find(|&cid| matches!(slots[cid as usize].state, SlotState::Empty))
}

/// Padding frame body lengths needed to round a buffer of `len` bytes up
/// to a multiple of `quantum`. The smallest padding frame is 3 bytes, so
/// a gap of 1 or 2 is stretched by one more quantum, and no chunk leaves
/// a remainder smaller than a frame.
fn padding_body_sizes(len: usize, quantum: usize) -> Vec<u8> {
    let mut bodies = Vec::new();
    if quantum == 0 {
        return bodies;
    }
    let mut gap = (quantum - len % quantum) % quantum;
    if gap == 0 {
        return bodies;
    }
    if gap < 3 {
        gap += quantum;
    }
    while gap > 0 {
        let mut take = gap.min(3 + 255);
        let rem = gap - take;
        if rem > 0 && rem < 3 {
            take -= 3 - rem;
        }
        bodies.push((take - 3) as u8);
        gap -= take;
    }
    bodies
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct CarrierTask<S> {
    rd: ReadHalf<S>,
    wr: WriteHalf<S>,
    is_major: bool,
    enc: CarrierCipher,
    dec: CarrierCipher,
    options: CarrierOptions,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
    /// Index 0 is never used; channel ids are 1..=126.
    slots: [Slot; 127],
    /// True iff some slot's `has_data` is set.
    has_any_data: bool,
    control_queue: VecDeque<Frame>,
    /// Staged output; everything below its length is already encrypted.
    sendbuf: BytesMut,
    /// Decrypted input still waiting for a complete frame.
    recvbuf: BytesMut,
    /// Scratch space for transport reads.
    rdbuf: Box<[u8]>,
    last_ping: Option<(u32, Instant)>,
}

impl<S> CarrierTask<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn run(mut self) -> Result<(), TunnelError> {
        let result = self.drive().await;
        self.close_all_channels();
        match &result {
            Ok(()) => info!("carrier finished"),
            Err(e) => warn!(error = %e, "carrier failed"),
        }
        result
    }

    async fn drive(&mut self) -> Result<(), TunnelError> {
        let keepalive_period = self
            .options
            .keepalive
            .unwrap_or(Duration::from_secs(3600));
        let keepalive_enabled = self.options.keepalive.is_some();
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + keepalive_period,
            keepalive_period,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // fallback tick so a fill pass runs even on a quiet carrier
        let mut poll = tokio::time::interval(Duration::from_millis(POLL_INTERVAL_MS));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.fill_and_encrypt().await;

            let want_read = self.recvbuf.len() < MAX_MESSAGE_SIZE;
            let read_max = CARRIER_BUF_SIZE - self.recvbuf.len();

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd).await {
                                info!("carrier shutting down");
                                return Ok(());
                            }
                        }
                        None => return Ok(()),
                    }
                }
                read = self.rd.read(&mut self.rdbuf[..read_max]), if want_read => {
                    let n = read?;
                    if n == 0 {
                        info!("transport closed by peer");
                        return Ok(());
                    }
                    self.dec.apply(&mut self.rdbuf[..n]);
                    self.recvbuf.extend_from_slice(&self.rdbuf[..n]);
                    while let Some(frame) = Frame::decode(&mut self.recvbuf)? {
                        self.dispatch(frame).await?;
                    }
                }
                wrote = self.wr.write(&self.sendbuf), if !self.sendbuf.is_empty() => {
                    let n = wrote?;
                    if n == 0 {
                        return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                    }
                    self.sendbuf.advance(n);
                }
                _ = keepalive.tick(), if keepalive_enabled => {
                    self.queue_ping();
                }
                _ = poll.tick() => {}
            }
        }
    }

    /// Returns false when the carrier should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Open {
                socket,
                target,
                reply,
            } => match find_free_slot(&self.slots, self.is_major) {
                Some(cid) => {
                    info!(cid, %target, "opening channel");
                    let slot = &mut self.slots[cid as usize];
                    slot.state = SlotState::AwaitingCon2 { socket };
                    slot.has_data = false;
                    slot.has_ack = false;
                    self.queue_control(Frame::con1(cid, WINDOW_UNITS, target));
                    let _ = reply.send(Ok(cid));
                }
                None => {
                    warn!(%target, "no free channel id, dropping socket");
                    let _ = reply.send(Err(TunnelError::ChannelsExhausted));
                }
            },
            Command::HasData(cid) => {
                let slot = &mut self.slots[cid as usize];
                if matches!(slot.state, SlotState::Connected { .. }) {
                    slot.has_data = true;
                    self.has_any_data = true;
                }
            }
            Command::HasAck(cid) => {
                let slot = &mut self.slots[cid as usize];
                if matches!(slot.state, SlotState::Connected { .. }) {
                    slot.has_ack = true;
                }
            }
            Command::ChannelEof(cid) => {
                let slot = &mut self.slots[cid as usize];
                if matches!(slot.state, SlotState::Connected { .. }) {
                    if let SlotState::Connected { channel } =
                        std::mem::replace(&mut slot.state, SlotState::Tearing)
                    {
                        channel.close();
                    }
                    slot.has_data = false;
                    slot.has_ack = false;
                    debug!(cid, "local side closed, tearing down");
                    self.queue_control(Frame::teardown(cid));
                }
            }
            Command::ConnectDone { cid, result } => self.on_connect_done(cid, result),
            Command::Shutdown => return false,
        }
        true
    }

    fn on_connect_done(&mut self, cid: u8, result: io::Result<TcpStream>) {
        let slot = &mut self.slots[cid as usize];
        if !matches!(slot.state, SlotState::Connecting { .. }) {
            // carrier already gave up on this slot
            return;
        }
        match result {
            Ok(socket) => {
                let peer_units = match slot.state {
                    SlotState::Connecting { peer_units } => peer_units,
                    _ => unreachable!(),
                };
                let channel = Arc::new(ChannelState::new(
                    cid,
                    CHANNEL_SENDBUF_SIZE,
                    CHANNEL_RECVBUF_SIZE,
                    peer_units as usize * ACK_UNIT,
                ));
                slot.state = SlotState::Connected {
                    channel: channel.clone(),
                };
                info!(cid, "channel established");
                tokio::spawn(channel::relay_socket(channel, socket, self.cmd_tx.clone()));
                self.queue_control(Frame::con2_ok(cid, WINDOW_UNITS));
            }
            Err(e) => {
                warn!(cid, error = %e, "connect for peer failed");
                slot.state = SlotState::Empty;
                self.queue_control(Frame::con2_reject(cid, CON2_UNREACHABLE));
            }
        }
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        match frame {
            Frame::Con1 {
                cid,
                window_units,
                target,
            } => self.on_con1(cid, window_units, target)?,
            Frame::Con2 {
                cid,
                reason,
                window_units,
            } => self.on_con2(cid, reason, window_units)?,
            Frame::Teardown { cid } => self.on_teardown(cid)?,
            Frame::Ping {
                nonce,
                timestamp_ms,
            } => {
                trace!(nonce, peer_time_ms = timestamp_ms, "ping");
                self.queue_control(Frame::pong(nonce, now_ms()));
            }
            Frame::Pong {
                nonce,
                timestamp_ms,
            } => {
                if let Some((sent_nonce, sent_at)) = self.last_ping.take() {
                    if sent_nonce == nonce {
                        debug!(
                            rtt_ms = sent_at.elapsed().as_millis() as u64,
                            peer_time_ms = timestamp_ms,
                            "pong"
                        );
                    } else {
                        self.last_ping = Some((sent_nonce, sent_at));
                        trace!(nonce, "pong with unknown nonce");
                    }
                }
            }
            Frame::Padding { len } => trace!(len, "padding"),
            Frame::Ack { cid, units } => {
                if let SlotState::Connected { channel } = &self.slots[cid as usize].state {
                    channel.on_ack(units);
                } else {
                    trace!(cid, "ack for inactive channel dropped");
                }
            }
            Frame::Data {
                cid,
                units,
                payload,
            } => {
                let channel = match &self.slots[cid as usize].state {
                    SlotState::Connected { channel } => Some(channel.clone()),
                    _ => None,
                };
                match channel {
                    Some(channel) => channel.on_data(&payload, units).await?,
                    None => trace!(cid, len = payload.len(), "data for inactive channel dropped"),
                }
            }
        }
        Ok(())
    }

    fn on_con1(&mut self, cid: u8, window_units: u16, target: Target) -> Result<(), ProtocolError> {
        let (lo, hi) = remote_range(self.is_major);
        if cid < lo || cid > hi {
            return Err(ProtocolError::ChannelIdWrongHalf { cid });
        }
        let slot = &mut self.slots[cid as usize];
        if !matches!(slot.state, SlotState::Empty) {
            return Err(ProtocolError::UnexpectedFrame {
                frame: "CON1",
                cid,
                state: slot.state.name(),
            });
        }
        match target {
            Target::Ipv4(..) | Target::Hostname(..) => {
                debug!(cid, %target, "peer opening channel");
                slot.state = SlotState::Connecting {
                    peer_units: window_units,
                };
                slot.has_data = false;
                slot.has_ack = false;
                self.spawn_connect(cid, target);
            }
            Target::Ipv6(..) | Target::Socks => {
                debug!(cid, %target, "rejecting unsupported target");
                self.queue_control(Frame::con2_reject(cid, CON2_UNSUPPORTED));
            }
        }
        Ok(())
    }

    fn on_con2(&mut self, cid: u8, reason: u8, window_units: u16) -> Result<(), ProtocolError> {
        let (lo, hi) = own_range(self.is_major);
        if cid < lo || cid > hi {
            return Err(ProtocolError::ChannelIdWrongHalf { cid });
        }
        let slot = &mut self.slots[cid as usize];
        match std::mem::replace(&mut slot.state, SlotState::Empty) {
            SlotState::AwaitingCon2 { socket } => {
                if reason != CON2_ACCEPTED {
                    warn!(cid, reason, "peer rejected channel");
                    drop(socket);
                    return Ok(());
                }
                let channel = Arc::new(ChannelState::new(
                    cid,
                    CHANNEL_SENDBUF_SIZE,
                    CHANNEL_RECVBUF_SIZE,
                    window_units as usize * ACK_UNIT,
                ));
                slot.state = SlotState::Connected {
                    channel: channel.clone(),
                };
                info!(cid, window_units, "channel established");
                tokio::spawn(channel::relay_socket(channel, socket, self.cmd_tx.clone()));
            }
            other => {
                let state = other.name();
                slot.state = other;
                return Err(ProtocolError::UnexpectedFrame {
                    frame: "CON2",
                    cid,
                    state,
                });
            }
        }
        Ok(())
    }

    fn on_teardown(&mut self, cid: u8) -> Result<(), ProtocolError> {
        if cid < 1 || cid > 126 {
            return Err(ProtocolError::IllegalChannelId(cid));
        }
        let slot = &mut self.slots[cid as usize];
        match std::mem::replace(&mut slot.state, SlotState::Empty) {
            SlotState::Tearing => {
                debug!(cid, "teardown acknowledged");
                slot.has_data = false;
                slot.has_ack = false;
            }
            SlotState::Connected { channel } => {
                debug!(cid, "peer tore down channel");
                channel.close();
                slot.has_data = false;
                slot.has_ack = false;
                self.queue_control(Frame::teardown(cid));
            }
            other => {
                let state = other.name();
                slot.state = other;
                return Err(ProtocolError::UnexpectedFrame {
                    frame: "TRDN",
                    cid,
                    state,
                });
            }
        }
        Ok(())
    }

    fn spawn_connect(&self, cid: u8, target: Target) {
        let cmd_tx = self.cmd_tx.clone();
        let limit = self.options.connect_timeout;
        tokio::spawn(async move {
            let result = connect_target(&target, limit).await;
            let _ = cmd_tx.send(Command::ConnectDone { cid, result }).await;
        });
    }

    fn queue_control(&mut self, frame: Frame) {
        self.control_queue.push_back(frame);
    }

    fn queue_ping(&mut self) {
        let nonce: u32 = rand::random();
        self.last_ping = Some((nonce, Instant::now()));
        self.control_queue.push_back(Frame::ping(nonce, now_ms()));
        trace!(nonce, "keepalive ping queued");
    }

    fn headroom(&self) -> usize {
        CARRIER_BUF_SIZE.saturating_sub(self.sendbuf.len())
    }

    /// Stage pending frames and encrypt the newly staged span.
    async fn fill_and_encrypt(&mut self) {
        let mark = self.sendbuf.len();
        self.fill_sendbuf().await;
        if let Some(quantum) = self.options.pad_to {
            if self.sendbuf.len() > mark {
                for body in padding_body_sizes(self.sendbuf.len(), quantum) {
                    Frame::padding(body).encode(&mut self.sendbuf);
                }
            }
        }
        if self.sendbuf.len() > mark {
            self.enc.apply(&mut self.sendbuf[mark..]);
        }
    }

    /// Stage control frames, then ack-only frames, then data frames.
    ///
    /// Control frames keep their queue order. A channel with pending data
    /// piggybacks its ack on the data frame instead of an ack-only frame.
    /// Data channels are picked by scanning up or down on a coin flip, a
    /// cheap anti-starvation heuristic rather than strict round robin.
    async fn fill_sendbuf(&mut self) {
        while let Some(frame) = self.control_queue.front() {
            if self.headroom() < frame.encoded_size() {
                break;
            }
            if let Some(frame) = self.control_queue.pop_front() {
                frame.encode(&mut self.sendbuf);
            }
        }

        for cid in 1..=126u8 {
            if self.headroom() < MAX_MESSAGE_SIZE {
                break;
            }
            let slot = &mut self.slots[cid as usize];
            if !slot.has_ack || slot.has_data {
                continue;
            }
            slot.has_ack = false;
            if let SlotState::Connected { channel } = &slot.state {
                let units = channel.take_ack_units();
                if units > 0 {
                    trace!(cid, units, "ack frame");
                    Frame::ack(cid, units).encode(&mut self.sendbuf);
                }
            }
        }

        while self.has_any_data && self.headroom() >= MAX_MESSAGE_SIZE {
            let descending: bool = rand::random();
            let mut picked = 0u8;
            for i in 0..126u8 {
                let cid = if descending { 126 - i } else { 1 + i };
                let slot = &self.slots[cid as usize];
                if slot.has_data && matches!(slot.state, SlotState::Connected { .. }) {
                    picked = cid;
                    break;
                }
            }
            if picked == 0 {
                self.has_any_data = false;
                break;
            }

            let slot = &mut self.slots[picked as usize];
            slot.has_data = false;
            let channel = match &slot.state {
                SlotState::Connected { channel } => channel.clone(),
                _ => continue,
            };

            let header_at = self.sendbuf.len();
            self.sendbuf.put_bytes(0, 4);
            let size = channel.pull_send_data(&mut self.sendbuf, MAX_DATA_SIZE).await;
            if size == 0 {
                // drained between the signal and now, this happens
                self.sendbuf.truncate(header_at);
                continue;
            }
            if size == MAX_DATA_SIZE {
                // the ring may hold more than one frame's worth
                self.slots[picked as usize].has_data = true;
            }
            let units = channel.take_ack_units();
            self.slots[picked as usize].has_ack = false;
            self.sendbuf[header_at] = picked + 128;
            self.sendbuf[header_at + 1] = units;
            let len = (size as u16).to_be_bytes();
            self.sendbuf[header_at + 2] = len[0];
            self.sendbuf[header_at + 3] = len[1];
            trace!(cid = picked, size, units, "data frame");
        }
    }

    fn close_all_channels(&mut self) {
        for slot in self.slots.iter_mut() {
            if let SlotState::Connected { channel } = &slot.state {
                channel.close();
            }
            slot.state = SlotState::Empty;
            slot.has_data = false;
            slot.has_ack = false;
        }
        self.has_any_data = false;
    }
}

async fn connect_target(target: &Target, limit: Duration) -> io::Result<TcpStream> {
    let connect = async {
        match target {
            Target::Ipv4(ip, port) => TcpStream::connect((*ip, *port)).await,
            Target::Hostname(host, port) => TcpStream::connect((host.as_str(), *port)).await,
            Target::Ipv6(..) | Target::Socks => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unsupported target type",
            )),
        }
    };
    match tokio::time::timeout(limit, connect).await {
        Ok(result) => result,
        Err(_) => Err(io::ErrorKind::TimedOut.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_target() {
        assert_eq!(
            classify_target("10.1.2.3", 80).unwrap(),
            Target::Ipv4(Ipv4Addr::new(10, 1, 2, 3), 80)
        );
        assert_eq!(
            classify_target("example.com", 443).unwrap(),
            Target::Hostname("example.com".into(), 443)
        );
        // single labels are legal hostnames
        assert_eq!(
            classify_target("localhost", 22).unwrap(),
            Target::Hostname("localhost".into(), 22)
        );

        assert!(matches!(
            classify_target("::1", 22),
            Err(TunnelError::UnsupportedAddress(_))
        ));
        assert!(matches!(
            classify_target("", 80),
            Err(TunnelError::InvalidAddress(_))
        ));
        let long = "x".repeat(256);
        assert!(matches!(
            classify_target(&long, 80),
            Err(TunnelError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_find_free_slot_halves() {
        let mut slots: [Slot; 127] = std::array::from_fn(|_| Slot::default());

        assert_eq!(find_free_slot(&slots, true), Some(64));
        assert_eq!(find_free_slot(&slots, false), Some(1));

        slots[64].state = SlotState::Tearing;
        assert_eq!(find_free_slot(&slots, true), Some(65));

        for cid in 1..=63 {
            slots[cid].state = SlotState::Connecting { peer_units: 1 };
        }
        assert_eq!(find_free_slot(&slots, false), None);
        // the other half is unaffected
        assert_eq!(find_free_slot(&slots, true), Some(65));
    }

    #[test]
    fn test_padding_aligns_to_quantum() {
        for quantum in [16usize, 32, 512, 1000] {
            for len in 0..2 * quantum {
                let added: usize = padding_body_sizes(len, quantum)
                    .iter()
                    .map(|&b| 3 + b as usize)
                    .sum();
                assert_eq!(
                    (len + added) % quantum,
                    0,
                    "len={len} quantum={quantum} added={added}"
                );
                // never more than one extra quantum of cover traffic
                assert!(added <= quantum + 2, "len={len} quantum={quantum}");
            }
        }
    }

    #[test]
    fn test_padding_small_gap_is_stretched() {
        // gap of 1 cannot hold a 3-byte padding frame
        let bodies = padding_body_sizes(31, 32);
        let added: usize = bodies.iter().map(|&b| 3 + b as usize).sum();
        assert_eq!(added, 33);
        assert_eq!((31 + added) % 32, 0);
    }

    #[test]
    fn test_padding_large_gap_splits_frames() {
        // gap of 1000 needs several frames, none leaving a 1-2 byte tail
        let bodies = padding_body_sizes(24, 1024);
        let added: usize = bodies.iter().map(|&b| 3 + b as usize).sum();
        assert_eq!(added, 1000);
        assert!(bodies.len() > 1);
    }

    #[test]
    fn test_aligned_buffer_needs_no_padding() {
        assert!(padding_body_sizes(0, 512).is_empty());
        assert!(padding_body_sizes(1024, 512).is_empty());
    }
}
