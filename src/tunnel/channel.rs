//! Per-channel state and the socket relay task
//!
//! Each open channel pairs one local TCP socket with one channel id on the
//! carrier. The relay task moves bytes between the socket and two ring
//! buffers; the carrier task drains the send ring into outgoing frames and
//! fills the receive ring from incoming ones. Flow-control counters are
//! plain atomics so neither task ever blocks the other on them.

use crate::buffer::RingBuffer;
use crate::protocol::{ProtocolError, ACK_UNIT, MAX_ACK};
use bytes::{BufMut, BytesMut};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, trace};

use super::carrier::Command;

/// State shared between a channel's relay task and the carrier task.
pub(crate) struct ChannelState {
    cid: u8,
    /// Socket-to-carrier direction, drained by the carrier's scheduler
    sendbuf: Mutex<RingBuffer>,
    /// Carrier-to-socket direction, filled from incoming data frames
    recvbuf: Mutex<RingBuffer>,
    recvbuf_capacity: usize,
    /// Room left in the peer's receive buffer for this channel, in bytes
    peer_free_recvbuf: AtomicUsize,
    /// Bytes written to the socket but not yet acked back to the peer
    my_unsend_ack: AtomicUsize,
    closed: AtomicBool,
    /// Wakes the relay after the carrier drains, credits or closes
    wake: Notify,
}

impl ChannelState {
    pub(crate) fn new(
        cid: u8,
        sendbuf_capacity: usize,
        recvbuf_capacity: usize,
        peer_window: usize,
    ) -> Self {
        Self {
            cid,
            sendbuf: Mutex::new(RingBuffer::new(sendbuf_capacity)),
            recvbuf: Mutex::new(RingBuffer::new(recvbuf_capacity)),
            recvbuf_capacity,
            peer_free_recvbuf: AtomicUsize::new(peer_window),
            my_unsend_ack: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub(crate) fn cid(&self) -> u8 {
        self.cid
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the channel finished and wake its relay so it can exit.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    pub(crate) fn peer_free(&self) -> usize {
        self.peer_free_recvbuf.load(Ordering::Acquire)
    }

    /// Accept an incoming data frame payload plus its piggybacked ack.
    ///
    /// Overflowing the receive buffer means the peer ignored our window;
    /// the channel is closed and the carrier must tear the session down.
    pub(crate) async fn on_data(&self, payload: &[u8], ack_units: u8) -> Result<(), ProtocolError> {
        if ack_units > 0 {
            self.on_ack(ack_units);
        }
        let mut recvbuf = self.recvbuf.lock().await;
        let free = recvbuf.free();
        if free < payload.len() {
            drop(recvbuf);
            self.close();
            return Err(ProtocolError::ReceiveOverflow {
                cid: self.cid,
                len: payload.len(),
                free,
            });
        }
        let n = recvbuf.put(payload);
        debug_assert_eq!(n, payload.len());
        drop(recvbuf);
        self.wake.notify_one();
        Ok(())
    }

    /// Credit the peer's receive window from an ack.
    pub(crate) fn on_ack(&self, units: u8) {
        if units == 0 {
            return;
        }
        self.peer_free_recvbuf
            .fetch_add(units as usize * ACK_UNIT, Ordering::AcqRel);
        self.wake.notify_one();
    }

    /// Move up to `max` buffered bytes into `out` for the carrier.
    ///
    /// Returns how many bytes were appended; zero when the send ring was
    /// drained by the time the carrier got here.
    pub(crate) async fn pull_send_data(&self, out: &mut BytesMut, max: usize) -> usize {
        let mut sendbuf = self.sendbuf.lock().await;
        let take = sendbuf.used().min(max);
        if take == 0 {
            return 0;
        }
        let (head, tail) = sendbuf.as_slices();
        let from_head = head.len().min(take);
        out.put_slice(&head[..from_head]);
        if take > from_head {
            out.put_slice(&tail[..take - from_head]);
        }
        sendbuf.consume(take);
        drop(sendbuf);
        self.wake.notify_one();
        take
    }

    /// Drain accumulated ack credit into whole units, clamped to what one
    /// frame can carry. Leftover bytes below one unit stay accumulated.
    pub(crate) fn take_ack_units(&self) -> u8 {
        loop {
            let current = self.my_unsend_ack.load(Ordering::Acquire);
            let units = (current / ACK_UNIT).min(MAX_ACK);
            if units == 0 {
                return 0;
            }
            if self
                .my_unsend_ack
                .compare_exchange(
                    current,
                    current - units * ACK_UNIT,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return units as u8;
            }
        }
    }

    /// Record `n` bytes relayed to the local socket. Returns true once
    /// enough credit has built up to be worth acking: at least one unit,
    /// and at least a twentieth of the receive buffer.
    pub(crate) fn note_wrote_to_socket(&self, n: usize) -> bool {
        let newval = self.my_unsend_ack.fetch_add(n, Ordering::AcqRel) + n;
        newval >= ACK_UNIT && newval >= self.recvbuf_capacity / 20
    }

    /// Whether the relay may read from the socket: the peer must have
    /// window left and the send ring must have room.
    async fn wants_read(&self) -> bool {
        self.peer_free() > 0 && self.sendbuf.lock().await.free() > 0
    }

    async fn wants_write(&self) -> bool {
        !self.recvbuf.lock().await.is_empty()
    }

    /// Read from the socket into the send ring, limited by the peer's
    /// remaining window, and debit that window.
    ///
    /// `Ok(0)` means the socket reached EOF. Only called while
    /// [`wants_read`](Self::wants_read) holds, so a zero budget cannot be
    /// confused with EOF; the counters it depends on are decremented by
    /// this task alone.
    pub(crate) async fn read_socket_into_sendbuf(&self, socket: &TcpStream) -> io::Result<usize> {
        let mut sendbuf = self.sendbuf.lock().await;
        let budget = self.peer_free().min(sendbuf.free());
        if budget == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = sendbuf.read_from(socket, budget)?;
        drop(sendbuf);
        if n > 0 {
            self.peer_free_recvbuf.fetch_sub(n, Ordering::AcqRel);
        }
        Ok(n)
    }

    /// Write buffered received bytes to the socket.
    pub(crate) async fn flush_recvbuf_to_socket(&self, socket: &TcpStream) -> io::Result<usize> {
        let mut recvbuf = self.recvbuf.lock().await;
        if recvbuf.is_empty() {
            return Ok(0);
        }
        recvbuf.write_to(socket)
    }
}

impl std::fmt::Debug for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelState")
            .field("cid", &self.cid)
            .field("peer_free", &self.peer_free())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Relay bytes between one TCP socket and the channel's ring buffers
/// until either side finishes.
///
/// Socket EOF or a socket error reports `Command::ChannelEof` so the
/// carrier can start a teardown; a close from the carrier side simply ends
/// the task, which drops the socket.
pub(crate) async fn relay_socket(
    state: Arc<ChannelState>,
    socket: TcpStream,
    to_carrier: mpsc::Sender<Command>,
) {
    let cid = state.cid();
    trace!(cid, "channel relay started");

    loop {
        if state.is_closed() {
            break;
        }

        let can_read = state.wants_read().await;
        let can_write = state.wants_write().await;

        tokio::select! {
            ready = socket.readable(), if can_read => {
                if ready.is_err() {
                    report_eof(&state, &to_carrier, cid, "socket readiness lost").await;
                    break;
                }
                match state.read_socket_into_sendbuf(&socket).await {
                    Ok(0) => {
                        trace!(cid, "local socket closed");
                        report_eof(&state, &to_carrier, cid, "eof").await;
                        break;
                    }
                    Ok(_) => {
                        let _ = to_carrier.send(Command::HasData(cid)).await;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        debug!(cid, error = %e, "channel socket read failed");
                        report_eof(&state, &to_carrier, cid, "read error").await;
                        break;
                    }
                }
            }
            ready = socket.writable(), if can_write => {
                if ready.is_err() {
                    report_eof(&state, &to_carrier, cid, "socket readiness lost").await;
                    break;
                }
                match state.flush_recvbuf_to_socket(&socket).await {
                    Ok(0) => {}
                    Ok(n) => {
                        if state.note_wrote_to_socket(n) {
                            let _ = to_carrier.send(Command::HasAck(cid)).await;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        debug!(cid, error = %e, "channel socket write failed");
                        report_eof(&state, &to_carrier, cid, "write error").await;
                        break;
                    }
                }
            }
            _ = state.wake.notified() => {}
        }
    }

    trace!(cid, "channel relay finished");
}

async fn report_eof(
    state: &ChannelState,
    to_carrier: &mpsc::Sender<Command>,
    cid: u8,
    why: &str,
) {
    trace!(cid, why, "channel finished locally");
    state.close();
    let _ = to_carrier.send(Command::ChannelEof(cid)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CHANNEL_RECVBUF_SIZE, CHANNEL_SENDBUF_SIZE};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn default_state(cid: u8) -> ChannelState {
        ChannelState::new(
            cid,
            CHANNEL_SENDBUF_SIZE,
            CHANNEL_RECVBUF_SIZE,
            CHANNEL_RECVBUF_SIZE,
        )
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let near = TcpStream::connect(addr).await.unwrap();
        let (far, _) = listener.accept().await.unwrap();
        (near, far)
    }

    #[test]
    fn test_ack_drain_rounds_then_clamps() {
        let state = default_state(1);
        // relay has pushed 300 units' worth of bytes to the socket
        assert!(state.note_wrote_to_socket(300 * ACK_UNIT));

        // one frame carries at most 255 units; the rest drains next round
        assert_eq!(state.take_ack_units(), 255);
        assert_eq!(state.take_ack_units(), 45);
        assert_eq!(state.take_ack_units(), 0);
    }

    #[test]
    fn test_ack_drain_keeps_partial_unit() {
        let state = default_state(1);
        state.note_wrote_to_socket(ACK_UNIT - 1);
        assert_eq!(state.take_ack_units(), 0);

        state.note_wrote_to_socket(1);
        assert_eq!(state.take_ack_units(), 1);
        assert_eq!(state.take_ack_units(), 0);

        // the remainder below one unit carries over
        state.note_wrote_to_socket(ACK_UNIT + ACK_UNIT / 2);
        assert_eq!(state.take_ack_units(), 1);
        state.note_wrote_to_socket(ACK_UNIT / 2);
        assert_eq!(state.take_ack_units(), 1);
    }

    #[test]
    fn test_ack_signal_hysteresis() {
        let state = default_state(1);
        let threshold = CHANNEL_RECVBUF_SIZE / 20;

        // one unit alone is not worth a frame yet
        assert!(!state.note_wrote_to_socket(ACK_UNIT));
        // crossing a twentieth of the buffer is
        assert!(state.note_wrote_to_socket(threshold - ACK_UNIT));
    }

    #[test]
    fn test_on_ack_credits_peer_window() {
        let state = ChannelState::new(5, CHANNEL_SENDBUF_SIZE, CHANNEL_RECVBUF_SIZE, 8192);
        assert_eq!(state.peer_free(), 8192);
        state.on_ack(2);
        assert_eq!(state.peer_free(), 8192 + 2 * ACK_UNIT);
        state.on_ack(0);
        assert_eq!(state.peer_free(), 8192 + 2 * ACK_UNIT);
    }

    #[tokio::test]
    async fn test_on_data_overflow_closes_channel() {
        let state = ChannelState::new(3, 64, 64, 64);
        assert!(state.on_data(&[7u8; 40], 0).await.is_ok());

        let err = state.on_data(&[7u8; 40], 0).await.unwrap_err();
        match err {
            ProtocolError::ReceiveOverflow { cid, len, free } => {
                assert_eq!(cid, 3);
                assert_eq!(len, 40);
                assert_eq!(free, 24);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(state.is_closed());
    }

    #[tokio::test]
    async fn test_data_reaches_socket_and_accrues_ack() {
        let (near, mut far) = socket_pair().await;
        let state = default_state(9);

        state.on_data(b"forwarded bytes", 0).await.unwrap();
        assert!(state.wants_write().await);

        near.writable().await.unwrap();
        let n = state.flush_recvbuf_to_socket(&near).await.unwrap();
        assert_eq!(n, 15);
        assert!(!state.wants_write().await);

        let mut buf = [0u8; 32];
        let got = tokio::io::AsyncReadExt::read(&mut far, &mut buf).await.unwrap();
        assert_eq!(&buf[..got], b"forwarded bytes");

        // 15 bytes is far below the ack threshold
        assert!(!state.note_wrote_to_socket(n));
        assert_eq!(state.take_ack_units(), 0);
    }

    #[tokio::test]
    async fn test_socket_bytes_reach_send_ring_and_debit_window() {
        let (near, mut far) = socket_pair().await;
        let state = default_state(4);
        let window_before = state.peer_free();

        far.write_all(b"upstream payload").await.unwrap();
        far.flush().await.unwrap();

        near.readable().await.unwrap();
        let n = state.read_socket_into_sendbuf(&near).await.unwrap();
        assert_eq!(n, 16);
        assert_eq!(state.peer_free(), window_before - 16);

        let mut out = BytesMut::new();
        assert_eq!(state.pull_send_data(&mut out, 1024).await, 16);
        assert_eq!(&out[..], b"upstream payload");
        assert_eq!(state.pull_send_data(&mut out, 1024).await, 0);
    }

    #[tokio::test]
    async fn test_exhausted_peer_window_stops_reading() {
        let (near, mut far) = socket_pair().await;
        // peer advertised only 4 bytes of room
        let state = ChannelState::new(2, CHANNEL_SENDBUF_SIZE, CHANNEL_RECVBUF_SIZE, 4);

        far.write_all(b"0123456789").await.unwrap();
        far.flush().await.unwrap();

        near.readable().await.unwrap();
        let n = state.read_socket_into_sendbuf(&near).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(state.peer_free(), 0);
        assert!(!state.wants_read().await);

        // an ack reopens the window for the rest
        state.on_ack(1);
        assert!(state.wants_read().await);
        let n = state.read_socket_into_sendbuf(&near).await.unwrap();
        assert_eq!(n, 6);

        let mut out = BytesMut::new();
        assert_eq!(state.pull_send_data(&mut out, 1024).await, 10);
        assert_eq!(&out[..], b"0123456789");
    }

    #[tokio::test]
    async fn test_pull_send_data_respects_max() {
        let (near, mut far) = socket_pair().await;
        let state = default_state(6);

        far.write_all(&[0xAB; 100]).await.unwrap();
        far.flush().await.unwrap();
        near.readable().await.unwrap();
        assert_eq!(state.read_socket_into_sendbuf(&near).await.unwrap(), 100);

        let mut out = BytesMut::new();
        assert_eq!(state.pull_send_data(&mut out, 30).await, 30);
        assert_eq!(state.pull_send_data(&mut out, 30).await, 30);
        assert_eq!(state.pull_send_data(&mut out, 1024).await, 40);
        assert_eq!(out.len(), 100);
    }

    #[tokio::test]
    async fn test_relay_reports_local_eof() {
        let (near, far) = socket_pair().await;
        let state = Arc::new(default_state(11));
        let (tx, mut rx) = mpsc::channel(8);

        let task = tokio::spawn(relay_socket(state.clone(), near, tx));
        drop(far);

        match rx.recv().await {
            Some(Command::ChannelEof(11)) => {}
            other => panic!("expected ChannelEof, got {other:?}"),
        }
        task.await.unwrap();
        assert!(state.is_closed());
    }

    #[tokio::test]
    async fn test_relay_exits_on_close() {
        let (near, _far) = socket_pair().await;
        let state = Arc::new(default_state(12));
        let (tx, mut rx) = mpsc::channel(8);

        let task = tokio::spawn(relay_socket(state.clone(), near, tx));
        state.close();
        task.await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
