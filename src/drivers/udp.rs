//! Reference datagram driver over UDP.
//!
//! Implements the datagram-protocol contract in plaintext: a CONNECT/ACCEPT
//! exchange stands in for the handshake, streams ride 5-byte frame headers
//! `[stream_id: u32 LE][flags: u8]`, and payloads are fragmented to
//! datagram-sized chunks with FIN on the final fragment. There is no
//! reliability, pacing or encryption here, and no ideal-send-buffer hints
//! are produced; the engine's default window governs.

use log::debug;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::transport::datagram::{
    DatagramApi, DatagramConnection, DatagramStream, SendFlags, StreamEvent, StreamShutdown,
};
use crate::transport::{ConnectParams, ConnectionSettings, EventSink, StreamId};

/// Frame header length on the wire.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Stream id reserved for connection-scoped control frames.
pub const CONTROL_STREAM_ID: u32 = u32::MAX;

/// End of the sending side (final fragment).
pub const FRAME_FIN: u8 = 0x01;
/// The sender aborted its sending side.
pub const FRAME_RESET: u8 = 0x02;
/// The sender wants the peer to stop sending.
pub const FRAME_STOP: u8 = 0x04;
/// Control: connection request; payload carries the CIBIR prefix.
pub const FRAME_CONNECT: u8 = 0x10;
/// Control: connection accepted.
pub const FRAME_ACCEPT: u8 = 0x20;
/// Control: connection closing.
pub const FRAME_CLOSE: u8 = 0x40;

/// Largest stream payload per datagram, leaving header and tunnel headroom
/// within a common 1500-byte MTU.
pub const MAX_DATAGRAM_PAYLOAD: usize = 1200;

const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Factory for UDP-backed datagram connections.
pub struct UdpDatagramDriver;

impl DatagramApi for UdpDatagramDriver {
    fn open(
        &self,
        settings: &ConnectionSettings,
        events: EventSink,
    ) -> io::Result<Box<dyn DatagramConnection>> {
        // Pacing and send buffering are transport-internal concerns this
        // driver has no mechanism for.
        let _ = settings;
        Ok(Box::new(UdpConnection {
            sink: events,
            local: None,
            share_binding: false,
            cibir: Vec::new(),
            shared: None,
            next_wire_id: 0,
            shutdown_emitted: false,
        }))
    }
}

struct StreamState {
    id: StreamId,
    send_done: bool,
    recv_done: bool,
}

impl StreamState {
    fn new(id: StreamId) -> Self {
        Self {
            id,
            send_done: false,
            recv_done: false,
        }
    }
}

struct ConnState {
    sink: EventSink,
    socket: UdpSocket,
    streams: Mutex<HashMap<u32, StreamState>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl ConnState {
    fn send_frame(&self, stream_id: u32, flags: u8, payload: &[u8]) -> io::Result<()> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&stream_id.to_le_bytes());
        frame.push(flags);
        frame.extend_from_slice(payload);
        self.socket.send(&frame)?;
        Ok(())
    }

    /// Emits the stream's shutdown-complete once both halves are done, and
    /// retires the wire id.
    fn maybe_complete(&self, wire_id: u32) {
        let mut streams = self.streams.lock();
        if let Some(state) = streams.get(&wire_id) {
            if state.send_done && state.recv_done {
                let id = state.id;
                streams.remove(&wire_id);
                drop(streams);
                self.sink.stream(id, StreamEvent::ShutdownComplete);
            }
        }
    }
}

struct UdpConnection {
    sink: EventSink,
    local: Option<SocketAddr>,
    share_binding: bool,
    cibir: Vec<u8>,
    shared: Option<Arc<ConnState>>,
    next_wire_id: u32,
    shutdown_emitted: bool,
}

impl DatagramConnection for UdpConnection {
    fn set_disable_encryption(&mut self) -> io::Result<()> {
        // Nothing is encrypted to begin with.
        Ok(())
    }

    fn set_cibir_id(&mut self, id: &[u8]) -> io::Result<()> {
        self.cibir = id.to_vec();
        Ok(())
    }

    fn set_share_binding(&mut self) -> io::Result<()> {
        self.share_binding = true;
        Ok(())
    }

    fn set_local_address(&mut self, addr: SocketAddr) -> io::Result<()> {
        self.local = Some(addr);
        Ok(())
    }

    fn local_address(&self) -> io::Result<SocketAddr> {
        match &self.shared {
            Some(shared) => shared.socket.local_addr(),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection not started",
            )),
        }
    }

    fn start(&mut self, params: &ConnectParams) -> io::Result<()> {
        let socket = open_socket(params.remote, self.local, self.share_binding)?;
        socket.set_read_timeout(Some(READ_POLL_INTERVAL))?;

        let shared = Arc::new(ConnState {
            sink: self.sink.clone(),
            socket,
            streams: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let reader = shared.clone();
        std::thread::Builder::new()
            .name("netbench-udp-conn".to_string())
            .spawn(move || read_loop(reader))?;

        shared.send_frame(CONTROL_STREAM_ID, FRAME_CONNECT, &self.cibir)?;
        self.shared = Some(shared);
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(shared) = &self.shared {
            if let Err(e) = shared.send_frame(CONTROL_STREAM_ID, FRAME_CLOSE, &[]) {
                debug!("udp close frame failed: {e}");
            }
            shared.closed.store(true, Ordering::Relaxed);
        }
        if !self.shutdown_emitted {
            self.shutdown_emitted = true;
            self.sink.connection_shutdown_complete();
        }
    }

    fn open_stream(&mut self, id: StreamId) -> io::Result<Box<dyn DatagramStream>> {
        let shared = self.shared.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "connection not started")
        })?;
        let wire_id = self.next_wire_id;
        self.next_wire_id += 1;
        shared.streams.lock().insert(wire_id, StreamState::new(id));
        Ok(Box::new(UdpStream {
            wire_id,
            id,
            shared: shared.clone(),
        }))
    }
}

impl Drop for UdpConnection {
    fn drop(&mut self) {
        if let Some(shared) = &self.shared {
            shared.closed.store(true, Ordering::Relaxed);
        }
    }
}

struct UdpStream {
    wire_id: u32,
    id: StreamId,
    shared: Arc<ConnState>,
}

impl DatagramStream for UdpStream {
    fn send(&mut self, data: bytes::Bytes, flags: SendFlags) -> io::Result<()> {
        let total = data.len() as u64;
        let mut offset = 0;
        loop {
            let end = (offset + MAX_DATAGRAM_PAYLOAD).min(data.len());
            let last = end == data.len();
            let frame_flags = if last && flags.fin { FRAME_FIN } else { 0 };
            self.shared
                .send_frame(self.wire_id, frame_flags, &data[offset..end])?;
            if last {
                break;
            }
            offset = end;
        }

        self.shared.sink.stream(
            self.id,
            StreamEvent::SendComplete {
                length: total,
                canceled: false,
            },
        );
        if flags.fin {
            self.mark_send_done();
        }
        Ok(())
    }

    fn shutdown(&mut self, mode: StreamShutdown) {
        match mode {
            StreamShutdown::Abort => {
                let _ = self
                    .shared
                    .send_frame(self.wire_id, FRAME_RESET | FRAME_STOP, &[]);
                if let Some(state) = self.shared.streams.lock().get_mut(&self.wire_id) {
                    state.send_done = true;
                    state.recv_done = true;
                }
            }
            StreamShutdown::AbortSend => {
                let _ = self.shared.send_frame(self.wire_id, FRAME_RESET, &[]);
                self.mark_send_done();
                return; // mark_send_done already ran the completion check
            }
            StreamShutdown::AbortReceive => {
                let _ = self.shared.send_frame(self.wire_id, FRAME_STOP, &[]);
                if let Some(state) = self.shared.streams.lock().get_mut(&self.wire_id) {
                    state.recv_done = true;
                }
            }
        }
        self.shared.maybe_complete(self.wire_id);
    }
}

impl UdpStream {
    fn mark_send_done(&self) {
        let newly_done = {
            let mut streams = self.shared.streams.lock();
            match streams.get_mut(&self.wire_id) {
                Some(state) if !state.send_done => {
                    state.send_done = true;
                    true
                }
                _ => false,
            }
        };
        if newly_done {
            self.shared
                .sink
                .stream(self.id, StreamEvent::SendShutdownComplete);
            self.shared.maybe_complete(self.wire_id);
        }
    }
}

fn open_socket(
    remote: SocketAddr,
    local: Option<SocketAddr>,
    share_binding: bool,
) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(remote), Type::DGRAM, Some(Protocol::UDP))?;
    if share_binding {
        socket.set_reuse_address(true)?;
    }
    let bind_addr = local.unwrap_or(match remote {
        SocketAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
        SocketAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
    });
    socket.bind(&bind_addr.into())?;
    socket.connect(&remote.into())?;
    Ok(socket.into())
}

fn read_loop(shared: Arc<ConnState>) {
    let mut buf = vec![0u8; 64 * 1024];
    while !shared.closed.load(Ordering::Relaxed) {
        let len = match shared.socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                debug!("udp receive failed: {e}");
                break;
            }
        };
        if len < FRAME_HEADER_SIZE {
            continue;
        }
        let stream_id = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let flags = buf[4];
        let payload_len = (len - FRAME_HEADER_SIZE) as u64;

        if stream_id == CONTROL_STREAM_ID {
            if flags & FRAME_ACCEPT != 0 && !shared.connected.swap(true, Ordering::Relaxed) {
                shared.sink.connected();
            }
            continue;
        }

        let streams = shared.streams.lock();
        let Some(state) = streams.get(&stream_id) else {
            continue; // stale or unknown stream, drop the frame
        };
        let id = state.id;
        drop(streams);

        if flags & FRAME_RESET != 0 {
            shared.sink.stream(id, StreamEvent::PeerSendAborted);
            continue;
        }
        if flags & FRAME_STOP != 0 {
            shared.sink.stream(id, StreamEvent::PeerReceiveAborted);
            continue;
        }

        let fin = flags & FRAME_FIN != 0;
        shared.sink.stream(
            id,
            StreamEvent::Receive {
                length: payload_len,
                fin,
            },
        );
        if fin {
            if let Some(state) = shared.streams.lock().get_mut(&stream_id) {
                state.recv_done = true;
            }
            shared.maybe_complete(stream_id);
        }
    }
}
