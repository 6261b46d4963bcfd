//! Worker threads.
//!
//! One kernel thread per worker, optionally pinned to its processor. A
//! worker owns its connection and stream pools outright; every transport
//! event for a connection lands on the owning worker's queue, so all
//! per-entity state is single-writer and lock-free. The queue doubles as
//! the wake event: the thread sleeps in `recv` when caught up.

use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crate::client::{ClientShared, Stack};
use crate::connection::{Connection, ConnectionHandle};
use crate::pool::{SendDataPool, SlotPool};
use crate::stream::{SendContext, Stream};
use crate::transport::datagram::{ConnectionEvent, StreamEvent};
use crate::transport::tcp::{TcpReceive, TcpSendData};
use crate::transport::{
    ConnectParams, ConnectionId, ConnectionSettings, EventSink, StreamId, TransportEvent,
    WorkerMessage,
};
use crate::Result;

/// Worker state shared with the top and with transport stacks.
pub(crate) struct WorkerShared {
    pub processor: usize,
    pub remote: SocketAddr,
    pub target: String,
    /// Local binding for this worker's connections. Starts as the
    /// configured bind entry; the first started connection mirrors its
    /// chosen address back here when only the family was unspecified.
    pub local_addr: Mutex<Option<SocketAddr>>,

    pub connections_queued: AtomicU64,
    pub connections_created: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_connected: AtomicU64,
    pub connections_completed: AtomicU64,
    pub streams_started: AtomicU64,
    pub streams_completed: AtomicU64,

    tx: Sender<WorkerMessage>,
}

impl WorkerShared {
    pub fn new(
        processor: usize,
        remote: SocketAddr,
        target: String,
        local_addr: Option<SocketAddr>,
        tx: Sender<WorkerMessage>,
    ) -> Self {
        Self {
            processor,
            remote,
            target,
            local_addr: Mutex::new(local_addr),
            connections_queued: AtomicU64::new(0),
            connections_created: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_connected: AtomicU64::new(0),
            connections_completed: AtomicU64::new(0),
            streams_started: AtomicU64::new(0),
            streams_completed: AtomicU64::new(0),
            tx,
        }
    }

    /// Assigns one more connection to this worker and wakes it.
    pub fn queue_new_connection(&self) {
        self.connections_queued.fetch_add(1, Ordering::Relaxed);
        self.wake();
    }

    pub fn wake(&self) {
        let _ = self.tx.send(WorkerMessage::Wake);
    }

    pub(crate) fn sender(&self) -> Sender<WorkerMessage> {
        self.tx.clone()
    }
}

/// A launched worker: its shared state plus the join handle.
pub(crate) struct Worker {
    pub shared: Arc<WorkerShared>,
    pub thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(
        index: u32,
        core: Option<core_affinity::CoreId>,
        affinitize: bool,
        shared: Arc<WorkerShared>,
        client: Arc<ClientShared>,
        rx: Receiver<WorkerMessage>,
    ) -> Result<Self> {
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name(format!("netbench-worker-{index}"))
            .spawn(move || {
                if affinitize {
                    if let Some(core) = core {
                        if !core_affinity::set_for_current(core) {
                            warn!("failed to pin worker {index} to processor {}", core.id);
                        }
                    }
                }
                WorkerState::new(client, thread_shared, rx).run();
            })?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }
}

/// Thread-local worker state: the pools and the event loop.
struct WorkerState {
    client: Arc<ClientShared>,
    shared: Arc<WorkerShared>,
    rx: Receiver<WorkerMessage>,
    connections: SlotPool<Connection>,
    streams: SlotPool<Stream>,
    sends: SendDataPool,
}

impl WorkerState {
    fn new(client: Arc<ClientShared>, shared: Arc<WorkerShared>, rx: Receiver<WorkerMessage>) -> Self {
        Self {
            client,
            shared,
            rx,
            connections: SlotPool::new(),
            streams: SlotPool::new(),
            sends: SendDataPool::default(),
        }
    }

    fn run(mut self) {
        debug!("worker on processor {} running", self.shared.processor);
        while self.client.is_running() {
            while self.client.is_running()
                && self.shared.connections_created.load(Ordering::Relaxed)
                    < self.shared.connections_queued.load(Ordering::Relaxed)
            {
                self.start_new_connection();
            }
            match self.rx.recv() {
                Ok(WorkerMessage::Wake) => {}
                Ok(WorkerMessage::Transport(event)) => self.dispatch(event),
                Err(_) => break,
            }
        }
        debug!("worker on processor {} exiting", self.shared.processor);
    }

    fn dispatch(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connection {
                connection,
                event: ConnectionEvent::Connected,
            } => self.on_connected(connection),
            TransportEvent::Connection {
                connection,
                event: ConnectionEvent::ShutdownComplete,
            } => self.on_connection_shutdown_complete(connection),
            TransportEvent::Stream {
                connection,
                stream,
                event,
            } => self.on_stream_event(connection, stream, event),
            TransportEvent::TcpConnect {
                connection,
                connected,
            } => {
                if connected {
                    self.on_connected(connection);
                } else {
                    self.on_connection_shutdown_complete(connection);
                }
            }
            TransportEvent::TcpSendComplete { connection, chain } => {
                self.on_tcp_send_complete(connection, chain)
            }
            TransportEvent::TcpReceive {
                connection,
                receive,
            } => self.on_tcp_receive(connection, receive),
        }
    }

    // --- Connection lifecycle ---

    fn start_new_connection(&mut self) {
        self.shared.connections_created.fetch_add(1, Ordering::Relaxed);
        self.shared.connections_active.fetch_add(1, Ordering::Relaxed);
        let key = self.connections.insert(Connection::new());
        match self.initialize_connection(key) {
            Ok(handle) => {
                if let Some(conn) = self.connections.get_mut(key) {
                    conn.handle = Some(handle);
                }
            }
            Err(e) => {
                warn!("connection setup failed: {e}");
                self.connections.remove(key);
                self.shared.connections_active.fetch_sub(1, Ordering::Relaxed);
                if !self.client.config.repeat_connections {
                    self.client.on_connection_finished();
                }
            }
        }
    }

    /// Opens, configures and starts a transport connection.
    fn initialize_connection(&mut self, key: ConnectionId) -> Result<ConnectionHandle> {
        let config = &self.client.config;
        let params = ConnectParams {
            server_name: self.shared.target.clone(),
            remote: self.shared.remote,
            local: *self.shared.local_addr.lock(),
            family: config.address_family,
        };
        let sink = EventSink::new(key, self.shared.sender());

        match &self.client.stack {
            Stack::Datagram(api) => {
                let settings = ConnectionSettings {
                    pacing: config.pacing,
                    send_buffering: config.send_buffering,
                };
                let mut handle = api.open(&settings, sink)?;
                if !config.encryption {
                    handle.set_disable_encryption()?;
                }
                if let Some(cibir) = config.cibir_wire() {
                    handle.set_cibir_id(&cibir)?;
                }
                if config.specific_local_addresses() {
                    handle.set_share_binding()?;
                    if let Some(local) = params.local {
                        handle.set_local_address(local)?;
                    }
                }
                handle.start(&params)?;
                if config.specific_local_addresses() && params.local.is_none() {
                    // Mirror the chosen binding so this worker's next
                    // connections share it.
                    match handle.local_address() {
                        Ok(addr) => *self.shared.local_addr.lock() = Some(addr),
                        Err(e) => debug!("local address read-back failed: {e}"),
                    }
                }
                Ok(ConnectionHandle::Datagram(handle))
            }
            Stack::Tcp(engine) => {
                let handle = engine.connect(&params, sink)?;
                Ok(ConnectionHandle::Tcp(handle))
            }
        }
    }

    fn on_connected(&mut self, ck: ConnectionId) {
        if self.connections.get(ck).is_none() {
            return;
        }
        self.shared.connections_connected.fetch_add(1, Ordering::Relaxed);
        let stream_count = self.client.config.stream_count;
        if stream_count == 0 {
            // Pure handshake run: the connection's work is done.
            if let Some(conn) = self.connections.get_mut(ck) {
                conn.request_shutdown();
            }
        } else {
            for _ in 0..stream_count {
                self.start_new_stream(ck);
            }
        }
    }

    fn on_connection_shutdown_complete(&mut self, ck: ConnectionId) {
        let Some(conn) = self.connections.remove(ck) else {
            return;
        };
        if self.client.config.print_connections {
            println!(
                "Connection complete: {} streams created, {} still active.",
                conn.streams_created, conn.streams_active
            );
        }
        // Streams the transport never individually finished die with the
        // connection.
        for &sk in conn.active_streams() {
            self.streams.remove(sk);
        }
        self.shared.connections_completed.fetch_add(1, Ordering::Relaxed);
        self.shared.connections_active.fetch_sub(1, Ordering::Relaxed);
        if self.client.config.repeat_connections {
            self.shared.queue_new_connection();
        } else {
            self.client.on_connection_finished();
        }
    }

    // --- Stream lifecycle ---

    fn start_new_stream(&mut self, ck: ConnectionId) {
        let Some(conn) = self.connections.get_mut(ck) else {
            return;
        };
        conn.streams_created += 1;
        conn.streams_active += 1;
        let sk = self.streams.insert(Stream::new());

        match conn.handle.as_mut() {
            Some(ConnectionHandle::Datagram(handle)) => match handle.open_stream(sk) {
                Ok(stream_handle) => {
                    if let Some(stream) = self.streams.get_mut(sk) {
                        stream.handle = Some(stream_handle);
                    }
                    conn.track_stream(sk);
                }
                Err(e) => {
                    warn!("stream open failed: {e}");
                    self.streams.remove(sk);
                    conn.streams_active -= 1;
                    let stream_count = self.client.config.stream_count;
                    if !self.client.config.repeat_streams && conn.streams_done(stream_count) {
                        conn.request_shutdown();
                    }
                    return;
                }
            },
            Some(ConnectionHandle::Tcp(_)) => {
                let wire_id = self.shared.streams_started.load(Ordering::Relaxed) as u32;
                if let Some(stream) = self.streams.get_mut(sk) {
                    stream.tcp_id = wire_id;
                }
                conn.register_tcp_stream(wire_id, sk);
                conn.track_stream(sk);
            }
            None => {
                self.streams.remove(sk);
                conn.streams_active -= 1;
                return;
            }
        }

        self.shared.streams_started.fetch_add(1, Ordering::Relaxed);
        self.drive_send(ck, sk);
    }

    /// Runs the stream's send loop against its connection's transport.
    fn drive_send(&mut self, ck: ConnectionId, sk: StreamId) {
        let Some(stream) = self.streams.get_mut(sk) else {
            return;
        };
        let Some(handle) = self.connections.get_mut(ck).and_then(|c| c.handle.as_mut()) else {
            return;
        };
        let mut cx = SendContext {
            config: &self.client.config,
            buffer: &self.client.buffer,
            sends: &mut self.sends,
        };
        stream.send(handle.send_target(), &mut cx);
    }

    fn on_stream_event(&mut self, ck: ConnectionId, sk: StreamId, event: StreamEvent) {
        match event {
            StreamEvent::SendComplete { length, canceled } => {
                let Some(stream) = self.streams.get_mut(sk) else {
                    return;
                };
                stream.on_send_complete(length, canceled);
                if !canceled {
                    self.drive_send(ck, sk);
                }
            }
            StreamEvent::Receive { length, fin } => {
                let Some(stream) = self.streams.get_mut(sk) else {
                    return;
                };
                if stream.on_receive(length, fin, &self.client.config) {
                    stream.abort_receive();
                }
            }
            StreamEvent::SendShutdownComplete => {
                let Some(stream) = self.streams.get_mut(sk) else {
                    return;
                };
                stream.on_send_shutdown_complete(&self.client.config);
            }
            StreamEvent::ShutdownComplete => self.finish_stream(ck, sk),
            StreamEvent::PeerSendAborted => {
                if let Some(stream) = self.streams.get_mut(sk) {
                    stream.on_peer_send_aborted();
                }
            }
            StreamEvent::PeerReceiveAborted => {
                if let Some(stream) = self.streams.get_mut(sk) {
                    stream.on_peer_receive_aborted();
                }
            }
            StreamEvent::IdealSendBuffer { byte_count } => {
                let Some(stream) = self.streams.get_mut(sk) else {
                    return;
                };
                if stream.on_ideal_send_buffer(byte_count, &self.client.config) {
                    self.drive_send(ck, sk);
                }
            }
        }
    }

    /// Both halves of a stream have terminated: evaluate it, free it, and
    /// settle the connection's stream accounting.
    fn finish_stream(&mut self, ck: ConnectionId, sk: StreamId) {
        let Some(stream) = self.streams.remove(sk) else {
            return;
        };
        let is_tcp = matches!(
            self.connections.get(ck).and_then(|c| c.handle.as_ref()),
            Some(ConnectionHandle::Tcp(_))
        );
        if let Some(conn) = self.connections.get_mut(ck) {
            if is_tcp {
                conn.unregister_tcp_stream(stream.tcp_id);
            }
            conn.untrack_stream(sk);
            conn.streams_active -= 1;
        }

        if stream.finish(&self.client.config, &self.client.latency) {
            self.shared.streams_completed.fetch_add(1, Ordering::Relaxed);
        }

        let repeat_streams = self.client.config.repeat_streams;
        let stream_count = self.client.config.stream_count;
        if repeat_streams {
            let deficit = match self.connections.get(ck) {
                Some(conn) => stream_count.saturating_sub(conn.streams_active),
                None => return,
            };
            for _ in 0..deficit {
                self.start_new_stream(ck);
            }
        } else if let Some(conn) = self.connections.get_mut(ck) {
            if conn.streams_done(stream_count) {
                conn.request_shutdown();
            }
        }
    }

    // --- TCP engine callbacks ---

    fn on_tcp_send_complete(&mut self, ck: ConnectionId, chain: Vec<TcpSendData>) {
        for record in chain {
            // Capture before recycling; the record id must not be read from
            // a reused slot.
            let wire_id = record.stream_id;
            let length = record.length as u64;
            let terminal = record.fin || record.abort;
            self.sends.free(record);

            let Some(sk) = self.connections.get(ck).and_then(|c| c.tcp_stream(wire_id)) else {
                continue;
            };
            let Some(stream) = self.streams.get_mut(sk) else {
                continue;
            };
            stream.on_send_complete(length, false);

            let mut finish = false;
            if terminal && stream.send_end_time.is_none() {
                stream.send_end_time = Some(Instant::now());
                finish = stream.recv_end_time.is_some();
            }
            if finish {
                self.finish_stream(ck, sk);
            } else {
                self.drive_send(ck, sk);
            }
        }
    }

    fn on_tcp_receive(&mut self, ck: ConnectionId, receive: TcpReceive) {
        let Some(sk) = self
            .connections
            .get(ck)
            .and_then(|c| c.tcp_stream(receive.stream_id))
        else {
            return;
        };
        let Some(stream) = self.streams.get_mut(sk) else {
            return;
        };

        let abort_now = stream.on_receive(receive.length, receive.fin, &self.client.config);
        if abort_now {
            // Force-end the receive half: tell the peer to stop sending.
            let mut record = self.sends.alloc();
            record.stream_id = receive.stream_id;
            record.abort = true;
            if let Some(ConnectionHandle::Tcp(conn)) =
                self.connections.get_mut(ck).and_then(|c| c.handle.as_mut())
            {
                conn.send(record);
            } else {
                self.sends.free(record);
            }
        }
        if receive.abort && stream.recv_end_time.is_none() {
            stream.recv_end_time = Some(Instant::now());
        }

        // The TCP layer has no stream shutdown event; synthesize it once
        // both halves have terminated.
        let finish = stream.send_end_time.is_some() && stream.recv_end_time.is_some();
        if finish {
            self.finish_stream(ck, sk);
        }
    }
}
