//! Per-connection state.
//!
//! A connection owns exactly one transport handle, datagram or TCP, chosen
//! by the run plan. In TCP mode it also keeps the id-to-stream table that
//! routes engine-side callbacks, because the TCP engine only surfaces
//! 32-bit stream ids. The table holds pool keys, never owning references;
//! entries are dropped before the stream slot is freed.

use std::collections::HashMap;

use crate::stream::SendTarget;
use crate::transport::datagram::DatagramConnection;
use crate::transport::tcp::TcpConnection;
use crate::transport::StreamId;

/// The one transport handle a connection owns.
pub(crate) enum ConnectionHandle {
    Datagram(Box<dyn DatagramConnection>),
    Tcp(Box<dyn TcpConnection>),
}

impl ConnectionHandle {
    pub fn send_target(&mut self) -> SendTarget<'_> {
        match self {
            Self::Datagram(_) => SendTarget::Datagram,
            Self::Tcp(conn) => SendTarget::Tcp(conn.as_mut()),
        }
    }
}

pub(crate) struct Connection {
    /// Set once setup succeeds; a connection without a handle never made it
    /// past initialization.
    pub handle: Option<ConnectionHandle>,
    pub streams_created: u32,
    pub streams_active: u32,
    shutdown_requested: bool,
    tcp_streams: HashMap<u32, StreamId>,
    active: Vec<StreamId>,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            handle: None,
            streams_created: 0,
            streams_active: 0,
            shutdown_requested: false,
            tcp_streams: HashMap::new(),
            active: Vec::new(),
        }
    }

    /// Remembers a live stream so it can be reclaimed if the connection
    /// goes down before the stream finishes on its own.
    pub fn track_stream(&mut self, id: StreamId) {
        self.active.push(id);
    }

    pub fn untrack_stream(&mut self, id: StreamId) {
        if let Some(pos) = self.active.iter().position(|&s| s == id) {
            self.active.swap_remove(pos);
        }
    }

    /// Streams still alive on this connection.
    pub fn active_streams(&self) -> &[StreamId] {
        &self.active
    }

    pub fn register_tcp_stream(&mut self, wire_id: u32, stream: StreamId) {
        self.tcp_streams.insert(wire_id, stream);
    }

    /// Routes a TCP callback id to the stream it belongs to. Stale ids
    /// resolve to nothing and the observation is dropped.
    pub fn tcp_stream(&self, wire_id: u32) -> Option<StreamId> {
        self.tcp_streams.get(&wire_id).copied()
    }

    pub fn unregister_tcp_stream(&mut self, wire_id: u32) {
        self.tcp_streams.remove(&wire_id);
    }

    /// Requests connection shutdown on the transport, once. Completion
    /// arrives as a shutdown-complete (or TCP disconnect) event.
    pub fn request_shutdown(&mut self) {
        if self.shutdown_requested {
            return;
        }
        self.shutdown_requested = true;
        match self.handle.as_mut() {
            Some(ConnectionHandle::Datagram(handle)) => handle.shutdown(),
            Some(ConnectionHandle::Tcp(conn)) => conn.close(),
            None => {}
        }
    }

    /// True once every configured stream has been created and none remain
    /// active; the connection may shut down.
    pub fn streams_done(&self, stream_count: u32) -> bool {
        self.streams_active == 0 && self.streams_created == stream_count
    }
}
