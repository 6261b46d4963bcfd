//! The transport callback contract.
//!
//! The engine drives two interchangeable stacks: the connection-oriented
//! encrypted datagram protocol ([`datagram`]) and a TCP engine ([`tcp`]).
//! Both are external collaborators: the engine invokes the operations their
//! traits expose and consumes the events they deliver through an
//! [`EventSink`]. Every event is tagged with the ids the engine supplied at
//! open time and lands on the queue of the worker that owns the connection,
//! so per-entity state stays single-writer.

pub mod datagram;
pub mod tcp;

use crossbeam_channel::Sender;
use std::net::SocketAddr;

use crate::config::AddressFamily;
use datagram::{ConnectionEvent, StreamEvent};
use tcp::{TcpReceive, TcpSendData};

pub use crate::pool::Key;

/// Identifies a connection within its owning worker.
pub type ConnectionId = Key;

/// Identifies a stream within its owning worker.
pub type StreamId = Key;

/// Parameters for establishing one connection.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// Server name, as resolved and possibly suffixed per worker.
    pub server_name: String,
    /// Resolved remote address, target port attached.
    pub remote: SocketAddr,
    /// Local binding, when one is configured for the worker.
    pub local: Option<SocketAddr>,
    /// Address-family hint.
    pub family: AddressFamily,
}

/// Run-wide transport settings applied to every connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub pacing: bool,
    pub send_buffering: bool,
}

/// A transport event tagged with its owning entities.
#[derive(Debug)]
pub enum TransportEvent {
    Connection {
        connection: ConnectionId,
        event: ConnectionEvent,
    },
    Stream {
        connection: ConnectionId,
        stream: StreamId,
        event: StreamEvent,
    },
    TcpConnect {
        connection: ConnectionId,
        connected: bool,
    },
    TcpSendComplete {
        connection: ConnectionId,
        chain: Vec<TcpSendData>,
    },
    TcpReceive {
        connection: ConnectionId,
        receive: TcpReceive,
    },
}

/// Message on a worker's queue: either a wake-up (connections queued, run
/// stopping) or a transport event to dispatch.
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Wake,
    Transport(TransportEvent),
}

/// Delivery handle a transport stack uses to hand events to the engine.
///
/// Cloneable and safe to use from any transport-owned thread; a send after
/// the run has wound down is silently dropped.
#[derive(Clone)]
pub struct EventSink {
    connection: ConnectionId,
    tx: Sender<WorkerMessage>,
}

impl EventSink {
    pub(crate) fn new(connection: ConnectionId, tx: Sender<WorkerMessage>) -> Self {
        Self { connection, tx }
    }

    /// The connection this sink delivers for.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    fn push(&self, event: TransportEvent) {
        let _ = self.tx.send(WorkerMessage::Transport(event));
    }

    /// Datagram protocol: the handshake completed.
    pub fn connected(&self) {
        self.push(TransportEvent::Connection {
            connection: self.connection,
            event: ConnectionEvent::Connected,
        });
    }

    /// Datagram protocol: the connection finished shutting down.
    pub fn connection_shutdown_complete(&self) {
        self.push(TransportEvent::Connection {
            connection: self.connection,
            event: ConnectionEvent::ShutdownComplete,
        });
    }

    /// Datagram protocol: a stream-scoped event.
    pub fn stream(&self, stream: StreamId, event: StreamEvent) {
        self.push(TransportEvent::Stream {
            connection: self.connection,
            stream,
            event,
        });
    }

    /// TCP engine: connect outcome, or disconnect when `false` arrives
    /// after a successful connect.
    pub fn tcp_connect(&self, connected: bool) {
        self.push(TransportEvent::TcpConnect {
            connection: self.connection,
            connected,
        });
    }

    /// TCP engine: a chain of completed send-data records.
    pub fn tcp_send_complete(&self, chain: Vec<TcpSendData>) {
        self.push(TransportEvent::TcpSendComplete {
            connection: self.connection,
            chain,
        });
    }

    /// TCP engine: received data for one stream.
    pub fn tcp_receive(&self, receive: TcpReceive) {
        self.push(TransportEvent::TcpReceive {
            connection: self.connection,
            receive,
        });
    }
}
