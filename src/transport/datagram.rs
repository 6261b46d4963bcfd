//! Datagram-protocol side of the transport contract.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;

use super::{ConnectParams, ConnectionSettings, EventSink, StreamId};

/// Connection-scoped events delivered by the datagram protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake completed; streams may be opened.
    Connected,
    /// The connection finished shutting down; the handle will see no
    /// further events.
    ShutdownComplete,
}

/// Stream-scoped events delivered by the datagram protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// Bytes arrived, in wire order. `fin` marks the peer's end of stream.
    Receive { length: u64, fin: bool },
    /// A send issued earlier completed. `canceled` sends were never
    /// delivered and do not count as acknowledged.
    SendComplete { length: u64, canceled: bool },
    /// The send direction finished shutting down.
    SendShutdownComplete,
    /// Both directions terminated; the stream is done.
    ShutdownComplete,
    /// The peer aborted its sending side.
    PeerSendAborted,
    /// The peer aborted its receiving side.
    PeerReceiveAborted,
    /// Transport hint: outstanding upload bytes that saturate the path.
    IdealSendBuffer { byte_count: u64 },
}

/// Flags attached to a stream send.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendFlags {
    /// First send of the stream starts it on the wire.
    pub start: bool,
    /// Marks the end of the sending side.
    pub fin: bool,
}

/// How to shut a stream down out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamShutdown {
    /// Abort both directions.
    Abort,
    /// Abort only the sending side.
    AbortSend,
    /// Abort only the receiving side.
    AbortReceive,
}

/// Factory for datagram-protocol connections.
pub trait DatagramApi: Send + Sync {
    /// Creates an un-started connection handle. Events for this connection
    /// and its streams flow through `events`.
    fn open(
        &self,
        settings: &ConnectionSettings,
        events: EventSink,
    ) -> io::Result<Box<dyn DatagramConnection>>;
}

/// One datagram-protocol connection.
///
/// The `set_*` parameter operations are only valid before [`start`]; the
/// stack is free to reject them afterwards.
///
/// [`start`]: DatagramConnection::start
pub trait DatagramConnection: Send {
    /// Disables 1-RTT payload encryption.
    fn set_disable_encryption(&mut self) -> io::Result<()>;

    /// Sets the CIBIR identifier (offset byte followed by the id bytes) to
    /// prefix to connection establishment.
    fn set_cibir_id(&mut self, id: &[u8]) -> io::Result<()>;

    /// Permits sharing the local binding with other connections.
    fn set_share_binding(&mut self) -> io::Result<()>;

    /// Binds the connection to a specific local address.
    fn set_local_address(&mut self, addr: SocketAddr) -> io::Result<()>;

    /// The local address actually chosen; valid once started.
    fn local_address(&self) -> io::Result<SocketAddr>;

    /// Starts the handshake. Completion is reported through
    /// [`ConnectionEvent::Connected`].
    fn start(&mut self, params: &ConnectParams) -> io::Result<()>;

    /// Requests connection shutdown; completion is reported through
    /// [`ConnectionEvent::ShutdownComplete`].
    fn shutdown(&mut self);

    /// Opens a stream. `id` tags every event the stack delivers for it.
    fn open_stream(&mut self, id: StreamId) -> io::Result<Box<dyn DatagramStream>>;
}

/// One stream on a datagram-protocol connection.
pub trait DatagramStream: Send {
    /// Queues `data` for transmission. Completion is reported through
    /// [`StreamEvent::SendComplete`] carrying the same length.
    fn send(&mut self, data: Bytes, flags: SendFlags) -> io::Result<()>;

    /// Aborts one or both directions.
    fn shutdown(&mut self, mode: StreamShutdown);
}
