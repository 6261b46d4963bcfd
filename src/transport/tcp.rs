//! TCP side of the transport contract.
//!
//! The TCP engine multiplexes streams over one connection and only surfaces
//! 32-bit stream ids in its callbacks, never engine state; the connection
//! keeps an id-to-stream table to route them.

use bytes::Bytes;
use std::io;

use super::{ConnectParams, EventSink};

/// A send record handed to the TCP engine. Completed records come back in
/// [`EventSink::tcp_send_complete`] chains for recycling.
///
/// [`EventSink::tcp_send_complete`]: super::EventSink::tcp_send_complete
#[derive(Debug, Clone, Default)]
pub struct TcpSendData {
    /// Stream the record belongs to.
    pub stream_id: u32,
    /// True on the record carrying the first byte of the stream.
    pub open: bool,
    /// Marks the end of the sending side.
    pub fin: bool,
    /// Aborts the stream's receive direction at the peer.
    pub abort: bool,
    /// Payload descriptor; empty for pure control records.
    pub buffer: Bytes,
    /// Payload length in bytes.
    pub length: u32,
}

impl TcpSendData {
    /// Clears the record for reuse from a pool.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Received data notification from the TCP engine.
///
/// The payload itself is not surfaced; the engine consumes lengths and
/// flags only.
#[derive(Debug, Clone, Copy)]
pub struct TcpReceive {
    pub stream_id: u32,
    /// First data seen for this stream.
    pub open: bool,
    /// The peer finished its sending side.
    pub fin: bool,
    /// The peer aborted the stream.
    pub abort: bool,
    pub length: u64,
}

/// Factory for TCP engine connections.
pub trait TcpEngine: Send + Sync {
    /// Starts connecting. The outcome arrives as a `connect(is_connected)`
    /// event through `events`; a later `connect(false)` signals disconnect.
    fn connect(
        &self,
        params: &ConnectParams,
        events: EventSink,
    ) -> io::Result<Box<dyn TcpConnection>>;
}

/// One TCP engine connection.
pub trait TcpConnection: Send {
    /// Queues a send record. The record is returned in a send-complete
    /// chain once written.
    fn send(&mut self, data: TcpSendData);

    /// Closes the connection. The engine delivers a final
    /// `connect(false)` event once torn down.
    fn close(&mut self);
}
