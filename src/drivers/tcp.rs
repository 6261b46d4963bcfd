//! TCP engine over the standard library socket stack.
//!
//! One connector/writer thread and one reader thread per connection.
//! Streams are multiplexed with a fixed 9-byte frame header:
//! `[stream_id: u32 LE][flags: u8][length: u32 LE]`, payload following.
//! The writer drains its queue in batches; each drained batch comes back to
//! the engine as a single send-complete chain.

use crossbeam_channel::{Receiver, Sender};
use log::debug;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::transport::tcp::{TcpConnection, TcpEngine, TcpReceive, TcpSendData};
use crate::transport::{ConnectParams, EventSink};

/// Frame header length on the wire.
pub const FRAME_HEADER_SIZE: usize = 9;

/// First byte of the stream.
pub const FRAME_OPEN: u8 = 0x1;
/// End of the sending side.
pub const FRAME_FIN: u8 = 0x2;
/// Abort the stream's receive direction at the peer.
pub const FRAME_ABORT: u8 = 0x4;

const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

/// TCP engine over `std::net::TcpStream`.
pub struct NativeTcpEngine;

enum WriterCommand {
    Send(TcpSendData),
    Close,
}

struct ConnectionInner {
    sink: EventSink,
    disconnect_sent: AtomicBool,
}

impl ConnectionInner {
    /// Exactly one `connect(false)` per connection, whichever side of the
    /// socket fails first.
    fn emit_disconnect(&self) {
        if !self.disconnect_sent.swap(true, Ordering::Relaxed) {
            self.sink.tcp_connect(false);
        }
    }
}

impl TcpEngine for NativeTcpEngine {
    fn connect(
        &self,
        params: &ConnectParams,
        events: EventSink,
    ) -> io::Result<Box<dyn TcpConnection>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(ConnectionInner {
            sink: events,
            disconnect_sent: AtomicBool::new(false),
        });
        let remote = params.remote;
        let local = params.local;
        let thread_inner = inner.clone();
        std::thread::Builder::new()
            .name("netbench-tcp-conn".to_string())
            .spawn(move || run_connection(remote, local, rx, thread_inner))?;
        Ok(Box::new(NativeTcpConnection { tx }))
    }
}

struct NativeTcpConnection {
    tx: Sender<WriterCommand>,
}

impl TcpConnection for NativeTcpConnection {
    fn send(&mut self, data: TcpSendData) {
        let _ = self.tx.send(WriterCommand::Send(data));
    }

    fn close(&mut self) {
        let _ = self.tx.send(WriterCommand::Close);
    }
}

impl Drop for NativeTcpConnection {
    fn drop(&mut self) {
        let _ = self.tx.send(WriterCommand::Close);
    }
}

fn run_connection(
    remote: SocketAddr,
    local: Option<SocketAddr>,
    rx: Receiver<WriterCommand>,
    inner: Arc<ConnectionInner>,
) {
    let stream = match open_socket(remote, local) {
        Ok(stream) => stream,
        Err(e) => {
            debug!("tcp connect to {remote} failed: {e}");
            inner.emit_disconnect();
            return;
        }
    };
    let reader = match stream.try_clone() {
        Ok(reader) => reader,
        Err(e) => {
            debug!("tcp socket clone failed: {e}");
            inner.emit_disconnect();
            return;
        }
    };

    inner.sink.tcp_connect(true);

    let reader_inner = inner.clone();
    let spawned = std::thread::Builder::new()
        .name("netbench-tcp-read".to_string())
        .spawn(move || read_loop(reader, reader_inner));
    if spawned.is_err() {
        inner.emit_disconnect();
        return;
    }

    write_loop(stream, rx, &inner);
}

fn open_socket(remote: SocketAddr, local: Option<SocketAddr>) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))?;
    if let Some(local) = local {
        socket.set_reuse_address(true)?;
        socket.bind(&local.into())?;
    }
    socket.connect(&remote.into())?;
    socket.set_nodelay(true)?;
    socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
    socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
    Ok(socket.into())
}

fn write_loop(mut stream: TcpStream, rx: Receiver<WriterCommand>, inner: &ConnectionInner) {
    'outer: loop {
        let mut chain = Vec::new();
        let mut pending = match rx.recv() {
            Ok(command) => Some(command),
            Err(_) => break,
        };
        while let Some(command) = pending {
            match command {
                WriterCommand::Close => {
                    let _ = stream.shutdown(Shutdown::Both);
                    break 'outer;
                }
                WriterCommand::Send(record) => {
                    if let Err(e) = write_record(&mut stream, &record) {
                        debug!("tcp write failed: {e}");
                        inner.emit_disconnect();
                        break 'outer;
                    }
                    chain.push(record);
                }
            }
            pending = rx.try_recv().ok();
        }
        if !chain.is_empty() {
            let _ = stream.flush();
            inner.sink.tcp_send_complete(chain);
        }
    }
}

fn write_record(stream: &mut TcpStream, record: &TcpSendData) -> io::Result<()> {
    let mut flags = 0u8;
    if record.open {
        flags |= FRAME_OPEN;
    }
    if record.fin {
        flags |= FRAME_FIN;
    }
    if record.abort {
        flags |= FRAME_ABORT;
    }
    let len = (record.length as usize).min(record.buffer.len());
    let payload = &record.buffer[..len];

    let mut header = [0u8; FRAME_HEADER_SIZE];
    header[0..4].copy_from_slice(&record.stream_id.to_le_bytes());
    header[4] = flags;
    header[5..9].copy_from_slice(&(len as u32).to_le_bytes());
    stream.write_all(&header)?;
    stream.write_all(payload)
}

fn read_loop(mut stream: TcpStream, inner: Arc<ConnectionInner>) {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut scratch = vec![0u8; 64 * 1024];
    'outer: loop {
        if stream.read_exact(&mut header).is_err() {
            break;
        }
        let stream_id = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let flags = header[4];
        let length = u32::from_le_bytes([header[5], header[6], header[7], header[8]]);

        // The engine consumes lengths and flags only; drain the payload.
        let mut remaining = length as usize;
        while remaining > 0 {
            let take = remaining.min(scratch.len());
            if stream.read_exact(&mut scratch[..take]).is_err() {
                break 'outer;
            }
            remaining -= take;
        }

        inner.sink.tcp_receive(TcpReceive {
            stream_id,
            open: flags & FRAME_OPEN != 0,
            fin: flags & FRAME_FIN != 0,
            abort: flags & FRAME_ABORT != 0,
            length: length as u64,
        });
    }
    inner.emit_disconnect();
}
