//! TCP transport shared by the control and transfer channels
//!
//! Every connection starts with the connecting side writing its raw 16-byte
//! peer id; after that both directions carry MessagePack frames. A
//! [`Messenger`] owns one connection and delivers decoded messages to a
//! [`MessageHandler`] from a dedicated receive thread.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::marker::PhantomData;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::codec::{encode_frame, FrameDecoder, FrameError, WireMessage};
use crate::identity::PeerId;
use crate::protocol::{timeouts, RECV_BUFFER_SIZE, UUID_BYTE_LENGTH};

pub trait MessageHandler<M>: Send + Sync {
    fn message_received(&self, message: M);
    /// Called once, from the receive thread, when the connection is gone
    fn disconnected(&self);
}

fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let _ = stream.set_write_timeout(Some(Duration::from_millis(timeouts::WRITE_MS)));
}

/// One framed connection to a known peer
pub struct Messenger<M: WireMessage> {
    address: SocketAddr,
    local_id: PeerId,
    remote_id: PeerId,
    writer: Mutex<TcpStream>,
    reader: Mutex<Option<TcpStream>>,
    handler: Mutex<Option<Arc<dyn MessageHandler<M>>>>,
    disconnected: AtomicBool,
    _message: PhantomData<fn(M)>,
}

impl<M: WireMessage> Messenger<M> {
    /// Dial `address` and introduce ourselves as `local_id`
    pub fn connect(
        address: SocketAddr,
        local_id: PeerId,
        remote_id: PeerId,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        let mut stream = TcpStream::connect_timeout(&address, timeout)
            .with_context(|| format!("connect {address}"))?;
        tune_socket(&stream);
        stream
            .write_all(local_id.as_bytes())
            .with_context(|| format!("handshake with {address}"))?;
        Self::from_stream(stream, address, local_id, remote_id)
    }

    /// Wrap a connection accepted by a [`ConnectionListener`]
    pub fn from_connection(connection: IncomingConnection, local_id: PeerId) -> Result<Arc<Self>> {
        Self::from_stream(
            connection.stream,
            connection.address,
            local_id,
            connection.remote_id,
        )
    }

    fn from_stream(
        stream: TcpStream,
        address: SocketAddr,
        local_id: PeerId,
        remote_id: PeerId,
    ) -> Result<Arc<Self>> {
        let reader = stream.try_clone().context("clone socket")?;
        Ok(Arc::new(Self {
            address,
            local_id,
            remote_id,
            writer: Mutex::new(stream),
            reader: Mutex::new(Some(reader)),
            handler: Mutex::new(None),
            disconnected: AtomicBool::new(false),
            _message: PhantomData,
        }))
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn remote_id(&self) -> PeerId {
        self.remote_id
    }

    pub fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::Acquire)
    }

    /// Start the receive thread. May only be called once.
    pub fn start_receiving(self: &Arc<Self>, handler: Arc<dyn MessageHandler<M>>) -> Result<()> {
        let Some(reader) = self.reader.lock().take() else {
            bail!("already receiving from {}", self.remote_id);
        };
        *self.handler.lock() = Some(handler);

        let messenger = Arc::clone(self);
        thread::Builder::new()
            .name(format!("recv-{}", self.address))
            .spawn(move || messenger.receive_loop(reader))
            .context("spawn receive thread")?;
        Ok(())
    }

    fn receive_loop(&self, mut reader: TcpStream) {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        'conn: while self.is_connected() {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(peer = %self.remote_id, error = %e, "read failed");
                    break;
                }
            };
            decoder.feed(&buf[..n]);

            loop {
                let value = match decoder.next_value() {
                    Ok(Some(value)) => value,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(peer = %self.remote_id, error = %e, "dropping connection");
                        break 'conn;
                    }
                };
                match M::from_value(value) {
                    Ok(message) => {
                        let handler = self.handler.lock().clone();
                        match handler {
                            Some(handler) => handler.message_received(message),
                            None => break 'conn,
                        }
                    }
                    Err(FrameError::Malformed(reason)) => {
                        warn!(peer = %self.remote_id, %reason, "ignoring malformed frame");
                    }
                    Err(e @ FrameError::UnknownType(_)) => {
                        warn!(peer = %self.remote_id, error = %e, "dropping connection");
                        break 'conn;
                    }
                }
            }
        }

        self.disconnect();
        // Releases the handler, which usually owns this messenger
        if let Some(handler) = self.handler.lock().take() {
            handler.disconnected();
        }
        trace!(peer = %self.remote_id, "receive loop finished");
    }

    pub fn send(&self, message: &M) -> Result<()> {
        if !self.is_connected() {
            bail!("connection to {} is closed", self.remote_id);
        }
        let frame = encode_frame(message)?;
        let written = self.writer.lock().write_all(&frame);
        if let Err(e) = written {
            self.disconnect();
            return Err(e).with_context(|| format!("send to {}", self.remote_id));
        }
        Ok(())
    }

    /// Close the socket; the receive thread notices and reports it once
    pub fn disconnect(&self) {
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            let _ = self.writer.lock().shutdown(Shutdown::Both);
        }
    }
}

/// Accepted connection whose handshake already completed
pub struct IncomingConnection {
    pub stream: TcpStream,
    pub address: SocketAddr,
    pub remote_id: PeerId,
}

pub trait ConnectionHandler: Send + Sync {
    fn connection_established(&self, connection: IncomingConnection);
}

/// Accept loop that performs the peer-id handshake
pub struct ConnectionListener {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionListener {
    pub fn bind(address: SocketAddr, handler: Arc<dyn ConnectionHandler>) -> Result<Self> {
        let listener = TcpListener::bind(address).with_context(|| format!("bind {address}"))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));

        let flag = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name(format!("accept-{}", local_addr.port()))
            .spawn(move || accept_loop(listener, flag, handler))
            .context("spawn accept thread")?;
        debug!(%local_addr, "listening");

        Ok(Self {
            local_addr,
            running,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ConnectionListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, running: Arc<AtomicBool>, handler: Arc<dyn ConnectionHandler>) {
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, address)) => {
                let handler = Arc::clone(&handler);
                let spawned = thread::Builder::new()
                    .name(format!("handshake-{address}"))
                    .spawn(move || match read_handshake(stream) {
                        Ok((stream, remote_id)) => handler.connection_established(IncomingConnection {
                            stream,
                            address,
                            remote_id,
                        }),
                        Err(e) => debug!(%address, error = %e, "handshake failed"),
                    });
                if let Err(e) = spawned {
                    warn!(%address, error = %e, "could not spawn handshake thread");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(timeouts::POLL_MS));
            }
            Err(e) => {
                warn!(error = %e, "accept error");
                thread::sleep(Duration::from_millis(timeouts::POLL_MS));
            }
        }
    }
}

fn read_handshake(mut stream: TcpStream) -> Result<(TcpStream, PeerId)> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_millis(timeouts::HANDSHAKE_MS)))?;
    let mut id = [0u8; UUID_BYTE_LENGTH];
    stream.read_exact(&mut id).context("short peer id")?;
    stream.set_read_timeout(None)?;
    tune_socket(&stream);
    Ok((stream, PeerId::from_bytes(id)))
}
