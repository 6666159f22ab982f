//! Non-blocking stream connections, plaintext and TLS.
//!
//! A `Connection` owns its socket and an outbound byte buffer. Writers
//! only append to the buffer (`enqueue_write`); the reactor drains it when
//! the socket reports write readiness, and delivers inbound bytes to the
//! data callback registered through `ExecutionLoop::add_connection`.

use std::cell::{Ref, RefCell, RefMut};
use std::convert::TryFrom;
use std::io;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use rustls;
use webpki_roots;

use errors::{Error, Result};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Transport selector for outbound connections.
#[derive(Clone, Debug)]
pub enum ConnectionKind {
    Plain,
    /// TLS with the given server name (certificate validation and SNI).
    Tls(String),
}

/// What one readiness-driven read produced.
pub enum ReadOutcome {
    /// Bytes as returned by the kernel (or the TLS session).
    Data(Vec<u8>),
    /// Readiness fired but nothing was actually readable.
    Nothing,
    /// Orderly end of stream.
    Closed,
    /// The socket or the TLS state machine failed.
    Failed(io::Error),
}

pub struct TlsStream {
    tcp: TcpStream,
    session: rustls::ClientConnection,
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream>),
}

pub struct Connection {
    stream: Stream,
    write_buffer: BytesMut,
    pub(crate) closed: bool,
}

/// Shared handle onto a connection. The fleet owns one per worker while
/// the reactor's read and write actions each hold their own; all of them
/// alias the same socket and outbound buffer on the one loop thread.
#[derive(Clone)]
pub struct ConnectionRef {
    inner: Rc<RefCell<Connection>>,
}

lazy_static! {
    static ref TLS_CONFIG: Arc<rustls::ClientConfig> = {
        let mut roots = rustls::RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        Arc::new(
            rustls::ClientConfig::builder()
                .with_safe_defaults()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    };
}

pub fn make_tls_session(hostname: &str) -> Result<rustls::ClientConnection> {
    let name = rustls::ServerName::try_from(hostname)
        .map_err(|_| Error::from(format!("invalid TLS server name: {}", hostname)))?;
    Ok(rustls::ClientConnection::new(TLS_CONFIG.clone(), name)?)
}

impl Connection {
    pub fn plain(tcp: TcpStream) -> Self {
        Connection {
            stream: Stream::Plain(tcp),
            write_buffer: BytesMut::new(),
            closed: false,
        }
    }

    pub fn tls(tcp: TcpStream, session: rustls::ClientConnection) -> Self {
        Connection {
            stream: Stream::Tls(Box::new(TlsStream { tcp, session })),
            write_buffer: BytesMut::new(),
            closed: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        match self.stream {
            Stream::Plain(ref tcp) => tcp.as_raw_fd(),
            Stream::Tls(ref tls) => tls.tcp.as_raw_fd(),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        let tcp = match self.stream {
            Stream::Plain(ref tcp) => tcp,
            Stream::Tls(ref tls) => &tls.tcp,
        };
        tcp.peer_addr().ok()
    }

    /// Bytes queued but not yet handed to the kernel.
    pub fn pending_writes(&self) -> &[u8] {
        &self.write_buffer
    }

    /// Whether the write action should currently poll.
    pub fn wants_write(&self) -> bool {
        if !self.write_buffer.is_empty() {
            return true;
        }
        match self.stream {
            Stream::Plain(_) => false,
            Stream::Tls(ref tls) => tls.session.wants_write(),
        }
    }

    /// Drain as much of the outbound buffer as the socket accepts.
    pub fn flush_writes(&mut self) -> io::Result<()> {
        match self.stream {
            Stream::Plain(ref mut tcp) => {
                while !self.write_buffer.is_empty() {
                    match tcp.write(&self.write_buffer) {
                        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                        Ok(n) => self.write_buffer.advance(n),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
            Stream::Tls(ref mut tls) => {
                // Stage plaintext into the session, then flush TLS records.
                // The session transparently interleaves handshake traffic.
                while !self.write_buffer.is_empty() {
                    match tls.session.writer().write(&self.write_buffer) {
                        Ok(0) => break,
                        Ok(n) => self.write_buffer.advance(n),
                        Err(e) => return Err(e),
                    }
                }
                while tls.session.wants_write() {
                    match tls.session.write_tls(&mut tls.tcp) {
                        Ok(_) => {}
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
        }
    }

    /// One readiness-driven read.
    pub fn read_chunk(&mut self) -> ReadOutcome {
        match self.stream {
            Stream::Plain(ref mut tcp) => {
                let mut buf = vec![0u8; READ_BUFFER_SIZE];
                match tcp.read(&mut buf) {
                    Ok(0) => ReadOutcome::Closed,
                    Ok(n) => {
                        buf.truncate(n);
                        ReadOutcome::Data(buf)
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::Nothing,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => ReadOutcome::Nothing,
                    Err(e) => ReadOutcome::Failed(e),
                }
            }
            Stream::Tls(ref mut tls) => {
                match tls.session.read_tls(&mut tls.tcp) {
                    Ok(0) => return ReadOutcome::Closed,
                    Ok(_) => {}
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return ReadOutcome::Nothing
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                        return ReadOutcome::Nothing
                    }
                    Err(e) => return ReadOutcome::Failed(e),
                }
                if let Err(e) = tls.session.process_new_packets() {
                    return ReadOutcome::Failed(io::Error::new(io::ErrorKind::InvalidData, e));
                }
                let mut data = Vec::new();
                let mut buf = [0u8; READ_BUFFER_SIZE];
                loop {
                    match tls.session.reader().read(&mut buf) {
                        Ok(0) => {
                            // close_notify from the peer
                            if data.is_empty() {
                                return ReadOutcome::Closed;
                            }
                            break;
                        }
                        Ok(n) => data.extend_from_slice(&buf[..n]),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return ReadOutcome::Failed(e),
                    }
                }
                if data.is_empty() {
                    // handshake progress only
                    ReadOutcome::Nothing
                } else {
                    ReadOutcome::Data(data)
                }
            }
        }
    }
}

impl ConnectionRef {
    pub fn wrap(connection: Connection) -> Self {
        ConnectionRef {
            inner: Rc::new(RefCell::new(connection)),
        }
    }

    pub fn new_plain(tcp: TcpStream) -> Self {
        ConnectionRef::wrap(Connection::plain(tcp))
    }

    /// Borrow the connection. Panics if a mutable borrow is live, so
    /// callbacks must not hold one across calls into other layers.
    pub fn get(&self) -> Ref<Connection> {
        self.inner.borrow()
    }

    pub fn get_mut(&self) -> RefMut<Connection> {
        self.inner.borrow_mut()
    }

    /// Append to the outbound buffer. No syscall happens here; the
    /// reactor drains the buffer when the socket is writable.
    pub fn enqueue_write(&self, data: &[u8]) {
        self.get_mut().write_buffer.extend_from_slice(data);
    }
}
