//! The execution loop: one reactor, the connections and child processes
//! registered on it, and the signal plumbing that ties them together.
//!
//! Everything runs on the calling thread. Callbacks registered here are
//! invoked from `loop_once` and run to completion before the next event
//! is serviced.

pub mod child;

use std::cell::{Cell, RefCell};
use std::convert::TryFrom;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::process::Command;
use std::rc::Rc;

use nix::sys::signal::{raise, SigSet, Signal};
use nix::sys::signalfd::{siginfo, SfdFlags, SignalFd};
use nix::sys::socket::{bind, connect, listen, setsockopt, socket, sockopt, AddressFamily,
                       InetAddr, SockAddr, SockFlag, SockType};

use errors::Result;
use net::connection::{Connection, ConnectionKind, ConnectionRef, ReadOutcome,
                      make_tls_session};
use net::http::{HttpRequest, HttpResponseParser, HttpResponse};
use reactor::{Action, ActionResult, Direction, PollResult, Poller};

pub use self::child::ChildProcess;

/// Inbound bytes for a connection; returning `false` closes it, an error
/// tears the whole loop down.
pub type DataCallback = Box<dyn FnMut(&[u8]) -> Result<bool>>;
/// Connection error / connection closed notification.
pub type EventCallback = Box<dyn FnMut()>;
/// New connection on a listener; returning `false` cancels the listener.
pub type AcceptCallback = Box<dyn FnMut(ConnectionRef) -> Result<bool>>;
/// Completed HTTP exchange: (request id, tag, response).
pub type HttpResponseCallback = Box<dyn FnMut(u64, &str, &HttpResponse)>;
/// Failed HTTP exchange: (request id, tag).
pub type HttpFailureCallback = Box<dyn FnMut(u64, &str)>;
/// Graceful child exit: (child id, tag).
pub type ChildExitCallback = Box<dyn FnMut(u64, &str)>;

struct ChildRecord {
    id: u64,
    tag: String,
    on_exit: ChildExitCallback,
    process: ChildProcess,
}

/// Cheaply cloneable handle; all loop state is shared behind `Rc`.
#[derive(Clone)]
pub struct ExecutionLoop {
    poller: Rc<Poller>,
    children: Rc<RefCell<Vec<ChildRecord>>>,
    connection_count: Rc<Cell<usize>>,
    next_id: Rc<Cell<u64>>,
}

impl ExecutionLoop {
    /// Create the loop and take over signal handling for the thread:
    /// `{CHLD, CONT, HUP, TERM, QUIT, INT}` are blocked and routed
    /// through a signal fd into the reactor.
    pub fn new() -> Result<ExecutionLoop> {
        let mut mask = SigSet::empty();
        for signal in &[
            Signal::SIGCHLD,
            Signal::SIGCONT,
            Signal::SIGHUP,
            Signal::SIGTERM,
            Signal::SIGQUIT,
            Signal::SIGINT,
        ] {
            mask.add(*signal);
        }
        mask.thread_block()?;
        let mut signal_fd =
            SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;

        let exec_loop = ExecutionLoop {
            poller: Rc::new(Poller::new()),
            children: Rc::new(RefCell::new(Vec::new())),
            connection_count: Rc::new(Cell::new(0)),
            next_id: Rc::new(Cell::new(0)),
        };

        let fd = signal_fd.as_raw_fd();
        let children = exec_loop.children.clone();
        let interest_children = exec_loop.children.clone();
        let connection_count = exec_loop.connection_count.clone();
        exec_loop.poller.add_action(Action::without_error(
            fd,
            Direction::In,
            Box::new(move || match signal_fd.read_signal() {
                Ok(Some(info)) => handle_signal(&children, &info),
                Ok(None) => Ok(ActionResult::Continue),
                Err(e) => Err(e.into()),
            }),
            // The termination predicate: the loop may exit naturally once
            // nothing is connected and no child is alive.
            Box::new(move || {
                !interest_children.borrow().is_empty() || connection_count.get() > 0
            }),
        ));

        Ok(exec_loop)
    }

    fn allocate_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// One reactor turn. `timeout_ms < 0` blocks until something fires.
    pub fn loop_once(&self, timeout_ms: i32) -> Result<PollResult> {
        self.poller.poll_once(timeout_ms)
    }

    /// Drive the loop until it exits naturally or an error tears it down.
    pub fn run(&self) -> Result<()> {
        loop {
            if let PollResult::Exit = self.loop_once(-1)? {
                return Ok(());
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.get()
    }

    pub fn child_count(&self) -> usize {
        self.children.borrow().len()
    }

    /// Register read/write actions for a connection. `on_data` receives
    /// exactly what each read returned; an empty read or `on_data`
    /// returning `false` runs `on_close` and cancels both actions; socket
    /// errors additionally run `on_error` first.
    pub fn add_connection(
        &self,
        conn: &ConnectionRef,
        on_data: DataCallback,
        on_error: EventCallback,
        on_close: EventCallback,
    ) {
        self.connection_count
            .set(self.connection_count.get() + 1);

        let fd = conn.get().fd();
        let on_error = Rc::new(RefCell::new(on_error));
        let on_close = Rc::new(RefCell::new(on_close));

        // Runs the close callback exactly once, even when both actions
        // observe the teardown.
        let finish = {
            let conn = conn.clone();
            let connection_count = self.connection_count.clone();
            let on_close = on_close.clone();
            Rc::new(move || {
                let first = {
                    let mut conn = conn.get_mut();
                    let first = !conn.closed;
                    conn.closed = true;
                    first
                };
                if first {
                    connection_count.set(connection_count.get() - 1);
                    (&mut *on_close.borrow_mut())();
                }
            })
        };

        let write_conn = conn.clone();
        let write_error = on_error.clone();
        let write_finish = finish.clone();
        let interest_conn = conn.clone();
        let fderror_error = on_error.clone();
        let fderror_finish = finish.clone();
        self.poller.add_action(Action::new(
            fd,
            Direction::Out,
            Box::new(move || {
                let result = write_conn.get_mut().flush_writes();
                match result {
                    Ok(()) => Ok(ActionResult::Continue),
                    Err(e) => {
                        debug!("connection write error: {}", e);
                        (&mut *write_error.borrow_mut())();
                        (*write_finish)();
                        Ok(ActionResult::CancelAll)
                    }
                }
            }),
            Box::new(move || {
                let conn = interest_conn.get();
                !conn.closed && conn.wants_write()
            }),
            Box::new(move || {
                (&mut *fderror_error.borrow_mut())();
                (*fderror_finish)();
            }),
        ));

        let read_conn = conn.clone();
        let read_finish = finish.clone();
        let mut on_data = on_data;
        let read_interest_conn = conn.clone();
        let rderror_error = on_error.clone();
        let rderror_finish = finish.clone();
        self.poller.add_action(Action::new(
            fd,
            Direction::In,
            Box::new(move || {
                let outcome = read_conn.get_mut().read_chunk();
                match outcome {
                    ReadOutcome::Data(data) => {
                        if on_data(&data)? {
                            Ok(ActionResult::Continue)
                        } else {
                            (*read_finish)();
                            Ok(ActionResult::CancelAll)
                        }
                    }
                    ReadOutcome::Nothing => Ok(ActionResult::Continue),
                    ReadOutcome::Closed => {
                        (*read_finish)();
                        Ok(ActionResult::CancelAll)
                    }
                    ReadOutcome::Failed(e) => {
                        debug!("connection read error: {}", e);
                        (&mut *on_error.borrow_mut())();
                        (*read_finish)();
                        Ok(ActionResult::CancelAll)
                    }
                }
            }),
            Box::new(move || !read_interest_conn.get().closed),
            Box::new(move || {
                (&mut *rderror_error.borrow_mut())();
                (*rderror_finish)();
            }),
        ));
    }

    /// Bind a listening socket and hand every accepted stream to
    /// `on_accept` as a fresh plaintext connection. Returns the listener
    /// id and the actually bound address.
    pub fn make_listener(
        &self,
        addr: &SocketAddr,
        on_accept: AcceptCallback,
    ) -> Result<(u64, SocketAddr)> {
        let listener = bind_listener(addr)?;
        let bound = listener.local_addr()?;
        let id = self.allocate_id();

        self.connection_count
            .set(self.connection_count.get() + 1);
        let connection_count = self.connection_count.clone();
        let mut on_accept = on_accept;
        let fd = listener.as_raw_fd();
        self.poller.add_action(Action::without_error(
            fd,
            Direction::In,
            Box::new(move || match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("incoming connection from {}", peer);
                    stream.set_nonblocking(true)?;
                    let conn = ConnectionRef::new_plain(stream);
                    if on_accept(conn)? {
                        Ok(ActionResult::Continue)
                    } else {
                        connection_count.set(connection_count.get() - 1);
                        Ok(ActionResult::CancelAll)
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    Ok(ActionResult::Continue)
                }
                Err(e) => Err(e.into()),
            }),
            Box::new(|| true),
        ));

        Ok((id, bound))
    }

    /// Open an outbound non-blocking connection, plaintext or TLS.
    pub fn make_connection(
        &self,
        addr: &SocketAddr,
        kind: ConnectionKind,
        on_data: DataCallback,
        on_error: EventCallback,
        on_close: EventCallback,
    ) -> Result<ConnectionRef> {
        let stream = connect_nonblock(addr)?;
        let connection = match kind {
            ConnectionKind::Plain => Connection::plain(stream),
            ConnectionKind::Tls(ref hostname) => {
                Connection::tls(stream, make_tls_session(hostname)?)
            }
        };
        let conn = ConnectionRef::wrap(connection);
        self.add_connection(&conn, on_data, on_error, on_close);
        Ok(conn)
    }

    /// One-shot HTTP exchange over a fresh connection. `on_response`
    /// fires exactly once with the first complete response and the
    /// connection is torn down; `on_failure` fires on socket errors.
    pub fn make_http_request(
        &self,
        tag: &str,
        addr: &SocketAddr,
        kind: ConnectionKind,
        request: &HttpRequest,
        on_response: HttpResponseCallback,
        on_failure: HttpFailureCallback,
    ) -> Result<u64> {
        let id = self.allocate_id();

        let mut parser = HttpResponseParser::new();
        let mut on_response = on_response;
        let data_tag = tag.to_string();
        let on_data = Box::new(move |data: &[u8]| -> Result<bool> {
            parser.parse(data)?;
            match parser.pop() {
                Some(response) => {
                    on_response(id, &data_tag, &response);
                    Ok(false)
                }
                None => Ok(true),
            }
        });

        let mut on_failure = on_failure;
        let error_tag = tag.to_string();
        let on_error = Box::new(move || on_failure(id, &error_tag));

        let close_tag = tag.to_string();
        let on_close = Box::new(move || debug!("http connection '{}' closed", close_tag));

        let conn = self.make_connection(addr, kind, on_data, on_error, on_close)?;
        conn.enqueue_write(&request.to_bytes());
        Ok(id)
    }

    /// Spawn and supervise a child process. A zero exit status invokes
    /// `on_exit`; a non-zero one is a fatal loop error.
    pub fn add_child_process(
        &self,
        tag: &str,
        on_exit: ChildExitCallback,
        command: &mut Command,
    ) -> Result<u64> {
        let id = self.allocate_id();
        let process = ChildProcess::spawn(tag, command)?;
        debug!("spawned child '{}' (pid {})", tag, process.pid());
        self.children.borrow_mut().push(ChildRecord {
            id,
            tag: tag.to_string(),
            on_exit,
            process,
        });
        Ok(id)
    }
}

fn handle_signal(
    children: &Rc<RefCell<Vec<ChildRecord>>>,
    info: &siginfo,
) -> Result<ActionResult> {
    let signal = Signal::try_from(info.ssi_signo as i32)?;
    match signal {
        Signal::SIGCONT => {
            for record in children.borrow_mut().iter_mut() {
                record.process.resume()?;
            }
        }
        Signal::SIGCHLD => handle_sigchld(children)?,
        Signal::SIGHUP | Signal::SIGTERM | Signal::SIGQUIT | Signal::SIGINT => {
            bail!("interrupted by signal {:?}", signal)
        }
        signal => bail!("unexpected signal {:?}", signal),
    }
    Ok(ActionResult::Continue)
}

fn handle_sigchld(children: &Rc<RefCell<Vec<ChildRecord>>>) -> Result<()> {
    let mut finished: Vec<ChildRecord> = Vec::new();
    {
        let mut children = children.borrow_mut();
        if children.is_empty() {
            bail!("received SIGCHLD without any managed children");
        }
        let mut index = 0;
        while index < children.len() {
            let remove = {
                let record = &mut children[index];
                if record.process.terminated() {
                    false
                } else {
                    record.process.check()?;
                    if record.process.terminated() {
                        if let Some(status) = record.process.exit_status() {
                            if status != 0 {
                                bail!(
                                    "child process '{}' exited with status {}",
                                    record.tag,
                                    status
                                );
                            }
                        }
                        true
                    } else if !record.process.running() {
                        // the child stopped; suspend ourselves as well
                        raise(Signal::SIGSTOP)?;
                        false
                    } else {
                        false
                    }
                }
            };
            if remove {
                finished.push(children.remove(index));
            } else {
                index += 1;
            }
        }
    }
    // callbacks run after the child list borrow is released
    for mut record in finished {
        (record.on_exit)(record.id, &record.tag);
    }
    Ok(())
}

fn address_family(addr: &SocketAddr) -> AddressFamily {
    match *addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    }
}

fn bind_listener(addr: &SocketAddr) -> Result<TcpListener> {
    let fd = socket(
        address_family(addr),
        SockType::Stream,
        SockFlag::empty(),
        None,
    )?;
    let listener = unsafe { TcpListener::from_raw_fd(fd) };
    setsockopt(fd, sockopt::ReuseAddr, &true)?;
    bind(fd, &SockAddr::new_inet(InetAddr::from_std(addr)))?;
    listen(fd, 128)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn connect_nonblock(addr: &SocketAddr) -> Result<TcpStream> {
    let fd = socket(
        address_family(addr),
        SockType::Stream,
        SockFlag::empty(),
        None,
    )?;
    let stream = unsafe { TcpStream::from_raw_fd(fd) };
    stream.set_nonblocking(true)?;
    match connect(fd, &SockAddr::new_inet(InetAddr::from_std(addr))) {
        Ok(()) | Err(::nix::Error::EINPROGRESS) => Ok(stream),
        Err(e) => Err(e.into()),
    }
}
