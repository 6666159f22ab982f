//! Readiness-based I/O multiplexer.
//!
//! The whole coordinator is single-threaded and cooperative: every socket
//! is non-blocking and the only suspension point is `Poller::poll_once`,
//! which waits on `poll(2)` for the registered actions and then runs their
//! callbacks to completion, one at a time.

use std::cell::RefCell;
use std::os::unix::io::RawFd;

use nix::poll::{poll, PollFd, PollFlags};

use errors::Result;

/// Which readiness a registered action waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Verdict of a ready callback.
pub enum ActionResult {
    /// Keep the action registered.
    Continue,
    /// Remove this action and every other action bound to the same fd.
    CancelAll,
}

/// Outcome of one `poll_once` turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollResult {
    /// At least one callback ran.
    Success,
    /// The wait timed out with nothing ready.
    Timeout,
    /// No registered action is currently interested; the loop may exit.
    Exit,
}

pub type ReadyCallback = Box<dyn FnMut() -> Result<ActionResult>>;
pub type InterestCallback = Box<dyn Fn() -> bool>;
pub type ErrorCallback = Box<dyn FnMut()>;

/// One registered interest: an fd, a direction, and the three callbacks
/// driving it. `ready` is `None` only while the callback is executing.
pub struct Action {
    fd: RawFd,
    direction: Direction,
    ready: Option<ReadyCallback>,
    interest: InterestCallback,
    error: Option<ErrorCallback>,
}

impl Action {
    pub fn new(
        fd: RawFd,
        direction: Direction,
        ready: ReadyCallback,
        interest: InterestCallback,
        error: ErrorCallback,
    ) -> Self {
        Action {
            fd,
            direction,
            ready: Some(ready),
            interest,
            error: Some(error),
        }
    }

    /// An action that never sees fd-level errors (listener, signal fd).
    pub fn without_error(
        fd: RawFd,
        direction: Direction,
        ready: ReadyCallback,
        interest: InterestCallback,
    ) -> Self {
        Action::new(fd, direction, ready, interest, Box::new(|| ()))
    }
}

/// The action table. Callbacks may register further actions while the
/// poller is dispatching, so additions go through a pending queue and are
/// admitted at the start of the next turn.
pub struct Poller {
    actions: RefCell<Vec<Option<Action>>>,
    pending: RefCell<Vec<Action>>,
}

impl Poller {
    pub fn new() -> Self {
        Poller {
            actions: RefCell::new(Vec::new()),
            pending: RefCell::new(Vec::new()),
        }
    }

    pub fn add_action(&self, action: Action) {
        self.pending.borrow_mut().push(action);
    }

    /// Remove every action bound to `fd`, registered or still pending.
    pub fn cancel_fd(&self, fd: RawFd) {
        for slot in self.actions.borrow_mut().iter_mut() {
            let matches = match *slot {
                Some(ref action) => action.fd == fd,
                None => false,
            };
            if matches {
                *slot = None;
            }
        }
        self.pending.borrow_mut().retain(|action| action.fd != fd);
    }

    fn admit_pending(&self) {
        let mut actions = self.actions.borrow_mut();
        for action in self.pending.borrow_mut().drain(..) {
            match actions.iter_mut().find(|slot| slot.is_none()) {
                Some(free) => *free = Some(action),
                None => actions.push(Some(action)),
            }
        }
    }

    /// One turn of the loop: assemble the wait set from the interested
    /// actions, wait for readiness, dispatch the fired callbacks.
    /// `timeout_ms < 0` waits indefinitely.
    pub fn poll_once(&self, timeout_ms: i32) -> Result<PollResult> {
        self.admit_pending();

        let mut indices: Vec<usize> = Vec::new();
        let mut pollfds: Vec<PollFd> = Vec::new();
        {
            let actions = self.actions.borrow();
            for (idx, slot) in actions.iter().enumerate() {
                if let Some(ref action) = *slot {
                    if (action.interest)() {
                        let events = match action.direction {
                            Direction::In => PollFlags::POLLIN,
                            Direction::Out => PollFlags::POLLOUT,
                        };
                        indices.push(idx);
                        pollfds.push(PollFd::new(action.fd, events));
                    }
                }
            }
        }

        if pollfds.is_empty() {
            return Ok(PollResult::Exit);
        }

        let fired = loop {
            match poll(&mut pollfds, timeout_ms) {
                Ok(n) => break n,
                Err(::nix::Error::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        };

        if fired == 0 {
            return Ok(PollResult::Timeout);
        }

        for (pos, &idx) in indices.iter().enumerate() {
            let revents = match pollfds[pos].revents() {
                Some(revents) => revents,
                None => continue,
            };
            if revents.is_empty() {
                continue;
            }

            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                let taken = {
                    let mut actions = self.actions.borrow_mut();
                    match actions[idx] {
                        Some(ref mut action) => Some((action.fd, action.error.take())),
                        None => None,
                    }
                };
                if let Some((fd, error)) = taken {
                    if let Some(mut error) = error {
                        error();
                    }
                    self.cancel_fd(fd);
                }
                continue;
            }

            let wants = {
                let actions = self.actions.borrow();
                match actions[idx] {
                    Some(ref action) => match action.direction {
                        Direction::In => {
                            revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP)
                        }
                        Direction::Out => {
                            revents.intersects(PollFlags::POLLOUT | PollFlags::POLLHUP)
                        }
                    },
                    None => false,
                }
            };
            if !wants {
                continue;
            }

            // Take the callback out of its slot for the duration of the
            // call; it may add actions or cancel its own fd.
            let taken = {
                let mut actions = self.actions.borrow_mut();
                match actions[idx] {
                    Some(ref mut action) => action.ready.take().map(|cb| (action.fd, cb)),
                    None => None,
                }
            };
            let (fd, mut ready) = match taken {
                Some(taken) => taken,
                None => continue,
            };

            match ready()? {
                ActionResult::Continue => {
                    let mut actions = self.actions.borrow_mut();
                    if let Some(ref mut action) = actions[idx] {
                        if action.fd == fd {
                            action.ready = Some(ready);
                        }
                    }
                }
                ActionResult::CancelAll => self.cancel_fd(fd),
            }
        }

        Ok(PollResult::Success)
    }
}
