//! Local child processes supervised by the execution loop.

use std::process::{Child, Command};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use errors::{Result, ResultExt};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChildState {
    Running,
    Stopped,
    Finished(i32),
}

/// One spawned process. Status is polled non-blockingly from the SIGCHLD
/// path of the loop; nothing here ever blocks.
pub struct ChildProcess {
    tag: String,
    child: Child,
    state: ChildState,
}

impl ChildProcess {
    pub fn spawn(tag: &str, command: &mut Command) -> Result<ChildProcess> {
        let child = command
            .spawn()
            .chain_err(|| format!("cannot spawn child process '{}'", tag))?;
        Ok(ChildProcess {
            tag: tag.to_string(),
            child,
            state: ChildState::Running,
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    /// Fold any pending wait events into the recorded state. Safe to call
    /// at any time; returns immediately when nothing happened.
    pub fn check(&mut self) -> Result<()> {
        if let ChildState::Finished(_) = self.state {
            return Ok(());
        }
        let flags =
            WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
        loop {
            match waitpid(self.pid(), Some(flags))? {
                WaitStatus::StillAlive => return Ok(()),
                WaitStatus::Exited(_, code) => {
                    self.state = ChildState::Finished(code);
                    return Ok(());
                }
                WaitStatus::Signaled(_, signal, _) => {
                    self.state = ChildState::Finished(128 + signal as i32);
                    return Ok(());
                }
                WaitStatus::Stopped(_, _) => self.state = ChildState::Stopped,
                WaitStatus::Continued(_) => self.state = ChildState::Running,
                _ => return Ok(()),
            }
        }
    }

    pub fn terminated(&self) -> bool {
        match self.state {
            ChildState::Finished(_) => true,
            _ => false,
        }
    }

    pub fn running(&self) -> bool {
        self.state == ChildState::Running
    }

    pub fn exit_status(&self) -> Option<i32> {
        match self.state {
            ChildState::Finished(code) => Some(code),
            _ => None,
        }
    }

    pub fn resume(&self) -> Result<()> {
        kill(self.pid(), Signal::SIGCONT)?;
        Ok(())
    }
}
