//! Unix process control primitives.
//!
//! The supervisor's state machine only talks to processes through the
//! `ProcessHandle` capability: deliver a signal, probe liveness without
//! delivering one, nothing else. That keeps the state machine independent of
//! the underlying system call surface.

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Ask the process to shut down cleanly.
    Graceful,
    /// Terminate immediately, including the whole process group.
    Force,
}

pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> u32;
    fn signal(&self, kind: SignalKind) -> Result<()>;
    /// Zero-signal liveness probe.
    fn is_alive(&self) -> bool;
}

/// Handle over a pid using native Unix signals.
#[derive(Debug, Clone, Copy)]
pub struct UnixProcessHandle {
    pid: u32,
}

impl UnixProcessHandle {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

impl ProcessHandle for UnixProcessHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn signal(&self, kind: SignalKind) -> Result<()> {
        match kind {
            SignalKind::Graceful => graceful_signal(self.pid),
            SignalKind::Force => force_kill(self.pid),
        }
    }

    fn is_alive(&self) -> bool {
        is_process_alive(self.pid)
    }
}

/// Check if a process is alive by PID without delivering a signal.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Send a graceful shutdown signal to a process.
#[cfg(unix)]
pub fn graceful_signal(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .map_err(|e| AppError::process(format!("Failed to send SIGTERM to PID {}: {}", pid, e)))
}

/// Kill a process, taking its whole process group down when one exists.
#[cfg(unix)]
pub fn force_kill(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::{getpgid, Pid};

    let target = Pid::from_raw(pid as i32);
    match getpgid(Some(target)) {
        Ok(pgid) => killpg(pgid, Signal::SIGKILL).map_err(|e| {
            AppError::process(format!(
                "Failed to kill process group {} (from pid {}): {}",
                pgid.as_raw(),
                pid,
                e
            ))
        }),
        Err(e) => kill(target, Signal::SIGKILL).map_err(|kill_err| {
            AppError::process(format!(
                "Failed to kill process {} (getpgid failed: {}): {}",
                pid, e, kill_err
            ))
        }),
    }
}

pub fn find_available_port() -> Result<u16> {
    portpicker::pick_unused_port().ok_or_else(|| AppError::process("no free port available"))
}

pub fn check_port_available(port: u16) -> Result<()> {
    std::net::TcpListener::bind(("0.0.0.0", port)).map_err(|_| AppError::port_occupied(port))?;
    Ok(())
}
