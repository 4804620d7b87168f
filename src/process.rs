//! # Process topology
//!
//! Pre-forking primitives. Workers share nothing but the descriptors they
//! inherit, so each one must build its own dispatcher after the fork.

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, sysconf, ForkResult, Pid, SysconfVar};
use tracing::{error, info, warn};

use crate::error::Result;

/// Which side of [`fork_workers`] the caller ended up on.
#[derive(Debug)]
pub enum Role {
    /// A child, numbered from zero.
    Worker { id: usize },
    /// The parent, with the pids of every child it forked.
    Supervisor { workers: Vec<Pid> },
}

/// Number of online processors, or 1 when that can't be determined.
pub fn cpu_count() -> usize {
    match sysconf(SysconfVar::_NPROCESSORS_ONLN) {
        Ok(Some(n)) if n > 0 => n as usize,
        _ => {
            error!(
                "Could not detect number of processors; running with one \
                 process"
            );
            1
        }
    }
}

/// Turns a requested process count into a concrete one: anything below 1
/// means "one per processor".
pub fn resolve_process_count(requested: i64) -> usize {
    if requested <= 0 {
        cpu_count()
    } else {
        requested as usize
    }
}

/// Forks `count` children. Returns [`Role::Worker`] in each child and
/// [`Role::Supervisor`] in the parent.
///
/// Must run before any tokio runtime exists in this process.
pub fn fork_workers(count: usize) -> Result<Role> {
    info!("Pre-forking {} server processes", count);

    let mut workers = Vec::with_capacity(count);
    for id in 0..count {
        // SAFETY: no runtime or helper threads exist yet, and the child
        // only goes on to build its own dispatcher.
        match unsafe { fork() }? {
            ForkResult::Child => return Ok(Role::Worker { id }),
            ForkResult::Parent { child } => workers.push(child),
        }
    }
    Ok(Role::Supervisor { workers })
}

/// Blocks until every worker has exited.
pub fn wait_for_workers(workers: &[Pid]) -> Result<()> {
    let mut remaining = workers.len();
    while remaining > 0 {
        match waitpid(None, None) {
            Ok(WaitStatus::Exited(pid, 0)) => {
                info!("Worker {} exited", pid);
                remaining -= 1;
            }
            Ok(WaitStatus::Exited(pid, code)) => {
                warn!("Worker {} exited with status {}", pid, code);
                remaining -= 1;
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                warn!("Worker {} killed by {}", pid, signal);
                remaining -= 1;
            }
            Ok(_) => (),
            Err(Errno::EINTR) => (),
            Err(Errno::ECHILD) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
