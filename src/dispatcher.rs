//! # Event dispatcher
//!
//! A single-threaded reactor: one tokio `current_thread` runtime driving a
//! `LocalSet`. Each registered descriptor gets a local task that waits for
//! readiness and hands control to its callback, which runs to completion
//! before anything else in the process is polled.
//!
//! Every process that serves connections owns its own [`Dispatcher`]. Forked
//! workers build theirs after the fork, never before.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::unix::AsyncFd;
use tokio::io::{Interest, Ready};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, LocalSet};
use tracing::{debug, error};

use crate::error::{Error, Result};

static INSTANTIATED: AtomicBool = AtomicBool::new(false);

/// Whether a [`Dispatcher`] has been created in this process. Forking after
/// that point would leave the children sharing the parent's reactor state.
pub fn instantiated() -> bool {
    INSTANTIATED.load(Ordering::SeqCst)
}

enum Signal {
    Stop,
    Fatal(Error),
}

pub struct Dispatcher {
    // Dropped before the runtime so local tasks release their reactor
    // registrations while it still exists.
    handle: Handle,
    runtime: Runtime,
    signals: mpsc::UnboundedReceiver<Signal>,
}

/// Cheap, clonable access to a [`Dispatcher`]'s handler table. Usable both
/// before `run` and from inside callbacks.
#[derive(Clone)]
pub struct Handle {
    inner: Rc<Inner>,
}

struct Inner {
    local: LocalSet,
    handlers: RefCell<HashMap<RawFd, JoinHandle<()>>>,
    signals: mpsc::UnboundedSender<Signal>,
}

impl Dispatcher {
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        INSTANTIATED.store(true, Ordering::SeqCst);
        debug!("Event dispatcher created");

        Ok(Dispatcher {
            handle: Handle {
                inner: Rc::new(Inner {
                    local: LocalSet::new(),
                    handlers: RefCell::new(HashMap::new()),
                    signals: tx,
                }),
            },
            runtime,
            signals: rx,
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn add_handler<F>(&self, fd: RawFd, interest: Interest, callback: F)
    where
        F: FnMut(RawFd, Ready) -> Result<()> + 'static,
    {
        self.handle.add_handler(fd, interest, callback)
    }

    pub fn remove_handler(&self, fd: RawFd) {
        self.handle.remove_handler(fd)
    }

    /// Dispatches events until [`Handle::stop`] is called or a handler
    /// fails, in which case that handler's error is returned.
    pub fn run(mut self) -> Result<()> {
        let Dispatcher {
            ref runtime,
            ref handle,
            ref mut signals,
        } = self;

        let outcome = runtime.block_on(handle.inner.local.run_until(async {
            match signals.recv().await {
                Some(Signal::Fatal(e)) => Err(e),
                Some(Signal::Stop) | None => Ok(()),
            }
        }));

        for (_, task) in handle.inner.handlers.borrow_mut().drain() {
            task.abort();
        }
        // Let the aborted tasks unwind; their callbacks may hold handles
        // back into this dispatcher.
        runtime.block_on(
            handle.inner.local.run_until(tokio::task::yield_now()),
        );
        outcome
    }

    /// Runs `future` to completion on this dispatcher without waiting for
    /// a stop request. Handlers keep firing while it runs.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime
            .block_on(self.handle.inner.local.run_until(future))
    }
}

impl Handle {
    /// Calls `callback` every time `fd` becomes ready for `interest`. The
    /// callback must consume whatever made the descriptor ready (until it
    /// would block) before returning. An error from it stops the
    /// dispatcher.
    ///
    /// Registering a descriptor twice replaces the earlier handler.
    pub fn add_handler<F>(&self, fd: RawFd, interest: Interest, callback: F)
    where
        F: FnMut(RawFd, Ready) -> Result<()> + 'static,
    {
        let signals = self.inner.signals.clone();
        let task = self.inner.local.spawn_local(async move {
            if let Err(e) = watch(fd, interest, callback).await {
                error!("Handler for descriptor {} failed: {}", fd, e);
                let _ = signals.send(Signal::Fatal(e));
            }
        });

        if let Some(old) = self.inner.handlers.borrow_mut().insert(fd, task) {
            old.abort();
        }
    }

    pub fn remove_handler(&self, fd: RawFd) {
        match self.inner.handlers.borrow_mut().remove(&fd) {
            Some(task) => task.abort(),
            None => debug!("No handler registered for descriptor {}", fd),
        }
    }

    /// Asks the dispatcher to return from `run`.
    pub fn stop(&self) {
        let _ = self.inner.signals.send(Signal::Stop);
    }
}

async fn watch<F>(fd: RawFd, interest: Interest, mut callback: F) -> Result<()>
where
    F: FnMut(RawFd, Ready) -> Result<()>,
{
    let source = AsyncFd::with_interest(fd, interest)?;
    loop {
        let mut guard = source.ready(interest).await?;
        callback(fd, guard.ready())?;
        guard.clear_ready();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn handler_fires_on_readable_descriptor() {
        let dispatcher = Dispatcher::new().unwrap();
        assert!(instantiated());

        let (mut writer, reader) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        writer.write_all(b"x").unwrap();

        let fired = Rc::new(Cell::new(0));
        let handle = dispatcher.handle();
        {
            let fired = Rc::clone(&fired);
            let handle = handle.clone();
            let fd = reader.as_raw_fd();
            dispatcher.add_handler(fd, Interest::READABLE, move |_, ready| {
                assert!(ready.is_readable());
                let mut buf = [0u8; 8];
                let _ = std::io::Read::read(&mut &reader, &mut buf);
                fired.set(fired.get() + 1);
                handle.stop();
                Ok(())
            });
        }

        dispatcher.run().unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn handler_error_is_fatal_to_run() {
        let dispatcher = Dispatcher::new().unwrap();
        let (mut writer, reader) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        writer.write_all(b"x").unwrap();

        let fd = reader.as_raw_fd();
        dispatcher.add_handler(fd, Interest::READABLE, |_, _| {
            Err(Error::StreamClosed)
        });

        assert!(matches!(dispatcher.run(), Err(Error::StreamClosed)));
        drop(reader);
    }

    #[test]
    fn removed_handler_never_fires() {
        let dispatcher = Dispatcher::new().unwrap();
        let (mut writer, reader) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        writer.write_all(b"x").unwrap();

        let fd = reader.as_raw_fd();
        dispatcher.add_handler(fd, Interest::READABLE, |_, _| {
            panic!("removed handler fired")
        });
        dispatcher.remove_handler(fd);

        let handle = dispatcher.handle();
        dispatcher.block_on(async {
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
        });
        handle.stop();
        dispatcher.run().unwrap();
        drop(reader);
    }
}
