//! # Connection listener
//!
//! Binds the listening socket, decides how many worker processes serve it
//! and accepts connections on behalf of whichever dispatcher it's attached
//! to.

use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::socket::{
    bind, listen, setsockopt, socket, sockopt, AddressFamily, SockFlag,
    SockType, SockaddrStorage,
};
use tokio::io::Interest;
use tracing::{error, info};

use crate::dispatcher::{self, Dispatcher, Handle};
use crate::error::{Error, Result};
use crate::process::{
    fork_workers, resolve_process_count, wait_for_workers, Role,
};
use crate::smtp::app::serve_smtp;
use crate::smtp::Settings;

const BACKLOG: usize = 128;

pub struct Server {
    settings: Arc<Settings>,
    socket: Option<Rc<TcpListener>>,
    dispatcher: Option<Handle>,
    started: bool,
}

impl Server {
    pub fn new(settings: Settings) -> Self {
        Server {
            settings: Arc::new(settings),
            socket: None,
            dispatcher: None,
            started: false,
        }
    }

    /// Binds and starts in this process only. The caller runs the
    /// returned dispatcher.
    pub fn listen(&mut self, port: u16, address: IpAddr) -> Result<Dispatcher> {
        self.bind(port, address)?;
        let dispatcher = Dispatcher::new()?;
        self.attach(dispatcher.handle())?;
        Ok(dispatcher)
    }

    /// Opens a non-blocking, close-on-exec listening socket with
    /// `SO_REUSEADDR` set.
    pub fn bind(&mut self, port: u16, address: IpAddr) -> Result<()> {
        if self.socket.is_some() {
            return Err(Error::AlreadyBound);
        }

        let addr = SocketAddr::new(address, port);
        let socket =
            open_listener(addr).map_err(|source| Error::Bind { addr, source })?;
        info!("Listening on {}", socket.local_addr()?);
        self.socket = Some(Rc::new(socket));
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let socket = self.socket.as_ref().ok_or(Error::NotBound)?;
        Ok(socket.local_addr()?)
    }

    /// Starts accepting with `num_processes` workers; zero or less means
    /// one per processor.
    ///
    /// With more than one worker this process forks. Each child gets back
    /// `Some(dispatcher)` with the accept handler already registered and
    /// must run it. The parent waits for every child to exit and then gets
    /// `None`. With a single worker this process gets the dispatcher.
    pub fn start(&mut self, num_processes: i64) -> Result<Option<Dispatcher>> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        if self.socket.is_none() {
            return Err(Error::NotBound);
        }
        self.started = true;

        let mut count = resolve_process_count(num_processes);
        if count > 1 && dispatcher::instantiated() {
            error!(
                "Cannot run in multiple processes: a dispatcher has already \
                 been created in this process. Start the server before \
                 creating one"
            );
            count = 1;
        }

        if count > 1 {
            match fork_workers(count)? {
                Role::Worker { id } => info!("Worker {} starting", id),
                Role::Supervisor { workers } => {
                    wait_for_workers(&workers)?;
                    return Ok(None);
                }
            }
        }

        let dispatcher = Dispatcher::new()?;
        self.register(dispatcher.handle())?;
        Ok(Some(dispatcher))
    }

    /// Starts accepting on a dispatcher the caller already owns. Always
    /// single-process.
    pub fn attach(&mut self, handle: Handle) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        self.register(handle)?;
        self.started = true;
        Ok(())
    }

    /// Stops accepting and closes the listening socket. Connections
    /// already established are left alone.
    pub fn stop(&mut self) {
        if let Some(socket) = self.socket.take() {
            if let Some(handle) = self.dispatcher.take() {
                handle.remove_handler(socket.as_raw_fd());
            }
            info!("Stopped listening");
        }
    }

    fn register(&mut self, handle: Handle) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(Error::NotBound)?;
        let fd = socket.as_raw_fd();
        // Only the server owns the socket, so `stop` closes it at once
        let socket: Weak<TcpListener> = Rc::downgrade(socket);
        let settings = Arc::clone(&self.settings);

        handle.add_handler(fd, Interest::READABLE, move |_, _| {
            let socket = match socket.upgrade() {
                Some(socket) => socket,
                None => return Ok(()),
            };
            accept_pending(&socket, |connection, peer| {
                serve_smtp(connection, peer, Arc::clone(&settings))
            })
        });
        self.dispatcher = Some(handle);
        Ok(())
    }
}

/// Accepts until the backlog is empty, handing each connection to `serve`.
/// A connection `serve` fails on is logged and skipped; any other accept
/// failure is returned, which stops the worker.
fn accept_pending<F>(socket: &TcpListener, mut serve: F) -> Result<()>
where
    F: FnMut(TcpStream, SocketAddr) -> Result<()>,
{
    loop {
        let (connection, peer) = match socket.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = serve(connection, peer) {
            error!("Error in connection callback for {}: {}", peer, e);
        }
    }
}

fn open_listener(addr: SocketAddr) -> nix::Result<TcpListener> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let fd = socket(family, SockType::Stream, SockFlag::empty(), None)?;
    let raw: RawFd = fd.as_raw_fd();

    let fd_flags = FdFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFD)?);
    fcntl(raw, FcntlArg::F_SETFD(fd_flags | FdFlag::FD_CLOEXEC))?;
    let fl_flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL)?);
    fcntl(raw, FcntlArg::F_SETFL(fl_flags | OFlag::O_NONBLOCK))?;

    setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    bind(raw, &SockaddrStorage::from(addr))?;
    listen(&fd, BACKLOG)?;

    Ok(TcpListener::from(fd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn server() -> Server {
        Server::new(Settings::new("testhost", |_| ()))
    }

    #[test]
    fn bind_sets_descriptor_flags() {
        let mut server = server();
        server.bind(0, IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        let socket = server.socket.as_ref().unwrap();
        let raw = socket.as_raw_fd();

        let fd_flags =
            FdFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFD).unwrap());
        assert!(fd_flags.contains(FdFlag::FD_CLOEXEC));
        let fl_flags =
            OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL).unwrap());
        assert!(fl_flags.contains(OFlag::O_NONBLOCK));
        assert!(nix::sys::socket::getsockopt(socket.as_ref(), sockopt::ReuseAddr)
            .unwrap());
    }

    #[test]
    fn binding_a_taken_port_fails() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut server = server();
        let result = server.bind(port, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(matches!(result, Err(Error::Bind { .. })));
    }

    #[test]
    fn start_requires_bind() {
        let mut server = server();
        assert!(matches!(server.start(1), Err(Error::NotBound)));
    }

    #[test]
    fn multi_process_request_downgrades_after_dispatcher_exists() {
        let _existing = Dispatcher::new().unwrap();

        let mut server = server();
        server.bind(0, IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        // No fork happens: this process gets the only dispatcher
        assert!(server.start(4).unwrap().is_some());
        assert!(matches!(server.start(1), Err(Error::AlreadyStarted)));
    }

    #[test]
    fn binding_twice_fails() {
        let mut server = server();
        server.bind(0, IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        let addr = server.local_addr().unwrap();

        let again = server.bind(0, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(matches!(again, Err(Error::AlreadyBound)));
        assert_eq!(server.local_addr().unwrap(), addr);
    }

    #[test]
    fn stop_closes_listening_socket_without_running() {
        let dispatcher = Dispatcher::new().unwrap();
        let mut server = server();
        server.bind(0, IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        let addr = server.local_addr().unwrap();
        server.attach(dispatcher.handle()).unwrap();
        assert!(matches!(
            server.attach(dispatcher.handle()),
            Err(Error::AlreadyStarted)
        ));

        server.stop();
        let refused = TcpStream::connect(addr).unwrap_err();
        assert_eq!(refused.kind(), io::ErrorKind::ConnectionRefused);
        assert!(matches!(server.local_addr(), Err(Error::NotBound)));

        dispatcher.handle().stop();
        dispatcher.run().unwrap();
    }

    fn bound_but_not_listening() -> TcpListener {
        let fd = socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )
        .unwrap();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        bind(fd.as_raw_fd(), &SockaddrStorage::from(addr)).unwrap();
        let socket = TcpListener::from(fd);
        socket.set_nonblocking(true).unwrap();
        socket
    }

    #[test]
    fn accept_error_is_returned() {
        let socket = bound_but_not_listening();

        let result = accept_pending(&socket, |_, _| Ok(()));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn accept_error_stops_the_dispatcher() {
        use std::io::Write;
        use std::os::unix::net::UnixStream;

        let dispatcher = Dispatcher::new().unwrap();
        let socket = bound_but_not_listening();
        let (mut wake, readable) = UnixStream::pair().unwrap();
        readable.set_nonblocking(true).unwrap();
        wake.write_all(b"x").unwrap();

        dispatcher.add_handler(
            readable.as_raw_fd(),
            Interest::READABLE,
            move |_, _| accept_pending(&socket, |_, _| Ok(())),
        );

        assert!(matches!(dispatcher.run(), Err(Error::Io(_))));
        drop(readable);
    }

    #[test]
    fn failed_connection_setup_does_not_stop_accepting() {
        let mut server = server();
        server.bind(0, IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        let addr = server.local_addr().unwrap();
        let socket = Rc::clone(server.socket.as_ref().unwrap());

        let _first = TcpStream::connect(addr).unwrap();
        let _second = TcpStream::connect(addr).unwrap();

        let mut attempts = 0;
        let mut served = Vec::new();
        // Handshakes complete asynchronously; keep draining until both
        // connections have shown up
        for _ in 0..200 {
            accept_pending(&socket, |connection, peer| {
                attempts += 1;
                if attempts == 1 {
                    return Err(Error::StreamClosed);
                }
                served.push(peer);
                drop(connection);
                Ok(())
            })
            .unwrap();
            if attempts == 2 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        assert_eq!(attempts, 2);
        assert_eq!(served.len(), 1);
    }
}
