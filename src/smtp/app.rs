use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::smtp::state_machine::Dialogue;
use crate::smtp::Settings;

/// Wraps a freshly accepted socket in a [`Dialogue`] and runs it as a task
/// on the current dispatcher. Must be called from inside the dispatcher.
pub fn serve_smtp(
    socket: std::net::TcpStream,
    peer: SocketAddr,
    settings: Arc<Settings>,
) -> Result<()> {
    socket.set_nonblocking(true)?;
    let socket = TcpStream::from_std(socket)?;
    let dialogue = Dialogue::new(socket, peer, settings);

    debug!("Accepted connection from {}", peer);
    tokio::task::spawn_local(async move {
        match dialogue.run().await {
            Ok(()) => info!("SMTP session with {} finished", peer),
            Err(e) => warn!("SMTP session with {} failed: {}", peer, e),
        }
    });
    Ok(())
}
