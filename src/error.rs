//! Crate-wide error type
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("couldn't bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: nix::Error,
    },

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    /// The peer went away, or the stream was closed locally.
    #[error("stream closed")]
    StreamClosed,

    #[error("malformed command: {0:?}")]
    MalformedCommand(String),

    #[error("couldn't parse message: {0}")]
    Parse(#[from] mailparse::MailParseError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("server already bound to a socket")]
    AlreadyBound,

    #[error("server already started")]
    AlreadyStarted,

    #[error("server isn't bound to a socket")]
    NotBound,
}
