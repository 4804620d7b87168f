//! # tinysmtpd
//!
//! A minimal, non-blocking SMTP receiver. It accepts TCP connections,
//! walks each client through HELO, MAIL FROM, RCPT TO and DATA, and hands
//! every completed message to an application callback.
//!
//! It doesn't intend to be RFC 5321 compliant: there's no QUIT, no
//! extended commands, no TLS and no timeouts.
//!
//! ```no_run
//! use std::net::{IpAddr, Ipv4Addr};
//! use tinysmtpd::{Server, Settings};
//!
//! # fn main() -> tinysmtpd::Result<()> {
//! let settings = Settings::new("mx.example.org", |mail| {
//!     println!("subject: {:?}", mail.message.subject());
//! });
//! let mut server = Server::new(settings);
//! server.bind(2525, IpAddr::V4(Ipv4Addr::UNSPECIFIED))?;
//! if let Some(dispatcher) = server.start(0)? {
//!     dispatcher.run()?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod process;
pub mod server;
pub mod smtp;
pub mod stream;
pub mod time;
pub mod tracing;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use server::Server;
pub use smtp::{Envelope, Mail, Message, Settings};
