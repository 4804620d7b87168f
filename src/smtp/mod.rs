//! # SMTP server module
//!
//! The per-connection dialogue is a small state machine built with enums
//! and matching, sitting on top of [`crate::stream::BufferedStream`]. Only
//! the minimal command subset is understood: HELO/EHLO, MAIL FROM, RCPT TO
//! and DATA. Anything else is silently ignored.

use std::sync::Arc;

pub mod app;
pub mod parse;
pub mod state_machine;

pub use parse::{Mail, Message};
pub use state_machine::{Dialogue, Envelope, State};

/// Application callback, invoked once per completed message.
pub type Handler = Arc<dyn Fn(Mail) + Send + Sync>;

/// Everything a dialogue needs besides its socket. Shared by every
/// connection of a worker.
#[derive(Clone)]
pub struct Settings {
    /// Name announced in the greeting and the HELO reply
    pub hostname: String,
    pub handler: Handler,
}

impl Settings {
    pub fn new<F>(hostname: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Mail) + Send + Sync + 'static,
    {
        Settings {
            hostname: hostname.into(),
            handler: Arc::new(handler),
        }
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}
