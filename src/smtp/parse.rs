//! # Mail Parsing module
//!
//! Thin layer over the `mailparse` crate: turns a DATA payload into an
//! owned [`Message`] the application handler can keep around after the
//! connection moves on.

use std::net::SocketAddr;
use std::str::Lines;

use chrono::{DateTime, Utc};
use mailparse::{parse_mail, ParsedMail};
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::smtp::state_machine::Envelope;
use crate::time::header_date_to_utc;

/// A parsed message: its headers in order of appearance and its decoded
/// text body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    headers: Vec<(String, String)>,
    body: String,
}

impl Message {
    /// Takes the slice of bytes that is the email DATA body and returns a
    /// [`Message`]
    pub fn parse(raw: &[u8]) -> Result<Message> {
        let parsed = parse_mail(raw)?;

        let headers = parsed
            .headers
            .iter()
            .map(|h| (h.get_key(), h.get_value()))
            .collect();

        let body = text_body(&parsed)?;
        debug!("Parsed message with a {} byte body", body.len());

        Ok(Message { headers, body })
    }

    /// First value of header `name`, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn subject(&self) -> Option<&str> {
        self.header("Subject")
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.header("Date").and_then(header_date_to_utc)
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Lines of the body without their terminators. Each call starts over.
    pub fn body_lines(&self) -> Lines<'_> {
        self.body.lines()
    }
}

/// Prefers the first `text/plain` part of a multipart message, then its
/// first part, then the top-level body.
fn text_body(parsed: &ParsedMail) -> Result<String> {
    if parsed.subparts.is_empty() {
        return Ok(parsed.get_body()?);
    }

    let part = parsed
        .subparts
        .iter()
        .find(|p| p.ctype.mimetype.starts_with("text/plain"))
        .unwrap_or(&parsed.subparts[0]);
    text_body(part)
}

/// What the application handler receives: the message plus the envelope
/// it came in with.
#[derive(Debug, Clone, Serialize)]
pub struct Mail {
    pub peer: SocketAddr,
    pub envelope: Envelope,
    pub message: Message,
}
