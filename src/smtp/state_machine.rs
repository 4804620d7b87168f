use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::smtp::parse::{Mail, Message};
use crate::smtp::Settings;
use crate::stream::BufferedStream;

const LINE_END: &[u8] = b"\r\n";
/// Includes the line end before the dot, so a payload is only complete
/// once the terminating line has arrived whole.
const END_OF_DATA: &[u8] = b"\r\n.\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Greeted,
    AwaitingCommand,
    AwaitingData,
}

#[derive(Debug, PartialEq)]
pub enum Event {
    Connected,
    Hello,
    MailFrom { from: String },
    RcptTo { rcpt_to: String },
    Data,
    EndOfData { payload: Vec<u8> },
    Unrecognized,
}

/// Sender and recipient for the message in flight. Nothing clears it: a
/// later MAIL FROM or RCPT TO overwrites the matching field, and values
/// carry over into the next DATA cycle otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Envelope {
    pub from_address: Option<String>,
    pub to_address: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Hello,
    MailFrom,
    RcptTo,
    Data,
}

/// Checked in order, first hit wins. Matching is case-sensitive substring
/// containment anywhere in the line.
const COMMAND_RULES: &[(&[&str], Command)] = &[
    (&["HELO", "EHLO"], Command::Hello),
    (&["MAIL FROM"], Command::MailFrom),
    (&["RCPT TO"], Command::RcptTo),
    (&["DATA"], Command::Data),
];

impl Event {
    /// Maps one command line (terminator included or not) to an event.
    pub fn recognize(line: &str) -> Result<Event> {
        let rule = COMMAND_RULES.iter().find(|(needles, _)| {
            needles.iter().any(|needle| line.contains(needle))
        });

        let event = match rule {
            Some((_, Command::Hello)) => Event::Hello,
            Some((_, Command::MailFrom)) => Event::MailFrom {
                from: argument(line)?,
            },
            Some((_, Command::RcptTo)) => Event::RcptTo {
                rcpt_to: argument(line)?,
            },
            Some((_, Command::Data)) => Event::Data,
            None => Event::Unrecognized,
        };
        Ok(event)
    }
}

/// Whatever follows the first colon, minus the line end.
fn argument(line: &str) -> Result<String> {
    let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
    match line.split_once(':') {
        Some((_, rest)) => Ok(rest.to_owned()),
        None => Err(Error::MalformedCommand(line.to_owned())),
    }
}

impl State {
    pub fn next(self, event: &Event) -> State {
        match (self, event) {
            (State::Greeted, Event::Connected) => State::AwaitingCommand,
            (State::AwaitingCommand, Event::Data) => State::AwaitingData,
            (State::AwaitingCommand, _) => State::AwaitingCommand,
            (State::AwaitingData, Event::EndOfData { .. }) => {
                State::AwaitingCommand
            }
            (state, _) => state,
        }
    }
}

/// One SMTP conversation over one connection.
pub struct Dialogue<S> {
    stream: BufferedStream<S>,
    peer: SocketAddr,
    settings: Arc<Settings>,
    state: State,
    envelope: Envelope,
}

impl<S> Dialogue<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: SocketAddr, settings: Arc<Settings>) -> Self {
        Dialogue {
            stream: BufferedStream::new(stream),
            peer,
            settings,
            state: State::Greeted,
            envelope: Envelope::default(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Converses until the peer hangs up. A command or payload that can't
    /// be interpreted ends this connection with an error; the stream is
    /// closed either way.
    pub async fn run(mut self) -> Result<()> {
        let outcome = self.converse().await;
        self.stream.close().await;

        match outcome {
            Err(Error::StreamClosed) => {
                debug!("{} hung up", self.peer);
                Ok(())
            }
            other => other,
        }
    }

    async fn converse(&mut self) -> Result<()> {
        loop {
            self.step().await?;
        }
    }

    /// Waits for the next event, answers it and moves to the next state.
    async fn step(&mut self) -> Result<()> {
        let event = match self.state {
            State::Greeted => Event::Connected,
            State::AwaitingCommand => {
                let line = self.stream.read_until(LINE_END).await?;
                let line = String::from_utf8_lossy(&line);
                debug!("read SMTP command: {}", line.trim_end());
                Event::recognize(&line)?
            }
            State::AwaitingData => {
                let payload = self.stream.read_until(END_OF_DATA).await?;
                debug!("read {} byte DATA payload", payload.len());
                Event::EndOfData { payload }
            }
        };

        self.handle(&event).await?;
        self.state = self.state.next(&event);
        Ok(())
    }

    async fn handle(&mut self, event: &Event) -> Result<()> {
        match event {
            Event::Connected => {
                let greeting = format!(
                    "220 {} Simple Mail Transfer Service Ready\r\n",
                    self.settings.hostname
                );
                self.stream.write(greeting.as_bytes()).await
            }
            Event::Hello => {
                let reply = format!("250 {}\r\n", self.settings.hostname);
                self.stream.write(reply.as_bytes()).await
            }
            Event::MailFrom { from } => {
                self.envelope.from_address = Some(from.clone());
                self.stream.write(b"200 Ok\r\n").await
            }
            Event::RcptTo { rcpt_to } => {
                if let Some(previous) = &self.envelope.to_address {
                    debug!("Recipient {} replaced by {}", previous, rcpt_to);
                }
                self.envelope.to_address = Some(rcpt_to.clone());
                self.stream.write(b"200 Ok\r\n").await
            }
            Event::Data => {
                self.stream
                    .write(b"354 End data with <CR><LF>.<CR><LF>\r\n")
                    .await
            }
            Event::EndOfData { payload } => {
                // Drop the ".\r\n"; the CRLF before it ends the last line
                let raw = &payload[..payload.len() - (END_OF_DATA.len() - 2)];
                let message = Message::parse(raw).map_err(|e| {
                    warn!("Undeliverable message from {}: {}", self.peer, e);
                    e
                })?;

                (self.settings.handler)(Mail {
                    peer: self.peer,
                    envelope: self.envelope.clone(),
                    message,
                });
                self.stream.write(b"250 Ok\r\n").await
            }
            Event::Unrecognized => Ok(()),
        }
    }
}
