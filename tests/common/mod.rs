#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Blocking SMTP client speaking just enough to drive the server.
pub struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream.set_nodelay(true).unwrap();
        Client {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
        }
    }

    pub fn send(&mut self, data: &str) {
        self.writer.write_all(data.as_bytes()).unwrap();
    }

    /// Writes `data` one byte per segment.
    pub fn trickle(&mut self, data: &str) {
        for byte in data.as_bytes() {
            self.writer.write_all(&[*byte]).unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn reply(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line
    }

    /// Sends `line` and returns the server's answer to it.
    pub fn command(&mut self, line: &str) -> String {
        self.send(line);
        self.reply()
    }

    /// Runs one full MAIL FROM / RCPT TO / DATA cycle and returns the
    /// final reply.
    pub fn deliver(&mut self, from: &str, to: &str, payload: &str) -> String {
        assert_eq!(self.command(&format!("MAIL FROM:{}\r\n", from)), "200 Ok\r\n");
        assert_eq!(self.command(&format!("RCPT TO:{}\r\n", to)), "200 Ok\r\n");
        assert_eq!(
            self.command("DATA\r\n"),
            "354 End data with <CR><LF>.<CR><LF>\r\n"
        );
        self.command(payload)
    }
}
