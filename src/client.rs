//! One connected chat user: an owned socket, a nickname, and a status.

use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use tracing::info;

use crate::codec;
use crate::error::{ChatError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Online,
    Offline,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Online => "online",
            Status::Offline => "offline",
        })
    }
}

/// A client starts `Offline` with an empty nickname; [`Client::handshake`]
/// adopts the first frame as the nickname and moves it `Online`. Once a
/// client goes back `Offline` through [`Client::disconnect`], the socket is
/// shut down and every further send or receive returns [`ChatError::Closed`].
#[derive(Debug)]
pub struct Client {
    stream: TcpStream,
    nick: String,
    status: Status,
}

impl Client {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            nick: String::new(),
            status: Status::Offline,
        }
    }

    /// The first frame a fresh connection sends is its nickname. On any
    /// error the caller is expected to drop the connection.
    pub fn handshake(&mut self) -> Result<&str> {
        let raw = codec::decode(&mut self.stream)?;
        self.nick = String::from_utf8_lossy(&raw).into_owned();
        self.status = Status::Online;
        info!("user {} connected", self.nick);
        Ok(&self.nick)
    }

    /// Sends one framed message, retrying partial writes until the whole
    /// frame is on the wire.
    pub fn send(&mut self, body: &[u8]) -> Result<()> {
        if self.status == Status::Offline {
            return Err(ChatError::Closed);
        }

        let frame = codec::encode(body)?;
        let mut remaining = frame.as_slice();
        while !remaining.is_empty() {
            match self.stream.write(remaining) {
                Ok(0) => return Err(ChatError::Closed),
                Ok(n) => remaining = &remaining[n..],
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ChatError::from_socket_io(err)),
            }
        }
        Ok(())
    }

    /// Receives one framed message, blocking until the frame is complete.
    pub fn recv(&mut self) -> Result<Vec<u8>> {
        if self.status == Status::Offline {
            return Err(ChatError::Closed);
        }
        codec::decode(&mut self.stream)
    }

    /// Idempotent: the second and later calls are no-ops.
    pub fn disconnect(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        if self.status != Status::Offline {
            self.status = Status::Offline;
            info!("user {} disconnected", self.nick);
        }
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn status(&self) -> Status {
        self.status
    }
}

impl AsRawFd for Client {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
