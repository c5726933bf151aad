//! Wire framing: a 16-bit big-endian length prefix followed by the body.

use std::io::{self, Read};

use crate::error::{ChatError, Result};

/// Largest body representable by the 2-byte length prefix.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

pub const FRAME_HEADER_LEN: usize = 2;

/// Encodes `body` into a complete frame. Bodies over [`MAX_FRAME_LEN`] are
/// rejected here, on the sending side; a receiver can never observe an
/// oversized length.
pub fn encode(body: &[u8]) -> Result<Vec<u8>> {
    if body.len() > MAX_FRAME_LEN {
        return Err(ChatError::TooLong { len: body.len() });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Reads exactly one frame from `reader` and returns its body. An empty
/// frame (`len == 0`) is legal. EOF or a socket error anywhere inside a
/// frame is unrecoverable for the connection and surfaces as
/// [`ChatError::Closed`]; decoding is not restartable.
pub fn decode<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    read_exact(reader, &mut header)?;

    let len = u16::from_be_bytes(header) as usize;
    let mut body = vec![0u8; len];
    read_exact(reader, &mut body)?;

    Ok(body)
}

// Short reads are retried until the buffer is full; a 0-byte read means the
// peer closed the stream.
fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(ChatError::Closed),
            Ok(n) => filled += n,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(ChatError::from_socket_io(err)),
        }
    }
    Ok(())
}
