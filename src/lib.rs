//! chatd: a multi-user TCP chat server.
//!
//! Messages travel as 2-byte-big-endian-length-prefixed frames; the first
//! frame of every connection is the nickname. A reactor thread owns all
//! sockets and feeds received messages through `in_queue` to a processor
//! thread, which answers `list` privately, turns everything else into a
//! broadcast, and hands the response back through `out_queue`. The
//! out-queue's eventfd is registered with the reactor like any other
//! descriptor, so deliveries ride the same event loop as reads.

pub mod client;
pub mod codec;
pub mod error;
pub mod message;
pub mod queue;
pub mod reactor;
pub mod server;

pub use error::{ChatError, Result};
pub use server::ChatServer;
