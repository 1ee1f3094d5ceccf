//! Wire protocol for Hopper.
//!
//! Every connection to the broker is a TCP stream of length-delimited frames
//! (4-byte big-endian length prefix). Control messages are JSON; artifact
//! bodies travel as raw frames of at most
//! [`CHUNK_SIZE`](hopper_core::artifact::CHUNK_SIZE) bytes.
//!
//! A connection starts with a [`Hello`](messages::Hello) naming what the
//! connecting peer is; the broker answers with a
//! [`HelloReply`](messages::HelloReply).

pub mod connection;
pub mod error;
pub mod handshake;
pub mod messages;

pub use connection::{
    Connection, MAX_FRAME_LENGTH, MessageReader, MessageWriter, reader_loop, writer_loop,
};
pub use error::{TransportError, TransportResult};
pub use handshake::{accept_hello, client_handshake, connect};
pub use messages::PROTOCOL_VERSION;
