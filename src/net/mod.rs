//! Stream sockets and framed message connections.
//!
//! [`SocketClient`] is a nonblocking stream socket driven by the current
//! thread's event loop. [`Connection`] layers a length-prefixed message
//! framing on top of it and decodes frames through a [`MessageFactory`].

mod connection;
mod message;
mod socket;

pub use connection::Connection;
pub use message::{Message, MessageFactory, RawMessageFactory, FINISH_MESSAGE_ID};
pub use socket::SocketClient;
