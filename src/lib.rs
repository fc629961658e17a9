//! Event loop, framed stream connections and subprocess supervision for
//! POSIX systems.
//!
//! The toolkit is built from three cooperating subsystems:
//!
//! - **Event loop**: a per-thread cooperative scheduler multiplexing FD
//!   readiness, timers and posted callables over the platform's native
//!   polling primitive (epoll or kqueue)
//! - **Connection**: a length-prefixed message transport over a connected
//!   stream socket, decoded through a pluggable message factory
//! - **Process**: a fork/exec supervisor that pipes the child's standard
//!   streams through the loop and reaps exits via a dedicated SIGCHLD
//!   worker thread
//!
//! Concurrency model: one event loop per thread, all callbacks serialized on
//! the loop's thread, plus one process-global reaper thread. The posted
//! queue and wake pipe of each loop are the only cross-thread channels.

mod error;
pub mod event_loop;
mod mux;
pub mod net;
pub mod process;
mod sys;

pub use error::Error;
pub use event_loop::{Event, EventLoop, ExecResult, LoopFlags, LoopHandle, TimerFlags};
pub use mux::Mode;
pub use net::{Connection, Message, MessageFactory, RawMessageFactory, SocketClient, FINISH_MESSAGE_ID};
pub use process::{ExecFlags, ExecState, Process};
