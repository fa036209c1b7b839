//! `WebSocket` transport glue: frame I/O for one upgraded socket.

pub mod session;

pub use session::{SessionParams, run_ws_session};
