//! IPC bridge between the client and the worker task.
//!
//! # Architecture
//!
//! - **protocol**: Message types ([`Command`](protocol::Command),
//!   [`Event`](protocol::Event)) and the identifiers they carry
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **transport**: In-memory duplex endpoints wiring the two together

pub mod codec;
pub mod protocol;
pub mod transport;
