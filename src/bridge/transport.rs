//! In-memory transport connecting a client to its worker task.
//!
//! Both ends live in the same process, so an in-memory duplex byte pipe plus
//! the framed JSON codec stands in for a socket. Messages are serialized
//! across the pipe and reconstructed on the far side; the two contexts never
//! share a payload.

use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{CommandCodec, JsonCodec};
use super::protocol::{Command, Event};

/// Per-direction buffer of the duplex pipe. A frame larger than this still
/// crosses; the writer just yields until the far side drains.
pub const PIPE_CAPACITY: usize = 64 * 1024;

pub type CommandWriter = FramedWrite<WriteHalf<DuplexStream>, JsonCodec<Command>>;
pub type EventReader = FramedRead<ReadHalf<DuplexStream>, JsonCodec<Event>>;
pub type CommandReader = FramedRead<ReadHalf<DuplexStream>, CommandCodec>;
pub type EventWriter = FramedWrite<WriteHalf<DuplexStream>, JsonCodec<Event>>;

/// Client end of the channel: writes commands, reads events.
pub struct HostEndpoint {
    pub commands: CommandWriter,
    pub events: EventReader,
}

impl HostEndpoint {
    pub fn new(io: DuplexStream) -> Self {
        let (read, write) = split(io);
        Self {
            commands: FramedWrite::new(write, JsonCodec::new()),
            events: FramedRead::new(read, JsonCodec::new()),
        }
    }

    pub fn into_split(self) -> (CommandWriter, EventReader) {
        (self.commands, self.events)
    }
}

/// Worker end of the channel: reads commands, writes events.
pub struct WorkerEndpoint {
    pub commands: CommandReader,
    pub events: EventWriter,
}

impl WorkerEndpoint {
    pub fn new(io: DuplexStream) -> Self {
        let (read, write) = split(io);
        Self {
            commands: FramedRead::new(read, CommandCodec::new()),
            events: FramedWrite::new(write, JsonCodec::new()),
        }
    }

    pub fn into_split(self) -> (CommandReader, EventWriter) {
        (self.commands, self.events)
    }
}

/// Create a connected endpoint pair.
pub fn pair() -> (HostEndpoint, WorkerEndpoint) {
    let (host_io, worker_io) = duplex(PIPE_CAPACITY);
    (HostEndpoint::new(host_io), WorkerEndpoint::new(worker_io))
}
