//! Master ↔ slave transport
//!
//! One TCP connection per slave carries every stream: registration,
//! heartbeat, task assignment + commands (master → slave), task updates,
//! and metrics (slave → master). Frames are length-prefixed JSON
//! envelopes; the envelope type demultiplexes the streams. Delivery is
//! FIFO per connection and at-least-once across reconnects - receivers
//! deduplicate by sequence numbers.

mod client;
mod error;
mod frame;
mod messages;
mod server;

pub use client::{Backoff, Connection};
pub use error::TransportError;
pub use frame::{MAX_FRAME_BYTES, read_frame, write_frame};
pub use messages::{CommandMessage, CommandType, Envelope, Message, TaskAssignment};
pub use server::{SlaveEvent, run_listener};
