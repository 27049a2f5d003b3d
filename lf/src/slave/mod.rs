//! Slave runtime
//!
//! A slave registers with the master, receives task assignments, drives
//! the keyword pipeline for its load segments through a bounded worker
//! pool, and streams updates, metrics, and heartbeats back. Buffers
//! survive disconnects and replay in FIFO order after reconnecting.

mod buffer;
mod runtime;
mod worker;

pub use buffer::BoundedBuffer;
pub use runtime::SlaveRuntime;
pub use worker::{GateControl, Gates, TaskSink, run_task};
