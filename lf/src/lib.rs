//! Loadflow - distributed workflow and load-test execution engine
//!
//! A master partitions a declarative workflow's virtual-user load into
//! segments, distributes them to slaves over a long-lived TCP channel,
//! aggregates live metrics, evaluates pass/fail thresholds, and exposes
//! realtime status to subscribers.
//!
//! # Modules
//!
//! - [`master`] - control plane: registry, scheduler, aggregator,
//!   execution state machine, runtime actor
//! - [`slave`] - worker runtime: task pool, VU drivers, buffers
//! - [`transport`] - length-prefixed message channel between the two
//! - [`config`] - YAML configuration with a fallback chain
//! - [`supervisor`] - supervised background task spawning
//!
//! The workflow model and keyword pipeline live in the `flowkit` crate.

pub mod cli;
pub mod config;
pub mod master;
pub mod slave;
pub mod supervisor;
pub mod transport;

// Re-export commonly used types
pub use config::{Config, MasterConfig, SlaveConfig};
pub use master::{
    AggregatorHandle, ExecutionMetrics, ExecutionTracker, FinalReport, LogOutput, MasterHandle, MasterRuntime,
    Output, OutputManager, RegistryEvent, SlaveEntry, SlaveRegistry, StatusSnapshot, StepSummary, SubmitError,
};
pub use slave::{BoundedBuffer, SlaveRuntime};
pub use supervisor::spawn_supervised;
pub use transport::{
    Backoff, CommandMessage, CommandType, Connection, Envelope, Message, SlaveEvent, TaskAssignment, TransportError,
    run_listener,
};
