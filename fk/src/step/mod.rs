//! Type-dispatched step executors
//!
//! Each executor implements `init → execute → cleanup`, consumes the
//! step's type-specific config, updates the context (request-shaped steps
//! set the response), and returns a [`StepResult`]. Timeouts are enforced
//! by the caller through cancellation.

mod db;
mod dispatch;
mod error;
mod http;
mod script;
mod traits;
mod wait;

pub use db::DbQueryExecutor;
pub use dispatch::StepExecutors;
pub use error::StepError;
pub use http::HttpExecutor;
pub use script::ScriptExecutor;
pub use traits::{StepExecutor, StepResult};
pub use wait::WaitExecutor;
