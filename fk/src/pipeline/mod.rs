//! Step pipeline: pre-processors → step action → post-processors

mod executor;
mod record;

pub use executor::{IterationOutcome, StepPipeline};
pub use record::{ActionRecord, OutcomeStatus, Phase, StepOutcome};
