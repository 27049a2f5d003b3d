//! Execution options: the virtual-user load profile of a workflow

use serde::{Deserialize, Serialize};

/// How virtual users are driven over the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// A fixed number of VUs iterate for the configured duration
    #[default]
    ConstantVus,
    /// VU count follows the configured stages
    RampingVus,
    /// Every VU runs the configured number of iterations
    PerVuIterations,
    /// The iteration total is split across all VUs
    SharedIterations,
}

/// One phase of a ramping-vus profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    #[serde(rename = "duration-ms")]
    pub duration_ms: u64,
    /// VU target to ramp to by the end of the stage
    pub target: u32,
    #[serde(default)]
    pub name: String,
}

/// The load profile of one workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ExecutionOptions {
    pub vus: u32,
    pub duration_ms: u64,
    pub iterations: u64,
    pub execution_mode: ExecutionMode,
    pub stages: Vec<Stage>,
    /// Execute on the master when no slaves are eligible
    pub standalone: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            vus: 1,
            duration_ms: 0,
            iterations: 1,
            execution_mode: ExecutionMode::ConstantVus,
            stages: Vec::new(),
            standalone: false,
        }
    }
}

impl ExecutionOptions {
    /// Normalize zero fields to their minimums
    pub fn apply_defaults(&mut self) {
        if self.vus == 0 {
            self.vus = 1;
        }
        if self.duration_ms == 0 && self.iterations == 0 {
            self.iterations = 1;
        }
    }

    /// Check the option invariants; the reason string is surfaced to the caller
    pub fn validate(&self) -> Result<(), String> {
        if self.vus < 1 {
            return Err("vus must be >= 1".to_string());
        }
        if self.duration_ms == 0 && self.iterations < 1 {
            return Err("iterations must be >= 1 when no duration is set".to_string());
        }
        if self.execution_mode == ExecutionMode::RampingVus {
            if self.stages.is_empty() {
                return Err("ramping-vus requires at least one stage".to_string());
            }
            if self.stages.iter().any(|s| s.duration_ms == 0) {
                return Err("every stage needs a nonzero duration".to_string());
            }
        }
        Ok(())
    }
}
