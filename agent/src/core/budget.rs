//! Step budget split between the execute and verify phases.

use anyhow::{Result, anyhow};

use crate::core::types::Phase;

/// Total step allowance for one user request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepBudget {
    max_steps: u32,
    reserved_for_verification: u32,
}

impl StepBudget {
    /// Build a budget; requires `0 < max_steps` and `reserved < max_steps`.
    pub fn new(max_steps: u32, reserved_for_verification: u32) -> Result<Self> {
        if max_steps == 0 {
            return Err(anyhow!("max_steps must be > 0"));
        }
        if reserved_for_verification >= max_steps {
            return Err(anyhow!(
                "reserved_for_verification ({reserved_for_verification}) must be < max_steps ({max_steps})"
            ));
        }
        Ok(Self {
            max_steps,
            reserved_for_verification,
        })
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    pub fn reserved_for_verification(&self) -> u32 {
        self.reserved_for_verification
    }

    /// Number of steps the execute phase may consume.
    pub fn execution_limit(&self) -> u32 {
        self.max_steps - self.reserved_for_verification
    }

    /// Phase that applies once `completed` steps have run.
    ///
    /// The verify phase is sticky: once entered it never returns to execute.
    pub fn phase_after(&self, current: Phase, completed: u32) -> Phase {
        match current {
            Phase::Execute if completed >= self.execution_limit() => Phase::Verify,
            other => other,
        }
    }

    pub fn exhausted(&self, completed: u32) -> bool {
        completed >= self.max_steps
    }

    pub fn remaining(&self, completed: u32) -> u32 {
        self.max_steps.saturating_sub(completed)
    }
}
