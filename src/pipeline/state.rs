//! Pipeline lifecycle: a linear state machine with a terminal failure state.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::pipeline::plan::Phase;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Pending,
    Running { phase: Phase },
    Done,
    Failed { phase: Phase, cause: String },
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed { .. })
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            PipelineState::Running { phase } | PipelineState::Failed { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Pending => f.write_str("Pending"),
            PipelineState::Running { phase } => write!(f, "{phase}"),
            PipelineState::Done => f.write_str("Done"),
            PipelineState::Failed { phase, cause } => write!(f, "Failed during {phase}: {cause}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: PipelineState,
    pub to: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pipeline transition from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// Tracks the current state and the ordered history of states entered.
#[derive(Debug, Clone)]
pub struct PipelineTracker {
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl Default for PipelineTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineTracker {
    pub fn new() -> Self {
        Self {
            state: PipelineState::Pending,
            history: vec![PipelineState::Pending],
        }
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    /// Move forward to `phase`, passing through every phase in between.
    /// Advancing to the current phase is a no-op.
    pub fn advance_to(&mut self, phase: Phase) -> Result<(), InvalidTransition> {
        let mut next = match &self.state {
            PipelineState::Pending => Phase::Fetching,
            PipelineState::Running { phase: current } if *current == phase => return Ok(()),
            PipelineState::Running { phase: current } if *current < phase => match current.next() {
                Some(next) => next,
                None => return Err(self.invalid(phase.to_string())),
            },
            _ => return Err(self.invalid(phase.to_string())),
        };
        loop {
            self.enter(PipelineState::Running { phase: next });
            if next == phase {
                return Ok(());
            }
            match next.next() {
                Some(following) => next = following,
                None => return Err(self.invalid(phase.to_string())),
            }
        }
    }

    /// Finish after the last phase.
    pub fn finish(&mut self) -> Result<(), InvalidTransition> {
        match self.state {
            PipelineState::Running {
                phase: Phase::Labeling,
            } => {
                self.enter(PipelineState::Done);
                Ok(())
            }
            _ => Err(self.invalid("Done".to_string())),
        }
    }

    /// Enter the terminal failure state. `phase` defaults to the current one.
    pub fn fail(&mut self, phase: Option<Phase>, cause: impl Into<String>) -> Result<(), InvalidTransition> {
        if self.state.is_terminal() {
            return Err(self.invalid("Failed".to_string()));
        }
        let phase = phase
            .or_else(|| self.state.phase())
            .unwrap_or(Phase::Fetching);
        self.enter(PipelineState::Failed {
            phase,
            cause: cause.into(),
        });
        Ok(())
    }

    fn enter(&mut self, state: PipelineState) {
        info!(from = %self.state, to = %state, "pipeline state changed");
        self.history.push(state.clone());
        self.state = state;
    }

    fn invalid(&self, to: String) -> InvalidTransition {
        InvalidTransition {
            from: self.state.clone(),
            to,
        }
    }
}
