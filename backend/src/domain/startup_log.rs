//! Per-container startup timeline.
//!
//! Each container index records four steps; each step is a small state
//! machine `NotExecuted → Started → {Succeeded, Failed}`.

use std::collections::BTreeMap;

use berth_common::StartupStepKind;
use chrono::{DateTime, Utc};

use crate::domain::error::StartupLogError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepState {
    #[default]
    NotExecuted,
    Started {
        at: DateTime<Utc>,
    },
    Succeeded {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    Failed {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
}

impl StepState {
    fn name(self) -> &'static str {
        match self {
            Self::NotExecuted => "not-executed",
            Self::Started { .. } => "started",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
        }
    }

    /// Time between start and completion, for finished steps.
    #[must_use]
    pub fn duration(self) -> Option<chrono::Duration> {
        match self {
            Self::Succeeded {
                started_at,
                finished_at,
            }
            | Self::Failed {
                started_at,
                finished_at,
            } => Some(finished_at - started_at),
            _ => None,
        }
    }
}

/// The four steps of one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContainerStartupLog {
    steps: [StepState; 4],
}

impl ContainerStartupLog {
    #[must_use]
    pub fn step(&self, kind: StartupStepKind) -> StepState {
        self.steps[slot(kind)]
    }
}

fn slot(kind: StartupStepKind) -> usize {
    match kind {
        StartupStepKind::Schedule => 0,
        StartupStepKind::PullImage => 1,
        StartupStepKind::StartContainer => 2,
        StartupStepKind::StartApplication => 3,
    }
}

/// Finished timeline of a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProxyStartupLog {
    containers: BTreeMap<usize, ContainerStartupLog>,
}

impl ProxyStartupLog {
    #[must_use]
    pub fn container(&self, index: usize) -> Option<&ContainerStartupLog> {
        self.containers.get(&index)
    }

    #[must_use]
    pub fn step(&self, index: usize, kind: StartupStepKind) -> StepState {
        self.containers
            .get(&index)
            .map_or(StepState::NotExecuted, |c| c.step(kind))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProxyStartupLogBuilder {
    log: ProxyStartupLog,
}

impl ProxyStartupLogBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns [`StartupLogError::IllegalTransition`] unless the step has not
    /// been executed yet.
    pub fn start_step(
        &mut self,
        index: usize,
        kind: StartupStepKind,
        at: DateTime<Utc>,
    ) -> Result<(), StartupLogError> {
        let state = self.state_mut(index, kind);
        match *state {
            StepState::NotExecuted => {
                *state = StepState::Started { at };
                Ok(())
            }
            other => Err(illegal(index, kind, other, "started")),
        }
    }

    /// # Errors
    ///
    /// Returns [`StartupLogError::IllegalTransition`] unless the step is started.
    pub fn succeed_step(
        &mut self,
        index: usize,
        kind: StartupStepKind,
        at: DateTime<Utc>,
    ) -> Result<(), StartupLogError> {
        let state = self.state_mut(index, kind);
        match *state {
            StepState::Started { at: started_at } => {
                *state = StepState::Succeeded {
                    started_at,
                    finished_at: at,
                };
                Ok(())
            }
            other => Err(illegal(index, kind, other, "succeeded")),
        }
    }

    /// # Errors
    ///
    /// Returns [`StartupLogError::IllegalTransition`] unless the step is started.
    pub fn fail_step(
        &mut self,
        index: usize,
        kind: StartupStepKind,
        at: DateTime<Utc>,
    ) -> Result<(), StartupLogError> {
        let state = self.state_mut(index, kind);
        match *state {
            StepState::Started { at: started_at } => {
                *state = StepState::Failed {
                    started_at,
                    finished_at: at,
                };
                Ok(())
            }
            other => Err(illegal(index, kind, other, "failed")),
        }
    }

    /// Mark every started-but-unfinished step of `index` as failed.
    pub fn abort_container(&mut self, index: usize) {
        let now = Utc::now();
        if let Some(container) = self.log.containers.get_mut(&index) {
            for state in &mut container.steps {
                if let StepState::Started { at } = *state {
                    *state = StepState::Failed {
                        started_at: at,
                        finished_at: now,
                    };
                }
            }
        }
    }

    // ── Convenience, stamped with the current time ────────────────────────────

    pub fn scheduling(&mut self, index: usize) -> Result<(), StartupLogError> {
        self.start_step(index, StartupStepKind::Schedule, Utc::now())
    }

    pub fn scheduled(&mut self, index: usize) -> Result<(), StartupLogError> {
        self.succeed_step(index, StartupStepKind::Schedule, Utc::now())
    }

    pub fn pulling_image(&mut self, index: usize) -> Result<(), StartupLogError> {
        self.start_step(index, StartupStepKind::PullImage, Utc::now())
    }

    pub fn image_pulled(&mut self, index: usize) -> Result<(), StartupLogError> {
        self.succeed_step(index, StartupStepKind::PullImage, Utc::now())
    }

    pub fn starting_container(&mut self, index: usize) -> Result<(), StartupLogError> {
        self.start_step(index, StartupStepKind::StartContainer, Utc::now())
    }

    pub fn container_started(&mut self, index: usize) -> Result<(), StartupLogError> {
        self.succeed_step(index, StartupStepKind::StartContainer, Utc::now())
    }

    pub fn starting_application(&mut self, index: usize) -> Result<(), StartupLogError> {
        self.start_step(index, StartupStepKind::StartApplication, Utc::now())
    }

    pub fn application_started(&mut self, index: usize) -> Result<(), StartupLogError> {
        self.succeed_step(index, StartupStepKind::StartApplication, Utc::now())
    }

    #[must_use]
    pub fn build(&self) -> ProxyStartupLog {
        self.log.clone()
    }

    fn state_mut(&mut self, index: usize, kind: StartupStepKind) -> &mut StepState {
        &mut self.log.containers.entry(index).or_default().steps[slot(kind)]
    }
}

fn illegal(
    index: usize,
    step: StartupStepKind,
    from: StepState,
    to: &'static str,
) -> StartupLogError {
    StartupLogError::IllegalTransition {
        index,
        step,
        from: from.name(),
        to,
    }
}
