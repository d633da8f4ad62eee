//! Mutable run state: progress counters and the dual variables.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::lagrangian::LagrangianConstraintOptimizer;
use crate::schedule::ScheduleStep;
use crate::TrainingError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Optimizer steps taken so far.
    pub global_step: usize,
    /// Completed passes over the training source, which is also the index
    /// of the epoch in progress.
    pub epoch: usize,
    /// Optimizer steps taken since the current epoch started.
    #[serde(default)]
    pub epoch_step: usize,
    pub duals: LagrangianConstraintOptimizer,
}

impl TrainerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one optimizer step.
    pub fn advance(&mut self) {
        self.global_step += 1;
        self.epoch_step += 1;
    }

    /// Marks the training source as exhausted for the current epoch.
    pub fn finish_epoch(&mut self) {
        self.epoch += 1;
        self.epoch_step = 0;
    }

    /// Schedule position of the next optimizer step.
    pub fn schedule_step(&self) -> ScheduleStep {
        ScheduleStep::new(self.global_step, self.epoch_step)
    }

    pub fn snapshot(&self) -> Result<String, TrainingError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn restore(snapshot: &str) -> Result<Self, TrainingError> {
        Ok(serde_json::from_str(snapshot)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TrainingError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.snapshot()?)?;
        log::info!("saved trainer state to {}", path.display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::restore(&fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lagrangian::{ConstrainedQuantity, ConstraintSpec, Observations, Relation};

    #[test]
    fn snapshot_round_trips_duals() -> Result<(), TrainingError> {
        let mut state = TrainerState::new();
        state
            .duals
            .register(ConstrainedQuantity::Rate, ConstraintSpec::new(16.0, Relation::Ge));
        state
            .duals
            .register(ConstrainedQuantity::Elbo, ConstraintSpec::new(-100.0, Relation::Eq));
        state.duals.update(&Observations::from([
            (ConstrainedQuantity::Rate, 3.0),
            (ConstrainedQuantity::Elbo, -180.0),
        ]))?;
        state.advance();
        state.advance();
        state.finish_epoch();
        state.advance();

        let restored = TrainerState::restore(&state.snapshot()?)?;
        assert_eq!(restored, state);
        assert_eq!(restored.epoch, 1);
        assert_eq!(restored.global_step, 3);
        assert_eq!(restored.schedule_step(), ScheduleStep::new(3, 1));
        Ok(())
    }

    #[test]
    fn states_saved_without_an_epoch_step_still_load() -> Result<(), TrainingError> {
        let state = TrainerState::restore(
            r#"{"global_step": 5, "epoch": 2, "duals": {"duals": {}}}"#,
        )?;
        assert_eq!(state.epoch_step, 0);
        assert_eq!(state.schedule_step(), ScheduleStep::new(5, 0));
        Ok(())
    }

    #[test]
    fn save_and_load_through_a_file() -> Result<(), TrainingError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state/trainer.json");
        let mut state = TrainerState::new();
        state.advance();
        state.save(&path)?;
        assert_eq!(TrainerState::load(&path)?, state);
        Ok(())
    }
}
