//! Objectives, weight schedules, Lagrangian constraints and the training
//! loop for latent-conditioned text VAEs.

pub mod config;
pub mod data;
pub mod divergence;
pub mod evaluation;
pub mod lagrangian;
pub mod logging;
pub mod metrics;
pub mod objective;
pub mod pareto;
pub mod schedule;
pub mod state;
pub mod trainer;

pub use config::{TrainingConfig, TrainingError};
pub use data::{BatchSource, DataBatch, InMemoryBatches, SyntheticBatches};
pub use evaluation::{EvaluationReport, IwEstimate};
pub use lagrangian::{
    ConstrainedQuantity, ConstraintSpec, DualVariable, LagrangianConstraintOptimizer, Relation,
};
pub use objective::{Composition, LossTerms, ObjectiveComposer, ObjectiveSpec};
pub use pareto::{Criterion, ParetoFront};
pub use schedule::{ParameterScheduler, ScheduleStep, WeightSchedule};
pub use state::TrainerState;
pub use trainer::{StepReport, VaeTrainer};
