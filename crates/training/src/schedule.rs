//! Step-indexed weight schedules for objective hyperparameters.

use serde::{Deserialize, Serialize};

use crate::lagrangian::ConstraintSpec;
use crate::TrainingError;

/// A weight whose value is a pure function of the step it is read at.
pub trait ParameterScheduler: Send + std::fmt::Debug {
    fn value_at(&self, step: usize) -> f64;

    /// Whether `value_at` expects the step within the current epoch rather
    /// than the global step.
    fn restarts_each_epoch(&self) -> bool {
        false
    }
}

/// Where an optimizer step sits in the run and in its epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScheduleStep {
    pub global: usize,
    pub in_epoch: usize,
}

impl ScheduleStep {
    pub const fn new(global: usize, in_epoch: usize) -> Self {
        Self { global, in_epoch }
    }

    /// The step a scheduler should be read at.
    pub fn for_scheduler(&self, scheduler: &dyn ParameterScheduler) -> usize {
        if scheduler.restarts_each_epoch() {
            self.in_epoch
        } else {
            self.global
        }
    }
}

/// A bare step is read as a run that has not finished its first epoch.
impl From<usize> for ScheduleStep {
    fn from(step: usize) -> Self {
        Self::new(step, step)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RampDirection {
    #[default]
    Increase,
    Decrease,
}

/// How an objective weight evolves during training.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum WeightSchedule {
    Constant {
        value: f64,
    },
    Linear {
        value: f64,
        ramp_length: usize,
        #[serde(default)]
        direction: RampDirection,
    },
    /// Restarts at every epoch boundary and ramps over the configured steps
    /// per epoch, which the trainer checks against the data source.
    Cyclical {
        value: f64,
    },
    /// The weight becomes a dual coefficient enforcing a constraint.
    Lagrangian(ConstraintSpec),
}

impl WeightSchedule {
    pub const fn constant(value: f64) -> Self {
        Self::Constant { value }
    }

    pub fn is_lagrangian(&self) -> bool {
        matches!(self, Self::Lagrangian(_))
    }

    pub fn policy_name(&self) -> &'static str {
        match self {
            Self::Constant { .. } => "constant",
            Self::Linear { .. } => "linear",
            Self::Cyclical { .. } => "cyclical",
            Self::Lagrangian(_) => "lagrangian",
        }
    }

    /// Problems with this schedule, each prefixed by `path`.
    pub fn problems(&self, path: &str, steps_per_epoch: Option<usize>) -> Vec<String> {
        let mut errors = Vec::new();
        match self {
            Self::Constant { .. } => {}
            Self::Linear { ramp_length, .. } => {
                if *ramp_length == 0 {
                    errors.push(format!("{path}.ramp_length must be greater than 0"));
                }
            }
            Self::Cyclical { .. } => {
                if steps_per_epoch.unwrap_or(0) == 0 {
                    errors.push(format!(
                        "{path} uses the cyclical policy but data.steps_per_epoch is not set"
                    ));
                }
            }
            Self::Lagrangian(spec) => errors.extend(spec.problems(path)),
        }
        errors
    }

    pub fn build(&self, steps_per_epoch: Option<usize>) -> Result<ScheduledWeight, TrainingError> {
        match *self {
            Self::Constant { value } => Ok(ScheduledWeight::Fixed(Box::new(Constant { value }))),
            Self::Linear {
                value,
                ramp_length,
                direction,
            } => Ok(ScheduledWeight::Fixed(Box::new(LinearRamp::new(
                value,
                ramp_length,
                direction,
            )?))),
            Self::Cyclical { value } => {
                let cycle = steps_per_epoch.ok_or_else(|| {
                    TrainingError::initialization(
                        "cyclical schedule requires data.steps_per_epoch",
                    )
                })?;
                Ok(ScheduledWeight::Fixed(Box::new(CyclicalRamp::new(value, cycle)?)))
            }
            Self::Lagrangian(spec) => Ok(ScheduledWeight::Dual(spec)),
        }
    }
}

/// A resolved schedule: either a step function or a dual variable.
#[derive(Debug)]
pub enum ScheduledWeight {
    Fixed(Box<dyn ParameterScheduler>),
    Dual(ConstraintSpec),
}

#[derive(Debug, Clone, Copy)]
pub struct Constant {
    value: f64,
}

impl ParameterScheduler for Constant {
    fn value_at(&self, _step: usize) -> f64 {
        self.value
    }
}

/// `value * clamp(step / ramp_length, 0, 1)`, or its complement when decreasing.
#[derive(Debug, Clone, Copy)]
pub struct LinearRamp {
    value: f64,
    ramp_length: usize,
    direction: RampDirection,
}

impl LinearRamp {
    pub fn new(
        value: f64,
        ramp_length: usize,
        direction: RampDirection,
    ) -> Result<Self, TrainingError> {
        if ramp_length == 0 {
            return Err(TrainingError::initialization(
                "linear schedule requires ramp_length greater than zero",
            ));
        }
        Ok(Self {
            value,
            ramp_length,
            direction,
        })
    }
}

impl ParameterScheduler for LinearRamp {
    fn value_at(&self, step: usize) -> f64 {
        let progress = (step as f64 / self.ramp_length as f64).clamp(0.0, 1.0);
        match self.direction {
            RampDirection::Increase => self.value * progress,
            RampDirection::Decrease => self.value * (1.0 - progress),
        }
    }
}

/// Sawtooth from 0 towards `value` over each cycle.
#[derive(Debug, Clone, Copy)]
pub struct CyclicalRamp {
    value: f64,
    cycle: usize,
}

impl CyclicalRamp {
    pub fn new(value: f64, cycle: usize) -> Result<Self, TrainingError> {
        if cycle == 0 {
            return Err(TrainingError::initialization(
                "cyclical schedule requires a cycle length greater than zero",
            ));
        }
        Ok(Self { value, cycle })
    }
}

impl ParameterScheduler for CyclicalRamp {
    fn value_at(&self, step: usize) -> f64 {
        self.value * (step % self.cycle) as f64 / self.cycle as f64
    }

    fn restarts_each_epoch(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(schedule: WeightSchedule, steps_per_epoch: Option<usize>) -> Box<dyn ParameterScheduler> {
        match schedule.build(steps_per_epoch) {
            Ok(ScheduledWeight::Fixed(scheduler)) => scheduler,
            other => panic!("expected a fixed schedule, got {other:?}"),
        }
    }

    #[test]
    fn linear_ramp_is_clamped_outside_the_ramp() {
        let schedule = fixed(
            WeightSchedule::Linear {
                value: 2.0,
                ramp_length: 100,
                direction: RampDirection::Increase,
            },
            None,
        );
        assert_eq!(schedule.value_at(0), 0.0);
        assert!((schedule.value_at(50) - 1.0).abs() < 1e-12);
        assert_eq!(schedule.value_at(100), 2.0);
        assert_eq!(schedule.value_at(250), 2.0);
    }

    #[test]
    fn decreasing_ramp_mirrors_increase() {
        let schedule = fixed(
            WeightSchedule::Linear {
                value: 1.0,
                ramp_length: 4,
                direction: RampDirection::Decrease,
            },
            None,
        );
        let values: Vec<f64> = (0..6).map(|s| schedule.value_at(s)).collect();
        assert_eq!(values, vec![1.0, 0.75, 0.5, 0.25, 0.0, 0.0]);
    }

    #[test]
    fn cyclical_restarts_each_epoch() {
        let schedule = fixed(WeightSchedule::Cyclical { value: 1.0 }, Some(10));
        assert_eq!(schedule.value_at(0), 0.0);
        assert!((schedule.value_at(9) - 0.9).abs() < 1e-12);
        assert_eq!(schedule.value_at(10), 0.0);
        assert!((schedule.value_at(15) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn only_cyclical_weights_read_the_epoch_step() {
        let cyclical = fixed(WeightSchedule::Cyclical { value: 1.0 }, Some(4));
        let linear = fixed(
            WeightSchedule::Linear {
                value: 1.0,
                ramp_length: 4,
                direction: RampDirection::Increase,
            },
            None,
        );
        let step = ScheduleStep::new(6, 0);
        assert_eq!(cyclical.value_at(step.for_scheduler(&*cyclical)), 0.0);
        assert_eq!(linear.value_at(step.for_scheduler(&*linear)), 1.0);
        assert_eq!(ScheduleStep::from(3), ScheduleStep::new(3, 3));
    }

    #[test]
    fn zero_ramp_is_a_problem() {
        let schedule = WeightSchedule::Linear {
            value: 1.0,
            ramp_length: 0,
            direction: RampDirection::Increase,
        };
        assert_eq!(schedule.problems("objective.beta", None).len(), 1);
        assert!(schedule.build(None).is_err());
        assert_eq!(
            WeightSchedule::Cyclical { value: 1.0 }
                .problems("objective.beta", None)
                .len(),
            1
        );
    }

    #[test]
    fn policies_parse_from_toml() {
        #[derive(Deserialize)]
        struct Holder {
            beta: WeightSchedule,
        }
        let holder: Holder =
            toml::from_str("beta = { policy = \"linear\", value = 1.0, ramp_length = 10 }")
                .expect("linear policy parses");
        assert_eq!(
            holder.beta,
            WeightSchedule::Linear {
                value: 1.0,
                ramp_length: 10,
                direction: RampDirection::Increase
            }
        );
        assert!(toml::from_str::<Holder>("beta = { policy = \"warmup\", value = 1.0 }").is_err());
    }
}
