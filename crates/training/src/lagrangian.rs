//! Dual variables enforcing constraints on scalar training quantities.
//!
//! Each constraint owns a coefficient `lambda` that is updated by gradient
//! ascent on the smoothed constraint violation once per optimizer step. The
//! primal loss receives `lambda * (target - observed)` for `ge` constraints and
//! `lambda * (observed - target)` for `le` and `eq`, with `lambda` held constant
//! with respect to the model parameters.

use std::collections::BTreeMap;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::metrics::ExponentialMovingAverage;
use crate::TrainingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    /// observed >= target
    Ge,
    /// observed <= target
    Le,
    /// observed == target; lambda may become negative
    Eq,
}

impl Relation {
    pub fn as_str(self) -> &'static str {
        match self {
            Relation::Ge => "ge",
            Relation::Le => "le",
            Relation::Eq => "eq",
        }
    }
}

fn default_relation() -> Relation {
    Relation::Ge
}

fn default_lr() -> f64 {
    1e-3
}

fn default_alpha() -> f64 {
    0.5
}

fn default_initial_lambda() -> f64 {
    1.0
}

/// Target, relation and dual hyperparameters of one constraint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSpec {
    pub target: f64,
    #[serde(default = "default_relation")]
    pub relation: Relation,
    /// Dual ascent step size.
    #[serde(default = "default_lr")]
    pub lr: f64,
    /// EMA smoothing of observations; `0` uses the raw observation.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_initial_lambda")]
    pub initial_lambda: f64,
}

impl ConstraintSpec {
    pub fn new(target: f64, relation: Relation) -> Self {
        Self {
            target,
            relation,
            lr: default_lr(),
            alpha: default_alpha(),
            initial_lambda: default_initial_lambda(),
        }
    }

    pub fn with_target(self, target: f64) -> Self {
        Self { target, ..self }
    }

    pub fn problems(&self, path: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.target.is_finite() {
            errors.push(format!("{path}.target must be finite"));
        }
        if self.lr.is_nan() || self.lr <= 0.0 {
            errors.push(format!("{path}.lr must be greater than 0"));
        }
        if !(0.0..1.0).contains(&self.alpha) {
            errors.push(format!("{path}.alpha must be in [0, 1)"));
        }
        if self.relation != Relation::Eq && self.initial_lambda < 0.0 {
            errors.push(format!(
                "{path}.initial_lambda must be >= 0 for relation '{}'",
                self.relation.as_str()
            ));
        }
        errors
    }
}

/// One Lagrange multiplier with its smoothed observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DualVariable {
    spec: ConstraintSpec,
    lambda: f64,
    ema: ExponentialMovingAverage,
}

impl DualVariable {
    pub fn new(spec: ConstraintSpec) -> Self {
        Self {
            spec,
            lambda: spec.initial_lambda,
            ema: ExponentialMovingAverage::new(1.0 - spec.alpha),
        }
    }

    pub fn spec(&self) -> &ConstraintSpec {
        &self.spec
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn smoothed(&self) -> Option<f64> {
        self.ema.value()
    }

    /// Signed violation of the constraint for a value; positive when violated.
    pub fn violation(&self, value: f64) -> f64 {
        match self.spec.relation {
            Relation::Ge => self.spec.target - value,
            Relation::Le | Relation::Eq => value - self.spec.target,
        }
    }

    /// Folds an observation into the EMA and takes one dual ascent step.
    pub fn update(&mut self, observed: f64) -> f64 {
        let smoothed = self.ema.update(observed);
        self.lambda += self.spec.lr * self.violation(smoothed);
        if self.spec.relation != Relation::Eq {
            self.lambda = self.lambda.max(0.0);
        }
        self.lambda
    }

    /// Primal loss contribution for an observed scalar tensor.
    pub fn penalty(&self, observed: &Tensor) -> candle_core::Result<Tensor> {
        let lambda = self.lambda;
        let target = self.spec.target;
        match self.spec.relation {
            Relation::Ge => observed.affine(-lambda, lambda * target),
            Relation::Le | Relation::Eq => observed.affine(lambda, -lambda * target),
        }
    }
}

/// Scalars a constraint can be placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstrainedQuantity {
    Rate,
    Distortion,
    Mmd,
    Elbo,
    Kde1dMarginalKl,
    MutualInformation,
    DimensionWiseKl,
    MarginalKl,
}

impl ConstrainedQuantity {
    pub fn name(self) -> &'static str {
        match self {
            Self::Rate => "rate",
            Self::Distortion => "distortion",
            Self::Mmd => "mmd",
            Self::Elbo => "elbo",
            Self::Kde1dMarginalKl => "kde1d_marginal_kl",
            Self::MutualInformation => "mutual_information",
            Self::DimensionWiseKl => "dimension_wise_kl",
            Self::MarginalKl => "marginal_kl",
        }
    }
}

/// Observed value of every constrained quantity for one batch.
pub type Observations = BTreeMap<ConstrainedQuantity, f64>;

/// Independent dual variables, one per constrained quantity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LagrangianConstraintOptimizer {
    duals: BTreeMap<ConstrainedQuantity, DualVariable>,
}

impl LagrangianConstraintOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a dual for `quantity` unless one exists already (e.g. restored
    /// from a snapshot).
    pub fn register(&mut self, quantity: ConstrainedQuantity, spec: ConstraintSpec) {
        self.duals
            .entry(quantity)
            .or_insert_with(|| DualVariable::new(spec));
    }

    pub fn is_empty(&self) -> bool {
        self.duals.is_empty()
    }

    pub fn quantities(&self) -> impl Iterator<Item = ConstrainedQuantity> + '_ {
        self.duals.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConstrainedQuantity, &DualVariable)> + '_ {
        self.duals.iter().map(|(quantity, dual)| (*quantity, dual))
    }

    pub fn dual(&self, quantity: ConstrainedQuantity) -> Option<&DualVariable> {
        self.duals.get(&quantity)
    }

    pub fn lambda(&self, quantity: ConstrainedQuantity) -> Option<f64> {
        self.duals.get(&quantity).map(DualVariable::lambda)
    }

    /// One dual step per registered constraint.
    pub fn update(&mut self, observations: &Observations) -> Result<(), TrainingError> {
        for (quantity, dual) in self.duals.iter_mut() {
            let observed = observations.get(quantity).ok_or_else(|| {
                TrainingError::runtime(format!(
                    "no observation for constrained quantity '{}'",
                    quantity.name()
                ))
            })?;
            let lambda = dual.update(*observed);
            log::debug!(
                "dual update {}: observed={:.4} lambda={:.6}",
                quantity.name(),
                observed,
                lambda
            );
        }
        Ok(())
    }

    /// Averages observations from several replicas or micro-batches, then
    /// performs a single update.
    pub fn update_averaged(&mut self, observations: &[Observations]) -> Result<(), TrainingError> {
        if observations.is_empty() {
            return Err(TrainingError::runtime(
                "dual update requires at least one set of observations",
            ));
        }
        let averaged = average_observations(observations);
        self.update(&averaged)
    }

    pub fn penalty(
        &self,
        quantity: ConstrainedQuantity,
        observed: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        let dual = self.duals.get(&quantity).ok_or_else(|| {
            TrainingError::runtime(format!(
                "constraint on '{}' was never registered",
                quantity.name()
            ))
        })?;
        Ok(dual.penalty(observed)?)
    }
}

/// Per-quantity mean over the sets that contain it.
pub fn average_observations(observations: &[Observations]) -> Observations {
    let mut sums: BTreeMap<ConstrainedQuantity, (f64, usize)> = BTreeMap::new();
    for set in observations {
        for (quantity, value) in set {
            let entry = sums.entry(*quantity).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }
    sums.into_iter()
        .map(|(quantity, (sum, count))| (quantity, sum / count as f64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn spec(target: f64, relation: Relation, alpha: f64) -> ConstraintSpec {
        ConstraintSpec {
            target,
            relation,
            lr: 0.1,
            alpha,
            initial_lambda: 1.0,
        }
    }

    #[test]
    fn satisfied_equality_leaves_lambda_unchanged() {
        let mut dual = DualVariable::new(spec(3.0, Relation::Eq, 0.5));
        for _ in 0..5 {
            assert_eq!(dual.update(3.0), 1.0);
        }
    }

    #[test]
    fn persistent_ge_violation_grows_lambda_monotonically() {
        let mut dual = DualVariable::new(spec(10.0, Relation::Ge, 0.5));
        let mut previous = dual.lambda();
        for _ in 0..10 {
            let lambda = dual.update(2.0);
            assert!(lambda > previous);
            previous = lambda;
        }
        // A constant observation keeps the EMA fixed.
        assert!((previous - (1.0 + 10.0 * 0.1 * 8.0)).abs() < 1e-9);
    }

    #[test]
    fn satisfied_le_constraint_clips_lambda_at_zero() {
        let mut dual = DualVariable::new(spec(10.0, Relation::Le, 0.0));
        for _ in 0..20 {
            dual.update(0.0);
        }
        assert_eq!(dual.lambda(), 0.0);
    }

    #[test]
    fn equality_lambda_keeps_its_sign() {
        let mut dual = DualVariable::new(spec(10.0, Relation::Eq, 0.0));
        for _ in 0..20 {
            dual.update(0.0);
        }
        assert!((dual.lambda() - (1.0 - 20.0)).abs() < 1e-9);
    }

    #[test]
    fn ema_smooths_after_first_observation() {
        let mut dual = DualVariable::new(spec(0.0, Relation::Le, 0.5));
        dual.update(4.0);
        assert_eq!(dual.smoothed(), Some(4.0));
        dual.update(0.0);
        assert_eq!(dual.smoothed(), Some(2.0));
    }

    #[test]
    fn penalty_sign_follows_relation() -> candle_core::Result<()> {
        let device = Device::Cpu;
        let observed = Tensor::new(4f32, &device)?;
        let ge = DualVariable::new(spec(10.0, Relation::Ge, 0.5));
        assert_eq!(ge.penalty(&observed)?.to_vec0::<f32>()?, 6.0);
        let le = DualVariable::new(spec(10.0, Relation::Le, 0.5));
        assert_eq!(le.penalty(&observed)?.to_vec0::<f32>()?, -6.0);
        Ok(())
    }

    #[test]
    fn averaged_update_uses_the_mean_observation() -> Result<(), TrainingError> {
        let mut optimizer = LagrangianConstraintOptimizer::new();
        optimizer.register(ConstrainedQuantity::Rate, spec(10.0, Relation::Ge, 0.0));
        let replicas = [
            Observations::from([(ConstrainedQuantity::Rate, 4.0)]),
            Observations::from([(ConstrainedQuantity::Rate, 8.0)]),
        ];
        optimizer.update_averaged(&replicas)?;
        let lambda = optimizer.lambda(ConstrainedQuantity::Rate).unwrap_or_default();
        assert!((lambda - (1.0 + 0.1 * 4.0)).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn missing_observation_is_an_error() {
        let mut optimizer = LagrangianConstraintOptimizer::new();
        optimizer.register(ConstrainedQuantity::Mmd, spec(0.01, Relation::Le, 0.5));
        assert!(optimizer.update(&Observations::new()).is_err());
    }

    #[test]
    fn register_keeps_restored_state() -> Result<(), TrainingError> {
        let mut optimizer = LagrangianConstraintOptimizer::new();
        optimizer.register(ConstrainedQuantity::Rate, spec(10.0, Relation::Ge, 0.0));
        optimizer.update(&Observations::from([(ConstrainedQuantity::Rate, 0.0)]))?;
        let lambda = optimizer.lambda(ConstrainedQuantity::Rate);
        optimizer.register(ConstrainedQuantity::Rate, spec(10.0, Relation::Ge, 0.0));
        assert_eq!(optimizer.lambda(ConstrainedQuantity::Rate), lambda);
        Ok(())
    }

    #[test]
    fn unknown_relation_is_rejected() {
        assert!(serde_json::from_str::<Relation>("\"gt\"").is_err());
        assert_eq!(
            serde_json::from_str::<Relation>("\"le\"").ok(),
            Some(Relation::Le)
        );
    }
}
