//! Training objectives and the composer that turns loss terms into a total loss.

use std::collections::BTreeMap;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::divergence::{self, KlDecomposition};
use crate::lagrangian::{
    ConstrainedQuantity, ConstraintSpec, LagrangianConstraintOptimizer, Observations, Relation,
};
use crate::metrics::Metrics;
use crate::schedule::{ParameterScheduler, ScheduleStep, ScheduledWeight, WeightSchedule};
use crate::TrainingError;

fn default_weight() -> WeightSchedule {
    WeightSchedule::constant(1.0)
}

fn default_free_bits() -> f64 {
    0.5
}

fn default_mmd_lambda() -> f64 {
    10_000.0
}

/// Objective kind with its hyperparameters.
///
/// Lagrangian targets on rate (`beta-vae`) and on dimension-wise KL
/// (`beta-tc-vae` gamma) are given per latent dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum ObjectiveSpec {
    /// Metrics only; no loss.
    Evaluation,
    Autoencoder,
    Vae,
    BetaVae {
        #[serde(default = "default_weight")]
        beta: WeightSchedule,
    },
    FreeBitsBetaVae {
        #[serde(default = "default_weight")]
        beta: WeightSchedule,
        #[serde(default = "default_free_bits")]
        free_bits_pd: f64,
    },
    BetaTcVae {
        #[serde(default = "default_weight")]
        alpha: WeightSchedule,
        #[serde(default = "default_weight")]
        beta: WeightSchedule,
        #[serde(default = "default_weight")]
        gamma: WeightSchedule,
    },
    MmdVae {
        #[serde(default = "default_mmd_lambda")]
        lambda: f64,
    },
    Hoffman {
        #[serde(default = "default_weight")]
        alpha: WeightSchedule,
        #[serde(default = "default_weight")]
        beta: WeightSchedule,
    },
    ElboConstraintOptim {
        #[serde(default)]
        constraints: ConstraintSet,
    },
    MmdConstraintOptim {
        #[serde(default)]
        constraints: ConstraintSet,
    },
}

impl Default for ObjectiveSpec {
    fn default() -> Self {
        Self::Vae
    }
}

/// Constraints available to the `*-constraint-optim` objectives.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintSet {
    pub use_elbo: bool,
    pub elbo: ConstraintSpec,
    pub use_distortion: bool,
    pub distortion: ConstraintSpec,
    pub use_mmd: bool,
    pub mmd: ConstraintSpec,
    pub use_rate: bool,
    pub rate: ConstraintSpec,
    pub use_kde1d: bool,
    pub kde1d: ConstraintSpec,
}

impl Default for ConstraintSet {
    fn default() -> Self {
        Self {
            use_elbo: true,
            elbo: ConstraintSpec::new(-100.0, Relation::Eq),
            use_distortion: false,
            distortion: ConstraintSpec::new(100.0, Relation::Eq),
            use_mmd: false,
            mmd: ConstraintSpec::new(0.01, Relation::Le),
            use_rate: true,
            rate: ConstraintSpec::new(16.0, Relation::Ge),
            use_kde1d: true,
            kde1d: ConstraintSpec::new(10.0, Relation::Le),
        }
    }
}

impl ConstraintSet {
    pub fn active(&self) -> Vec<(ConstrainedQuantity, ConstraintSpec)> {
        [
            (self.use_elbo, ConstrainedQuantity::Elbo, self.elbo),
            (self.use_distortion, ConstrainedQuantity::Distortion, self.distortion),
            (self.use_mmd, ConstrainedQuantity::Mmd, self.mmd),
            (self.use_rate, ConstrainedQuantity::Rate, self.rate),
            (self.use_kde1d, ConstrainedQuantity::Kde1dMarginalKl, self.kde1d),
        ]
        .into_iter()
        .filter(|(enabled, _, _)| *enabled)
        .map(|(_, quantity, spec)| (quantity, spec))
        .collect()
    }
}

/// Which optional loss terms an objective consumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequiredTerms {
    pub decomposition: bool,
    pub mmd: bool,
    pub kde: bool,
}

/// A weighted slot of an objective: its name, schedule, the quantity a
/// lagrangian policy constrains, and whether the target is per dimension.
struct WeightSlot<'a> {
    name: &'static str,
    schedule: &'a WeightSchedule,
    quantity: Option<ConstrainedQuantity>,
    per_dimension: bool,
}

impl ObjectiveSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Evaluation => "evaluation",
            Self::Autoencoder => "autoencoder",
            Self::Vae => "vae",
            Self::BetaVae { .. } => "beta-vae",
            Self::FreeBitsBetaVae { .. } => "free-bits-beta-vae",
            Self::BetaTcVae { .. } => "beta-tc-vae",
            Self::MmdVae { .. } => "mmd-vae",
            Self::Hoffman { .. } => "hoffman",
            Self::ElboConstraintOptim { .. } => "elbo-constraint-optim",
            Self::MmdConstraintOptim { .. } => "mmd-constraint-optim",
        }
    }

    /// Whether the decoder is fed posterior samples rather than the mean.
    pub fn samples_latent(&self) -> bool {
        !matches!(self, Self::Autoencoder)
    }

    pub fn required_terms(&self) -> RequiredTerms {
        match self {
            Self::Evaluation => RequiredTerms {
                decomposition: true,
                mmd: true,
                kde: true,
            },
            Self::BetaTcVae { .. } | Self::Hoffman { .. } => RequiredTerms {
                decomposition: true,
                ..RequiredTerms::default()
            },
            Self::MmdVae { .. } => RequiredTerms {
                mmd: true,
                ..RequiredTerms::default()
            },
            Self::MmdConstraintOptim { constraints } => RequiredTerms {
                mmd: true,
                kde: constraints.use_kde1d,
                ..RequiredTerms::default()
            },
            Self::ElboConstraintOptim { constraints } => RequiredTerms {
                mmd: constraints.use_mmd,
                kde: constraints.use_kde1d,
                ..RequiredTerms::default()
            },
            _ => RequiredTerms::default(),
        }
    }

    fn weight_slots(&self) -> Vec<WeightSlot<'_>> {
        match self {
            Self::BetaVae { beta } | Self::FreeBitsBetaVae { beta, .. } => vec![WeightSlot {
                name: "beta",
                schedule: beta,
                quantity: matches!(self, Self::BetaVae { .. }).then_some(ConstrainedQuantity::Rate),
                per_dimension: true,
            }],
            Self::BetaTcVae { alpha, beta, gamma } => vec![
                WeightSlot {
                    name: "alpha",
                    schedule: alpha,
                    quantity: Some(ConstrainedQuantity::MutualInformation),
                    per_dimension: false,
                },
                WeightSlot {
                    name: "beta",
                    schedule: beta,
                    quantity: None,
                    per_dimension: false,
                },
                WeightSlot {
                    name: "gamma",
                    schedule: gamma,
                    quantity: Some(ConstrainedQuantity::DimensionWiseKl),
                    per_dimension: true,
                },
            ],
            Self::Hoffman { alpha, beta } => vec![
                WeightSlot {
                    name: "alpha",
                    schedule: alpha,
                    quantity: Some(ConstrainedQuantity::MutualInformation),
                    per_dimension: false,
                },
                WeightSlot {
                    name: "beta",
                    schedule: beta,
                    quantity: Some(ConstrainedQuantity::MarginalKl),
                    per_dimension: false,
                },
            ],
            _ => Vec::new(),
        }
    }

    /// Every configuration problem of this objective.
    pub fn problems(&self, steps_per_epoch: Option<usize>) -> Vec<String> {
        let mut errors = Vec::new();
        let kind = self.kind();

        for slot in self.weight_slots() {
            let path = format!("objective.{}", slot.name);
            if slot.schedule.is_lagrangian() && slot.quantity.is_none() {
                errors.push(format!(
                    "{path}: {kind} does not support the lagrangian policy for {}",
                    slot.name
                ));
                continue;
            }
            if let (WeightSchedule::Lagrangian(spec), true) = (slot.schedule, slot.per_dimension) {
                if spec.relation != Relation::Ge {
                    errors.push(format!(
                        "{path}.relation must be 'ge' for a per-dimension target, got '{}'",
                        spec.relation.as_str()
                    ));
                }
            }
            if matches!(self, Self::Hoffman { .. })
                && matches!(slot.schedule, WeightSchedule::Cyclical { .. })
            {
                errors.push(format!("{path}: hoffman does not support the cyclical policy"));
                continue;
            }
            errors.extend(slot.schedule.problems(&path, steps_per_epoch));
        }

        match self {
            Self::FreeBitsBetaVae { free_bits_pd, .. } => {
                if !free_bits_pd.is_finite() || *free_bits_pd < 0.0 {
                    errors.push("objective.free_bits_pd must be a finite value >= 0".to_string());
                }
            }
            Self::MmdVae { lambda } => {
                if !lambda.is_finite() || *lambda < 0.0 {
                    errors.push("objective.lambda must be a finite value >= 0".to_string());
                }
            }
            Self::ElboConstraintOptim { constraints } | Self::MmdConstraintOptim { constraints } => {
                for (quantity, spec) in constraints.active() {
                    errors.extend(spec.problems(&format!("objective.constraints.{}", quantity.name())));
                }
            }
            _ => {}
        }
        errors
    }
}

/// Per-batch loss terms. Optional terms are `None` when not computed.
#[derive(Debug, Clone)]
pub struct LossTerms {
    /// Summed-over-tokens, batch-averaged cross-entropy.
    pub reconstruction: Tensor,
    /// `(latent_size)`, batch-averaged analytic KL.
    pub kl_per_dim: Tensor,
    pub decomposition: Option<KlDecomposition>,
    pub mmd: Option<Tensor>,
    pub kde_marginal_kl: Option<Tensor>,
}

fn missing(term: &str) -> TrainingError {
    TrainingError::runtime(format!("objective needs the '{term}' term but it was not computed"))
}

impl LossTerms {
    pub fn new(reconstruction: Tensor, kl_per_dim: Tensor) -> Self {
        Self {
            reconstruction,
            kl_per_dim,
            decomposition: None,
            mmd: None,
            kde_marginal_kl: None,
        }
    }

    pub fn rate(&self) -> Result<Tensor, TrainingError> {
        Ok(divergence::rate(&self.kl_per_dim)?)
    }

    /// `-(reconstruction + rate)`
    pub fn elbo(&self) -> Result<Tensor, TrainingError> {
        Ok((&self.reconstruction + self.rate()?)?.neg()?)
    }

    fn decomposition(&self) -> Result<&KlDecomposition, TrainingError> {
        self.decomposition
            .as_ref()
            .ok_or_else(|| missing("kl decomposition"))
    }

    pub fn quantity(&self, quantity: ConstrainedQuantity) -> Result<Tensor, TrainingError> {
        match quantity {
            ConstrainedQuantity::Rate => self.rate(),
            ConstrainedQuantity::Distortion => Ok(self.reconstruction.clone()),
            ConstrainedQuantity::Elbo => self.elbo(),
            ConstrainedQuantity::Mmd => self.mmd.clone().ok_or_else(|| missing("mmd")),
            ConstrainedQuantity::Kde1dMarginalKl => self
                .kde_marginal_kl
                .clone()
                .ok_or_else(|| missing("kde1d_marginal_kl")),
            ConstrainedQuantity::MutualInformation => {
                Ok(self.decomposition()?.mutual_information.clone())
            }
            ConstrainedQuantity::DimensionWiseKl => {
                Ok(self.decomposition()?.dimension_wise_kl.clone())
            }
            ConstrainedQuantity::MarginalKl => Ok(self.decomposition()?.marginal_kl.clone()),
        }
    }
}

/// Total loss (absent for `evaluation`) and the metrics of one composition.
#[derive(Debug, Clone)]
pub struct Composition {
    pub total_loss: Option<Tensor>,
    pub metrics: Metrics,
}

#[derive(Debug)]
enum Weight {
    Fixed(Box<dyn ParameterScheduler>),
    Dual(ConstrainedQuantity),
}

/// Resolved objective: schedules built, constraint targets scaled.
#[derive(Debug)]
pub struct ObjectiveComposer {
    spec: ObjectiveSpec,
    weights: BTreeMap<&'static str, Weight>,
    constraints: Vec<(ConstrainedQuantity, ConstraintSpec)>,
}

pub(crate) fn scalar(tensor: &Tensor) -> Result<f64, TrainingError> {
    Ok(tensor.to_dtype(DType::F64)?.to_vec0::<f64>()?)
}

impl ObjectiveComposer {
    pub fn new(
        spec: ObjectiveSpec,
        latent_size: usize,
        steps_per_epoch: Option<usize>,
    ) -> Result<Self, TrainingError> {
        let problems = spec.problems(steps_per_epoch);
        if !problems.is_empty() {
            return Err(TrainingError::validation(problems));
        }

        let mut weights = BTreeMap::new();
        let mut constraints = Vec::new();
        for slot in spec.weight_slots() {
            let weight = match slot.schedule.build(steps_per_epoch)? {
                ScheduledWeight::Fixed(scheduler) => Weight::Fixed(scheduler),
                ScheduledWeight::Dual(constraint) => {
                    let quantity = slot.quantity.ok_or_else(|| {
                        TrainingError::initialization(format!(
                            "objective weight '{}' cannot be lagrangian",
                            slot.name
                        ))
                    })?;
                    let target = if slot.per_dimension {
                        constraint.target * latent_size as f64
                    } else {
                        constraint.target
                    };
                    constraints.push((quantity, constraint.with_target(target)));
                    Weight::Dual(quantity)
                }
            };
            weights.insert(slot.name, weight);
        }
        if let ObjectiveSpec::ElboConstraintOptim { constraints: set }
        | ObjectiveSpec::MmdConstraintOptim { constraints: set } = &spec
        {
            constraints.extend(set.active());
        }

        log::info!(
            "objective {} with {} constraint(s)",
            spec.kind(),
            constraints.len()
        );
        Ok(Self {
            spec,
            weights,
            constraints,
        })
    }

    pub fn spec(&self) -> &ObjectiveSpec {
        &self.spec
    }

    pub fn constraints(&self) -> &[(ConstrainedQuantity, ConstraintSpec)] {
        &self.constraints
    }

    pub fn register_duals(&self, duals: &mut LagrangianConstraintOptimizer) {
        for (quantity, spec) in &self.constraints {
            duals.register(*quantity, *spec);
        }
    }

    /// Observed scalar of every constrained quantity.
    pub fn observations(&self, terms: &LossTerms) -> Result<Observations, TrainingError> {
        self.constraints
            .iter()
            .map(|(quantity, _)| Ok((*quantity, scalar(&terms.quantity(*quantity)?)?)))
            .collect()
    }

    /// Updates the duals from this batch, then composes the loss.
    pub fn compose(
        &self,
        step: usize,
        terms: &LossTerms,
        duals: &mut LagrangianConstraintOptimizer,
    ) -> Result<Composition, TrainingError> {
        self.register_duals(duals);
        if !self.constraints.is_empty() {
            duals.update(&self.observations(terms)?)?;
        }
        self.compose_with(step, terms, duals)
    }

    /// Composes the loss with the current duals, without updating them.
    pub fn compose_with(
        &self,
        step: usize,
        terms: &LossTerms,
        duals: &LagrangianConstraintOptimizer,
    ) -> Result<Composition, TrainingError> {
        self.compose_at(ScheduleStep::from(step), terms, duals)
    }

    /// Like `compose_with`, but cyclical weights read `step.in_epoch`.
    pub fn compose_at(
        &self,
        step: ScheduleStep,
        terms: &LossTerms,
        duals: &LagrangianConstraintOptimizer,
    ) -> Result<Composition, TrainingError> {
        let mut metrics = Metrics::new();
        let reconstruction = &terms.reconstruction;
        let rate = terms.rate()?;
        metrics.insert("reconstruction".into(), scalar(reconstruction)?);
        metrics.insert("rate".into(), scalar(&rate)?);
        metrics.insert("elbo".into(), scalar(&terms.elbo()?)?);
        if let Some(decomposition) = &terms.decomposition {
            metrics.insert(
                "mutual_information".into(),
                scalar(&decomposition.mutual_information)?,
            );
            metrics.insert(
                "total_correlation".into(),
                scalar(&decomposition.total_correlation)?,
            );
            metrics.insert(
                "dimension_wise_kl".into(),
                scalar(&decomposition.dimension_wise_kl)?,
            );
            metrics.insert("marginal_kl".into(), scalar(&decomposition.marginal_kl)?);
        }
        if let Some(mmd) = &terms.mmd {
            metrics.insert("mmd".into(), scalar(mmd)?);
        }
        if let Some(kde) = &terms.kde_marginal_kl {
            metrics.insert("kde1d_marginal_kl".into(), scalar(kde)?);
        }

        let total = match &self.spec {
            ObjectiveSpec::Evaluation => None,
            ObjectiveSpec::Autoencoder => Some(reconstruction.clone()),
            ObjectiveSpec::Vae => Some((reconstruction + &rate)?),
            ObjectiveSpec::BetaVae { .. } => {
                let kl = self.weigh("beta", step, &rate, duals, &mut metrics)?;
                Some((reconstruction + kl)?)
            }
            ObjectiveSpec::FreeBitsBetaVae { free_bits_pd, .. } => {
                let clipped = divergence::free_bits_kl(&terms.kl_per_dim, *free_bits_pd)?;
                metrics.insert("free_bits_kl".into(), scalar(&clipped)?);
                let kl = self.weigh("beta", step, &clipped, duals, &mut metrics)?;
                Some((reconstruction + kl)?)
            }
            ObjectiveSpec::BetaTcVae { .. } => {
                let decomposition = terms.decomposition()?;
                let mi = self.weigh(
                    "alpha",
                    step,
                    &decomposition.mutual_information,
                    duals,
                    &mut metrics,
                )?;
                let tc = self.weigh(
                    "beta",
                    step,
                    &decomposition.total_correlation,
                    duals,
                    &mut metrics,
                )?;
                let dim_kl = self.weigh(
                    "gamma",
                    step,
                    &decomposition.dimension_wise_kl,
                    duals,
                    &mut metrics,
                )?;
                Some((((reconstruction + mi)? + tc)? + dim_kl)?)
            }
            ObjectiveSpec::MmdVae { lambda } => {
                let mmd = terms.quantity(ConstrainedQuantity::Mmd)?;
                metrics.insert("weight/lambda".into(), *lambda);
                Some((reconstruction + mmd.affine(*lambda, 0.0)?)?)
            }
            ObjectiveSpec::Hoffman { .. } => {
                let decomposition = terms.decomposition()?;
                let mi = self.weigh(
                    "alpha",
                    step,
                    &decomposition.mutual_information,
                    duals,
                    &mut metrics,
                )?;
                let marginal =
                    self.weigh("beta", step, &decomposition.marginal_kl, duals, &mut metrics)?;
                Some(((reconstruction + mi)? + marginal)?)
            }
            ObjectiveSpec::ElboConstraintOptim { .. } => {
                let primary = (reconstruction + &rate)?;
                Some(self.add_penalties(primary, terms, duals)?)
            }
            ObjectiveSpec::MmdConstraintOptim { .. } => {
                let primary = terms.quantity(ConstrainedQuantity::Mmd)?;
                Some(self.add_penalties(primary, terms, duals)?)
            }
        };

        for (quantity, _) in &self.constraints {
            if let Some(lambda) = duals.lambda(*quantity) {
                metrics.insert(format!("lambda/{}", quantity.name()), lambda);
            }
        }
        if let Some(total) = &total {
            metrics.insert("total_loss".into(), scalar(total)?);
        }

        Ok(Composition {
            total_loss: total,
            metrics,
        })
    }

    fn weigh(
        &self,
        name: &'static str,
        step: ScheduleStep,
        term: &Tensor,
        duals: &LagrangianConstraintOptimizer,
        metrics: &mut Metrics,
    ) -> Result<Tensor, TrainingError> {
        match self.weights.get(name) {
            Some(Weight::Fixed(scheduler)) => {
                let weight = scheduler.value_at(step.for_scheduler(&**scheduler));
                metrics.insert(format!("weight/{name}"), weight);
                Ok(term.affine(weight, 0.0)?)
            }
            Some(Weight::Dual(quantity)) => {
                let penalty = duals.penalty(*quantity, term)?;
                Ok((term + penalty)?)
            }
            None => Err(TrainingError::runtime(format!(
                "objective {} has no weight named '{name}'",
                self.spec.kind()
            ))),
        }
    }

    fn add_penalties(
        &self,
        primary: Tensor,
        terms: &LossTerms,
        duals: &LagrangianConstraintOptimizer,
    ) -> Result<Tensor, TrainingError> {
        let mut total = primary;
        for (quantity, _) in &self.constraints {
            let penalty = duals.penalty(*quantity, &terms.quantity(*quantity)?)?;
            total = (total + penalty)?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::RampDirection;
    use candle_core::Device;

    fn terms(reconstruction: f32, kl: &[f32]) -> candle_core::Result<LossTerms> {
        let device = Device::Cpu;
        Ok(LossTerms::new(
            Tensor::new(reconstruction, &device)?,
            Tensor::new(kl, &device)?,
        ))
    }

    fn total(composition: &Composition) -> f64 {
        composition.metrics["total_loss"]
    }

    #[test]
    fn vae_adds_full_kl() -> anyhow::Result<()> {
        let composer = ObjectiveComposer::new(ObjectiveSpec::Vae, 2, None)?;
        let mut duals = LagrangianConstraintOptimizer::new();
        let out = composer.compose(0, &terms(3.0, &[0.5, 1.5])?, &mut duals)?;
        assert!((total(&out) - 5.0).abs() < 1e-6);
        assert!((out.metrics["elbo"] + 5.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn evaluation_reports_metrics_without_loss() -> anyhow::Result<()> {
        let composer = ObjectiveComposer::new(ObjectiveSpec::Evaluation, 2, None)?;
        let mut duals = LagrangianConstraintOptimizer::new();
        let out = composer.compose(0, &terms(3.0, &[0.5, 1.5])?, &mut duals)?;
        assert!(out.total_loss.is_none());
        assert!((out.metrics["rate"] - 2.0).abs() < 1e-6);
        assert!(!out.metrics.contains_key("total_loss"));
        Ok(())
    }

    #[test]
    fn free_bits_floor_small_dimensions() -> anyhow::Result<()> {
        let spec = ObjectiveSpec::FreeBitsBetaVae {
            beta: WeightSchedule::constant(2.0),
            free_bits_pd: 0.1,
        };
        let composer = ObjectiveComposer::new(spec, 1, None)?;
        let mut duals = LagrangianConstraintOptimizer::new();
        let out = composer.compose(0, &terms(1.0, &[0.05])?, &mut duals)?;
        assert!((out.metrics["free_bits_kl"] - 0.1).abs() < 1e-6);
        assert!((total(&out) - 1.2).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn lagrangian_beta_scales_target_by_latent_size() -> anyhow::Result<()> {
        let spec = ObjectiveSpec::BetaVae {
            beta: WeightSchedule::Lagrangian(ConstraintSpec {
                target: 0.5,
                relation: Relation::Ge,
                lr: 0.1,
                alpha: 0.0,
                initial_lambda: 1.0,
            }),
        };
        let composer = ObjectiveComposer::new(spec, 4, None)?;
        assert_eq!(composer.constraints()[0].1.target, 2.0);

        let mut duals = LagrangianConstraintOptimizer::new();
        // rate 1.0 < target 2.0: lambda grows to 1.1 before composing.
        let out = composer.compose(0, &terms(3.0, &[0.25; 4])?, &mut duals)?;
        assert!((out.metrics["lambda/rate"] - 1.1).abs() < 1e-9);
        // reconstruction + rate + lambda * (target - rate)
        assert!((total(&out) - (3.0 + 1.0 + 1.1 * 1.0)).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn compose_with_leaves_duals_untouched() -> anyhow::Result<()> {
        let composer = ObjectiveComposer::new(
            ObjectiveSpec::ElboConstraintOptim {
                constraints: ConstraintSet {
                    use_kde1d: false,
                    ..ConstraintSet::default()
                },
            },
            2,
            None,
        )?;
        let mut duals = LagrangianConstraintOptimizer::new();
        composer.register_duals(&mut duals);
        let before = duals.clone();
        let out = composer.compose_with(7, &terms(50.0, &[1.0, 1.0])?, &duals)?;
        assert_eq!(duals, before);
        // -elbo = 52; elbo eq -100: 1 * (-52 + 100); rate ge 16: 1 * (16 - 2)
        assert!((total(&out) - (52.0 + 48.0 + 14.0)).abs() < 1e-4);
        assert_eq!(out.metrics["lambda/elbo"], 1.0);
        Ok(())
    }

    #[test]
    fn constraint_objective_requires_its_terms() -> anyhow::Result<()> {
        let composer = ObjectiveComposer::new(
            ObjectiveSpec::MmdConstraintOptim {
                constraints: ConstraintSet::default(),
            },
            2,
            None,
        )?;
        let mut duals = LagrangianConstraintOptimizer::new();
        assert!(composer
            .compose(0, &terms(1.0, &[0.1, 0.1])?, &mut duals)
            .is_err());
        Ok(())
    }

    #[test]
    fn invalid_combinations_are_all_reported() {
        let lagrangian = WeightSchedule::Lagrangian(ConstraintSpec::new(1.0, Relation::Le));
        let free_bits = ObjectiveSpec::FreeBitsBetaVae {
            beta: lagrangian,
            free_bits_pd: -1.0,
        };
        assert_eq!(free_bits.problems(None).len(), 2);

        let beta_tc = ObjectiveSpec::BetaTcVae {
            alpha: WeightSchedule::Linear {
                value: 1.0,
                ramp_length: 0,
                direction: RampDirection::Increase,
            },
            beta: lagrangian,
            gamma: lagrangian,
        };
        // zero ramp, lagrangian beta, gamma relation not ge
        assert_eq!(beta_tc.problems(None).len(), 3);
        assert!(ObjectiveComposer::new(beta_tc, 2, None).is_err());
    }

    #[test]
    fn objective_names_parse() {
        let spec: ObjectiveSpec = toml::from_str(
            "name = \"beta-tc-vae\"\nbeta = { policy = \"constant\", value = 6.0 }",
        )
        .expect("beta-tc-vae parses");
        assert_eq!(
            spec,
            ObjectiveSpec::BetaTcVae {
                alpha: WeightSchedule::constant(1.0),
                beta: WeightSchedule::constant(6.0),
                gamma: WeightSchedule::constant(1.0),
            }
        );
        assert!(toml::from_str::<ObjectiveSpec>("name = \"wae\"").is_err());
    }
}
