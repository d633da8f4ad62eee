//! Pareto-efficient checkpoint selection over evaluation criteria.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::TrainingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Rate,
    IwLl,
    IwLlXGen,
    DKs,
    Distortion,
    Mmd,
    Elbo,
}

impl Criterion {
    /// Whether larger values are better.
    pub fn maximize(self) -> bool {
        matches!(
            self,
            Criterion::Rate | Criterion::IwLl | Criterion::IwLlXGen | Criterion::Elbo
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Criterion::Rate => "rate",
            Criterion::IwLl => "iw_ll",
            Criterion::IwLlXGen => "iw_ll_x_gen",
            Criterion::DKs => "d_ks",
            Criterion::Distortion => "distortion",
            Criterion::Mmd => "mmd",
            Criterion::Elbo => "elbo",
        }
    }

    fn needs_generated_text(self) -> bool {
        matches!(self, Criterion::IwLlXGen | Criterion::DKs)
    }
}

/// Toggles for each checkpoint selection axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParetoCriteria {
    pub rate: bool,
    pub iw_ll: bool,
    pub iw_ll_x_gen: bool,
    pub d_ks: bool,
    pub distortion: bool,
    pub mmd: bool,
    pub elbo: bool,
}

impl Default for ParetoCriteria {
    fn default() -> Self {
        Self {
            rate: true,
            iw_ll: true,
            iw_ll_x_gen: false,
            d_ks: false,
            distortion: false,
            mmd: false,
            elbo: false,
        }
    }
}

impl ParetoCriteria {
    pub fn enabled(&self) -> Vec<Criterion> {
        [
            (self.rate, Criterion::Rate),
            (self.iw_ll, Criterion::IwLl),
            (self.iw_ll_x_gen, Criterion::IwLlXGen),
            (self.d_ks, Criterion::DKs),
            (self.distortion, Criterion::Distortion),
            (self.mmd, Criterion::Mmd),
            (self.elbo, Criterion::Elbo),
        ]
        .into_iter()
        .filter_map(|(on, criterion)| on.then_some(criterion))
        .collect()
    }

    pub fn problems(&self, eval_iw_ll_x_gen: bool) -> Vec<String> {
        let mut errors = Vec::new();
        if !eval_iw_ll_x_gen {
            for criterion in self.enabled() {
                if criterion.needs_generated_text() {
                    errors.push(format!(
                        "evaluation.pareto.{} requires evaluation.eval_iw_ll_x_gen",
                        criterion.name()
                    ));
                }
            }
        }
        errors
    }
}

/// One evaluated checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub step: usize,
    pub values: BTreeMap<Criterion, f64>,
}

/// Set of mutually non-dominated candidates.
#[derive(Debug, Clone)]
pub struct ParetoFront {
    criteria: Vec<Criterion>,
    members: Vec<Candidate>,
}

impl ParetoFront {
    pub fn new(criteria: Vec<Criterion>) -> Self {
        Self {
            criteria,
            members: Vec::new(),
        }
    }

    pub fn criteria(&self) -> &[Criterion] {
        &self.criteria
    }

    pub fn members(&self) -> &[Candidate] {
        &self.members
    }

    /// `a` is at least as good as `b` everywhere and strictly better somewhere.
    pub fn dominates(&self, a: &Candidate, b: &Candidate) -> bool {
        let mut strictly_better = false;
        for criterion in &self.criteria {
            let (Some(&x), Some(&y)) = (a.values.get(criterion), b.values.get(criterion)) else {
                return false;
            };
            let (x, y) = if criterion.maximize() { (x, y) } else { (-x, -y) };
            if x < y {
                return false;
            }
            if x > y {
                strictly_better = true;
            }
        }
        strictly_better
    }

    /// Inserts `candidate` unless it is dominated, evicting members it
    /// dominates. Returns whether it joined the front.
    pub fn insert(&mut self, candidate: Candidate) -> Result<bool, TrainingError> {
        for criterion in &self.criteria {
            match candidate.values.get(criterion) {
                Some(value) if value.is_finite() => {}
                _ => {
                    return Err(TrainingError::runtime(format!(
                        "candidate at step {} has no finite value for '{}'",
                        candidate.step,
                        criterion.name()
                    )))
                }
            }
        }
        if self
            .members
            .iter()
            .any(|member| self.dominates(member, &candidate))
        {
            return Ok(false);
        }
        let before = self.members.len();
        let kept: Vec<Candidate> = self
            .members
            .iter()
            .filter(|member| !self.dominates(&candidate, member))
            .cloned()
            .collect();
        if kept.len() < before {
            log::debug!(
                "step {} dominates {} pareto member(s)",
                candidate.step,
                before - kept.len()
            );
        }
        self.members = kept;
        self.members.push(candidate);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(step: usize, rate: f64, d_ks: f64) -> Candidate {
        Candidate {
            step,
            values: BTreeMap::from([(Criterion::Rate, rate), (Criterion::DKs, d_ks)]),
        }
    }

    #[test]
    fn dominated_candidates_are_dropped() -> Result<(), TrainingError> {
        let mut front = ParetoFront::new(vec![Criterion::Rate, Criterion::DKs]);
        assert!(front.insert(candidate(1, 5.0, 0.5))?);
        assert!(front.insert(candidate(2, 8.0, 0.7))?);
        // Worse on both axes than step 2.
        assert!(!front.insert(candidate(3, 7.0, 0.8))?);
        // Better than step 1 on both axes; step 1 leaves.
        assert!(front.insert(candidate(4, 6.0, 0.4))?);
        let steps: Vec<usize> = front.members().iter().map(|c| c.step).collect();
        assert_eq!(steps, vec![2, 4]);
        Ok(())
    }

    #[test]
    fn equal_candidates_do_not_dominate() -> Result<(), TrainingError> {
        let mut front = ParetoFront::new(vec![Criterion::Rate]);
        assert!(front.insert(candidate(1, 5.0, 0.0))?);
        assert!(front.insert(candidate(2, 5.0, 0.0))?);
        assert_eq!(front.members().len(), 2);
        Ok(())
    }

    #[test]
    fn missing_criterion_is_an_error() {
        let mut front = ParetoFront::new(vec![Criterion::Mmd]);
        assert!(front.insert(candidate(1, 1.0, 1.0)).is_err());
    }

    #[test]
    fn generated_text_axes_need_generated_eval() {
        let criteria = ParetoCriteria {
            iw_ll_x_gen: true,
            d_ks: true,
            ..ParetoCriteria::default()
        };
        assert_eq!(criteria.problems(false).len(), 2);
        assert!(criteria.problems(true).is_empty());
    }
}
