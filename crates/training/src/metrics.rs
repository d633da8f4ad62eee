use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

/// Named scalar metrics produced by an objective or an evaluation pass.
pub type Metrics = BTreeMap<String, f64>;

/// `value = alpha * sample + (1 - alpha) * value`; the first sample seeds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    tokens_processed: u64,
    loss_ema: ExponentialMovingAverage,
    throughput_ema: ExponentialMovingAverage,
    grad_norm_ema: ExponentialMovingAverage,
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            tokens_processed: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
            throughput_ema: ExponentialMovingAverage::new(0.1),
            grad_norm_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_step(&mut self, tokens: u64, loss: f64, grad_norm: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.tokens_processed = self.tokens_processed.saturating_add(tokens);
        let step_tokens_per_sec = if step_duration > Duration::ZERO {
            tokens as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };

        StepSnapshot {
            loss: self.loss_ema.update(loss),
            step_loss: loss,
            tokens,
            step_tokens_per_sec,
            tokens_per_sec: self.throughput_ema.update(step_tokens_per_sec),
            grad_norm: self.grad_norm_ema.update(grad_norm),
            raw_grad_norm: grad_norm,
            total_tokens: self.tokens_processed,
            wall_time: now.duration_since(self.start_time),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub loss: f64,
    pub step_loss: f64,
    pub tokens: u64,
    pub step_tokens_per_sec: f64,
    pub tokens_per_sec: f64,
    pub grad_norm: f64,
    pub raw_grad_norm: f64,
    pub total_tokens: u64,
    pub wall_time: Duration,
}

/// Per-key running mean over a sequence of metric maps.
#[derive(Debug, Default, Clone)]
pub struct RunningSummary {
    sums: BTreeMap<String, (f64, usize)>,
}

impl RunningSummary {
    pub fn update(&mut self, metrics: &Metrics) {
        for (key, value) in metrics {
            let entry = self.sums.entry(key.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }

    pub fn mean(&self, key: &str) -> Option<f64> {
        self.sums
            .get(key)
            .filter(|(_, count)| *count > 0)
            .map(|(sum, count)| sum / *count as f64)
    }

    pub fn finalize(&self) -> Metrics {
        self.sums
            .iter()
            .filter(|(_, (_, count))| *count > 0)
            .map(|(key, (sum, count))| (key.clone(), sum / *count as f64))
            .collect()
    }
}
