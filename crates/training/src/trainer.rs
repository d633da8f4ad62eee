use candle_core::{backprop::GradStore, DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use model::{
    ConditionedDecoder, DecoderInput, ForwardOptions, LatentEncoder, LatentProjector,
    MeanPoolEncoder, OutputKind, Reduction, RequestedOutputs, SamplerConfig, TwoStageReduction,
};

use crate::{
    config::TrainingConfig,
    data::{BatchSource, DataBatch},
    divergence::{self, KDE_BANDWIDTH_FLOOR},
    evaluation::{
        generated_iw_log_likelihood, iw_log_likelihood, ks_statistic, mean_per_word,
        EvaluationReport, IwEstimate, VaeParts,
    },
    logging::{Logger, LoggingSettings},
    metrics::{Metrics, RunningSummary, TrainingMetrics},
    objective::{LossTerms, ObjectiveComposer, ObjectiveSpec, RequiredTerms},
    pareto::ParetoFront,
    state::TrainerState,
    TrainingError,
};

/// Outcome of one optimizer step.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: usize,
    pub loss: Option<f64>,
    pub grad_norm: f64,
    /// Objective metrics averaged over the step's micro-batches.
    pub metrics: Metrics,
}

/// Owns the encoder, projector and decoder together with the optimizer, the
/// objective and the run state.
pub struct VaeTrainer {
    config: TrainingConfig,
    device: Device,
    varmap: VarMap,
    encoder: MeanPoolEncoder,
    projector: LatentProjector,
    decoder: ConditionedDecoder,
    composer: ObjectiveComposer,
    optimizer: AdamW,
    state: TrainerState,
    metrics: TrainingMetrics,
    logger: Logger,
    pareto: ParetoFront,
}

impl VaeTrainer {
    pub fn new(config: TrainingConfig, device: Device) -> Result<Self, TrainingError> {
        config.validate()?;
        if let Err(err) = device.set_seed(config.runtime.seed) {
            log::warn!("failed to seed device RNG: {}", err);
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = MeanPoolEncoder::new(&config.model, vb.pp("encoder"))?;
        let projector = LatentProjector::new(&config.model, vb.pp("latent"))?;
        let decoder = ConditionedDecoder::new(config.model.clone(), vb.pp("decoder"))?;

        let composer = ObjectiveComposer::new(
            config.objective.clone(),
            config.model.latent_size,
            config.data.steps_per_epoch,
        )?;
        let mut state = TrainerState::new();
        composer.register_duals(&mut state.duals);

        let params = ParamsAdamW {
            lr: config.optimizer.learning_rate,
            beta1: config.optimizer.beta1,
            beta2: config.optimizer.beta2,
            eps: config.optimizer.epsilon,
            weight_decay: config.optimizer.weight_decay,
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;

        let logger = Logger::new(LoggingSettings::from_config(
            true,
            config.runtime.tensorboard_dir.clone(),
            config.runtime.log_every_n_steps,
        ))?;
        let pareto = ParetoFront::new(config.evaluation.pareto.enabled());

        let parameters: usize = varmap
            .all_vars()
            .iter()
            .map(|var| var.as_tensor().elem_count())
            .sum();
        log::info!(
            "vae trainer on {:?}: objective={} latent_size={} layers={} parameters={}",
            device,
            config.objective.kind(),
            config.model.latent_size,
            config.model.n_layers,
            parameters
        );

        Ok(Self {
            config,
            device,
            varmap,
            encoder,
            projector,
            decoder,
            composer,
            optimizer,
            state,
            metrics: TrainingMetrics::new(),
            logger,
            pareto,
        })
    }

    /// Continues from a saved state; duals missing from it are registered fresh.
    pub fn with_state(mut self, state: TrainerState) -> Self {
        self.state = state;
        self.composer.register_duals(&mut self.state.duals);
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn pareto(&self) -> &ParetoFront {
        &self.pareto
    }

    fn parts(&self) -> VaeParts<'_> {
        VaeParts {
            encoder: &self.encoder,
            projector: &self.projector,
            decoder: &self.decoder,
        }
    }

    /// Encodes the batch, conditions the decoder on the latent and computes
    /// the loss terms in `required`.
    pub fn compute_terms(
        &self,
        batch: &DataBatch,
        train: bool,
        required: RequiredTerms,
    ) -> Result<LossTerms, TrainingError> {
        let posterior = self
            .encoder
            .encode(&batch.input_ids, Some(&batch.attention_mask))?;
        let z = if self.composer.spec().samples_latent() {
            posterior.sample()?
        } else {
            posterior.mu.clone()
        };
        let bundle = self.projector.project(&z)?;

        let input = DecoderInput::new(&batch.input_ids)
            .with_attention_mask(&batch.attention_mask)
            .with_labels(&batch.input_ids);
        let options = ForwardOptions {
            outputs: RequestedOutputs::of(&[OutputKind::CrossEntropy]),
            cross_entropy: TwoStageReduction::new(Reduction::Sum, Reduction::Mean),
            train,
            ..ForwardOptions::default()
        };
        let outputs = self.decoder.forward(&input, &bundle, &options)?;
        let reconstruction = outputs
            .cross_entropy
            .ok_or_else(|| TrainingError::runtime("decoder returned no cross-entropy"))?;

        let mut terms = LossTerms::new(reconstruction, posterior.kl_per_dim()?);
        if required.decomposition {
            terms.decomposition = Some(divergence::decompose_kl(&posterior, &z)?);
        }
        if required.mmd {
            terms.mmd = Some(divergence::mmd_to_prior(&z)?);
        }
        if required.kde {
            terms.kde_marginal_kl = Some(divergence::kde_marginal_kl(&z, KDE_BANDWIDTH_FLOOR)?);
        }
        Ok(terms)
    }

    /// One optimizer step over `micro_batches`. The constraint observations of
    /// all micro-batches are averaged into a single dual update before any
    /// loss is composed; gradients of the composed losses are summed.
    pub fn train_step(&mut self, micro_batches: &[DataBatch]) -> Result<StepReport, TrainingError> {
        if micro_batches.is_empty() {
            return Err(TrainingError::runtime("train step requires at least one batch"));
        }
        if matches!(self.composer.spec(), ObjectiveSpec::Evaluation) {
            return Err(TrainingError::runtime(
                "the evaluation objective has no loss to optimize",
            ));
        }

        let step = self.state.global_step;
        let schedule_step = self.state.schedule_step();
        let required = self.composer.spec().required_terms();
        let terms = micro_batches
            .iter()
            .map(|batch| self.compute_terms(batch, true, required))
            .collect::<Result<Vec<_>, _>>()?;

        if !self.state.duals.is_empty() {
            let observations = terms
                .iter()
                .map(|terms| self.composer.observations(terms))
                .collect::<Result<Vec<_>, _>>()?;
            self.state.duals.update_averaged(&observations)?;
        }

        let scale = 1.0 / micro_batches.len() as f64;
        let mut summary = RunningSummary::default();
        let mut accumulated: Option<GradStore> = None;
        for micro_terms in &terms {
            let composition = self
                .composer
                .compose_at(schedule_step, micro_terms, &self.state.duals)?;
            summary.update(&composition.metrics);
            let loss = composition
                .total_loss
                .ok_or_else(|| TrainingError::runtime("objective produced no loss"))?;
            let grads = loss.affine(scale, 0.0)?.backward()?;
            if let Some(existing) = accumulated.as_mut() {
                self.merge_gradient_store(existing, grads)?;
            } else {
                accumulated = Some(grads);
            }
        }
        let mut grads =
            accumulated.ok_or_else(|| TrainingError::runtime("no gradients were produced"))?;

        let grad_norm = self.gradient_norm(&grads)?;
        if !grad_norm.is_finite() {
            return Err(TrainingError::runtime(format!(
                "non-finite gradient norm at step {step}"
            )));
        }
        if let Some(max_norm) = self.config.optimizer.gradient_clipping {
            self.clip_gradients(&mut grads, grad_norm, max_norm)?;
        }
        self.optimizer.step(&grads)?;
        self.state.advance();

        let metrics = summary.finalize();
        let loss = metrics.get("total_loss").copied();
        let tokens = micro_batches.iter().map(DataBatch::tokens).sum();
        let snapshot = self
            .metrics
            .record_step(tokens, loss.unwrap_or(f64::NAN), grad_norm);
        let global_step = self.state.global_step;
        if global_step == 1 || global_step % self.config.runtime.log_every_n_steps == 0 {
            let lr = self.optimizer.learning_rate();
            self.logger
                .log_training_step(global_step, lr, &snapshot, &metrics);
        }

        Ok(StepReport {
            step: global_step,
            loss,
            grad_norm,
            metrics,
        })
    }

    /// Objective metrics, importance-weighted log-likelihood and, when
    /// enabled, the generated-text scores. The report is offered to the
    /// Pareto front.
    pub fn evaluate(
        &mut self,
        source: &mut dyn BatchSource,
    ) -> Result<EvaluationReport, TrainingError> {
        let required = ObjectiveSpec::Evaluation.required_terms();
        let step = self.state.global_step;
        let n_samples = self.config.evaluation.iw_ll_n_samples;
        let max_batches = self.config.evaluation.max_batches.unwrap_or(usize::MAX);

        source.reset(0);
        let mut summary = RunningSummary::default();
        let mut estimates: Vec<IwEstimate> = Vec::new();
        let mut batches = 0;
        while batches < max_batches {
            let Some(batch) = source.next_batch()? else {
                break;
            };
            let terms = self.compute_terms(&batch, false, required)?;
            let composition = self.composer.compose_at(
                self.state.schedule_step(),
                &terms,
                &self.state.duals,
            )?;
            summary.update(&composition.metrics);
            estimates.extend(iw_log_likelihood(
                self.parts(),
                &batch.input_ids,
                Some(&batch.attention_mask),
                n_samples,
            )?);
            batches += 1;
        }
        if batches == 0 {
            return Err(TrainingError::runtime("evaluation source produced no batches"));
        }

        let mut report = EvaluationReport {
            step,
            metrics: summary.finalize(),
            iw_ll_per_word: mean_per_word(&estimates),
            ..EvaluationReport::default()
        };

        if self.config.evaluation.eval_iw_ll_x_gen {
            let sampler = SamplerConfig {
                max_seq_len: self.config.evaluation.max_seq_len_x_gen,
                sampling: self.config.evaluation.sampling,
                ..SamplerConfig::default()
            };
            let generated = generated_iw_log_likelihood(
                self.parts(),
                self.config.evaluation.n_sequences_x_gen,
                n_samples,
                sampler,
                &self.device,
            )?;
            let data_per_word: Vec<f64> = estimates.iter().map(|e| e.per_word).collect();
            let generated_per_word: Vec<f64> = generated.iter().map(|e| e.per_word).collect();
            report.iw_ll_x_gen_per_word = mean_per_word(&generated);
            report.d_ks = Some(ks_statistic(&data_per_word, &generated_per_word)?);
        }

        self.logger.log_evaluation(&report);
        if !self.pareto.criteria().is_empty() {
            let candidate = report.candidate(self.pareto.criteria())?;
            if self.pareto.insert(candidate)? {
                log::info!(
                    "step {} is pareto-efficient ({} member(s) on the front)",
                    step,
                    self.pareto.members().len()
                );
            }
        }
        Ok(report)
    }

    /// Trains until `max_steps` or `max_epochs`, evaluating on `eval` every
    /// `evaluation.every_n_steps` steps and once more at the end.
    pub fn fit(
        &mut self,
        train: &mut dyn BatchSource,
        mut eval: Option<&mut dyn BatchSource>,
    ) -> Result<(), TrainingError> {
        let accumulation = self.config.data.gradient_accumulation_steps.max(1);
        let max_steps = self.config.runtime.max_steps;
        let max_epochs = self.config.runtime.max_epochs;
        let eval_every = self.config.evaluation.every_n_steps;
        let mut evaluated_at: Option<usize> = None;

        log::info!(
            "starting training at step {} epoch {} (accumulation={})",
            self.state.global_step,
            self.state.epoch,
            accumulation
        );

        'epochs: loop {
            let epoch = self.state.epoch;
            if max_epochs.is_some_and(|limit| epoch >= limit) {
                break;
            }
            // A resumed epoch replays its data from the start.
            train.reset(epoch);
            self.state.epoch_step = 0;
            let mut pending: Vec<DataBatch> = Vec::with_capacity(accumulation);
            loop {
                if max_steps.is_some_and(|limit| self.state.global_step >= limit) {
                    break 'epochs;
                }
                let batch = train.next_batch()?;
                let exhausted = batch.is_none();
                pending.extend(batch);
                if pending.is_empty() {
                    break;
                }
                if !exhausted && pending.len() < accumulation {
                    continue;
                }

                // A trailing partial group still takes a step.
                self.train_step(&pending)?;
                pending.clear();

                if let (Some(every), Some(source)) = (eval_every, eval.as_deref_mut()) {
                    if self.state.global_step % every == 0 {
                        self.evaluate(source)?;
                        evaluated_at = Some(self.state.global_step);
                    }
                }
                if exhausted {
                    break;
                }
            }
            let steps_this_epoch = self.state.epoch_step;
            if steps_this_epoch == 0 {
                log::warn!("epoch {epoch} produced no batches; stopping");
                break;
            }
            if let Some(expected) = self.config.data.steps_per_epoch {
                if expected != steps_this_epoch {
                    return Err(TrainingError::validation(vec![format!(
                        "data.steps_per_epoch is {expected} but epoch {epoch} took \
                         {steps_this_epoch} optimizer steps"
                    )]));
                }
            }
            self.state.finish_epoch();
            log::debug!("finished epoch {epoch} after {steps_this_epoch} steps");
        }

        if let Some(source) = eval.as_deref_mut() {
            if evaluated_at != Some(self.state.global_step) {
                self.evaluate(source)?;
            }
        }

        self.logger.flush();
        if let Some(path) = &self.config.runtime.state_path {
            self.state.save(path)?;
        }
        log::info!("training finished at step {}", self.state.global_step);
        Ok(())
    }

    fn merge_gradient_store(
        &self,
        accum: &mut GradStore,
        mut new_grads: GradStore,
    ) -> Result<(), TrainingError> {
        for var in self.varmap.all_vars() {
            let tensor = var.as_tensor();
            if let Some(grad) = new_grads.remove(tensor) {
                let combined = match accum.remove(tensor) {
                    Some(existing) => existing.add(&grad)?,
                    None => grad,
                };
                accum.insert(tensor, combined);
            }
        }
        Ok(())
    }

    fn gradient_norm(&self, grads: &GradStore) -> Result<f64, TrainingError> {
        let mut sum_squares = 0.0f64;
        for var in self.varmap.all_vars() {
            if let Some(grad) = grads.get(var.as_tensor()) {
                sum_squares += grad
                    .to_dtype(DType::F32)?
                    .sqr()?
                    .sum_all()?
                    .to_vec0::<f32>()? as f64;
            }
        }
        Ok(sum_squares.sqrt())
    }

    fn clip_gradients(
        &self,
        grads: &mut GradStore,
        total_norm: f64,
        max_norm: f64,
    ) -> Result<(), TrainingError> {
        if total_norm <= max_norm {
            return Ok(());
        }
        let clip_coef = max_norm / (total_norm + 1e-6);
        for var in self.varmap.all_vars() {
            let tensor = var.as_tensor();
            if let Some(grad) = grads.remove(tensor) {
                grads.insert(tensor, (grad * clip_coef)?);
            }
        }
        Ok(())
    }
}
