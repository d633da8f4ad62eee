use candle_core::Device;
use tempfile::tempdir;
use training::{
    config::{DataConfig, EvaluationConfig, RuntimeConfig},
    objective::ConstraintSet,
    pareto::ParetoCriteria,
    BatchSource, ConstrainedQuantity, ObjectiveSpec, SyntheticBatches, TrainerState,
    TrainingConfig, TrainingError, VaeTrainer, WeightSchedule,
};

fn tiny_config(objective: ObjectiveSpec) -> TrainingConfig {
    let mut config = TrainingConfig {
        objective,
        data: DataConfig {
            batch_size: 3,
            gradient_accumulation_steps: 2,
            steps_per_epoch: None,
            max_seq_len: 8,
        },
        runtime: RuntimeConfig {
            max_steps: Some(4),
            max_epochs: None,
            log_every_n_steps: 1,
            ..RuntimeConfig::default()
        },
        evaluation: EvaluationConfig {
            every_n_steps: Some(2),
            iw_ll_n_samples: 2,
            ..EvaluationConfig::default()
        },
        ..TrainingConfig::default()
    };
    config.model.vocab_size = 20;
    config.model.hidden_size = 16;
    config.model.n_layers = 1;
    config.model.n_heads = 2;
    config.model.latent_size = 4;
    config.model.max_positions = 16;
    config.model.ff_ratio = 2;
    config.model.attn_dropout_p = None;
    config.model.resid_dropout_p = None;
    config
}

fn source(config: &TrainingConfig, batches: usize, seed: u64) -> SyntheticBatches {
    SyntheticBatches::new(
        config.model.vocab_size,
        config.model.bos_token_id,
        config.model.eos_token_id,
        config.model.pad_token_id,
        config.data.batch_size,
        config.data.max_seq_len,
        batches,
        seed,
        Device::Cpu,
    )
    .expect("synthetic source")
}

#[test]
fn smoke_constrained_training_saves_state() {
    let tmp = tempdir().expect("tempdir");
    let state_path = tmp.path().join("state/trainer.json");

    let mut config = tiny_config(ObjectiveSpec::ElboConstraintOptim {
        constraints: ConstraintSet::default(),
    });
    config.runtime.state_path = Some(state_path.clone());

    // Three batches per epoch with accumulation 2: one full and one partial step.
    let mut train = source(&config, 3, 5);
    let mut eval = source(&config, 1, 6);
    let mut trainer = VaeTrainer::new(config, Device::Cpu).expect("trainer");
    trainer
        .fit(&mut train, Some(&mut eval as &mut dyn BatchSource))
        .expect("fit");

    // Both epochs ran to exhaustion before the step limit was checked again.
    assert_eq!(trainer.state().global_step, 4);
    assert_eq!(trainer.state().epoch, 2);
    assert_eq!(trainer.state().epoch_step, 0);
    assert!(!trainer.pareto().members().is_empty());

    let saved = TrainerState::load(&state_path).expect("saved state");
    assert_eq!(&saved, trainer.state());
    for quantity in [
        ConstrainedQuantity::Elbo,
        ConstrainedQuantity::Rate,
        ConstrainedQuantity::Kde1dMarginalKl,
    ] {
        let lambda = saved.duals.lambda(quantity).expect("registered dual");
        assert!(lambda.is_finite());
    }
    // The rate target of 16 nats is far above a freshly initialised encoder.
    assert!(saved.duals.lambda(ConstrainedQuantity::Rate).unwrap_or(0.0) > 1.0);
}

#[test]
fn generated_text_evaluation_reports_ks_distance() {
    let mut config = tiny_config(ObjectiveSpec::Vae);
    config.evaluation.eval_iw_ll_x_gen = true;
    config.evaluation.max_seq_len_x_gen = 6;
    config.evaluation.n_sequences_x_gen = 3;
    config.evaluation.pareto = ParetoCriteria {
        d_ks: true,
        iw_ll_x_gen: true,
        ..ParetoCriteria::default()
    };

    let mut eval = source(&config, 1, 11);
    let mut trainer = VaeTrainer::new(config, Device::Cpu).expect("trainer");
    let report = trainer.evaluate(&mut eval).expect("evaluation");

    let d_ks = report.d_ks.expect("ks distance");
    assert!((0.0..=1.0).contains(&d_ks));
    assert!(report.iw_ll_per_word.is_some_and(f64::is_finite));
    assert!(report.iw_ll_x_gen_per_word.is_some_and(f64::is_finite));
    assert!(report.metrics.contains_key("mmd"));
    assert_eq!(trainer.pareto().members().len(), 1);
}

#[test]
fn resumed_state_keeps_dual_variables() {
    let config = tiny_config(ObjectiveSpec::ElboConstraintOptim {
        constraints: ConstraintSet::default(),
    });
    let mut state = TrainerState::new();
    state.global_step = 4;
    let trainer = VaeTrainer::new(config, Device::Cpu)
        .expect("trainer")
        .with_state(state);
    assert_eq!(trainer.state().global_step, 4);
    assert_eq!(
        trainer.state().duals.lambda(ConstrainedQuantity::Rate),
        Some(1.0)
    );
}

#[test]
fn cyclical_period_must_match_the_real_epoch_length() {
    let mut config = tiny_config(ObjectiveSpec::BetaVae {
        beta: WeightSchedule::Cyclical { value: 1.0 },
    });
    config.data.gradient_accumulation_steps = 1;
    config.data.steps_per_epoch = Some(4);
    config.evaluation.every_n_steps = None;

    // Two batches per epoch make two optimizer steps, not four.
    let mut train = source(&config, 2, 9);
    let mut trainer = VaeTrainer::new(config, Device::Cpu).expect("trainer");
    let err = trainer.fit(&mut train, None).expect_err("mismatched epoch length");

    assert!(matches!(err, TrainingError::Validation(_)));
    assert_eq!(trainer.state().global_step, 2);
    assert_eq!(trainer.state().epoch, 0);
}
