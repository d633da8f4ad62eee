use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use clap::Parser;
use serde_json::{Number, Value};
use training::{
    BatchSource, InMemoryBatches, SyntheticBatches, TrainerState, TrainingConfig, TrainingError,
    VaeTrainer,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Text VAE training CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, help = "Validate the configuration and exit")]
    check: bool,

    #[arg(
        long,
        value_name = "PATH",
        help = "Pre-tokenized corpus: one JSON array of token ids per line"
    )]
    data: Option<PathBuf>,

    #[arg(
        long,
        value_name = "N",
        default_value_t = 10,
        help = "Optimizer steps per epoch on random sequences when --data is absent"
    )]
    synthetic_steps: usize,

    #[arg(long, help = "Restore progress and dual variables from runtime.state_path")]
    resume: bool,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    config.validate()?;

    if args.check {
        println!(
            "configuration is valid: objective={} latent_size={}",
            config.objective.kind(),
            config.model.latent_size
        );
        return Ok(());
    }

    let device = select_device();
    let mut trainer = VaeTrainer::new(config.clone(), device.clone())?;
    if args.resume {
        let path = config.runtime.state_path.as_ref().ok_or_else(|| {
            TrainingError::initialization("--resume requires runtime.state_path")
        })?;
        if path.exists() {
            let state = TrainerState::load(path)?;
            log::info!(
                "resumed trainer state from {} (step {})",
                path.display(),
                state.global_step
            );
            trainer = trainer.with_state(state);
        } else {
            log::warn!("no trainer state at {}; starting fresh", path.display());
        }
    }

    let (mut train, mut eval) = match &args.data {
        Some(path) => corpus_sources(&config, path, &device)?,
        None => synthetic_sources(&config, args.synthetic_steps, &device)?,
    };
    trainer.fit(&mut *train, Some(&mut *eval))?;

    let steps: Vec<usize> = trainer.pareto().members().iter().map(|c| c.step).collect();
    if !steps.is_empty() {
        println!("pareto-efficient steps: {:?}", steps);
    }
    Ok(())
}

fn select_device() -> Device {
    if metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => return device,
            Err(err) => log::warn!("failed to initialize metal device, falling back to CPU: {}", err),
        }
    } else if cuda_is_available() {
        match Device::cuda_if_available(0) {
            Ok(device) => return device,
            Err(err) => log::warn!("cuda reported available but initialization failed: {err}"),
        }
    }
    Device::Cpu
}

type Sources = (Box<dyn BatchSource>, Box<dyn BatchSource>);

fn synthetic_sources(
    config: &TrainingConfig,
    steps: usize,
    device: &Device,
) -> Result<Sources, TrainingError> {
    let build = |batches: usize, seed: u64| {
        SyntheticBatches::new(
            config.model.vocab_size,
            config.model.bos_token_id,
            config.model.eos_token_id,
            config.model.pad_token_id,
            config.data.batch_size,
            config.data.max_seq_len,
            batches,
            seed,
            device.clone(),
        )
    };
    let seed = config.runtime.seed;
    let train = build(steps.max(1) * config.data.gradient_accumulation_steps, seed)?;
    let eval = build(config.evaluation.max_batches.unwrap_or(2), seed.wrapping_add(1))?;
    Ok((Box::new(train), Box::new(eval)))
}

/// Every tenth sequence is held out for evaluation.
fn corpus_sources(
    config: &TrainingConfig,
    path: &Path,
    device: &Device,
) -> Result<Sources, TrainingError> {
    let contents = fs::read_to_string(path)?;
    let mut train = Vec::new();
    let mut held_out = Vec::new();
    for (idx, line) in contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
    {
        let ids: Vec<u32> = serde_json::from_str(line).map_err(|err| {
            TrainingError::ConfigFormat(format!("{}:{}: {}", path.display(), idx + 1, err))
        })?;
        if idx % 10 == 9 {
            held_out.push(ids);
        } else {
            train.push(ids);
        }
    }
    if held_out.is_empty() {
        held_out = train.clone();
    }
    let build = |sequences: Vec<Vec<u32>>| {
        InMemoryBatches::new(
            sequences,
            config.data.batch_size,
            config.data.max_seq_len,
            config.model.pad_token_id,
            config.runtime.seed,
            device.clone(),
        )
    };
    let train = build(train)?;
    let eval = build(held_out)?;
    log::info!(
        "loaded {} training and {} held-out sequences from {}",
        train.len(),
        eval.len(),
        path.display()
    );
    Ok((Box::new(train), Box::new(eval)))
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

/// Assigns `new_value` at a dot path such as `objective.beta.value`,
/// creating intermediate objects as needed.
fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::runtime(format!(
            "invalid override path '{path}'"
        )));
    }

    let Some((last, parents)) = segments.split_last() else {
        return Err(TrainingError::runtime("override path must not be empty"));
    };
    let mut current = value;
    for segment in parents {
        current = object_at(current, segment)?
            .entry(segment.to_string())
            .or_insert(Value::Null);
    }
    object_at(current, last)?.insert(last.to_string(), new_value);
    Ok(())
}

fn object_at<'v>(
    value: &'v mut Value,
    segment: &str,
) -> Result<&'v mut serde_json::Map<String, Value>, TrainingError> {
    if value.is_null() {
        *value = Value::Object(serde_json::Map::new());
    }
    value.as_object_mut().ok_or_else(|| {
        TrainingError::runtime(format!(
            "override path segment '{segment}' points into a non-object value"
        ))
    })
}
