use thiserror::Error;

/// Contract violations raised by the decoder, projector and sampler.
#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("labels are required when cross-entropy or exact match is requested")]
    MissingLabels,
    #[error("conditioning bundle carries neither memory nor embedding conditioning")]
    NoConditioning,
    #[error("expected {expected} memory tensors (one per layer), got {actual}")]
    MemoryLayerMismatch { expected: usize, actual: usize },
    #[error("{output} requires a latent mechanism that is not enabled ({mechanism})")]
    MissingMechanism {
        output: &'static str,
        mechanism: &'static str,
    },
    #[error("logit-derived outputs need at least two tokens, got {0}")]
    SequenceTooShort(usize),
    #[error("labels shape {labels:?} does not match input ids {inputs:?}")]
    LabelShape {
        labels: Vec<usize>,
        inputs: Vec<usize>,
    },
    #[error("sequence length {len} exceeds max_positions {max}")]
    SequenceTooLong { len: usize, max: usize },
    #[error("invalid decoder configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Attention(#[from] attention::AttentionError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DecoderError>;
