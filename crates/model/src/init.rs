//! Parameter initialisers shared by the decoder components.
//!
//! Projection weights are drawn from `N(0, initializer_range^2)` and biases
//! start at zero.

use candle_core::Result;
use candle_nn::{init::Init, Embedding, Linear, VarBuilder};

pub(crate) fn normal_linear(
    in_dim: usize,
    out_dim: usize,
    std: f64,
    bias: bool,
    vb: VarBuilder,
) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: std,
        },
    )?;
    let bias = if bias {
        Some(vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

pub(crate) fn normal_embedding(
    count: usize,
    hidden: usize,
    std: f64,
    vb: VarBuilder,
) -> Result<Embedding> {
    let weight = vb.get_with_hints(
        (count, hidden),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: std,
        },
    )?;
    Ok(Embedding::new(weight, hidden))
}
