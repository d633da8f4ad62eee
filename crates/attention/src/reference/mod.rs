//! Portable, exact attention used by the decoder blocks.
//!
//! Clarity over speed: every score is materialised so that the latent memory
//! slots can be inspected through the returned probabilities.

pub mod exact;

pub use exact::ExactAttention;
