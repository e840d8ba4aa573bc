//! Crate root: public surface, shared types, and crate-wide invariants
//!
//! `fmlearn` is an online learner for a factorization-machine binary
//! classifier trained by FTRL-Proximal with per-coordinate adaptive learning
//! rates. It consumes a stream of sparse labeled samples (labels in
//! `{−1, +1}`) and maintains a lazily-materialized model: one first-order
//! weight and one K-dimensional latent factor per observed feature string,
//! alongside the `(z, n)` dual accumulators the weights are reconstructed
//! from. The bias term is an implicit extra feature named [`BIAS_FEATURE`].
//!
//! ## Invariants
//!
//! - **Dual state.** After every completed training step, `wn ≥ 0` and
//!   `vn[f] ≥ 0` (sums of squared gradients), and `|wz| ≤ λ1 ⇒ w == 0` per
//!   the proximal soft-threshold rule.
//! - **Locking discipline.** Unit fields are mutated only under the unit's
//!   stripe lock ([`locks::LockPool`]); the forward pass reads them lock-free
//!   through individually-atomic `f64` cells ([`store::AtomicF64`]) — stale
//!   reads are accepted, torn reads are impossible.
//! - **Ownership.** The model store owns every unit; trainers borrow by
//!   lock. Unit handles are address-stable for the process lifetime.
//! - **Serialization.** Training must be quiesced before iterating the store
//!   for output; a binary model whose success flag was never set is refused
//!   at load.
//!
//! The failure mode for any violated file-format expectation is a precise
//! error, never a partially-populated store.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

/// Binary model file codec (fixed layout, deferred header).
pub mod bin_codec;
/// Producer/consumer batch frame over a bounded channel.
pub mod frame;
/// Vector kernels: scalar and vectorized level-1 backends.
pub mod kernels;
/// Striped lock pool keyed by feature hash.
pub mod locks;
/// Frozen scoring model and batch predictor.
pub mod predictor;
/// Sample line parser.
pub mod sample;
/// Concurrent model store and per-feature units.
pub mod store;
/// FTRL-Proximal trainer.
pub mod trainer;
/// Text model file codec.
pub mod txt_codec;
/// RNG and scalar math helpers.
pub mod util;

// ============================================================================
// Shared types
// ============================================================================

/// Reserved feature name of the global intercept. Input lines must not carry
/// a feature with this name.
pub const BIAS_FEATURE: &str = "bias";

/// Which on-disk model flavor to read or write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelFormat {
    Txt,
    Bin,
}

impl ModelFormat {
    /// Parse a `-mf`/`-imf` value (`txt` or `bin`).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "txt" => Some(ModelFormat::Txt),
            "bin" => Some(ModelFormat::Bin),
            _ => None,
        }
    }
}

/// Unified model-file error, shared by trainer and predictor loads.
#[derive(Debug, thiserror::Error)]
pub enum ModelIoError {
    #[error(transparent)]
    Txt(#[from] txt_codec::TxtCodecError),
    #[error(transparent)]
    Bin(#[from] bin_codec::BinCodecError),
}

// ============================================================================
// Root-level re-exports
// ============================================================================

pub use crate::kernels::{Backend, VectorOps};
pub use crate::predictor::{FtrlPredictor, PredictModel, PredictOptions};
pub use crate::sample::{parse_sample, Sample, Term};
pub use crate::store::{ModelStore, ModelUnit, UnitRecord};
pub use crate::trainer::{FtrlTrainer, TrainOptions};
