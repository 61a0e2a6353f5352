//! Standard multivariate normal base distribution.
//!
//! The prior is the fixed latent-space distribution a flow transforms into
//! data space. Its dimensionality always matches the owning flow's
//! `input_dim` and never changes over the flow's lifetime.

use candle_core::{Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::FlowResult;

/// ln(2π), for the normal log-density constant.
const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// Standard multivariate normal distribution N(0, I) of fixed dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normal {
    dim: usize,
}

impl Normal {
    /// Create a standard normal of the given dimensionality.
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    /// Dimensionality of the distribution.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Draw `n` samples as an `(n, dim)` tensor.
    ///
    /// With `Some(seed)` the draw is bit-reproducible (ChaCha8 stream seeded
    /// from the value). With `None` a fresh entropy seed is taken from the
    /// thread RNG, so repeated calls are independent and not reproducible.
    pub fn sample(&self, n: usize, seed: Option<u64>, device: &Device) -> FlowResult<Tensor> {
        let seed = seed.unwrap_or_else(|| rand::thread_rng().gen());
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let values: Vec<f32> = (0..n * self.dim)
            .map(|_| StandardNormal.sample(&mut rng))
            .collect();
        Ok(Tensor::from_vec(values, (n, self.dim), device)?)
    }

    /// Log-density of each row of an `(n, dim)` batch, returned as `(n,)`.
    ///
    /// Computed with candle ops so gradients flow through it during training:
    /// `-0.5 * Σ x² - 0.5 * dim * ln(2π)`.
    pub fn log_prob(&self, batch: &Tensor) -> FlowResult<Tensor> {
        let norm_const = 0.5 * self.dim as f64 * LN_2PI;
        Ok(batch.sqr()?.sum(1)?.affine(-0.5, -norm_const)?)
    }
}
