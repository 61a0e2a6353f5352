//! First-order optimizers for flow training.
//!
//! The training loop consumes optimizers through [`GradientOptimizer`]: a
//! stateful contract of `init` (build state from current parameters),
//! `update` (one step from gradients, producing new state), and
//! [`OptimizerState::params`] (extract current parameters). State is replaced
//! wholesale on every update, never mutated in place, so the parameters seen
//! by any reader are always a fully consistent tree.

use candle_core::{DType, Tensor};

use crate::error::{FlowError, FlowResult};

/// Optimizer state: the current parameter tensors plus optimizer-specific
/// slot buffers (e.g. Adam's moment estimates, one `Vec<Tensor>` per slot).
#[derive(Debug, Clone)]
pub struct OptimizerState {
    params: Vec<Tensor>,
    slots: Vec<Vec<Tensor>>,
}

impl OptimizerState {
    /// Current parameter tensors.
    pub fn params(&self) -> &[Tensor] {
        &self.params
    }

    /// Take ownership of the parameter tensors, consuming the state.
    pub fn into_params(self) -> Vec<Tensor> {
        self.params
    }
}

/// Stateful first-order optimizer contract.
pub trait GradientOptimizer {
    /// Build fresh optimizer state from the given parameters.
    fn init(&self, params: &[Tensor]) -> FlowResult<OptimizerState>;

    /// Apply one update for the given global step (0-based, monotonically
    /// increasing across the whole training run) and gradients, returning the
    /// new state.
    fn update(
        &self,
        step: usize,
        grads: &[Tensor],
        state: OptimizerState,
    ) -> FlowResult<OptimizerState>;
}

/// Adam optimizer with bias-corrected moment estimates.
#[derive(Debug, Clone)]
pub struct Adam {
    /// Learning rate.
    pub lr: f64,
    /// Exponential decay for the first moment.
    pub beta1: f64,
    /// Exponential decay for the second moment.
    pub beta2: f64,
    /// Denominator fuzz term.
    pub eps: f64,
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(1e-3)
    }
}

impl Adam {
    /// Adam with the given learning rate and standard moment decays
    /// (0.9, 0.999, eps 1e-8).
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl GradientOptimizer for Adam {
    fn init(&self, params: &[Tensor]) -> FlowResult<OptimizerState> {
        let zeros = |t: &Tensor| Tensor::zeros(t.shape(), DType::F32, t.device());
        let m = params.iter().map(zeros).collect::<Result<Vec<_>, _>>()?;
        let v = params.iter().map(zeros).collect::<Result<Vec<_>, _>>()?;
        Ok(OptimizerState {
            params: params.to_vec(),
            slots: vec![m, v],
        })
    }

    fn update(
        &self,
        step: usize,
        grads: &[Tensor],
        state: OptimizerState,
    ) -> FlowResult<OptimizerState> {
        if grads.len() != state.params.len() {
            return Err(FlowError::config(format!(
                "gradient count {} does not match parameter count {}",
                grads.len(),
                state.params.len()
            )));
        }

        let t = (step + 1) as i32;
        let bc1 = 1.0 - self.beta1.powi(t);
        let bc2 = 1.0 - self.beta2.powi(t);

        let mut params = Vec::with_capacity(state.params.len());
        let mut m_slot = Vec::with_capacity(state.params.len());
        let mut v_slot = Vec::with_capacity(state.params.len());

        for (i, grad) in grads.iter().enumerate() {
            let p = &state.params[i];
            let m = &state.slots[0][i];
            let v = &state.slots[1][i];

            // m = β1·m + (1-β1)·g ; v = β2·v + (1-β2)·g²
            let m_new = ((m * self.beta1)? + (grad * (1.0 - self.beta1))?)?;
            let v_new = ((v * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;

            // Bias-corrected step: p - lr · m̂ / (√v̂ + ε)
            let m_hat = (&m_new / bc1)?;
            let v_hat = (&v_new / bc2)?;
            let denom = (v_hat.sqrt()? + self.eps)?;
            let update = ((&m_hat / &denom)? * self.lr)?;
            params.push((p - &update)?);

            m_slot.push(m_new);
            v_slot.push(v_new);
        }

        Ok(OptimizerState {
            params,
            slots: vec![m_slot, v_slot],
        })
    }
}
