//! Trainable normalizing-flow density estimation on candle.
//!
//! This crate implements an invertible, differentiable transform that maps a
//! standard multivariate normal prior onto an empirical data distribution,
//! fit by maximum likelihood. It provides:
//! - Exact log-density via the change-of-variables formula
//! - Sampling by pushing prior draws through the forward map
//! - Grid-based conditional/posterior density estimation along one column
//! - Minibatch SGD training with a pluggable first-order optimizer
//! - JSON persistence of the trained state bundle
//!
//! Tensor math and automatic differentiation are delegated to `candle-core`;
//! the core only composes its primitives.
//!
//! # Example
//!
//! ```no_run
//! use candle_core::Device;
//! use norm_flow_rs::{Adam, Flow, TrainOptions};
//!
//! let device = Device::Cpu;
//! let mut flow = Flow::new(2, &device).unwrap();
//!
//! let data = flow.sample(512, Some(0)).unwrap();
//! let losses = flow
//!     .train(&data, &Adam::default(), &TrainOptions::default())
//!     .unwrap();
//! println!("final loss: {}", losses.last().unwrap());
//!
//! flow.save("flow.json").unwrap();
//! let restored = Flow::restore("flow.json", &device).unwrap();
//! let density = restored.log_prob(&data).unwrap();
//! # let _ = density;
//! ```

pub mod bijector;
pub mod bundle;
pub mod error;
pub mod flow;
pub mod optimizer;
pub mod prior;
pub mod train;

pub use bijector::{BijectorSpec, DEFAULT_COUPLING_HIDDEN};
pub use bundle::{FlowBundle, TensorData, BUNDLE_FORMAT};
pub use error::{FlowError, FlowResult};
pub use flow::{
    default_grid, Flow, FlowOptions, PosteriorMode, DEFAULT_GRID_START, DEFAULT_GRID_STEP,
    DEFAULT_GRID_STOP, INIT_SEED,
};
pub use optimizer::{Adam, GradientOptimizer, OptimizerState};
pub use prior::Normal;
pub use train::TrainOptions;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::bijector::BijectorSpec;
    pub use crate::error::{FlowError, FlowResult};
    pub use crate::flow::{default_grid, Flow, FlowOptions, PosteriorMode};
    pub use crate::optimizer::{Adam, GradientOptimizer};
    pub use crate::prior::Normal;
    pub use crate::train::TrainOptions;
}
