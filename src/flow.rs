//! The trainable normalizing-flow density model.
//!
//! A [`Flow`] owns one bijector descriptor with its current parameters and a
//! standard-normal prior of matching dimensionality. The change-of-variables
//! identity ties them together: for data `x` with latent `u = inverse(x)`,
//! `log p(x) = prior.log_prob(u) + log|det J_inverse(x)|`. Sampling runs the
//! other way, pushing prior draws through the forward map.
//!
//! Parameters are replaced wholesale (at construction, restore, and the end
//! of training), never mutated in place.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::{Device, Tensor};

use crate::bijector::BijectorSpec;
use crate::bundle::FlowBundle;
use crate::error::{FlowError, FlowResult};
use crate::prior::Normal;

/// Seed used to derive initial bijector parameters.
///
/// Fixed by design: identical `(bijector, input_dim)` always start from
/// identical initial parameters, and restoring a bundle re-derives the maps
/// from the same seed while loading the trained parameters verbatim.
pub const INIT_SEED: u64 = 0;

/// Default posterior grid bounds and step: 101 evenly spaced points over
/// `[0, 2]` with step 0.02.
pub const DEFAULT_GRID_START: f64 = 0.0;
/// Inclusive upper bound of the default posterior grid.
pub const DEFAULT_GRID_STOP: f64 = 2.0;
/// Step of the default posterior grid.
pub const DEFAULT_GRID_STEP: f64 = 0.02;

/// The default posterior evaluation grid ([`DEFAULT_GRID_START`] to
/// [`DEFAULT_GRID_STOP`] in steps of [`DEFAULT_GRID_STEP`], both ends
/// included).
pub fn default_grid() -> Vec<f32> {
    let len = ((DEFAULT_GRID_STOP - DEFAULT_GRID_START) / DEFAULT_GRID_STEP).round() as usize + 1;
    (0..len)
        .map(|i| (DEFAULT_GRID_START + i as f64 * DEFAULT_GRID_STEP) as f32)
        .collect()
}

/// How [`Flow::posterior`] aligns its inputs with the evaluation grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PosteriorMode {
    /// Infer from the column count: `input_dim - 1` columns means `Insert`,
    /// `input_dim` columns means `Replace`.
    Auto,
    /// Inputs carry `input_dim - 1` columns; grid values are inserted at the
    /// target column.
    Insert,
    /// Inputs carry `input_dim` columns; the target column is overwritten
    /// with each grid value.
    Replace,
}

impl FromStr for PosteriorMode {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "insert" => Ok(Self::Insert),
            "replace" => Ok(Self::Replace),
            other => Err(FlowError::validation(format!(
                "mode `{other}` is invalid. Accepted values are `auto`, `insert`, and `replace`"
            ))),
        }
    }
}

/// Constructor arguments for [`Flow::with_options`].
///
/// Exactly one of `input_dim` (fresh flow) or `file` (restore) must be set.
#[derive(Debug, Clone, Default)]
pub struct FlowOptions {
    /// Dimensionality of the modeled distribution (fresh construction).
    pub input_dim: Option<usize>,
    /// Bijector family; defaults to [`BijectorSpec::default_for`] when absent.
    pub bijector: Option<BijectorSpec>,
    /// Bundle to restore from; mutually exclusive with `input_dim`/`bijector`.
    pub file: Option<PathBuf>,
    /// Opaque caller metadata, persisted untouched.
    pub info: Option<serde_json::Value>,
}

/// A trainable normalizing-flow density model.
pub struct Flow {
    pub(crate) input_dim: usize,
    /// Opaque caller metadata; persisted with the flow, untouched by the core.
    pub info: Option<serde_json::Value>,
    pub(crate) bijector: BijectorSpec,
    pub(crate) params: Vec<Tensor>,
    pub(crate) prior: Normal,
    pub(crate) device: Device,
}

impl Flow {
    /// Fresh flow with the default bijector family and no metadata.
    pub fn new(input_dim: usize, device: &Device) -> FlowResult<Self> {
        Self::with_options(
            FlowOptions {
                input_dim: Some(input_dim),
                ..FlowOptions::default()
            },
            device,
        )
    }

    /// Restore a flow from a saved bundle.
    pub fn restore(file: impl AsRef<Path>, device: &Device) -> FlowResult<Self> {
        Self::with_options(
            FlowOptions {
                file: Some(file.as_ref().to_path_buf()),
                ..FlowOptions::default()
            },
            device,
        )
    }

    /// Construct a flow from explicit options.
    ///
    /// Fresh path: `input_dim` must be positive; the bijector defaults to
    /// [`BijectorSpec::default_for`]; initial parameters are derived from the
    /// fixed [`INIT_SEED`]. No I/O happens.
    ///
    /// Restore path: the bundle's descriptor and parameters are loaded
    /// verbatim and the prior is rebuilt from the stored `input_dim`.
    pub fn with_options(options: FlowOptions, device: &Device) -> FlowResult<Self> {
        let FlowOptions {
            input_dim,
            bijector,
            file,
            info,
        } = options;

        match (file, input_dim) {
            (None, None) => Err(FlowError::config(
                "must provide either input_dim or file",
            )),
            (Some(_), Some(_)) => Err(FlowError::config(
                "if file is provided, do not provide input_dim or bijector",
            )),
            (Some(_), None) if bijector.is_some() => Err(FlowError::config(
                "if file is provided, do not provide input_dim or bijector",
            )),
            (Some(file), None) => {
                let bundle = FlowBundle::load(&file)?;
                let params = bundle.param_tensors(device)?;
                tracing::debug!(
                    input_dim = bundle.input_dim,
                    params = params.len(),
                    file = %file.display(),
                    "restored flow bundle"
                );
                Ok(Self {
                    input_dim: bundle.input_dim,
                    info: bundle.info,
                    bijector: bundle.bijector,
                    params,
                    prior: Normal::new(bundle.input_dim),
                    device: device.clone(),
                })
            }
            (None, Some(input_dim)) => {
                if input_dim == 0 {
                    return Err(FlowError::config("input_dim must be a positive integer"));
                }
                let bijector =
                    bijector.unwrap_or_else(|| BijectorSpec::default_for(input_dim));
                let params = bijector.init_params(INIT_SEED, input_dim, device)?;
                Ok(Self {
                    input_dim,
                    info,
                    bijector,
                    params,
                    prior: Normal::new(input_dim),
                    device: device.clone(),
                })
            }
        }
    }

    /// Dimensionality of the modeled distribution.
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// The bijector descriptor.
    pub fn bijector(&self) -> &BijectorSpec {
        &self.bijector
    }

    /// Current bijector parameters.
    pub fn params(&self) -> &[Tensor] {
        &self.params
    }

    /// The base distribution.
    pub fn prior(&self) -> &Normal {
        &self.prior
    }

    /// Device the flow computes on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Write the state bundle to `path`, overwriting any existing content.
    pub fn save(&self, path: impl AsRef<Path>) -> FlowResult<()> {
        FlowBundle::new(
            self.input_dim,
            self.info.clone(),
            self.bijector.clone(),
            &self.params,
        )?
        .save(path)
    }

    /// Map an `(n, input_dim)` latent batch into data space.
    pub fn forward(&self, points: &Tensor) -> FlowResult<Tensor> {
        Ok(self.bijector.forward(&self.params, points)?.0)
    }

    /// Map an `(n, input_dim)` data batch into latent space.
    pub fn inverse(&self, points: &Tensor) -> FlowResult<Tensor> {
        Ok(self.bijector.inverse(&self.params, points)?.0)
    }

    /// Draw `n` samples from the modeled distribution.
    ///
    /// Prior draws are pushed through the forward map. With `Some(seed)` the
    /// result is reproducible; with `None` a fresh entropy seed is used.
    pub fn sample(&self, n: usize, seed: Option<u64>) -> FlowResult<Tensor> {
        let latent = self.prior.sample(n, seed, &self.device)?;
        self.forward(&latent)
    }

    /// Exact log-density of each row of an `(n, input_dim)` batch.
    ///
    /// Non-finite entries (inputs outside the model's effective support, or
    /// overflow in the maps) are reported as `-inf` — zero density rather
    /// than undefined. Downstream callers rely on this substitution.
    pub fn log_prob(&self, points: &Tensor) -> FlowResult<Tensor> {
        let (latent, log_det) = self.bijector.inverse(&self.params, points)?;
        let log_prob = (self.prior.log_prob(&latent)? + log_det)?;

        let mut values = log_prob.to_vec1::<f32>()?;
        for v in values.iter_mut() {
            if !v.is_finite() {
                *v = f32::NEG_INFINITY;
            }
        }
        Ok(Tensor::from_vec(values, log_prob.dims(), &self.device)?)
    }

    /// Grid estimate of the one-dimensional conditional density of `column`,
    /// holding the remaining coordinates of each input row fixed.
    ///
    /// Each input row is expanded into `grid.len()` full rows — the target
    /// column set to each grid value in turn — the joint density is evaluated
    /// on the expanded batch, and each row of the `(n_rows, grid.len())`
    /// result is normalized by its own trapezoidal integral over `grid`.
    /// Non-finite densities become `0.0`.
    ///
    /// `inputs` carries either `input_dim` columns (grid values overwrite the
    /// target column) or `input_dim - 1` columns (grid values are inserted at
    /// it); `mode` selects between the two, with [`PosteriorMode::Auto`]
    /// inferring from the column count. Mismatches fail with a validation
    /// error before any computation.
    pub fn posterior(
        &self,
        inputs: &Tensor,
        grid: &[f32],
        column: usize,
        mode: PosteriorMode,
    ) -> FlowResult<Tensor> {
        let (n_rows, n_cols) = inputs.dims2()?;
        let dim = self.input_dim;

        let mode = match mode {
            PosteriorMode::Insert if n_cols != dim - 1 => {
                return Err(FlowError::validation(
                    "when using mode `insert`, inputs must have input_dim - 1 columns",
                ))
            }
            PosteriorMode::Replace if n_cols != dim => {
                return Err(FlowError::validation(
                    "when using mode `replace`, inputs must have input_dim columns",
                ))
            }
            PosteriorMode::Auto => {
                if n_cols == dim - 1 {
                    PosteriorMode::Insert
                } else if n_cols == dim {
                    PosteriorMode::Replace
                } else {
                    return Err(FlowError::validation(
                        "inputs must have input_dim or input_dim - 1 columns",
                    ));
                }
            }
            explicit => explicit,
        };
        if column >= dim {
            return Err(FlowError::validation(format!(
                "column {column} is out of range for input_dim {dim}"
            )));
        }

        let n_grid = grid.len();
        let rows = inputs.to_vec2::<f32>()?;

        // Grid-point-major expansion: all grid values for row 0, then row 1,
        // so the flat batch reshapes back to (n_rows, n_grid).
        let mut expanded = Vec::with_capacity(n_rows * n_grid * dim);
        for row in &rows {
            for &g in grid {
                match mode {
                    PosteriorMode::Insert => {
                        expanded.extend_from_slice(&row[..column]);
                        expanded.push(g);
                        expanded.extend_from_slice(&row[column..]);
                    }
                    PosteriorMode::Replace => {
                        expanded.extend_from_slice(row);
                        let last = expanded.len() - dim + column;
                        expanded[last] = g;
                    }
                    PosteriorMode::Auto => unreachable!("auto resolved above"),
                }
            }
        }

        let batch = Tensor::from_vec(expanded, (n_rows * n_grid, dim), &self.device)?;
        let log_prob = self.log_prob(&batch)?.to_vec1::<f32>()?;

        let mut pdfs = Vec::with_capacity(n_rows * n_grid);
        for row_lp in log_prob.chunks(n_grid) {
            let mut pdf: Vec<f32> = row_lp.iter().map(|lp| lp.exp()).collect();
            let integral = trapezoid(&pdf, grid);
            for v in pdf.iter_mut() {
                let normalized = *v / integral;
                *v = if normalized.is_finite() { normalized } else { 0.0 };
            }
            pdfs.extend(pdf);
        }

        Ok(Tensor::from_vec(pdfs, (n_rows, n_grid), &self.device)?)
    }
}

/// Trapezoidal integral of sampled values `y` over ordered abscissae `x`.
pub(crate) fn trapezoid(y: &[f32], x: &[f32]) -> f32 {
    y.windows(2)
        .zip(x.windows(2))
        .map(|(ys, xs)| 0.5 * (ys[0] + ys[1]) * (xs[1] - xs[0]))
        .sum()
}
