//! Persistence of the flow's logical state bundle.
//!
//! A bundle is a single JSON record with four fields: the dimensionality,
//! opaque caller metadata, the bijector descriptor, and the flat parameter
//! dump. A constant format tag is written alongside for forward
//! compatibility; restoring rejects unknown tags loudly rather than guessing.
//!
//! Structural compatibility between the descriptor and the parameters is the
//! caller's responsibility: a bundle edited by hand to pair mismatched
//! descriptor and parameters will fail later, at apply time.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::bijector::BijectorSpec;
use crate::error::{FlowError, FlowResult};

/// Format tag written into every bundle.
pub const BUNDLE_FORMAT: &str = "norm-flow-rs/v1";

/// Flat dump of one parameter tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorData {
    /// Tensor shape, row-major.
    pub shape: Vec<usize>,
    /// Flattened f32 values.
    pub data: Vec<f32>,
}

impl TensorData {
    /// Dump a tensor to its flat representation.
    pub fn from_tensor(tensor: &Tensor) -> FlowResult<Self> {
        Ok(Self {
            shape: tensor.dims().to_vec(),
            data: tensor.flatten_all()?.to_vec1::<f32>()?,
        })
    }

    /// Rebuild the tensor on the given device.
    pub fn to_tensor(&self, device: &Device) -> FlowResult<Tensor> {
        Ok(Tensor::from_vec(self.data.clone(), self.shape.as_slice(), device)?)
    }
}

/// The persisted state of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowBundle {
    /// Format tag, always [`BUNDLE_FORMAT`].
    pub format: String,
    /// Dimensionality of the modeled distribution.
    pub input_dim: usize,
    /// Opaque caller metadata, untouched by the core.
    pub info: Option<serde_json::Value>,
    /// Bijector descriptor; regenerates the transform maps at restore time.
    pub bijector: BijectorSpec,
    /// Current bijector parameters.
    pub params: Vec<TensorData>,
}

impl FlowBundle {
    /// Assemble a bundle from live flow state.
    pub fn new(
        input_dim: usize,
        info: Option<serde_json::Value>,
        bijector: BijectorSpec,
        params: &[Tensor],
    ) -> FlowResult<Self> {
        let params = params
            .iter()
            .map(TensorData::from_tensor)
            .collect::<FlowResult<Vec<_>>>()?;
        Ok(Self {
            format: BUNDLE_FORMAT.to_string(),
            input_dim,
            info,
            bijector,
            params,
        })
    }

    /// Write the bundle to `path`, overwriting any existing content.
    pub fn save(&self, path: impl AsRef<Path>) -> FlowResult<()> {
        let file = File::create(path.as_ref())?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    /// Read a bundle from `path`.
    pub fn load(path: impl AsRef<Path>) -> FlowResult<Self> {
        let file = File::open(path.as_ref())?;
        let bundle: Self = serde_json::from_reader(BufReader::new(file))?;
        if bundle.format != BUNDLE_FORMAT {
            return Err(FlowError::config(format!(
                "unsupported bundle format `{}` (expected `{BUNDLE_FORMAT}`)",
                bundle.format
            )));
        }
        Ok(bundle)
    }

    /// Rebuild the parameter tensors on the given device.
    pub fn param_tensors(&self, device: &Device) -> FlowResult<Vec<Tensor>> {
        self.params.iter().map(|p| p.to_tensor(device)).collect()
    }
}
