//! Model metadata consumed by the request provider and the engine.
//!
//! Parsing model configuration from a repository is the job of the
//! repository implementation; this module only defines the shape the core
//! needs: tensor names, element types, fixed dimensions and batching limits.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::MemoryDomain;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Bool,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Fp16,
    Fp32,
    Fp64,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn byte_size(&self) -> usize {
        match self {
            Self::Bool | Self::Uint8 | Self::Int8 => 1,
            Self::Uint16 | Self::Int16 | Self::Fp16 => 2,
            Self::Uint32 | Self::Int32 | Self::Fp32 => 4,
            Self::Uint64 | Self::Int64 | Self::Fp64 => 8,
        }
    }
}

/// Name, element type and per-instance shape of a model input or output.
///
/// `dims` excludes the batch dimension. A dimension of `-1` marks a
/// variable-size dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub data_type: DataType,
    pub dims: Vec<i64>,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, data_type: DataType, dims: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            data_type,
            dims,
        }
    }

    /// Bytes occupied by one batch instance of this tensor.
    pub fn instance_byte_size(&self) -> Result<u64> {
        let mut elements: u64 = 1;
        for &dim in &self.dims {
            if dim == -1 {
                return Err(Error::unsupported(format!(
                    "variable-size dimension in tensor '{}' is not supported",
                    self.name
                )));
            }
            if dim < 0 {
                return Err(Error::invalid_arg(format!(
                    "tensor '{}' has invalid dimension {}",
                    self.name, dim
                )));
            }
            elements = elements.checked_mul(dim as u64).ok_or_else(|| {
                Error::invalid_arg(format!("tensor '{}' is too large", self.name))
            })?;
        }
        elements
            .checked_mul(self.data_type.byte_size() as u64)
            .ok_or_else(|| Error::invalid_arg(format!("tensor '{}' is too large", self.name)))
    }

    /// Bytes occupied by the whole batch of this tensor.
    pub fn batch_byte_size(&self, batch_size: u32) -> Result<u64> {
        self.instance_byte_size()?
            .checked_mul(batch_size as u64)
            .ok_or_else(|| Error::invalid_arg(format!("tensor '{}' batch is too large", self.name)))
    }
}

/// Where the engine allocates output buffers for a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPlacement {
    pub domain: MemoryDomain,
    #[serde(default)]
    pub region_id: i64,
}

/// Metadata for one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    /// Largest batch a request may carry; 0 means batching is unsupported
    #[serde(default)]
    pub max_batch_size: u32,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    #[serde(default)]
    pub placement: OutputPlacement,
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, max_batch_size: u32) -> Self {
        Self {
            name: name.into(),
            max_batch_size,
            inputs: Vec::new(),
            outputs: Vec::new(),
            placement: OutputPlacement::default(),
        }
    }

    pub fn with_input(mut self, spec: TensorSpec) -> Self {
        self.inputs.push(spec);
        self
    }

    pub fn with_output(mut self, spec: TensorSpec) -> Self {
        self.outputs.push(spec);
        self
    }

    pub fn with_placement(mut self, domain: MemoryDomain, region_id: i64) -> Self {
        self.placement = OutputPlacement { domain, region_id };
        self
    }

    pub fn input(&self, name: &str) -> Option<&TensorSpec> {
        self.inputs.iter().find(|spec| spec.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&TensorSpec> {
        self.outputs.iter().find(|spec| spec.name == name)
    }

    /// Check structural consistency of the configuration.
    ///
    /// Variable-size dimensions are accepted here and rejected when a request
    /// is built against the model.
    pub fn validate(&self, strict: bool) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid_arg("model name must not be empty"));
        }
        if strict && (self.inputs.is_empty() || self.outputs.is_empty()) {
            return Err(Error::invalid_arg(format!(
                "model '{}' must declare at least one input and one output",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for spec in self.inputs.iter().chain(self.outputs.iter()) {
            if spec.name.is_empty() {
                return Err(Error::invalid_arg(format!(
                    "model '{}' has an unnamed tensor",
                    self.name
                )));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(Error::invalid_arg(format!(
                    "model '{}' declares tensor '{}' more than once",
                    self.name, spec.name
                )));
            }
            if spec.dims.iter().any(|&d| d < -1) {
                return Err(Error::invalid_arg(format!(
                    "model '{}' tensor '{}' has a negative dimension",
                    self.name, spec.name
                )));
            }
        }
        Ok(())
    }
}

/// Version selector for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelVersion {
    /// The highest version that is ready to serve
    Latest,
    Specific(i64),
}

impl From<i64> for ModelVersion {
    fn from(version: i64) -> Self {
        if version < 0 {
            Self::Latest
        } else {
            Self::Specific(version)
        }
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Specific(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn image_model() -> ModelConfig {
        ModelConfig::new("resnet", 8)
            .with_input(TensorSpec::new("image", DataType::Uint8, vec![3, 224, 224]))
            .with_output(TensorSpec::new("probs", DataType::Fp32, vec![1000]))
    }

    #[test]
    fn test_byte_sizes() {
        let config = image_model();
        let input = config.input("image").unwrap();
        assert_eq!(input.instance_byte_size().unwrap(), 150528);
        assert_eq!(input.batch_byte_size(4).unwrap(), 602112);

        let output = config.output("probs").unwrap();
        assert_eq!(output.batch_byte_size(2).unwrap(), 8000);
    }

    #[test]
    fn test_variable_dimension_unsupported() {
        let spec = TensorSpec::new("tokens", DataType::Int64, vec![-1]);
        assert_eq!(spec.instance_byte_size().unwrap_err().code(), ErrorCode::Unsupported);
    }

    #[test]
    fn test_validate() {
        assert!(image_model().validate(true).is_ok());

        let empty = ModelConfig::new("empty", 0);
        assert!(empty.validate(false).is_ok());
        assert_eq!(empty.validate(true).unwrap_err().code(), ErrorCode::InvalidArg);

        let duplicate = image_model()
            .with_output(TensorSpec::new("image", DataType::Fp32, vec![1]));
        assert_eq!(duplicate.validate(true).unwrap_err().code(), ErrorCode::InvalidArg);

        let negative = image_model()
            .with_output(TensorSpec::new("bad", DataType::Fp32, vec![-3]));
        assert_eq!(negative.validate(true).unwrap_err().code(), ErrorCode::InvalidArg);
    }

    #[test]
    fn test_version_sentinel() {
        assert_eq!(ModelVersion::from(-1), ModelVersion::Latest);
        assert_eq!(ModelVersion::from(3), ModelVersion::Specific(3));
    }

    #[test]
    fn test_config_json() {
        let json = r#"{
            "name": "classifier",
            "inputs": [{"name": "x", "data_type": "FP32", "dims": [4]}],
            "outputs": [{"name": "y", "data_type": "FP32", "dims": [2]}],
            "placement": {"domain": "accelerator", "region_id": 1}
        }"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_batch_size, 0);
        assert_eq!(config.placement.domain, MemoryDomain::Accelerator);
        assert_eq!(config.placement.region_id, 1);
    }
}
