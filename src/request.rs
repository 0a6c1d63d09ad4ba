//! Inference request provider.
//!
//! A provider collects the input tensors of one request. Buffers appended to
//! an input accumulate in order and stay separate until the engine consumes
//! them; their summed size must equal the input's batch byte size before the
//! provider can be submitted. The size contract is enforced at submission, so
//! a partially filled provider is a normal intermediate state.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{ModelVersion, TensorSpec};
use crate::server::{LoadedModel, Server, ServerShared};

/// Request metadata supplied at provider creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferRequestHeader {
    /// Caller-chosen id echoed in the response header
    #[serde(default)]
    pub id: u64,
    pub batch_size: u32,
    /// Outputs to produce; empty means every model output
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl InferRequestHeader {
    pub fn new(batch_size: u32) -> Self {
        Self {
            id: 0,
            batch_size,
            outputs: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }
}

/// A byte range of a registered shared-memory handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedMemoryRef {
    pub handle: String,
    pub offset: usize,
    pub byte_size: usize,
}

#[derive(Debug, Clone)]
pub(crate) enum InputSource {
    Buffers(Vec<Bytes>),
    SharedMemory(SharedMemoryRef),
}

#[derive(Debug, Clone)]
pub(crate) struct InputBinding {
    pub(crate) spec: TensorSpec,
    pub(crate) expected: u64,
    pub(crate) source: InputSource,
}

#[derive(Debug, Clone)]
pub(crate) struct OutputBinding {
    pub(crate) spec: TensorSpec,
    pub(crate) expected: u64,
    pub(crate) shared_memory: Option<SharedMemoryRef>,
}

/// Input tensors and output bindings for one inference request.
pub struct InferenceRequestProvider {
    pub(crate) server: Arc<ServerShared>,
    pub(crate) model: Arc<LoadedModel>,
    header: InferRequestHeader,
    inputs: BTreeMap<String, InputBinding>,
    outputs: Vec<OutputBinding>,
}

impl InferenceRequestProvider {
    /// Create a provider for `model_name` at `version`; a negative version
    /// selects the most recent ready one.
    pub fn new(
        server: &Server,
        model_name: &str,
        version: i64,
        header: InferRequestHeader,
    ) -> Result<Self> {
        let shared = server.shared();
        let model = shared.resolve_model(model_name, ModelVersion::from(version))?;
        let config = model.config();
        let batch_size = header.batch_size;

        if batch_size == 0 {
            return Err(Error::invalid_arg("batch size must be at least 1"));
        }
        if config.max_batch_size == 0 {
            if batch_size != 1 {
                return Err(Error::invalid_arg(format!(
                    "batching not supported for model '{}'",
                    config.name
                )));
            }
        } else if batch_size > config.max_batch_size {
            return Err(Error::invalid_arg(format!(
                "batch size {} exceeds maximum {} for model '{}'",
                batch_size, config.max_batch_size, config.name
            )));
        }

        let mut inputs = BTreeMap::new();
        for spec in &config.inputs {
            inputs.insert(
                spec.name.clone(),
                InputBinding {
                    spec: spec.clone(),
                    expected: spec.batch_byte_size(batch_size)?,
                    source: InputSource::Buffers(Vec::new()),
                },
            );
        }

        let mut outputs = Vec::new();
        if header.outputs.is_empty() {
            for spec in &config.outputs {
                outputs.push(OutputBinding {
                    spec: spec.clone(),
                    expected: spec.batch_byte_size(batch_size)?,
                    shared_memory: None,
                });
            }
        } else {
            let mut seen = HashSet::new();
            for name in &header.outputs {
                let spec = config.output(name).ok_or_else(|| {
                    Error::invalid_arg(format!(
                        "model '{}' has no output '{}'",
                        config.name, name
                    ))
                })?;
                if !seen.insert(name.as_str()) {
                    return Err(Error::invalid_arg(format!(
                        "output '{}' requested more than once",
                        name
                    )));
                }
                outputs.push(OutputBinding {
                    spec: spec.clone(),
                    expected: spec.batch_byte_size(batch_size)?,
                    shared_memory: None,
                });
            }
        }

        Ok(Self {
            server: Arc::clone(shared),
            model,
            header,
            inputs,
            outputs,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model.config().name
    }

    /// The concrete version the provider was resolved to.
    pub fn model_version(&self) -> i64 {
        self.model.version()
    }

    pub fn header(&self) -> &InferRequestHeader {
        &self.header
    }

    /// Total bytes expected for input `name` across the whole batch.
    pub fn input_batch_byte_size(&self, name: &str) -> Result<u64> {
        Ok(self.input(name)?.expected)
    }

    /// Bytes appended so far to input `name`.
    pub fn appended_byte_size(&self, name: &str) -> Result<u64> {
        Ok(match &self.input(name)?.source {
            InputSource::Buffers(buffers) => buffers.iter().map(|b| b.len() as u64).sum(),
            InputSource::SharedMemory(r) => r.byte_size as u64,
        })
    }

    /// Append a buffer to input `name`, sharing it by reference.
    pub fn append_input_data(&mut self, name: &str, data: impl Into<Bytes>) -> Result<()> {
        let binding = self.input_mut(name)?;
        match &mut binding.source {
            InputSource::Buffers(buffers) => {
                buffers.push(data.into());
                Ok(())
            }
            InputSource::SharedMemory(r) => Err(Error::invalid_arg(format!(
                "input '{}' is bound to shared memory '{}'",
                name, r.handle
            ))),
        }
    }

    /// Append a copy of `data` to input `name`.
    pub fn append_input_copy(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.append_input_data(name, Bytes::copy_from_slice(data))
    }

    /// Take input `name` from a registered shared-memory handle instead of
    /// appended buffers.
    pub fn set_input_shared_memory(
        &mut self,
        name: &str,
        handle: &str,
        offset: usize,
        byte_size: usize,
    ) -> Result<()> {
        let binding = self.input_mut(name)?;
        if let InputSource::Buffers(buffers) = &binding.source {
            if !buffers.is_empty() {
                return Err(Error::invalid_arg(format!(
                    "input '{}' already has appended buffers",
                    name
                )));
            }
        }
        binding.source = InputSource::SharedMemory(SharedMemoryRef {
            handle: handle.to_string(),
            offset,
            byte_size,
        });
        Ok(())
    }

    /// Deliver output `name` into a registered shared-memory handle.
    pub fn set_output_shared_memory(
        &mut self,
        name: &str,
        handle: &str,
        offset: usize,
        byte_size: usize,
    ) -> Result<()> {
        let binding = self
            .outputs
            .iter_mut()
            .find(|b| b.spec.name == name)
            .ok_or_else(|| Error::invalid_arg(format!("output '{}' is not requested", name)))?;
        binding.shared_memory = Some(SharedMemoryRef {
            handle: handle.to_string(),
            offset,
            byte_size,
        });
        Ok(())
    }

    /// Drop every appended buffer and shared-memory binding.
    pub fn reset(&mut self) {
        for binding in self.inputs.values_mut() {
            binding.source = InputSource::Buffers(Vec::new());
        }
        for binding in &mut self.outputs {
            binding.shared_memory = None;
        }
    }

    /// Check the byte-size contract of every input and shared-memory output.
    pub fn validate(&self) -> Result<()> {
        for (name, binding) in &self.inputs {
            let provided = match &binding.source {
                InputSource::Buffers(buffers) => buffers.iter().map(|b| b.len() as u64).sum(),
                InputSource::SharedMemory(r) => r.byte_size as u64,
            };
            if provided != binding.expected {
                return Err(Error::invalid_arg(format!(
                    "input '{}' expects {} bytes for batch size {}, got {}",
                    name, binding.expected, self.header.batch_size, provided
                )));
            }
        }

        for binding in &self.outputs {
            if let Some(r) = &binding.shared_memory {
                if r.byte_size as u64 != binding.expected {
                    return Err(Error::invalid_arg(format!(
                        "output '{}' expects {} bytes for batch size {}, shared memory '{}' provides {}",
                        binding.spec.name, binding.expected, self.header.batch_size, r.handle, r.byte_size
                    )));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn inputs(&self) -> impl Iterator<Item = &InputBinding> {
        self.inputs.values()
    }

    pub(crate) fn outputs(&self) -> &[OutputBinding] {
        &self.outputs
    }

    fn input(&self, name: &str) -> Result<&InputBinding> {
        self.inputs.get(name).ok_or_else(|| {
            Error::invalid_arg(format!(
                "model '{}' has no input '{}'",
                self.model.config().name,
                name
            ))
        })
    }

    fn input_mut(&mut self, name: &str) -> Result<&mut InputBinding> {
        let model = &self.model;
        self.inputs.get_mut(name).ok_or_else(|| {
            Error::invalid_arg(format!(
                "model '{}' has no input '{}'",
                model.config().name,
                name
            ))
        })
    }
}

impl std::fmt::Debug for InferenceRequestProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceRequestProvider")
            .field("model", &self.model_name())
            .field("version", &self.model_version())
            .field("header", &self.header)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}
