//! Backend abstraction: the opaque executor invoked once per request.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};
use crate::memory::Buffer;
use crate::model::{ModelConfig, TensorSpec};

/// One assembled input: the whole batch, contiguous.
#[derive(Debug, Clone)]
pub struct InputTensor {
    pub spec: TensorSpec,
    pub data: Bytes,
}

impl InputTensor {
    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

/// A pre-allocated output buffer the backend fills in place.
///
/// The buffer itself stays owned by the engine; backends only see its bytes.
#[derive(Debug)]
pub struct OutputSlot {
    pub(crate) spec: TensorSpec,
    pub(crate) buffer: Buffer,
}

impl OutputSlot {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buffer.as_mut_slice()
    }
}

/// Everything a backend sees for one request.
#[derive(Debug)]
pub struct ExecutionBatch {
    pub model: Arc<ModelConfig>,
    pub version: i64,
    pub batch_size: u32,
    pub inputs: Vec<InputTensor>,
    pub(crate) outputs: Vec<OutputSlot>,
}

impl ExecutionBatch {
    pub fn input(&self, name: &str) -> Option<&InputTensor> {
        self.inputs.iter().find(|t| t.name() == name)
    }

    /// Output slots in the order the model declares them.
    pub fn outputs(&self) -> &[OutputSlot] {
        &self.outputs
    }

    pub fn outputs_mut(&mut self) -> &mut [OutputSlot] {
        &mut self.outputs
    }

    pub fn output_mut(&mut self, name: &str) -> Option<&mut OutputSlot> {
        self.outputs.iter_mut().find(|t| t.name() == name)
    }
}

/// Per-framework execution engine.
///
/// `execute` consumes the assembled inputs and fills every output slot.
/// An `Err` is reported through the response status, not to the submitter.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn execute(&self, batch: &mut ExecutionBatch) -> Result<()>;
}

/// Creates a backend for one version of a model.
pub trait BackendFactory: Send + Sync {
    fn create(&self, config: &ModelConfig, version: i64) -> Result<Arc<dyn Backend>>;
}

impl<F> BackendFactory for F
where
    F: Fn(&ModelConfig, i64) -> Result<Arc<dyn Backend>> + Send + Sync,
{
    fn create(&self, config: &ModelConfig, version: i64) -> Result<Arc<dyn Backend>> {
        self(config, version)
    }
}

/// Copies input *i* to output *i*.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityBackend;

#[async_trait]
impl Backend for IdentityBackend {
    async fn execute(&self, batch: &mut ExecutionBatch) -> Result<()> {
        if batch.inputs.len() < batch.outputs.len() {
            return Err(Error::invalid_arg(format!(
                "identity model '{}' has {} inputs for {} outputs",
                batch.model.name,
                batch.inputs.len(),
                batch.outputs.len()
            )));
        }

        for (input, output) in batch.inputs.iter().zip(batch.outputs.iter_mut()) {
            if output.len() != input.data.len() {
                return Err(Error::invalid_arg(format!(
                    "identity output '{}' holds {} bytes but input '{}' has {}",
                    output.spec.name,
                    output.len(),
                    input.spec.name,
                    input.data.len()
                )));
            }
            output.as_mut_slice().copy_from_slice(&input.data);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::memory::MemoryDomain;
    use crate::model::DataType;

    fn batch(input: &[u8], output_size: usize) -> ExecutionBatch {
        let model = ModelConfig::new("identity", 4)
            .with_input(TensorSpec::new("in", DataType::Uint8, vec![2]))
            .with_output(TensorSpec::new("out", DataType::Uint8, vec![2]));
        ExecutionBatch {
            inputs: vec![InputTensor {
                spec: model.inputs[0].clone(),
                data: Bytes::copy_from_slice(input),
            }],
            outputs: vec![OutputSlot {
                spec: model.outputs[0].clone(),
                buffer: Buffer::zeroed(MemoryDomain::Host, 0, output_size),
            }],
            model: Arc::new(model),
            version: 1,
            batch_size: 2,
        }
    }

    #[tokio::test]
    async fn test_identity_copies() {
        let mut batch = batch(&[1, 2, 3, 4], 4);
        IdentityBackend.execute(&mut batch).await.unwrap();
        assert_eq!(batch.output_mut("out").unwrap().as_slice(), &[1, 2, 3, 4]);
        assert_eq!(batch.input("in").unwrap().data.len(), 4);
    }

    #[tokio::test]
    async fn test_identity_size_mismatch() {
        let mut batch = batch(&[1, 2, 3, 4], 2);
        let err = IdentityBackend.execute(&mut batch).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArg);
    }

    #[test]
    fn test_closure_factory() {
        let factory = |_: &ModelConfig, _: i64| -> Result<Arc<dyn Backend>> { Ok(Arc::new(IdentityBackend)) };
        let config = ModelConfig::new("m", 0);
        assert!(factory.create(&config, 1).is_ok());
    }
}
