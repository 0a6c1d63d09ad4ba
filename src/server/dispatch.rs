//! Request preparation and execution.
//!
//! `prepare` runs on the submitting thread and rejects anything that can be
//! checked without executing. `execute` runs on a worker task, and every
//! failure it meets becomes the status of the response it returns.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use tracing::{debug, warn};

use super::models::LoadedModel;
use super::ServerShared;
use crate::backend::{ExecutionBatch, InputTensor, OutputSlot};
use crate::error::{Error, Result};
use crate::memory::MemoryAllocator;
use crate::model::TensorSpec;
use crate::request::{InferenceRequestProvider, InputSource, SharedMemoryRef};
use crate::response::{
    release_buffer, InferResponseHeader, InferenceResponse, OutputHeader, OutputStorage,
};
use crate::shm::SharedMemoryBlock;
use crate::status::SerializedBlob;

enum InputPayload {
    Buffers(Vec<Bytes>),
    SharedMemory(Arc<SharedMemoryBlock>, SharedMemoryRef),
}

struct PreparedInput {
    spec: TensorSpec,
    byte_size: usize,
    payload: InputPayload,
}

struct PreparedOutput {
    spec: TensorSpec,
    byte_size: usize,
    destination: Option<(Arc<SharedMemoryBlock>, SharedMemoryRef)>,
}

/// A validated request detached from its provider.
pub(crate) struct PreparedRequest {
    id: u64,
    model: Arc<LoadedModel>,
    batch_size: u32,
    inputs: Vec<PreparedInput>,
    outputs: Vec<PreparedOutput>,
}

impl PreparedRequest {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn model_name(&self) -> &str {
        &self.model.config().name
    }

    pub(crate) fn summary(&self) -> RequestSummary {
        RequestSummary {
            id: self.id,
            model: Arc::clone(&self.model),
            batch_size: self.batch_size,
        }
    }
}

/// What a response header needs when the request itself is gone.
pub(crate) struct RequestSummary {
    pub(crate) id: u64,
    model: Arc<LoadedModel>,
    batch_size: u32,
}

fn to_usize(name: &str, size: u64) -> Result<usize> {
    usize::try_from(size).map_err(|_| {
        Error::invalid_arg(format!("tensor '{}' of {} bytes exceeds addressable memory", name, size))
    })
}

fn resolve_block(
    shared: &ServerShared,
    tensor: &str,
    r: &SharedMemoryRef,
) -> Result<Arc<SharedMemoryBlock>> {
    let block = shared.shared_memory.get(&r.handle)?;
    match r.offset.checked_add(r.byte_size) {
        Some(end) if end <= block.byte_size() => Ok(block),
        _ => Err(Error::invalid_arg(format!(
            "tensor '{}' range {}+{} exceeds shared memory '{}' of {} bytes",
            tensor,
            r.offset,
            r.byte_size,
            r.handle,
            block.byte_size()
        ))),
    }
}

/// Validate a provider and snapshot everything execution needs.
pub(crate) fn prepare(
    shared: &ServerShared,
    provider: &InferenceRequestProvider,
) -> Result<PreparedRequest> {
    provider.validate()?;

    let mut inputs = Vec::new();
    for binding in provider.inputs() {
        let byte_size = to_usize(&binding.spec.name, binding.expected)?;
        let payload = match &binding.source {
            InputSource::Buffers(buffers) => InputPayload::Buffers(buffers.clone()),
            InputSource::SharedMemory(r) => {
                InputPayload::SharedMemory(resolve_block(shared, &binding.spec.name, r)?, r.clone())
            }
        };
        inputs.push(PreparedInput {
            spec: binding.spec.clone(),
            byte_size,
            payload,
        });
    }

    let mut outputs = Vec::new();
    for binding in provider.outputs() {
        let destination = match &binding.shared_memory {
            Some(r) => Some((resolve_block(shared, &binding.spec.name, r)?, r.clone())),
            None => None,
        };
        outputs.push(PreparedOutput {
            spec: binding.spec.clone(),
            byte_size: to_usize(&binding.spec.name, binding.expected)?,
            destination,
        });
    }

    Ok(PreparedRequest {
        id: provider.header().id,
        model: Arc::clone(&provider.model),
        batch_size: provider.header().batch_size,
        inputs,
        outputs,
    })
}

fn gather(input: PreparedInput) -> Result<InputTensor> {
    let data = match input.payload {
        InputPayload::Buffers(mut buffers) if buffers.len() == 1 => buffers.remove(0),
        InputPayload::Buffers(buffers) => {
            let mut data = BytesMut::with_capacity(input.byte_size);
            for buffer in &buffers {
                data.extend_from_slice(buffer);
            }
            data.freeze()
        }
        InputPayload::SharedMemory(block, r) => block.read(r.offset, r.byte_size)?,
    };
    Ok(InputTensor {
        spec: input.spec,
        data,
    })
}

fn release_slots(allocator: &dyn MemoryAllocator, slots: Vec<OutputSlot>) {
    for slot in slots {
        release_buffer(allocator, &slot.spec.name, slot.buffer);
    }
}

/// Slots must come back in allocation order, each holding the buffer it was given.
fn check_slots(model: &LoadedModel, slots: &[OutputSlot], outputs: &[PreparedOutput]) -> Result<()> {
    let placement = model.config().placement;
    if slots.len() != outputs.len() {
        return Err(Error::internal(format!(
            "backend for model '{}' returned {} output slots, expected {}",
            model.config().name,
            slots.len(),
            outputs.len()
        )));
    }
    for (slot, output) in slots.iter().zip(outputs) {
        let buffer = &slot.buffer;
        if slot.spec.name != output.spec.name
            || buffer.len() != output.byte_size
            || buffer.domain() != placement.domain
            || buffer.region_id() != placement.region_id
        {
            return Err(Error::internal(format!(
                "backend for model '{}' moved output '{}': slot holds '{}' with {:?}",
                model.config().name,
                output.spec.name,
                slot.spec.name,
                buffer
            )));
        }
    }
    Ok(())
}

async fn run(
    shared: &ServerShared,
    model: &LoadedModel,
    batch_size: u32,
    inputs: Vec<PreparedInput>,
    outputs: &[PreparedOutput],
) -> Result<Vec<(String, OutputStorage)>> {
    let allocator = shared.allocator.as_ref();
    let inputs = inputs.into_iter().map(gather).collect::<Result<Vec<_>>>()?;

    let placement = model.config().placement;
    let mut slots = Vec::with_capacity(outputs.len());
    for output in outputs {
        match allocator.allocate(placement.domain, placement.region_id, output.byte_size) {
            Ok(buffer) if buffer.len() == output.byte_size => slots.push(OutputSlot {
                spec: output.spec.clone(),
                buffer,
            }),
            Ok(buffer) => {
                let len = buffer.len();
                release_buffer(allocator, &output.spec.name, buffer);
                release_slots(allocator, slots);
                return Err(Error::internal(format!(
                    "allocator returned {} bytes for output '{}', expected {}",
                    len, output.spec.name, output.byte_size
                )));
            }
            Err(e) => {
                release_slots(allocator, slots);
                return Err(e);
            }
        }
    }

    let mut batch = ExecutionBatch {
        model: Arc::clone(model.config()),
        version: model.version(),
        batch_size,
        inputs,
        outputs: slots,
    };

    let executed = AssertUnwindSafe(model.backend().execute(&mut batch))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            Err(Error::internal(format!(
                "backend for model '{}' panicked",
                model.config().name
            )))
        });
    if let Err(e) = executed.and_then(|()| check_slots(model, &batch.outputs, outputs)) {
        release_slots(allocator, batch.outputs);
        return Err(e);
    }

    let mut delivered = Vec::with_capacity(outputs.len());
    let mut failure = None;
    for (slot, output) in batch.outputs.into_iter().zip(outputs) {
        match &output.destination {
            Some((block, r)) => {
                if failure.is_none() {
                    if let Err(e) = block.write(r.offset, slot.buffer.as_slice()) {
                        failure = Some(e);
                    }
                }
                release_buffer(allocator, &slot.spec.name, slot.buffer);
                delivered.push((slot.spec.name, OutputStorage::SharedMemory(r.clone())));
            }
            None => delivered.push((slot.spec.name, OutputStorage::Buffer(slot.buffer))),
        }
    }

    if let Some(e) = failure {
        for (name, storage) in delivered {
            if let OutputStorage::Buffer(buffer) = storage {
                release_buffer(allocator, &name, buffer);
            }
        }
        return Err(e);
    }
    Ok(delivered)
}

/// Execute a prepared request and build its response.
pub(crate) async fn execute(shared: &ServerShared, request: PreparedRequest) -> InferenceResponse {
    let PreparedRequest {
        id,
        model,
        batch_size,
        inputs,
        outputs,
    } = request;

    debug!(id, model = %model.config().name, version = model.version(), batch_size, "executing request");
    let started = Instant::now();
    let result = run(shared, &model, batch_size, inputs, &outputs).await;
    let compute_ns = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
    model.stats().record(result.is_ok(), compute_ns);

    let (status, delivered) = match result {
        Ok(delivered) => (Ok(()), delivered),
        Err(e) => {
            warn!(id, model = %model.config().name, "request failed: {}", e);
            (Err(e), Vec::new())
        }
    };

    let header = InferResponseHeader {
        id,
        model_name: model.config().name.clone(),
        model_version: model.version(),
        batch_size,
        outputs: delivered
            .iter()
            .map(|(name, storage)| match storage {
                OutputStorage::Buffer(buffer) => OutputHeader {
                    name: name.clone(),
                    byte_size: buffer.len(),
                    shared_memory: None,
                },
                OutputStorage::SharedMemory(r) => OutputHeader {
                    name: name.clone(),
                    byte_size: r.byte_size,
                    shared_memory: Some(r.handle.clone()),
                },
            })
            .collect(),
        compute_ns,
    };

    finish(shared, status, &header, batch_size, delivered)
}

/// Response for a request that never reached its backend.
pub(crate) fn reject(shared: &ServerShared, request: &RequestSummary, error: Error) -> InferenceResponse {
    let header = InferResponseHeader {
        id: request.id,
        model_name: request.model.config().name.clone(),
        model_version: request.model.version(),
        batch_size: request.batch_size,
        outputs: Vec::new(),
        compute_ns: 0,
    };
    finish(shared, Err(error), &header, request.batch_size, Vec::new())
}

fn finish(
    shared: &ServerShared,
    status: Result<()>,
    header: &InferResponseHeader,
    batch_size: u32,
    delivered: Vec<(String, OutputStorage)>,
) -> InferenceResponse {
    let (status, blob) = match SerializedBlob::from_json(header) {
        Ok(blob) => (status, blob),
        Err(e) => (status.and(Err(e)), SerializedBlob::default()),
    };
    InferenceResponse::new(status, blob, batch_size, delivered, Arc::clone(&shared.allocator))
}
