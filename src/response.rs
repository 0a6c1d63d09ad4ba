//! Inference response.
//!
//! A response owns the output buffers produced for one request. Dropping it
//! returns every buffer to the allocator that produced it, with the same
//! domain and region the buffer was allocated under.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::memory::{Buffer, MemoryAllocator};
use crate::request::SharedMemoryRef;
use crate::status::SerializedBlob;

/// Per-output entry of the response header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputHeader {
    pub name: String,
    pub byte_size: usize,
    /// Handle the output was written to, when delivered through shared memory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_memory: Option<String>,
}

/// Metadata serialized into [`InferenceResponse::header`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferResponseHeader {
    pub id: u64,
    pub model_name: String,
    pub model_version: i64,
    pub batch_size: u32,
    pub outputs: Vec<OutputHeader>,
    pub compute_ns: u64,
}

pub(crate) enum OutputStorage {
    Buffer(Buffer),
    SharedMemory(SharedMemoryRef),
}

/// Return a buffer to `allocator`, logging instead of failing.
pub(crate) fn release_buffer(allocator: &dyn MemoryAllocator, name: &str, buffer: Buffer) {
    let byte_size = buffer.len();
    let domain = buffer.domain();
    let region_id = buffer.region_id();
    if let Err(e) = allocator.free(buffer, byte_size, domain, region_id) {
        warn!(output = name, %domain, region_id, byte_size, "failed to free output buffer: {}", e);
    }
}

/// Result of one inference request.
pub struct InferenceResponse {
    status: Result<()>,
    header: SerializedBlob,
    batch_size: u32,
    outputs: Vec<(String, OutputStorage)>,
    allocator: Arc<dyn MemoryAllocator>,
}

impl InferenceResponse {
    pub(crate) fn new(
        status: Result<()>,
        header: SerializedBlob,
        batch_size: u32,
        outputs: Vec<(String, OutputStorage)>,
        allocator: Arc<dyn MemoryAllocator>,
    ) -> Self {
        Self {
            status,
            header,
            batch_size,
            outputs,
            allocator,
        }
    }

    /// Success, or the error the request failed with.
    pub fn status(&self) -> Result<()> {
        self.status.clone()
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    pub fn header(&self) -> &SerializedBlob {
        &self.header
    }

    /// Decode the header blob.
    pub fn decode_header(&self) -> Result<InferResponseHeader> {
        self.header.decode()
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|(name, _)| name.as_str())
    }

    /// Bytes of output `name` for the whole batch.
    pub fn output_data(&self, name: &str) -> Result<&[u8]> {
        match self.storage(name)? {
            OutputStorage::Buffer(buffer) => Ok(buffer.as_slice()),
            OutputStorage::SharedMemory(r) => Err(Error::invalid_arg(format!(
                "output '{}' was delivered to shared memory '{}'",
                name, r.handle
            ))),
        }
    }

    /// Bytes of batch element `index` of output `name`.
    pub fn output_element(&self, name: &str, index: usize) -> Result<&[u8]> {
        let data = self.output_data(name)?;
        let batch = self.batch_size as usize;
        if index >= batch {
            return Err(Error::invalid_arg(format!(
                "batch index {} out of range for batch size {}",
                index, batch
            )));
        }
        let stride = data.len() / batch;
        Ok(&data[index * stride..(index + 1) * stride])
    }

    /// Where output `name` was written, when delivered through shared memory.
    pub fn output_shared_memory(&self, name: &str) -> Result<&SharedMemoryRef> {
        match self.storage(name)? {
            OutputStorage::SharedMemory(r) => Ok(r),
            OutputStorage::Buffer(_) => Err(Error::invalid_arg(format!(
                "output '{}' was not delivered to shared memory",
                name
            ))),
        }
    }

    fn storage(&self, name: &str) -> Result<&OutputStorage> {
        if let Err(e) = &self.status {
            return Err(e.clone());
        }
        self.outputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, storage)| storage)
            .ok_or_else(|| Error::not_found(format!("response has no output '{}'", name)))
    }
}

impl Drop for InferenceResponse {
    fn drop(&mut self) {
        for (name, storage) in self.outputs.drain(..) {
            if let OutputStorage::Buffer(buffer) = storage {
                release_buffer(self.allocator.as_ref(), &name, buffer);
            }
        }
    }
}

impl std::fmt::Debug for InferenceResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceResponse")
            .field("status", &self.status)
            .field("header", &self.header)
            .field("batch_size", &self.batch_size)
            .field("outputs", &self.output_names().collect::<Vec<_>>())
            .finish()
    }
}
