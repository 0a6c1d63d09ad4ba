//! Inference execution core.
//!
//! Loads models from a repository, accepts requests through
//! [`InferenceRequestProvider`], executes them asynchronously on pluggable
//! [`Backend`]s and hands results back as [`InferenceResponse`]s. Tensors can
//! move through named shared-memory handles instead of inline buffers.

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod model;
pub mod repository;
pub mod request;
pub mod response;
pub mod server;
pub mod shm;
pub mod status;

// Re-export commonly used types
pub use backend::{Backend, BackendFactory, ExecutionBatch, IdentityBackend, InputTensor, OutputSlot};
pub use config::{AcceleratorPool, LoggingOptions, MemoryOptions, ServerOptions};
pub use error::{Error, ErrorCode, Result};
pub use memory::{Buffer, HostAllocator, MemoryAllocator, MemoryDomain, PooledAllocator};
pub use model::{DataType, ModelConfig, ModelVersion, OutputPlacement, TensorSpec};
pub use repository::{InMemoryRepository, ModelRepository, RepositoryModel};
pub use request::{InferRequestHeader, InferenceRequestProvider, SharedMemoryRef};
pub use response::{InferResponseHeader, InferenceResponse, OutputHeader};
pub use server::{Server, ServerBuilder, ServerHandle};
pub use shm::{SharedMemoryBlock, SharedMemoryManager, SharedMemoryRegion, SharedMemoryStatus};
pub use status::{ModelStatus, SerializedBlob, ServerState, ServerStatus};
