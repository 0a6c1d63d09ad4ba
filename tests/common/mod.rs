//! Shared fixtures for server integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tensorserve_core::{
    Backend, DataType, Error, ExecutionBatch, IdentityBackend, InMemoryRepository, ModelConfig,
    Result, Server, ServerOptions, TensorSpec,
};
use tokio::sync::Semaphore;

/// Scores per batch element produced by [`ScoreBackend`]
pub const SCORES: usize = 5;

/// Options pointing shared memory at `dir` with a short exit timeout.
pub fn options(dir: &Path) -> ServerOptions {
    ServerOptions::default()
        .with_shared_memory_dir(dir)
        .with_exit_timeout_secs(5)
        .with_execution_slots(4)
}

/// Image classifier: FP32 [3, 224, 224] in, FP32 [5] out.
pub fn image_model(name: &str, max_batch_size: u32) -> ModelConfig {
    ModelConfig::new(name, max_batch_size)
        .with_input(TensorSpec::new("image", DataType::Fp32, vec![3, 224, 224]))
        .with_output(TensorSpec::new("scores", DataType::Fp32, vec![SCORES as i64]))
}

/// Two-input, two-output model for the identity backend.
pub fn identity_model(name: &str, elements: i64) -> ModelConfig {
    ModelConfig::new(name, 8)
        .with_input(TensorSpec::new("in0", DataType::Int32, vec![elements]))
        .with_input(TensorSpec::new("in1", DataType::Int32, vec![elements]))
        .with_output(TensorSpec::new("out0", DataType::Int32, vec![elements]))
        .with_output(TensorSpec::new("out1", DataType::Int32, vec![elements]))
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn f32_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn i32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// One image instance whose every pixel is `fill`.
pub fn image(fill: f32) -> Vec<u8> {
    f32_bytes(&vec![fill; 3 * 224 * 224])
}

/// Writes `[x, x + 1, ..., x + 4]` for each batch element, where `x` is the
/// first float of that element's input.
#[derive(Debug, Default)]
pub struct ScoreBackend {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Backend for ScoreBackend {
    async fn execute(&self, batch: &mut ExecutionBatch) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let input = batch
            .input("image")
            .ok_or_else(|| Error::internal("missing input"))?
            .data
            .clone();
        let batch_size = batch.batch_size as usize;
        let stride = input.len() / batch_size;

        let out = batch
            .output_mut("scores")
            .ok_or_else(|| Error::internal("missing output"))?
            .as_mut_slice();
        for element in 0..batch_size {
            let x = f32_values(&input[element * stride..element * stride + 4])[0];
            let scores: Vec<f32> = (0..SCORES).map(|k| x + k as f32).collect();
            let start = element * SCORES * 4;
            out[start..start + SCORES * 4].copy_from_slice(&f32_bytes(&scores));
        }
        Ok(())
    }
}

/// Always fails with `INTERNAL`.
pub struct FailingBackend;

#[async_trait]
impl Backend for FailingBackend {
    async fn execute(&self, _batch: &mut ExecutionBatch) -> Result<()> {
        Err(Error::internal("backend exploded"))
    }
}

/// Panics during execution.
pub struct PanickingBackend;

#[async_trait]
impl Backend for PanickingBackend {
    async fn execute(&self, _batch: &mut ExecutionBatch) -> Result<()> {
        panic!("backend panicked on purpose");
    }
}

/// Identity backend that hands each output the other output's buffer.
pub struct SwappingBackend;

#[async_trait]
impl Backend for SwappingBackend {
    async fn execute(&self, batch: &mut ExecutionBatch) -> Result<()> {
        IdentityBackend.execute(batch).await?;
        batch.outputs_mut().swap(0, 1);
        Ok(())
    }
}

/// Identity backend that waits for a permit before executing.
pub struct GatedBackend {
    pub gate: Arc<Semaphore>,
}

#[async_trait]
impl Backend for GatedBackend {
    async fn execute(&self, batch: &mut ExecutionBatch) -> Result<()> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| Error::unavailable("gate closed"))?;
        permit.forget();
        IdentityBackend.execute(batch).await
    }
}

/// Build a server over `repository` that hands every model `backend`.
pub fn server_with(
    options: ServerOptions,
    repository: Arc<InMemoryRepository>,
    backend: Arc<dyn Backend>,
) -> Result<Server> {
    let factory = move |_: &ModelConfig, _: i64| -> Result<Arc<dyn Backend>> { Ok(Arc::clone(&backend)) };
    Server::builder(options)
        .repository(repository)
        .backend_factory(Arc::new(factory))
        .build()
}
