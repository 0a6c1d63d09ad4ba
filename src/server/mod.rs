//! Inference server lifecycle and request submission.
//!
//! A [`Server`] owns the model table, the shared-memory registry and the
//! allocator. Requests are executed on tasks spawned onto the tokio runtime
//! the server was built in, bounded by `execution_slots` permits.
//!
//! Lifecycle: `Serving` -> `Stopping` -> `Stopped`. A stopped server never
//! serves again; build a new one instead.

mod dispatch;
mod models;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendFactory};
use crate::config::ServerOptions;
use crate::error::{Error, Result};
use crate::memory::{MemoryAllocator, PooledAllocator};
use crate::model::{ModelConfig, ModelVersion};
use crate::repository::{InMemoryRepository, ModelRepository};
use crate::request::InferenceRequestProvider;
use crate::response::InferenceResponse;
use crate::shm::{SharedMemoryManager, SharedMemoryStatus};
use crate::status::{SerializedBlob, ServerState, ServerStatus};

pub use models::LoadedModel;
use models::ModelTable;

/// State shared between a server, its handles and its worker tasks.
pub(crate) struct ServerShared {
    options: ServerOptions,
    state: RwLock<ServerState>,
    models: RwLock<ModelTable>,
    reload: Mutex<()>,
    repository: Arc<dyn ModelRepository>,
    factory: Arc<dyn BackendFactory>,
    pub(crate) allocator: Arc<dyn MemoryAllocator>,
    pub(crate) shared_memory: SharedMemoryManager,
    inflight: AtomicUsize,
    drained: Notify,
    slots: Arc<Semaphore>,
    runtime: Handle,
    started: Instant,
    started_at: i64,
}

/// Decrements the in-flight count when a request finishes.
struct InflightGuard {
    shared: Arc<ServerShared>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.shared.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.drained.notify_waiters();
        }
    }
}

impl ServerShared {
    fn state(&self) -> ServerState {
        *self.state.read()
    }

    fn is_live(&self) -> bool {
        matches!(self.state(), ServerState::Serving | ServerState::Stopping)
    }

    fn is_ready(&self) -> bool {
        self.state() == ServerState::Serving
            && self.models.read().is_ready(self.options.strict_readiness)
    }

    pub(crate) fn resolve_model(&self, name: &str, version: ModelVersion) -> Result<Arc<LoadedModel>> {
        self.models.read().resolve(name, version)
    }

    /// Count a new request in, unless the server stopped accepting.
    fn begin_request(self: &Arc<Self>) -> Result<InflightGuard> {
        let state = self.state.read();
        if *state != ServerState::Serving {
            return Err(Error::unavailable(format!(
                "server '{}' is not accepting requests",
                self.options.server_id
            )));
        }
        self.inflight.fetch_add(1, Ordering::AcqRel);
        drop(state);
        Ok(InflightGuard {
            shared: Arc::clone(self),
        })
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.inflight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Reconcile a copy of the table and swap it in, so backends load
    /// without blocking lookups.
    fn reconcile(&self) -> Result<models::ReconcileReport> {
        let _reload = self.reload.lock();
        let scanned = self.repository.scan()?;
        let mut table = self.models.read().clone();
        let report = table.reconcile(scanned, self.factory.as_ref(), self.options.strict_model_config);

        let state = self.state.read();
        if *state == ServerState::Stopped {
            return Err(Error::unavailable(format!(
                "server '{}' stopped while loading models",
                self.options.server_id
            )));
        }
        *self.models.write() = table;
        drop(state);
        Ok(report)
    }

    /// Transition to `Stopped` and release models and shared memory.
    fn shutdown(&self) -> bool {
        {
            let mut state = self.state.write();
            if *state == ServerState::Stopped {
                return false;
            }
            *state = ServerState::Stopped;
        }
        let unloaded = self.models.write().clear();
        self.shared_memory.unregister_all();
        info!(id = %self.options.server_id, unloaded, "server stopped");
        true
    }

    fn server_status(&self) -> ServerStatus {
        let state = self.state();
        ServerStatus {
            id: self.options.server_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            state,
            live: matches!(state, ServerState::Serving | ServerState::Stopping),
            ready: self.is_ready(),
            started_at: self.started_at,
            uptime_ns: u64::try_from(self.started.elapsed().as_nanos()).unwrap_or(u64::MAX),
            models: self.models.read().status(),
        }
    }

    fn model_status_blob(&self, name: &str) -> Result<SerializedBlob> {
        let status = self
            .models
            .read()
            .model_status(name)
            .ok_or_else(|| Error::not_found(format!("unknown model '{}'", name)))?;
        SerializedBlob::from_json(&status)
    }
}

/// Owns a request's callback until it has run.
///
/// If the request task is dropped first, which happens when the runtime shuts
/// down, the callback runs from `drop` with an `UNAVAILABLE` response.
struct Completion<F>
where
    F: FnOnce(ServerHandle, InferenceResponse),
{
    shared: Arc<ServerShared>,
    summary: dispatch::RequestSummary,
    complete: Option<F>,
    _inflight: InflightGuard,
}

impl<F> Completion<F>
where
    F: FnOnce(ServerHandle, InferenceResponse),
{
    fn finish(mut self, response: InferenceResponse) {
        if let Some(complete) = self.complete.take() {
            complete(
                ServerHandle {
                    shared: Arc::clone(&self.shared),
                },
                response,
            );
        }
    }
}

impl<F> Drop for Completion<F>
where
    F: FnOnce(ServerHandle, InferenceResponse),
{
    fn drop(&mut self) {
        if let Some(complete) = self.complete.take() {
            warn!(id = self.summary.id, "request task dropped before completion");
            let response = dispatch::reject(
                &self.shared,
                &self.summary,
                Error::unavailable("request was cancelled because the runtime shut down"),
            );
            complete(
                ServerHandle {
                    shared: Arc::clone(&self.shared),
                },
                response,
            );
        }
    }
}

/// Cheap reference to a server, passed to completion callbacks.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<ServerShared>,
}

impl ServerHandle {
    pub fn id(&self) -> &str {
        &self.shared.options.server_id
    }

    pub fn is_live(&self) -> bool {
        self.shared.is_live()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.is_ready()
    }

    pub fn status(&self) -> Result<SerializedBlob> {
        SerializedBlob::from_json(&self.shared.server_status())
    }

    pub fn model_status(&self, name: &str) -> Result<SerializedBlob> {
        self.shared.model_status_blob(name)
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle").field("id", &self.id()).finish()
    }
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    options: ServerOptions,
    repository: Option<Arc<dyn ModelRepository>>,
    factory: Option<Arc<dyn BackendFactory>>,
    allocator: Option<Arc<dyn MemoryAllocator>>,
}

impl ServerBuilder {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            repository: None,
            factory: None,
            allocator: None,
        }
    }

    pub fn repository(mut self, repository: Arc<dyn ModelRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn backend_factory(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn allocator(mut self, allocator: Arc<dyn MemoryAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Create the server and load every model in the repository.
    ///
    /// Must be called from within a tokio runtime. With `exit_on_error` any
    /// model that fails its initial load fails the whole call.
    pub fn build(self) -> Result<Server> {
        let runtime = Handle::try_current().map_err(|_| {
            Error::unavailable("server must be created inside a tokio runtime")
        })?;

        let options = self.options;
        if options.execution_slots == 0 {
            return Err(Error::invalid_arg("execution_slots must be at least 1"));
        }

        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(InMemoryRepository::new()));
        let factory = self.factory.unwrap_or_else(|| Arc::new(no_backend));
        let allocator = self
            .allocator
            .unwrap_or_else(|| Arc::new(PooledAllocator::new(&options.memory)));

        let shared = Arc::new(ServerShared {
            shared_memory: SharedMemoryManager::new(options.shared_memory_dir.clone()),
            slots: Arc::new(Semaphore::new(options.execution_slots)),
            state: RwLock::new(ServerState::Serving),
            models: RwLock::new(ModelTable::default()),
            reload: Mutex::new(()),
            repository,
            factory,
            allocator,
            inflight: AtomicUsize::new(0),
            drained: Notify::new(),
            runtime,
            started: Instant::now(),
            started_at: chrono::Utc::now().timestamp(),
            options,
        });

        let report = shared.reconcile()?;
        let loaded = report.loaded;
        if shared.options.exit_on_error {
            if let Some(e) = report.into_error() {
                error!(id = %shared.options.server_id, "initial model load failed: {}", e);
                *shared.state.write() = ServerState::Stopped;
                return Err(e);
            }
        }

        info!(
            id = %shared.options.server_id,
            loaded,
            slots = shared.options.execution_slots,
            "server serving"
        );
        Ok(Server { shared })
    }
}

fn no_backend(config: &ModelConfig, _version: i64) -> Result<Arc<dyn Backend>> {
    Err(Error::unsupported(format!(
        "no backend factory configured for model '{}'",
        config.name
    )))
}

/// An inference server.
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    pub fn builder(options: ServerOptions) -> ServerBuilder {
        ServerBuilder::new(options)
    }

    pub(crate) fn shared(&self) -> &Arc<ServerShared> {
        &self.shared
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.options.server_id
    }

    pub fn options(&self) -> &ServerOptions {
        &self.shared.options
    }

    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    pub fn is_live(&self) -> bool {
        self.shared.is_live()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.is_ready()
    }

    /// Number of accepted requests whose callback has not yet returned.
    pub fn inflight(&self) -> usize {
        self.shared.inflight.load(Ordering::Acquire)
    }

    pub fn status(&self) -> Result<SerializedBlob> {
        SerializedBlob::from_json(&self.shared.server_status())
    }

    pub fn model_status(&self, name: &str) -> Result<SerializedBlob> {
        self.shared.model_status_blob(name)
    }

    /// Rescan the repository and load, reload or unload models to match.
    ///
    /// Failures are isolated per model. With `exit_on_error` they are also
    /// returned as an error after the rest of the table has been updated.
    pub fn poll_model_repository(&self) -> Result<()> {
        if self.shared.state() != ServerState::Serving {
            return Err(Error::unavailable(format!(
                "server '{}' is not serving",
                self.id()
            )));
        }

        let report = self.shared.reconcile()?;
        info!(
            id = %self.id(),
            loaded = report.loaded,
            kept = report.kept,
            unloaded = report.unloaded,
            failed = report.failures.len(),
            "polled model repository"
        );
        match report.into_error() {
            Some(e) if self.shared.options.exit_on_error => Err(e),
            _ => Ok(()),
        }
    }

    pub fn register_shared_memory(
        &self,
        name: &str,
        region_key: &str,
        offset: usize,
        byte_size: usize,
    ) -> Result<()> {
        self.shared
            .shared_memory
            .register(name, region_key, offset, byte_size)
    }

    pub fn unregister_shared_memory(&self, name: &str) -> Result<()> {
        self.shared.shared_memory.unregister(name)
    }

    pub fn unregister_all_shared_memory(&self) {
        self.shared.shared_memory.unregister_all()
    }

    pub fn shared_memory_status(&self) -> Vec<SharedMemoryStatus> {
        self.shared.shared_memory.status()
    }

    /// Submit a request; `complete` runs exactly once with the response.
    ///
    /// Returns an error without invoking `complete` when the request is
    /// rejected before dispatch. If the runtime shuts down before the request
    /// finishes, `complete` receives an `UNAVAILABLE` response instead.
    pub fn infer_async<F>(&self, provider: &InferenceRequestProvider, complete: F) -> Result<()>
    where
        F: FnOnce(ServerHandle, InferenceResponse) + Send + 'static,
    {
        if !Arc::ptr_eq(&provider.server, &self.shared) {
            return Err(Error::invalid_arg(
                "request provider was created for a different server",
            ));
        }
        let guard = self.shared.begin_request()?;
        let request = dispatch::prepare(&self.shared, provider)?;

        debug!(id = request.id(), model = request.model_name(), "request accepted");
        let shared = Arc::clone(&self.shared);
        let completion = Completion {
            shared: Arc::clone(&self.shared),
            summary: request.summary(),
            complete: Some(complete),
            _inflight: guard,
        };
        // A runtime that has shut down drops the task unpolled, which
        // completes the request through `Completion::drop`.
        self.shared.runtime.spawn(async move {
            let response = match Arc::clone(&shared.slots).acquire_owned().await {
                Ok(permit) => {
                    let response = dispatch::execute(&shared, request).await;
                    drop(permit);
                    response
                }
                Err(_) => dispatch::reject(
                    &shared,
                    &request.summary(),
                    Error::unavailable("execution slots closed"),
                ),
            };
            completion.finish(response);
        });
        Ok(())
    }

    /// Submit a request and wait for its response.
    pub async fn infer(&self, provider: &InferenceRequestProvider) -> Result<InferenceResponse> {
        let (tx, rx) = oneshot::channel();
        self.infer_async(provider, move |_, response| {
            let _ = tx.send(response);
        })?;
        rx.await
            .map_err(|_| Error::internal("request task ended without a response"))
    }

    /// Stop accepting requests, drain in-flight ones and unload every model.
    ///
    /// Waits up to `exit_timeout_secs`; on timeout the server is stopped
    /// anyway and `UNAVAILABLE` reports how many requests were still
    /// running. Calling `stop` again is a no-op.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.shared.state.write();
            match *state {
                ServerState::Stopped => return Ok(()),
                ServerState::Serving => {
                    *state = ServerState::Stopping;
                    info!(id = %self.id(), inflight = self.inflight(), "server stopping");
                }
                ServerState::Stopping => {}
            }
        }

        let secs = self.shared.options.exit_timeout_secs;
        let drained = tokio::time::timeout(Duration::from_secs(secs), self.shared.wait_drained())
            .await
            .is_ok();
        let remaining = self.inflight();
        self.shared.shutdown();

        if drained {
            Ok(())
        } else {
            warn!(id = %self.id(), remaining, "requests still in flight at exit timeout");
            Err(Error::unavailable(format!(
                "{} requests still in flight after {}s",
                remaining, secs
            )))
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.shared.shutdown() {
            debug!(id = %self.id(), "server dropped without stop");
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
