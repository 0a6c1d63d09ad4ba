//! Loaded model table and repository reconciliation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendFactory};
use crate::error::{Error, Result};
use crate::model::{ModelConfig, ModelVersion};
use crate::repository::RepositoryModel;
use crate::status::{InferStats, ModelReadyState, ModelStatus, ModelVersionStatus};

/// One ready version of a model with its backend.
pub struct LoadedModel {
    config: Arc<ModelConfig>,
    version: i64,
    backend: Arc<dyn Backend>,
    stats: InferStats,
}

impl LoadedModel {
    pub fn config(&self) -> &Arc<ModelConfig> {
        &self.config
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub(crate) fn stats(&self) -> &InferStats {
        &self.stats
    }
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("name", &self.config.name)
            .field("version", &self.version)
            .finish()
    }
}

#[derive(Clone)]
enum VersionSlot {
    Ready(Arc<LoadedModel>),
    Unavailable(String),
}

#[derive(Clone)]
struct ModelEntry {
    config: Arc<ModelConfig>,
    versions: BTreeMap<i64, VersionSlot>,
}

/// Per-model load failure from one reconciliation.
#[derive(Debug, Clone)]
pub(crate) struct LoadFailure {
    pub(crate) model: String,
    pub(crate) version: Option<i64>,
    pub(crate) error: Error,
}

impl std::fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.version {
            Some(v) => write!(f, "{} version {}: {}", self.model, v, self.error),
            None => write!(f, "{}: {}", self.model, self.error),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ReconcileReport {
    pub(crate) loaded: usize,
    pub(crate) kept: usize,
    pub(crate) unloaded: usize,
    pub(crate) failures: Vec<LoadFailure>,
}

impl ReconcileReport {
    /// All failures joined into one error, if any.
    pub(crate) fn into_error(self) -> Option<Error> {
        if self.failures.is_empty() {
            return None;
        }
        let detail = self
            .failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Some(Error::unavailable(format!("failed to load models: {}", detail)))
    }
}

/// Models known to a server, keyed by name then version.
///
/// Cloning is shallow: loaded models are shared between the clones.
#[derive(Clone, Default)]
pub(crate) struct ModelTable {
    entries: BTreeMap<String, ModelEntry>,
}

impl ModelTable {
    /// Resolve a version to a ready model.
    pub(crate) fn resolve(&self, name: &str, version: ModelVersion) -> Result<Arc<LoadedModel>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| Error::not_found(format!("unknown model '{}'", name)))?;

        match version {
            ModelVersion::Latest => entry
                .versions
                .values()
                .rev()
                .find_map(|slot| match slot {
                    VersionSlot::Ready(model) => Some(Arc::clone(model)),
                    VersionSlot::Unavailable(_) => None,
                })
                .ok_or_else(|| {
                    Error::unavailable(format!("model '{}' has no ready version", name))
                }),
            ModelVersion::Specific(v) => match entry.versions.get(&v) {
                Some(VersionSlot::Ready(model)) => Ok(Arc::clone(model)),
                Some(VersionSlot::Unavailable(reason)) => Err(Error::unavailable(format!(
                    "model '{}' version {} is unavailable: {}",
                    name, v, reason
                ))),
                None => Err(Error::not_found(format!(
                    "unknown version {} of model '{}'",
                    v, name
                ))),
            },
        }
    }

    /// Bring the table in line with a repository snapshot.
    ///
    /// Versions whose configuration is unchanged keep their backend. Failures
    /// are recorded per model and never prevent other models from loading.
    pub(crate) fn reconcile(
        &mut self,
        scanned: Vec<RepositoryModel>,
        factory: &dyn BackendFactory,
        strict: bool,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut previous = std::mem::take(&mut self.entries);

        for model in scanned {
            let name = model.config.name.clone();
            let config = Arc::new(model.config);
            let old = previous.remove(&name);
            let versions: BTreeSet<i64> = model.versions.into_iter().collect();

            if let Err(e) = config.validate(strict) {
                warn!(model = %name, "invalid model configuration: {}", e);
                let reason = e.to_string();
                report.unloaded += old.as_ref().map_or(0, count_ready);
                report.failures.push(LoadFailure {
                    model: name.clone(),
                    version: None,
                    error: e,
                });
                let slots = versions
                    .iter()
                    .map(|v| (*v, VersionSlot::Unavailable(reason.clone())))
                    .collect();
                self.entries.insert(name, ModelEntry { config, versions: slots });
                continue;
            }

            let mut old_versions = match old {
                Some(entry) if entry.config == config => entry.versions,
                Some(entry) => {
                    info!(model = %name, "model configuration changed; reloading");
                    report.unloaded += count_ready(&entry);
                    BTreeMap::new()
                }
                None => BTreeMap::new(),
            };

            let mut slots = BTreeMap::new();
            for version in versions {
                if let Some(VersionSlot::Ready(loaded)) = old_versions.remove(&version) {
                    report.kept += 1;
                    slots.insert(version, VersionSlot::Ready(loaded));
                    continue;
                }

                match factory.create(&config, version) {
                    Ok(backend) => {
                        info!(model = %name, version, "loaded model version");
                        report.loaded += 1;
                        slots.insert(
                            version,
                            VersionSlot::Ready(Arc::new(LoadedModel {
                                config: Arc::clone(&config),
                                version,
                                backend,
                                stats: InferStats::default(),
                            })),
                        );
                    }
                    Err(e) => {
                        warn!(model = %name, version, "failed to load model version: {}", e);
                        slots.insert(version, VersionSlot::Unavailable(e.to_string()));
                        report.failures.push(LoadFailure {
                            model: name.clone(),
                            version: Some(version),
                            error: e,
                        });
                    }
                }
            }

            for (version, slot) in old_versions {
                if matches!(slot, VersionSlot::Ready(_)) {
                    info!(model = %name, version, "unloaded model version");
                    report.unloaded += 1;
                }
            }

            self.entries.insert(name, ModelEntry { config, versions: slots });
        }

        for (name, entry) in previous {
            info!(model = %name, "model removed from repository; unloading");
            report.unloaded += count_ready(&entry);
        }

        debug!(
            loaded = report.loaded,
            kept = report.kept,
            unloaded = report.unloaded,
            failed = report.failures.len(),
            "reconciled model repository"
        );
        report
    }

    /// Readiness of the table alone, ignoring server state.
    pub(crate) fn is_ready(&self, strict: bool) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let mut slots = self.entries.values().flat_map(|entry| entry.versions.values());
        if strict {
            self.entries.values().all(|entry| !entry.versions.is_empty())
                && slots.all(|slot| matches!(slot, VersionSlot::Ready(_)))
        } else {
            slots.any(|slot| matches!(slot, VersionSlot::Ready(_)))
        }
    }

    pub(crate) fn model_status(&self, name: &str) -> Option<ModelStatus> {
        self.entries.get(name).map(entry_status)
    }

    pub(crate) fn status(&self) -> BTreeMap<String, ModelStatus> {
        self.entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry_status(entry)))
            .collect()
    }

    pub(crate) fn ready_versions(&self) -> usize {
        self.entries.values().map(count_ready).sum()
    }

    /// Unload everything. Requests holding a model keep it until they finish.
    pub(crate) fn clear(&mut self) -> usize {
        let unloaded = self.ready_versions();
        self.entries.clear();
        unloaded
    }
}

fn count_ready(entry: &ModelEntry) -> usize {
    entry
        .versions
        .values()
        .filter(|slot| matches!(slot, VersionSlot::Ready(_)))
        .count()
}

fn entry_status(entry: &ModelEntry) -> ModelStatus {
    let versions = entry
        .versions
        .iter()
        .map(|(version, slot)| {
            let status = match slot {
                VersionSlot::Ready(model) => ModelVersionStatus {
                    ready_state: ModelReadyState::Ready,
                    reason: None,
                    infer_stats: model.stats.snapshot(),
                },
                VersionSlot::Unavailable(reason) => ModelVersionStatus {
                    ready_state: ModelReadyState::Unavailable,
                    reason: Some(reason.clone()),
                    infer_stats: Default::default(),
                },
            };
            (*version, status)
        })
        .collect();

    ModelStatus {
        config: (*entry.config).clone(),
        versions,
    }
}
