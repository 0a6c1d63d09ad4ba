//! Model repository abstraction.
//!
//! A repository reports which models and versions are currently present.
//! The server reconciles its loaded models against each scan.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::Result;
use crate::model::ModelConfig;

/// A model and the versions of it present in the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryModel {
    pub config: ModelConfig,
    pub versions: Vec<i64>,
}

/// Source of model metadata.
pub trait ModelRepository: Send + Sync {
    /// Snapshot of every model currently present.
    fn scan(&self) -> Result<Vec<RepositoryModel>>;
}

/// Repository held in memory and edited through method calls.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    models: RwLock<BTreeMap<String, RepositoryModel>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a model.
    pub fn insert(&self, config: ModelConfig, versions: Vec<i64>) {
        let name = config.name.clone();
        self.models
            .write()
            .insert(name, RepositoryModel { config, versions });
    }

    /// Remove a model; returns whether it was present.
    pub fn remove(&self, name: &str) -> bool {
        self.models.write().remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.read().is_empty()
    }
}

impl ModelRepository for InMemoryRepository {
    fn scan(&self) -> Result<Vec<RepositoryModel>> {
        Ok(self.models.read().values().cloned().collect())
    }
}
