//! Server and model status reports.
//!
//! Status and response headers leave the core as [`SerializedBlob`]s. The
//! protocol layer owns their schema; the structs here are what this crate
//! serializes into them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::ModelConfig;

/// Opaque serialized metadata with a base/size accessor contract.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SerializedBlob {
    bytes: Bytes,
}

impl SerializedBlob {
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self {
            bytes: Bytes::from(serde_json::to_vec(value)?),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn byte_size(&self) -> usize {
        self.bytes.len()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.bytes)?)
    }
}

impl fmt::Debug for SerializedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializedBlob")
            .field("byte_size", &self.bytes.len())
            .finish()
    }
}

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerState {
    /// Accepting requests
    Serving,
    /// Draining in-flight requests; new requests are refused
    Stopping,
    /// Permanently stopped
    Stopped,
}

/// Readiness of one model version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelReadyState {
    Ready,
    Unavailable,
}

/// Execution counters of one model version.
#[derive(Debug, Default)]
pub struct InferStats {
    success: AtomicU64,
    failed: AtomicU64,
    compute_ns: AtomicU64,
}

impl InferStats {
    pub fn record(&self, ok: bool, compute_ns: u64) {
        if ok {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.compute_ns.fetch_add(compute_ns, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> InferStatsSnapshot {
        InferStatsSnapshot {
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            compute_ns: self.compute_ns.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferStatsSnapshot {
    pub success: u64,
    pub failed: u64,
    pub compute_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersionStatus {
    pub ready_state: ModelReadyState,
    /// Why the version is unavailable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub infer_stats: InferStatsSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub config: ModelConfig,
    pub versions: BTreeMap<i64, ModelVersionStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub id: String,
    pub version: String,
    pub state: ServerState,
    pub live: bool,
    pub ready: bool,
    /// Unix timestamp (seconds) of server creation
    pub started_at: i64,
    pub uptime_ns: u64,
    pub models: BTreeMap<String, ModelStatus>,
}
