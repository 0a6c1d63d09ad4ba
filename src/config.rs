//! Configuration management for the inference server.
//!
//! Server options are loaded from several sources, in increasing precedence:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `TENSORSERVE_` (nested keys are
//!    separated by `__`, e.g. `TENSORSERVE_MEMORY__HOST_LIMIT_BYTES`)
//!
//! Options are copied into a [`Server`](crate::server::Server) when it is
//! built. Mutating an options value afterwards has no effect on that server.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Options snapshot used to create a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Textual identifier of the server
    pub server_id: String,

    /// Reject model configurations without inputs or outputs
    pub strict_model_config: bool,

    /// Only report ready when every known model version is ready
    pub strict_readiness: bool,

    /// Fail server creation when any model fails its initial load
    pub exit_on_error: bool,

    /// Seconds `stop` waits for in-flight requests to drain
    pub exit_timeout_secs: u64,

    /// Maximum number of requests executing at the same time
    pub execution_slots: usize,

    /// Directory holding the files that back shared-memory regions
    pub shared_memory_dir: PathBuf,

    /// Output buffer budgets
    pub memory: MemoryOptions,

    /// Log output settings
    pub logging: LoggingOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            server_id: "inference:0".to_string(),
            strict_model_config: true,
            strict_readiness: true,
            exit_on_error: true,
            exit_timeout_secs: 30,
            execution_slots: default_execution_slots(),
            shared_memory_dir: default_shared_memory_dir(),
            memory: MemoryOptions::default(),
            logging: LoggingOptions::default(),
        }
    }
}

impl ServerOptions {
    /// Load options from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TENSORSERVE")
                .prefix_separator("_")
                .separator("__"),
        );

        let options: ServerOptions = builder.build()?.try_deserialize()?;
        Ok(options)
    }

    pub fn with_server_id(mut self, id: impl Into<String>) -> Self {
        self.server_id = id.into();
        self
    }

    pub fn with_shared_memory_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shared_memory_dir = dir.into();
        self
    }

    pub fn with_exit_timeout_secs(mut self, secs: u64) -> Self {
        self.exit_timeout_secs = secs;
        self
    }

    pub fn with_execution_slots(mut self, slots: usize) -> Self {
        self.execution_slots = slots;
        self
    }
}

/// Byte budgets for output buffer allocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryOptions {
    /// Host memory limit in bytes (None for no limit)
    pub host_limit_bytes: Option<usize>,

    /// Accelerator devices available for output placement
    pub accelerators: Vec<AcceleratorPool>,
}

/// Memory budget of one accelerator device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceleratorPool {
    /// Device index used as the allocation region id
    pub device_id: i64,
    /// Bytes available on the device
    pub capacity_bytes: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// Default level when the filter does not match
    pub level: String,
    /// `EnvFilter` directives, e.g. `tensorserve_core=debug`
    pub filter: Option<String>,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            filter: None,
        }
    }
}

fn default_execution_slots() -> usize {
    num_cpus::get().max(1)
}

fn default_shared_memory_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_options_defaults() {
        let options = ServerOptions::default();
        assert_eq!(options.server_id, "inference:0");
        assert!(options.strict_readiness);
        assert!(options.exit_on_error);
        assert_eq!(options.exit_timeout_secs, 30);
        assert!(options.execution_slots >= 1);
        assert!(options.memory.accelerators.is_empty());
        assert_eq!(options.logging.level, "info");
    }

    #[test]
    fn test_options_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
server_id = "edge-7"
strict_readiness = false
exit_timeout_secs = 5

[memory]
host_limit_bytes = 1048576

[[memory.accelerators]]
device_id = 0
capacity_bytes = 4096
"#
        )
        .unwrap();

        let options = ServerOptions::load(Some(file.path())).unwrap();
        assert_eq!(options.server_id, "edge-7");
        assert!(!options.strict_readiness);
        assert_eq!(options.exit_timeout_secs, 5);
        assert_eq!(options.memory.host_limit_bytes, Some(1048576));
        assert_eq!(
            options.memory.accelerators,
            vec![AcceleratorPool { device_id: 0, capacity_bytes: 4096 }]
        );
        // Unset keys keep their defaults
        assert!(options.exit_on_error);
    }

    #[test]
    fn test_options_missing_file() {
        let err = ServerOptions::load(Some(Path::new("/nonexistent/tensorserve.toml"))).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidArg);
    }

    #[test]
    fn test_options_builders() {
        let options = ServerOptions::default()
            .with_server_id("a")
            .with_exit_timeout_secs(1)
            .with_execution_slots(3)
            .with_shared_memory_dir("/tmp/x");
        assert_eq!(options.server_id, "a");
        assert_eq!(options.exit_timeout_secs, 1);
        assert_eq!(options.execution_slots, 3);
        assert_eq!(options.shared_memory_dir, PathBuf::from("/tmp/x"));
    }
}
