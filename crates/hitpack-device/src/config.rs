//! Backend configuration.

use crate::error::{DeviceError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which backend implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Device emulated in host memory with worker-thread streams.
    #[default]
    Host,
    /// NVIDIA GPU through the CUDA driver API.
    Cuda,
}

/// Runtime tunables that can change without tearing the device down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Threads per block applied to kernels without a pinned block size.
    pub threads_per_block: u32,
    /// Occupancy hint: resident blocks per multiprocessor.
    pub blocks_per_multiprocessor: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            threads_per_block: 256,
            blocks_per_multiprocessor: 2,
        }
    }
}

impl RuntimeSettings {
    /// Largest block size any supported device accepts.
    pub const MAX_THREADS_PER_BLOCK: u32 = 1024;

    /// Reject shapes no device can launch.
    pub fn validate(&self) -> Result<()> {
        if self.threads_per_block == 0 || self.threads_per_block > Self::MAX_THREADS_PER_BLOCK {
            return Err(DeviceError::InvalidConfig(format!(
                "threads_per_block {} outside 1..={}",
                self.threads_per_block,
                Self::MAX_THREADS_PER_BLOCK
            )));
        }
        if self.blocks_per_multiprocessor == 0 {
            return Err(DeviceError::InvalidConfig(
                "blocks_per_multiprocessor must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration handed to the backend factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceBackendConfig {
    /// Backend implementation.
    pub device_kind: DeviceKind,
    /// Physical device index.
    pub device_index: usize,
    /// Device memory limit in bytes.
    pub max_memory: usize,
    /// Number of asynchronous streams.
    pub num_streams: usize,
    /// Number of event slots.
    pub num_events: usize,
    /// Size of the broadcast constant region.
    pub constant_memory_size: usize,
    /// Record profiling regions.
    pub profiling: bool,
    /// Above 0, debug checkpoints synchronize and surface faults.
    pub debug_level: u32,
    /// Launch shaping.
    pub runtime: RuntimeSettings,
}

impl Default for DeviceBackendConfig {
    fn default() -> Self {
        Self {
            device_kind: DeviceKind::Host,
            device_index: 0,
            max_memory: 1 << 30, // 1GB
            num_streams: 8,
            num_events: 64,
            constant_memory_size: 64 * 1024,
            profiling: false,
            debug_level: 0,
            runtime: RuntimeSettings::default(),
        }
    }
}

impl DeviceBackendConfig {
    /// Host backend with default pools.
    pub fn host() -> Self {
        Self::default()
    }

    /// CUDA backend on `device_index`.
    pub fn cuda(device_index: usize) -> Self {
        Self {
            device_kind: DeviceKind::Cuda,
            device_index,
            ..Self::default()
        }
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: DeviceBackendConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Reject configurations that cannot produce a working backend.
    pub fn validate(&self) -> Result<()> {
        if self.num_streams == 0 {
            return Err(DeviceError::InvalidConfig("num_streams must be at least 1".into()));
        }
        if self.num_streams > i32::MAX as usize {
            return Err(DeviceError::InvalidConfig(format!(
                "num_streams {} too large",
                self.num_streams
            )));
        }
        if self.num_events == 0 {
            return Err(DeviceError::InvalidConfig("num_events must be at least 1".into()));
        }
        self.runtime.validate()
    }
}
