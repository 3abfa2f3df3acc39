//! Tunables consumed by the action cache

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

/// Configuration for the blob-store-backed action cache
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Ceiling on in-flight upload memory, in KiB
    #[serde(default = "default_max_upload_memory_kb")]
    pub max_upload_memory_kb: u32,

    /// Captured streams at or below this many bytes are stored inline
    #[serde(default = "default_max_inline_bytes")]
    pub max_inline_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_upload_memory_kb: default_max_upload_memory_kb(),
            max_inline_bytes: default_max_inline_bytes(),
        }
    }
}

impl CacheConfig {
    /// Check the configuration can back a working governor
    pub fn validate(&self) -> Result<()> {
        if self.max_upload_memory_kb == 0 {
            return Err(Error::configuration(
                "max_upload_memory_kb must be greater than zero",
            ));
        }
        if self.max_upload_memory_kb as usize > Semaphore::MAX_PERMITS {
            return Err(Error::configuration(format!(
                "max_upload_memory_kb {} exceeds the permit limit {}",
                self.max_upload_memory_kb,
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(())
    }
}

// Default value functions
fn default_max_upload_memory_kb() -> u32 {
    512 * 1024 // 512 MiB
}

fn default_max_inline_bytes() -> usize {
    10 * 1024
}
