//! Multiplexer settings
//!
//! Local configuration of a connection. None of it is exchanged with the
//! peer.

use super::error::{Error, Result};
use std::time::Duration;

/// Default largest item count per outbound Write
pub const DEFAULT_MAX_WRITE_ITEMS: u64 = 64;

/// Default transport read size (16 KiB)
pub const DEFAULT_READ_CHUNK_SIZE: usize = 16 * 1024;

/// Default transport timeout
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Multiplexer settings
#[derive(Debug, Clone, Default)]
pub struct MuxSettings {
    /// Largest `amount` carried by one outbound Write (default: 64)
    pub max_write_items: Option<u64>,

    /// Answer Oops with ForgoCredit automatically (default: false)
    pub auto_forgo_on_oops: Option<bool>,

    /// Evict streams once both directions completed (default: true)
    pub auto_evict: Option<bool>,

    /// Transport read size used by the endpoint driver (default: 16 KiB)
    pub read_chunk_size: Option<usize>,

    /// Transport timeout used by the endpoint driver (default: 10s)
    ///
    /// `Some(None)` waits forever.
    pub io_timeout: Option<Option<Duration>>,
}

impl MuxSettings {
    /// Create empty settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Get max items per Write (with default)
    pub fn get_max_write_items(&self) -> u64 {
        self.max_write_items.unwrap_or(DEFAULT_MAX_WRITE_ITEMS)
    }

    /// Get auto forgo on Oops (with default)
    pub fn get_auto_forgo_on_oops(&self) -> bool {
        self.auto_forgo_on_oops.unwrap_or(false)
    }

    /// Get auto evict (with default)
    pub fn get_auto_evict(&self) -> bool {
        self.auto_evict.unwrap_or(true)
    }

    /// Get read chunk size (with default)
    pub fn get_read_chunk_size(&self) -> usize {
        self.read_chunk_size.unwrap_or(DEFAULT_READ_CHUNK_SIZE)
    }

    /// Get transport timeout (with default)
    pub fn get_io_timeout(&self) -> Option<Duration> {
        self.io_timeout.unwrap_or(Some(DEFAULT_IO_TIMEOUT))
    }

    /// Validate settings values
    pub fn validate(&self) -> Result<()> {
        if self.max_write_items == Some(0) {
            return Err(Error::InvalidSettings(
                "Max write items must be at least 1".to_string(),
            ));
        }

        if self.read_chunk_size == Some(0) {
            return Err(Error::InvalidSettings(
                "Read chunk size must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Merge settings from another MuxSettings object
    /// (values in `other` override values in `self`)
    pub fn merge(&mut self, other: &MuxSettings) {
        if other.max_write_items.is_some() {
            self.max_write_items = other.max_write_items;
        }
        if other.auto_forgo_on_oops.is_some() {
            self.auto_forgo_on_oops = other.auto_forgo_on_oops;
        }
        if other.auto_evict.is_some() {
            self.auto_evict = other.auto_evict;
        }
        if other.read_chunk_size.is_some() {
            self.read_chunk_size = other.read_chunk_size;
        }
        if other.io_timeout.is_some() {
            self.io_timeout = other.io_timeout;
        }
    }
}

/// Builder for multiplexer settings
#[derive(Debug, Default)]
pub struct MuxSettingsBuilder {
    settings: MuxSettings,
}

impl MuxSettingsBuilder {
    /// Create a new settings builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set max items per Write
    pub fn max_write_items(mut self, max: u64) -> Self {
        self.settings.max_write_items = Some(max);
        self
    }

    /// Set auto forgo on Oops
    pub fn auto_forgo_on_oops(mut self, enable: bool) -> Self {
        self.settings.auto_forgo_on_oops = Some(enable);
        self
    }

    /// Set auto evict
    pub fn auto_evict(mut self, enable: bool) -> Self {
        self.settings.auto_evict = Some(enable);
        self
    }

    /// Set read chunk size
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.settings.read_chunk_size = Some(size);
        self
    }

    /// Set transport timeout, `None` to wait forever
    pub fn io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.settings.io_timeout = Some(timeout);
        self
    }

    /// Build the settings
    pub fn build(self) -> Result<MuxSettings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}
