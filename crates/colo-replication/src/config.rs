//! Driver configuration.

use std::time::Duration;

use crate::error::ConfigError;

/// Which side of the COLO pair a `ReplicationDriver` is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Primary,
    Secondary,
}

/// Configuration for a [`crate::driver::ReplicationDriver`].
///
/// `sector_size` and `cluster_sectors` default to 512 bytes and 128 sectors
/// (64 KiB clusters).
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub mode: Mode,
    pub export: Option<String>,
    pub sector_size: u32,
    pub cluster_sectors: u32,
    pub min_period: Duration,
    pub max_period: Duration,
}

impl DriverConfig {
    pub fn new(mode: Mode, max_period: Duration) -> Self {
        Self {
            mode,
            export: None,
            sector_size: 512,
            cluster_sectors: 128,
            min_period: Duration::from_millis(100),
            max_period,
        }
    }

    pub fn with_export(mut self, export: impl Into<String>) -> Self {
        self.export = Some(export.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == Mode::Secondary && self.export.is_none() {
            return Err(ConfigError::MissingExport);
        }
        if self.sector_size == 0 || self.cluster_sectors == 0 {
            return Err(ConfigError::InvalidGeometry);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secondary_requires_export() {
        let cfg = DriverConfig::new(Mode::Secondary, Duration::from_secs(1));
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingExport)));

        let cfg = cfg.with_export("colo0");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn primary_does_not_require_export() {
        let cfg = DriverConfig::new(Mode::Primary, Duration::from_secs(1));
        assert!(cfg.validate().is_ok());
    }
}
