use thiserror::Error;

use crate::config::DeviceConfig;

pub const CONFIG_NAMESPACE: &str = "config";
pub const KEY_SSID: &str = "ssid";
pub const KEY_PASS: &str = "pass";
pub const KEY_APPLIANCE_ID: &str = "appid";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("failed to open config namespace: {0}")]
    Open(String),
    #[error("failed to write `{key}`: {reason}")]
    Write { key: &'static str, reason: String },
    #[error("failed to erase `{key}`: {reason}")]
    Erase { key: &'static str, reason: String },
}

// Implementations erase `appid` first and write it last, so an interrupted
// `save` or `clear` reads back as unprovisioned.
pub trait ConfigStore {
    fn load(&self) -> DeviceConfig;

    fn save(&mut self, config: &DeviceConfig) -> Result<(), WriteError>;

    fn clear(&mut self) -> Result<(), WriteError>;
}

#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    record: Option<DeviceConfig>,
    fail_writes: bool,
    saves: usize,
    clears: usize,
}

#[cfg(test)]
impl MemoryStore {
    pub fn with_config(config: DeviceConfig) -> Self {
        Self {
            record: Some(config),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn saves(&self) -> usize {
        self.saves
    }

    pub fn clears(&self) -> usize {
        self.clears
    }
}

#[cfg(test)]
impl ConfigStore for MemoryStore {
    fn load(&self) -> DeviceConfig {
        self.record.clone().unwrap_or_default()
    }

    fn save(&mut self, config: &DeviceConfig) -> Result<(), WriteError> {
        if self.fail_writes {
            // The erase-first ordering still applies to a failed write.
            self.record = None;
            return Err(WriteError::Write {
                key: KEY_APPLIANCE_ID,
                reason: "simulated flash failure".to_string(),
            });
        }
        self.saves += 1;
        self.record = Some(config.clone());
        Ok(())
    }

    fn clear(&mut self) -> Result<(), WriteError> {
        if self.fail_writes {
            return Err(WriteError::Erase {
                key: KEY_APPLIANCE_ID,
                reason: "simulated flash failure".to_string(),
            });
        }
        self.clears += 1;
        self.record = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_is_idempotent() {
        let store = MemoryStore::with_config(DeviceConfig::new("Home", "secret", "AC1"));

        let first = store.load();
        let second = store.load();
        let third = store.load();

        assert_eq!(first, second);
        assert_eq!(second, third);
    }

    #[test]
    fn empty_store_loads_empty_record() {
        let store = MemoryStore::default();
        assert!(store.load().is_empty());
    }

    #[test]
    fn clear_erases_record() {
        let mut store = MemoryStore::with_config(DeviceConfig::new("Home", "secret", "AC1"));
        store.clear().unwrap();

        assert!(!store.load().is_provisioned());
        assert_eq!(store.clears(), 1);
    }

    #[test]
    fn failed_save_reads_back_unprovisioned() {
        let mut store = MemoryStore::with_config(DeviceConfig::new("Old", "pw", "AC0"));
        store.set_fail_writes(true);

        assert!(store.save(&DeviceConfig::new("New", "pw", "AC1")).is_err());
        assert!(!store.load().is_provisioned());
    }
}
