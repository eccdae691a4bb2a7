use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::RelayState;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub ssid: String,
    #[serde(rename = "pass")]
    pub passphrase: String,
    #[serde(rename = "appid")]
    pub appliance_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigInvalid {
    #[error("no configuration stored")]
    Missing,
    #[error("ssid is empty")]
    EmptySsid,
    #[error("appliance id is empty")]
    EmptyApplianceId,
}

impl DeviceConfig {
    pub fn new(
        ssid: impl Into<String>,
        passphrase: impl Into<String>,
        appliance_id: impl Into<String>,
    ) -> Self {
        Self {
            ssid: ssid.into(),
            passphrase: passphrase.into(),
            appliance_id: appliance_id.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ssid.is_empty() && self.passphrase.is_empty() && self.appliance_id.is_empty()
    }

    pub fn validate(&self) -> Result<(), ConfigInvalid> {
        if self.is_empty() {
            return Err(ConfigInvalid::Missing);
        }
        if self.ssid.trim().is_empty() {
            return Err(ConfigInvalid::EmptySsid);
        }
        if self.appliance_id.trim().is_empty() {
            return Err(ConfigInvalid::EmptyApplianceId);
        }
        Ok(())
    }

    pub fn is_provisioned(&self) -> bool {
        self.validate().is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputLevel {
    Low,
    High,
}

impl OutputLevel {
    pub fn is_high(self) -> bool {
        matches!(self, Self::High)
    }

    pub fn inverted(self) -> Self {
        match self {
            Self::Low => Self::High,
            Self::High => Self::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayWiring {
    #[serde(rename = "applianceOnLevel")]
    pub appliance_on_level: OutputLevel,
}

impl Default for RelayWiring {
    fn default() -> Self {
        Self {
            appliance_on_level: OutputLevel::High,
        }
    }
}

impl RelayWiring {
    pub fn level_for(&self, state: RelayState) -> OutputLevel {
        match state {
            RelayState::Energized => self.appliance_on_level,
            RelayState::DeEnergized => self.appliance_on_level.inverted(),
        }
    }

    pub fn safe_level(&self) -> OutputLevel {
        self.level_for(RelayState::DeEnergized)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlTiming {
    pub hold_threshold_ms: u64,
    pub reset_ack_ms: u64,
    pub hold_blink_half_period_ms: u64,
    pub heartbeat_half_period_ms: u64,
    pub poll_interval_ms: u64,
    pub poll_timeout_ms: u64,
    pub sample_interval_ms: u64,
    pub join_attempts: u32,
    pub join_poll_interval_ms: u64,
    pub save_restart_delay_ms: u64,
    pub link_loss_restart_ms: u64,
}

impl Default for ControlTiming {
    fn default() -> Self {
        Self {
            hold_threshold_ms: 5_000,
            reset_ack_ms: 1_000,
            hold_blink_half_period_ms: 100,
            heartbeat_half_period_ms: 500,
            poll_interval_ms: 1_000,
            poll_timeout_ms: 3_000,
            sample_interval_ms: 20,
            join_attempts: 20,
            join_poll_interval_ms: 500,
            save_restart_delay_ms: 2_000,
            link_loss_restart_ms: 300_000,
        }
    }
}

impl ControlTiming {
    pub fn sanitize(&mut self) {
        self.hold_threshold_ms = self.hold_threshold_ms.clamp(1_000, 30_000);
        self.reset_ack_ms = self.reset_ack_ms.min(5_000);
        self.hold_blink_half_period_ms = self.hold_blink_half_period_ms.clamp(20, 1_000);
        self.heartbeat_half_period_ms = self.heartbeat_half_period_ms.clamp(100, 5_000);
        self.poll_interval_ms = self.poll_interval_ms.clamp(100, 60_000);
        self.sample_interval_ms = self.sample_interval_ms.clamp(5, 200);
        self.join_attempts = self.join_attempts.clamp(1, 120);
        self.join_poll_interval_ms = self.join_poll_interval_ms.clamp(50, 5_000);
        self.save_restart_delay_ms = self.save_restart_delay_ms.clamp(100, 10_000);
        self.link_loss_restart_ms = self.link_loss_restart_ms.max(10_000);

        // A blocked poll stalls reset sampling, so it must finish well
        // inside the hold threshold.
        let max_timeout = self.hold_threshold_ms.saturating_mul(3) / 4;
        self.poll_timeout_ms = self.poll_timeout_ms.clamp(250, max_timeout);
    }

    pub fn join_budget_ms(&self) -> u64 {
        u64::from(self.join_attempts).saturating_mul(self.join_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_record_is_missing() {
        assert_eq!(
            DeviceConfig::default().validate(),
            Err(ConfigInvalid::Missing)
        );
    }

    #[test]
    fn required_fields_must_be_present() {
        let no_ssid = DeviceConfig::new("", "secret", "AC1");
        assert_eq!(no_ssid.validate(), Err(ConfigInvalid::EmptySsid));

        let blank_ssid = DeviceConfig::new("   ", "", "AC1");
        assert_eq!(blank_ssid.validate(), Err(ConfigInvalid::EmptySsid));

        let no_appliance = DeviceConfig::new("Home", "secret", "");
        assert_eq!(no_appliance.validate(), Err(ConfigInvalid::EmptyApplianceId));
    }

    #[test]
    fn open_network_is_valid() {
        assert!(DeviceConfig::new("Cafe", "", "AC1").is_provisioned());
    }

    #[test]
    fn default_wiring_energizes_high() {
        let wiring = RelayWiring::default();
        assert_eq!(wiring.level_for(RelayState::Energized), OutputLevel::High);
        assert_eq!(wiring.safe_level(), OutputLevel::Low);

        let inverted = RelayWiring {
            appliance_on_level: OutputLevel::Low,
        };
        assert_eq!(inverted.safe_level(), OutputLevel::High);
    }

    #[test]
    fn sanitize_keeps_poll_timeout_below_hold_threshold() {
        let mut timing = ControlTiming {
            hold_threshold_ms: 4_000,
            poll_timeout_ms: 10_000,
            ..ControlTiming::default()
        };
        timing.sanitize();

        assert_eq!(timing.poll_timeout_ms, 3_000);
    }

    #[test]
    fn defaults_survive_sanitize() {
        let mut timing = ControlTiming::default();
        timing.sanitize();

        assert_eq!(timing.hold_threshold_ms, 5_000);
        assert_eq!(timing.poll_timeout_ms, 3_000);
        assert_eq!(timing.join_budget_ms(), 10_000);
    }
}
