use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperatingMode {
    Provisioning,
    Operational,
}

impl OperatingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "PROVISIONING",
            Self::Operational => "OPERATIONAL",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayState {
    Energized,
    #[default]
    DeEnergized,
}

impl RelayState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Energized => "ENERGIZED",
            Self::DeEnergized => "DE_ENERGIZED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplianceState {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestartReason {
    FactoryReset,
    Provisioned,
    LinkLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Restart {
    pub reason: RestartReason,
    #[serde(rename = "delayMs")]
    pub delay_ms: u64,
}

impl Restart {
    pub fn new(reason: RestartReason, delay_ms: u64) -> Self {
        Self { reason, delay_ms }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceContext {
    pub mode: OperatingMode,
    pub relay: RelayState,
    #[serde(rename = "indicatorLit")]
    pub indicator_lit: bool,
}

impl DeviceContext {
    pub fn new(mode: OperatingMode) -> Self {
        Self {
            mode,
            relay: RelayState::DeEnergized,
            indicator_lit: false,
        }
    }

    pub fn force_safe(&mut self) {
        self.relay = RelayState::DeEnergized;
    }
}
