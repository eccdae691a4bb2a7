pub mod config;
pub mod connection;
pub mod control;
#[cfg(test)]
mod mock;
pub mod poll;
pub mod provisioning;
pub mod reset;
pub mod routes;
pub mod store;
pub mod types;

pub use config::{ConfigInvalid, ControlTiming, DeviceConfig, OutputLevel, RelayWiring};
pub use connection::{connect, ConnectError, JoinBudget, NetworkHandle, StationLink};
pub use control::{
    boot, BootSelection, ControlLoop, ProvisioningReason, TickInput, TickOutcome,
};
pub use poll::{poll_appliance, state_url, OfflinePoller, PollError, StatePoller, StateReply};
pub use provisioning::{handle_submit, ProvisioningForm, SubmitOutcome};
pub use reset::{ResetEvent, ResetMonitor, ResetPhase};
pub use routes::*;
pub use store::{ConfigStore, WriteError};
pub use types::{
    ApplianceState, DeviceContext, OperatingMode, RelayState, Restart, RestartReason,
};
