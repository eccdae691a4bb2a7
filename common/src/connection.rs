use std::time::Duration;

use log::{info, warn};
use thiserror::Error;

use crate::config::{ControlTiming, DeviceConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("station did not associate within {polls} status polls")]
    Timeout { polls: u32 },
    #[error("station rejected join request: {0}")]
    Rejected(String),
}

pub trait StationLink {
    fn begin(&mut self, ssid: &str, passphrase: &str) -> Result<(), ConnectError>;

    fn is_associated(&mut self) -> bool;

    fn abort(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinBudget {
    pub attempts: u32,
    pub poll_interval: Duration,
}

impl JoinBudget {
    pub fn from_timing(timing: &ControlTiming) -> Self {
        Self {
            attempts: timing.join_attempts.max(1),
            poll_interval: Duration::from_millis(timing.join_poll_interval_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandle {
    pub ssid: String,
    pub polls: u32,
}

pub fn connect<L, S>(
    link: &mut L,
    config: &DeviceConfig,
    budget: JoinBudget,
    mut sleep: S,
) -> Result<NetworkHandle, ConnectError>
where
    L: StationLink + ?Sized,
    S: FnMut(Duration),
{
    link.begin(&config.ssid, &config.passphrase)?;
    info!("joining `{}`", config.ssid);

    for poll in 1..=budget.attempts {
        sleep(budget.poll_interval);
        if link.is_associated() {
            info!("joined `{}` after {poll} status polls", config.ssid);
            return Ok(NetworkHandle {
                ssid: config.ssid.clone(),
                polls: poll,
            });
        }
    }

    warn!(
        "join of `{}` timed out after {} polls",
        config.ssid, budget.attempts
    );
    link.abort();
    Err(ConnectError::Timeout {
        polls: budget.attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedStation;

    fn budget() -> JoinBudget {
        JoinBudget {
            attempts: 20,
            poll_interval: Duration::from_millis(500),
        }
    }

    #[test]
    fn succeeds_when_link_comes_up_within_budget() {
        let mut link = ScriptedStation::associates_after(3);
        let mut slept = Duration::ZERO;

        let handle = connect(
            &mut link,
            &DeviceConfig::new("Home", "secret", "AC1"),
            budget(),
            |d| slept += d,
        )
        .unwrap();

        assert_eq!(handle.ssid, "Home");
        assert_eq!(handle.polls, 3);
        assert_eq!(slept, Duration::from_millis(1_500));
        assert_eq!(link.joined_with(), Some(("Home", "secret")));
    }

    #[test]
    fn wait_is_bounded() {
        let mut link = ScriptedStation::never_associates();
        let mut sleeps = 0;

        let err = connect(
            &mut link,
            &DeviceConfig::new("Home", "wrong", "AC1"),
            budget(),
            |_| sleeps += 1,
        )
        .unwrap_err();

        assert_eq!(err, ConnectError::Timeout { polls: 20 });
        assert_eq!(sleeps, 20);
        assert!(link.aborted());
    }

    #[test]
    fn rejected_join_is_reported_without_polling() {
        let mut link = ScriptedStation::rejecting("ssid too long");
        let mut sleeps = 0;

        let err = connect(
            &mut link,
            &DeviceConfig::new("Home", "", "AC1"),
            budget(),
            |_| sleeps += 1,
        )
        .unwrap_err();

        assert_eq!(err, ConnectError::Rejected("ssid too long".to_string()));
        assert_eq!(sleeps, 0);
    }
}
