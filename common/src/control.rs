use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    config::{ConfigInvalid, ControlTiming, DeviceConfig},
    connection::{connect, ConnectError, JoinBudget, NetworkHandle, StationLink},
    poll::{poll_appliance, state_url, PollError, StatePoller},
    reset::{ResetEvent, ResetMonitor},
    store::ConfigStore,
    types::{
        ApplianceState, DeviceContext, OperatingMode, RelayState, Restart, RestartReason,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisioningReason {
    #[error("configuration invalid: {0}")]
    ConfigInvalid(#[from] ConfigInvalid),
    #[error("network join failed: {0}")]
    Connect(#[from] ConnectError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootSelection {
    Provisioning {
        reason: ProvisioningReason,
    },
    Operational {
        config: DeviceConfig,
        network: NetworkHandle,
    },
}

impl BootSelection {
    pub fn mode(&self) -> OperatingMode {
        match self {
            Self::Provisioning { .. } => OperatingMode::Provisioning,
            Self::Operational { .. } => OperatingMode::Operational,
        }
    }
}

pub fn boot<S, L, F>(store: &S, link: &mut L, timing: &ControlTiming, sleep: F) -> BootSelection
where
    S: ConfigStore + ?Sized,
    L: StationLink + ?Sized,
    F: FnMut(Duration),
{
    let config = store.load();
    if let Err(invalid) = config.validate() {
        info!("boot: {invalid}; entering provisioning");
        return BootSelection::Provisioning {
            reason: invalid.into(),
        };
    }

    match connect(link, &config, JoinBudget::from_timing(timing), sleep) {
        Ok(network) => {
            info!(
                "boot: operational for appliance `{}` on `{}`",
                config.appliance_id, network.ssid
            );
            BootSelection::Operational { config, network }
        }
        Err(err) => {
            warn!("boot: {err}; entering provisioning");
            BootSelection::Provisioning { reason: err.into() }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickInput {
    pub now_ms: u64,
    pub reset_active: bool,
    pub link_up: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Restart(Restart),
}

#[derive(Debug, Clone)]
enum LoopTarget {
    Provisioning,
    Operational { appliance_id: String, url: String },
}

// Only a parsed "on" reply energizes the relay.
#[derive(Debug, Clone)]
pub struct ControlLoop {
    timing: ControlTiming,
    reset: ResetMonitor,
    target: LoopTarget,
    next_poll_ms: Option<u64>,
    link_down_since_ms: Option<u64>,
    last_poll: Option<Result<ApplianceState, PollError>>,
}

impl ControlLoop {
    pub fn provisioning(timing: ControlTiming) -> Self {
        Self::with_target(timing, LoopTarget::Provisioning)
    }

    pub fn operational(timing: ControlTiming, appliance_id: &str, api_base: &str) -> Self {
        let target = LoopTarget::Operational {
            appliance_id: appliance_id.to_string(),
            url: state_url(api_base, appliance_id),
        };
        Self::with_target(timing, target)
    }

    pub fn from_boot(selection: &BootSelection, timing: ControlTiming, api_base: &str) -> Self {
        match selection {
            BootSelection::Provisioning { .. } => Self::provisioning(timing),
            BootSelection::Operational { config, .. } => {
                Self::operational(timing, &config.appliance_id, api_base)
            }
        }
    }

    fn with_target(timing: ControlTiming, target: LoopTarget) -> Self {
        Self {
            reset: ResetMonitor::new(timing.hold_threshold_ms),
            timing,
            target,
            next_poll_ms: None,
            link_down_since_ms: None,
            last_poll: None,
        }
    }

    pub fn mode(&self) -> OperatingMode {
        match self.target {
            LoopTarget::Provisioning => OperatingMode::Provisioning,
            LoopTarget::Operational { .. } => OperatingMode::Operational,
        }
    }

    pub fn initial_context(&self) -> DeviceContext {
        DeviceContext::new(self.mode())
    }

    pub fn poll_url(&self) -> Option<&str> {
        match &self.target {
            LoopTarget::Provisioning => None,
            LoopTarget::Operational { url, .. } => Some(url),
        }
    }

    pub fn last_poll(&self) -> Option<&Result<ApplianceState, PollError>> {
        self.last_poll.as_ref()
    }

    pub fn reset_monitor(&self) -> &ResetMonitor {
        &self.reset
    }

    pub fn timing(&self) -> &ControlTiming {
        &self.timing
    }

    pub fn tick<S, P>(
        &mut self,
        ctx: &mut DeviceContext,
        input: TickInput,
        store: &mut S,
        poller: &mut P,
    ) -> TickOutcome
    where
        S: ConfigStore + ?Sized,
        P: StatePoller + ?Sized,
    {
        let now_ms = input.now_ms;

        // A pending factory reset owns the outputs until the restart lands.
        if self.reset.is_triggered() {
            return TickOutcome::Continue;
        }

        match self.reset.sample(input.reset_active, now_ms) {
            ResetEvent::Triggered => return self.factory_reset(ctx, store),
            ResetEvent::PressStarted => info!(
                "reset button pressed; hold for {}ms to erase configuration",
                self.timing.hold_threshold_ms
            ),
            ResetEvent::Released { held_ms } => {
                info!("reset button released after {held_ms}ms; reset cancelled")
            }
            ResetEvent::None => {}
        }

        if self.reset.is_holding() {
            ctx.force_safe();
            ctx.indicator_lit = blink_phase(now_ms, self.timing.hold_blink_half_period_ms);
            return TickOutcome::Continue;
        }

        match self.mode() {
            OperatingMode::Provisioning => {
                ctx.force_safe();
                ctx.indicator_lit = blink_phase(now_ms, self.timing.heartbeat_half_period_ms);
                TickOutcome::Continue
            }
            OperatingMode::Operational => self.operational_tick(ctx, input, poller),
        }
    }

    fn factory_reset<S>(&mut self, ctx: &mut DeviceContext, store: &mut S) -> TickOutcome
    where
        S: ConfigStore + ?Sized,
    {
        warn!("factory reset triggered; erasing stored configuration");
        if let Err(err) = store.clear() {
            warn!("factory reset erase failed: {err}");
        }

        ctx.force_safe();
        ctx.indicator_lit = true;
        TickOutcome::Restart(Restart::new(
            RestartReason::FactoryReset,
            self.timing.reset_ack_ms,
        ))
    }

    fn operational_tick<P>(
        &mut self,
        ctx: &mut DeviceContext,
        input: TickInput,
        poller: &mut P,
    ) -> TickOutcome
    where
        P: StatePoller + ?Sized,
    {
        let now_ms = input.now_ms;

        if !input.link_up {
            let since_ms = *self.link_down_since_ms.get_or_insert(now_ms);
            if now_ms.saturating_sub(since_ms) >= self.timing.link_loss_restart_ms {
                warn!(
                    "station link down for {}s; restarting",
                    self.timing.link_loss_restart_ms / 1000
                );
                ctx.force_safe();
                ctx.indicator_lit = false;
                return TickOutcome::Restart(Restart::new(RestartReason::LinkLost, 0));
            }
            self.apply_poll(ctx, Err(PollError::LinkDown));
            return TickOutcome::Continue;
        }
        if self.link_down_since_ms.take().is_some() {
            info!("station link restored");
        }

        if self.next_poll_ms.is_some_and(|due_ms| now_ms < due_ms) {
            return TickOutcome::Continue;
        }
        self.next_poll_ms = Some(now_ms.saturating_add(self.timing.poll_interval_ms));

        let result = match &self.target {
            LoopTarget::Operational { url, .. } => poll_appliance(poller, url),
            LoopTarget::Provisioning => Err(PollError::LinkDown),
        };
        self.apply_poll(ctx, result);
        TickOutcome::Continue
    }

    fn apply_poll(&mut self, ctx: &mut DeviceContext, result: Result<ApplianceState, PollError>) {
        let relay = match result {
            Ok(ApplianceState::On) => RelayState::Energized,
            Ok(ApplianceState::Off) | Err(_) => RelayState::DeEnergized,
        };

        if let Err(err) = &result {
            let repeated = matches!(&self.last_poll, Some(Err(previous)) if previous == err);
            if repeated {
                debug!("appliance poll still failing: {err}");
            } else {
                warn!("appliance poll failed: {err}; relay held de-energized");
            }
        }

        if ctx.relay != relay {
            let appliance_id = match &self.target {
                LoopTarget::Operational { appliance_id, .. } => appliance_id.as_str(),
                LoopTarget::Provisioning => "",
            };
            info!("appliance `{appliance_id}` relay -> {}", relay.as_str());
        }

        ctx.relay = relay;
        ctx.indicator_lit = relay == RelayState::Energized;
        self.last_poll = Some(result);
    }
}

pub fn blink_phase(now_ms: u64, half_period_ms: u64) -> bool {
    (now_ms / half_period_ms.max(1)) % 2 == 0
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        mock::{ScriptedPoller, ScriptedStation},
        poll::OfflinePoller,
        provisioning::{handle_submit, ProvisioningForm},
        store::MemoryStore,
    };

    const API: &str = "http://api.local/appliances";

    fn timing() -> ControlTiming {
        ControlTiming::default()
    }

    fn input(now_ms: u64) -> TickInput {
        TickInput {
            now_ms,
            reset_active: false,
            link_up: true,
        }
    }

    fn pressed(now_ms: u64) -> TickInput {
        TickInput {
            reset_active: true,
            ..input(now_ms)
        }
    }

    struct Rig {
        control: ControlLoop,
        ctx: DeviceContext,
        store: MemoryStore,
        poller: ScriptedPoller,
    }

    impl Rig {
        fn operational(store: MemoryStore) -> Self {
            let control = ControlLoop::operational(timing(), "AC1", API);
            Self {
                ctx: control.initial_context(),
                control,
                store,
                poller: ScriptedPoller::new(),
            }
        }

        fn provisioning(store: MemoryStore) -> Self {
            let control = ControlLoop::provisioning(timing());
            Self {
                ctx: control.initial_context(),
                control,
                store,
                poller: ScriptedPoller::new(),
            }
        }

        fn tick(&mut self, input: TickInput) -> TickOutcome {
            self.control
                .tick(&mut self.ctx, input, &mut self.store, &mut self.poller)
        }
    }

    fn provisioned_store() -> MemoryStore {
        MemoryStore::with_config(DeviceConfig::new("Home", "secret", "AC1"))
    }

    #[test]
    fn boot_without_config_selects_provisioning() {
        let mut link = ScriptedStation::associates_after(1);
        let selection = boot(&MemoryStore::default(), &mut link, &timing(), |_| {});

        assert_eq!(
            selection,
            BootSelection::Provisioning {
                reason: ProvisioningReason::ConfigInvalid(ConfigInvalid::Missing),
            }
        );
        assert_eq!(link.status_polls(), 0);
    }

    #[test]
    fn boot_with_incomplete_config_never_joins() {
        for config in [
            DeviceConfig::new("", "secret", "AC1"),
            DeviceConfig::new("Home", "secret", ""),
            DeviceConfig::new("", "", "  "),
        ] {
            let store = MemoryStore::with_config(config.clone());
            let mut link = ScriptedStation::associates_after(1);

            let selection = boot(&store, &mut link, &timing(), |_| {});

            assert_eq!(selection.mode(), OperatingMode::Provisioning, "{config:?}");
            assert!(link.joined_with().is_none());
        }
    }

    #[test]
    fn boot_join_timeout_selects_provisioning() {
        let mut link = ScriptedStation::never_associates();
        let selection = boot(&provisioned_store(), &mut link, &timing(), |_| {});

        assert_eq!(
            selection,
            BootSelection::Provisioning {
                reason: ProvisioningReason::Connect(ConnectError::Timeout { polls: 20 }),
            }
        );
    }

    #[test]
    fn boot_joins_and_selects_operational() {
        let mut link = ScriptedStation::associates_after(2);
        let selection = boot(&provisioned_store(), &mut link, &timing(), |_| {});

        assert_eq!(selection.mode(), OperatingMode::Operational);
        let control = ControlLoop::from_boot(&selection, timing(), API);
        assert_eq!(control.poll_url(), Some("http://api.local/appliances/AC1/state"));
    }

    #[test]
    fn starts_de_energized() {
        let rig = Rig::operational(provisioned_store());
        assert_eq!(rig.ctx.relay, RelayState::DeEnergized);
        assert!(!rig.ctx.indicator_lit);
    }

    #[test]
    fn on_off_then_server_error() {
        let mut rig = Rig::operational(provisioned_store());
        rig.poller
            .reply(200, r#"{"success":true,"state":"on"}"#)
            .reply(200, r#"{"success":true,"state":"off"}"#)
            .reply(500, r#"{"error":"Failed to retrieve appliance state"}"#);

        assert_eq!(rig.tick(input(0)), TickOutcome::Continue);
        assert_eq!(rig.ctx.relay, RelayState::Energized);
        assert!(rig.ctx.indicator_lit);

        rig.tick(input(1_000));
        assert_eq!(rig.ctx.relay, RelayState::DeEnergized);
        assert!(!rig.ctx.indicator_lit);

        rig.tick(input(2_000));
        assert_eq!(rig.ctx.relay, RelayState::DeEnergized);
        assert_eq!(rig.control.last_poll(), Some(&Err(PollError::Status(500))));
        assert_eq!(rig.poller.requests().len(), 3);
        assert!(rig
            .poller
            .requests()
            .iter()
            .all(|url| url == "http://api.local/appliances/AC1/state"));
    }

    #[test]
    fn every_non_on_outcome_de_energizes() {
        let failures: [(&str, fn(&mut ScriptedPoller)); 6] = [
            ("transport", |p| {
                p.fail(PollError::Transport("timed out".into()));
            }),
            ("status", |p| {
                p.reply(503, "");
            }),
            ("malformed", |p| {
                p.reply(200, "<html>oops</html>");
            }),
            ("off", |p| {
                p.reply(200, r#"{"state":"off"}"#);
            }),
            ("absent", |p| {
                p.reply(200, r#"{"success":true}"#);
            }),
            ("array", |p| {
                p.reply(200, r#"["on"]"#);
            }),
        ];

        for (name, script) in failures {
            let mut rig = Rig::operational(provisioned_store());
            rig.poller.reply(200, r#"{"state":"on"}"#);
            script(&mut rig.poller);

            rig.tick(input(0));
            assert_eq!(rig.ctx.relay, RelayState::Energized, "{name}");

            rig.tick(input(1_000));
            assert_eq!(rig.ctx.relay, RelayState::DeEnergized, "{name}");
            assert!(!rig.ctx.indicator_lit, "{name}");
        }
    }

    #[test]
    fn non_object_on_token_never_energizes() {
        let mut rig = Rig::operational(provisioned_store());
        rig.poller.reply(200, r#"["on"]"#).reply(200, r#""on""#);

        rig.tick(input(0));
        assert_eq!(rig.ctx.relay, RelayState::DeEnergized);
        assert!(matches!(rig.control.last_poll(), Some(Err(PollError::Parse(_)))));

        rig.tick(input(1_000));
        assert_eq!(rig.ctx.relay, RelayState::DeEnergized);
        assert!(!rig.ctx.indicator_lit);
    }

    #[test]
    fn polls_once_per_interval() {
        let mut rig = Rig::operational(provisioned_store());
        for _ in 0..3 {
            rig.poller.reply(200, r#"{"state":"on"}"#);
        }

        let mut now = 0;
        while now < 2_500 {
            rig.tick(input(now));
            now += 20;
        }

        // t=0, t=1000, t=2000
        assert_eq!(rig.poller.requests().len(), 3);
    }

    #[test]
    fn held_reset_triggers_single_erase_and_restart() {
        let mut rig = Rig::operational(provisioned_store());
        rig.poller.reply(200, r#"{"state":"on"}"#);
        rig.tick(input(0));
        assert_eq!(rig.ctx.relay, RelayState::Energized);

        let mut restarts = Vec::new();
        let mut now = 20;
        while now <= 8_000 {
            if let TickOutcome::Restart(restart) = rig.tick(pressed(now)) {
                restarts.push(restart);
            }
            now += 20;
        }

        assert_eq!(
            restarts,
            vec![Restart::new(RestartReason::FactoryReset, 1_000)]
        );
        assert_eq!(rig.store.clears(), 1);
        assert_eq!(rig.ctx.relay, RelayState::DeEnergized);
        assert!(rig.ctx.indicator_lit);
        // No polls while the button was held.
        assert_eq!(rig.poller.requests().len(), 1);

        let mut link = ScriptedStation::associates_after(1);
        let next_boot = boot(&rig.store, &mut link, &timing(), |_| {});
        assert_eq!(
            next_boot,
            BootSelection::Provisioning {
                reason: ProvisioningReason::ConfigInvalid(ConfigInvalid::Missing),
            }
        );
    }

    #[test]
    fn short_press_leaves_store_untouched() {
        let mut rig = Rig::operational(provisioned_store());
        rig.poller
            .reply(200, r#"{"state":"on"}"#)
            .reply(200, r#"{"state":"on"}"#);
        rig.tick(input(0));

        let mut now = 20;
        while now < 4_900 {
            assert_eq!(rig.tick(pressed(now)), TickOutcome::Continue);
            // Hold feedback suppresses actuation and keeps the relay safe.
            assert_eq!(rig.ctx.relay, RelayState::DeEnergized);
            now += 20;
        }
        rig.tick(input(now));

        assert_eq!(rig.store.clears(), 0);
        assert!(rig.store.load().is_provisioned());
        assert!(!rig.control.reset_monitor().is_holding());
        // Polling resumes on the first tick after release.
        assert_eq!(rig.ctx.relay, RelayState::Energized);
        assert_eq!(rig.poller.requests().len(), 2);
    }

    #[test]
    fn hold_feedback_blinks_fast() {
        let mut rig = Rig::provisioning(MemoryStore::default());

        rig.tick(pressed(1_000));
        let first = rig.ctx.indicator_lit;
        rig.tick(pressed(1_100));
        let second = rig.ctx.indicator_lit;
        rig.tick(pressed(1_200));

        assert_ne!(first, second);
        assert_eq!(first, rig.ctx.indicator_lit);
    }

    #[test]
    fn provisioning_heartbeat_never_polls() {
        let mut rig = Rig::provisioning(MemoryStore::default());
        let mut lit_samples = Vec::new();

        for now in [0, 250, 500, 750, 1_000, 1_250] {
            assert_eq!(rig.tick(input(now)), TickOutcome::Continue);
            assert_eq!(rig.ctx.relay, RelayState::DeEnergized);
            lit_samples.push(rig.ctx.indicator_lit);
        }

        assert_eq!(lit_samples, vec![true, true, false, false, true, true]);
        assert!(rig.poller.requests().is_empty());
    }

    #[test]
    fn reset_in_provisioning_erases_and_restarts() {
        let mut rig = Rig::provisioning(MemoryStore::with_config(DeviceConfig::new(
            "Stale", "", "",
        )));
        rig.tick(pressed(0));

        let outcome = rig.tick(pressed(5_000));

        assert_eq!(
            outcome,
            TickOutcome::Restart(Restart::new(RestartReason::FactoryReset, 1_000))
        );
        assert!(rig.store.load().is_empty());
    }

    #[test]
    fn erase_failure_still_restarts() {
        let mut rig = Rig::operational(MemoryStore::failing());
        rig.tick(pressed(0));

        let outcome = rig.tick(pressed(6_000));

        assert!(matches!(
            outcome,
            TickOutcome::Restart(Restart {
                reason: RestartReason::FactoryReset,
                ..
            })
        ));
    }

    #[test]
    fn link_loss_de_energizes_without_polling_then_restarts() {
        let mut rig = Rig::operational(provisioned_store());
        rig.poller.reply(200, r#"{"state":"on"}"#);
        rig.tick(input(0));
        assert_eq!(rig.ctx.relay, RelayState::Energized);

        let down = |now_ms| TickInput {
            link_up: false,
            ..input(now_ms)
        };

        assert_eq!(rig.tick(down(1_000)), TickOutcome::Continue);
        assert_eq!(rig.ctx.relay, RelayState::DeEnergized);
        assert_eq!(rig.control.last_poll(), Some(&Err(PollError::LinkDown)));
        assert_eq!(rig.poller.requests().len(), 1);

        assert_eq!(rig.tick(down(300_999)), TickOutcome::Continue);
        assert_eq!(
            rig.tick(down(301_000)),
            TickOutcome::Restart(Restart::new(RestartReason::LinkLost, 0))
        );
    }

    #[test]
    fn provisioning_round_trip_through_restart() {
        let mut store = MemoryStore::default();
        let mut link = ScriptedStation::associates_after(1);

        let first = boot(&store, &mut link, &timing(), |_| {});
        assert_eq!(first.mode(), OperatingMode::Provisioning);

        let mut control = ControlLoop::from_boot(&first, timing(), API);
        let mut ctx = control.initial_context();
        let mut offline = OfflinePoller;
        assert_eq!(
            control.tick(&mut ctx, input(0), &mut store, &mut offline),
            TickOutcome::Continue
        );

        let form = ProvisioningForm::from_urlencoded(b"ssid=X&pass=&appid=Y").expect("form body");
        let outcome = handle_submit(&mut store, &form, &timing());
        assert_eq!(
            outcome.restart(),
            Some(Restart::new(RestartReason::Provisioned, 2_000))
        );

        let mut link = ScriptedStation::associates_after(1);
        let second = boot(&store, &mut link, &timing(), |_| {});
        match second {
            BootSelection::Operational { config, .. } => {
                assert_eq!(config, DeviceConfig::new("X", "", "Y"));
            }
            other => panic!("expected operational boot, got {other:?}"),
        }
        assert_eq!(link.joined_with(), Some(("X", "")));
    }
}
