use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, OnceLock, PoisonError},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect},
    routing::{get, post},
    Form, Router,
};
use tokio::{net::TcpListener, sync::watch};
use tracing::{debug, info, warn};

use relay_common::{
    boot,
    provisioning::{render_form, MAX_FORM_BODY_BYTES},
    ConfigStore, ConnectError, ControlLoop, ControlTiming, DeviceConfig, DeviceContext,
    OfflinePoller, OperatingMode, OutputLevel, PollError, ProvisioningForm, RelayWiring,
    Restart, StatePoller, StateReply, StationLink, TickInput, TickOutcome, WriteError,
    CONNECTIVITY_CHECK_PATHS, DEFAULT_API_BASE, PATH_FORM, PATH_SAVE, PROVISIONING_AP_SSID,
};

type RestartSignal = Arc<watch::Sender<Option<Restart>>>;

#[derive(Debug, Clone)]
struct HostSettings {
    data_dir: PathBuf,
    api_base: String,
    http_port: u16,
    join_fails: bool,
    wiring: RelayWiring,
    timing: ControlTiming,
}

impl HostSettings {
    fn from_env() -> Self {
        let data_dir = std::env::var("RELAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.relay"));
        let api_base =
            std::env::var("RELAY_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        let http_port = std::env::var("RELAY_HTTP_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(8080);
        let join_fails = std::env::var("RELAY_SIM_JOIN")
            .map(|value| value.eq_ignore_ascii_case("fail"))
            .unwrap_or(false);
        let wiring = match std::env::var("RELAY_ACTIVE_LOW").as_deref() {
            Ok("1") | Ok("true") => RelayWiring {
                appliance_on_level: OutputLevel::Low,
            },
            _ => RelayWiring::default(),
        };
        let timing = load_timing(&data_dir.join("timing.json"));

        Self {
            data_dir,
            api_base,
            http_port,
            join_fails,
            wiring,
            timing,
        }
    }

    fn reset_button(&self) -> MarkerFile {
        std::env::var("RELAY_RESET_BUTTON")
            .map(|path| MarkerFile::new(PathBuf::from(path)))
            .unwrap_or_else(|_| MarkerFile::new(self.data_dir.join("reset-button")))
    }

    fn link_down(&self) -> MarkerFile {
        MarkerFile::new(self.data_dir.join("link-down"))
    }
}

fn load_timing(path: &Path) -> ControlTiming {
    let mut timing = match std::fs::read(path) {
        Ok(raw) => serde_json::from_slice::<ControlTiming>(&raw).unwrap_or_else(|err| {
            warn!("ignoring unreadable {}: {err}", path.display());
            ControlTiming::default()
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => ControlTiming::default(),
        Err(err) => {
            warn!("failed to read {}: {err}", path.display());
            ControlTiming::default()
        }
    };
    timing.sanitize();
    timing
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Arc::new(HostSettings::from_env());
    let store = FileStore::new(settings.data_dir.join("config.json"));
    info!(
        "relay controller simulation: data dir {}, api base {}",
        settings.data_dir.display(),
        settings.api_base
    );

    loop {
        let restart = run_boot_cycle(settings.clone(), store.clone()).await?;
        info!(
            "restart requested ({:?}); rebooting in {}ms",
            restart.reason, restart.delay_ms
        );
        tokio::time::sleep(Duration::from_millis(restart.delay_ms)).await;
    }
}

async fn run_boot_cycle(settings: Arc<HostSettings>, store: FileStore) -> anyhow::Result<Restart> {
    let mut outputs = LoggedOutputs::new(settings.wiring);
    outputs.apply(&DeviceContext::new(OperatingMode::Provisioning));

    let selection = {
        let settings = settings.clone();
        let store = store.clone();
        tokio::task::spawn_blocking(move || {
            let mut station = SimulatedStation::new(settings.join_fails);
            boot(&store, &mut station, &settings.timing, std::thread::sleep)
        })
        .await
        .context("boot task panicked")?
    };

    let control = ControlLoop::from_boot(&selection, settings.timing.clone(), &settings.api_base);
    let (restart_tx, restart_rx) = watch::channel(None);
    let restart_tx: RestartSignal = Arc::new(restart_tx);

    let portal = match control.mode() {
        OperatingMode::Provisioning => {
            let state = PortalState {
                store: store.clone(),
                timing: settings.timing.clone(),
                restart: restart_tx.clone(),
            };
            Some(spawn_portal(settings.http_port, state, restart_rx.clone()).await?)
        }
        OperatingMode::Operational => None,
    };

    let restart = {
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || {
            drive_device(control, &settings, store, outputs, &restart_tx, &restart_rx)
        })
        .await
        .context("device loop panicked")??
    };

    if let Some(portal) = portal {
        match portal.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("provisioning portal error: {err:#}"),
            Err(err) => warn!("provisioning portal task failed: {err}"),
        }
    }
    Ok(restart)
}

fn drive_device(
    mut control: ControlLoop,
    settings: &HostSettings,
    mut store: FileStore,
    mut outputs: LoggedOutputs,
    restart_tx: &RestartSignal,
    restart_rx: &watch::Receiver<Option<Restart>>,
) -> anyhow::Result<Restart> {
    let mut poller: Box<dyn StatePoller> = match control.mode() {
        OperatingMode::Provisioning => Box::new(OfflinePoller),
        OperatingMode::Operational => Box::new(HttpPoller::new(Duration::from_millis(
            settings.timing.poll_timeout_ms,
        ))?),
    };
    let reset_button = settings.reset_button();
    let link_down = settings.link_down();
    let sample_interval = Duration::from_millis(settings.timing.sample_interval_ms);
    let mut ctx = control.initial_context();

    loop {
        if let Some(restart) = *restart_rx.borrow() {
            return Ok(restart);
        }

        let input = TickInput {
            now_ms: monotonic_ms(),
            reset_active: reset_button.is_present(),
            link_up: !link_down.is_present(),
        };
        let outcome = control.tick(&mut ctx, input, &mut store, poller.as_mut());
        outputs.apply(&ctx);

        if let TickOutcome::Restart(restart) = outcome {
            restart_tx.send_replace(Some(restart));
            return Ok(restart);
        }
        std::thread::sleep(sample_interval);
    }
}

#[derive(Clone)]
struct PortalState {
    store: FileStore,
    timing: ControlTiming,
    restart: RestartSignal,
}

async fn spawn_portal(
    port: u16,
    state: PortalState,
    mut restart_rx: watch::Receiver<Option<Restart>>,
) -> anyhow::Result<tokio::task::JoinHandle<anyhow::Result<()>>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind provisioning portal at {addr}"))?;
    info!("provisioning AP `{PROVISIONING_AP_SSID}`: portal on http://{addr}");

    let app = portal_router(state);
    Ok(tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = restart_rx.wait_for(Option::is_some).await;
            })
            .await
            .context("provisioning portal server failed")
    }))
}

fn portal_router(state: PortalState) -> Router {
    let mut router = Router::new()
        .route(PATH_FORM, get(handle_form))
        .route(PATH_SAVE, post(handle_save));
    for path in CONNECTIVITY_CHECK_PATHS {
        router = router.route(path, get(handle_form));
    }
    router
        .fallback(handle_redirect)
        .layer(DefaultBodyLimit::max(MAX_FORM_BODY_BYTES))
        .with_state(state)
}

async fn handle_form() -> Html<String> {
    Html(render_form())
}

async fn handle_save(
    State(state): State<PortalState>,
    Form(form): Form<ProvisioningForm>,
) -> impl IntoResponse {
    let PortalState {
        store,
        timing,
        restart,
    } = state;
    let outcome = tokio::task::spawn_blocking(move || {
        let mut store = store;
        relay_common::handle_submit(&mut store, &form, &timing)
    })
    .await;

    match outcome {
        Ok(outcome) => {
            if let Some(pending) = outcome.restart() {
                restart.send_replace(Some(pending));
            }
            let status = StatusCode::from_u16(outcome.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Html(outcome.page())).into_response()
        }
        Err(err) => {
            warn!("provisioning submit task failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_redirect() -> Redirect {
    Redirect::to(PATH_FORM)
}

#[derive(Clone)]
struct FileStore {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl FileStore {
    fn new(path: PathBuf) -> Self {
        Self {
            path: Arc::new(path),
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn write_record(&self, config: &DeviceConfig) -> Result<(), WriteError> {
        let path = self.path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| WriteError::Open(err.to_string()))?;
        }
        let payload = serde_json::to_vec_pretty(config).map_err(|err| WriteError::Write {
            key: relay_common::store::KEY_APPLIANCE_ID,
            reason: err.to_string(),
        })?;

        // Rename over the old record so a crash mid-write never leaves a
        // half-written file behind.
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, payload)
            .and_then(|()| std::fs::rename(&staging, path))
            .map_err(|err| WriteError::Write {
                key: relay_common::store::KEY_APPLIANCE_ID,
                reason: err.to_string(),
            })
    }
}

impl ConfigStore for FileStore {
    fn load(&self) -> DeviceConfig {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        match std::fs::read(self.path.as_ref()) {
            Ok(raw) => serde_json::from_slice::<DeviceConfig>(&raw).unwrap_or_else(|err| {
                warn!("stored config unreadable, treating as empty: {err}");
                DeviceConfig::default()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => DeviceConfig::default(),
            Err(err) => {
                warn!("failed to read stored config: {err}");
                DeviceConfig::default()
            }
        }
    }

    fn save(&mut self, config: &DeviceConfig) -> Result<(), WriteError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write_record(config)
    }

    fn clear(&mut self) -> Result<(), WriteError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        match std::fs::remove_file(self.path.as_ref()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(WriteError::Erase {
                key: relay_common::store::KEY_APPLIANCE_ID,
                reason: err.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
struct MarkerFile {
    path: PathBuf,
}

impl MarkerFile {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn is_present(&self) -> bool {
        self.path.exists()
    }
}

struct SimulatedStation {
    join_fails: bool,
    joining: Option<String>,
}

impl SimulatedStation {
    fn new(join_fails: bool) -> Self {
        Self {
            join_fails,
            joining: None,
        }
    }
}

impl StationLink for SimulatedStation {
    fn begin(&mut self, ssid: &str, _passphrase: &str) -> Result<(), ConnectError> {
        self.joining = Some(ssid.to_string());
        Ok(())
    }

    fn is_associated(&mut self) -> bool {
        self.joining.is_some() && !self.join_fails
    }

    fn abort(&mut self) {
        if let Some(ssid) = self.joining.take() {
            debug!("simulated join of `{ssid}` aborted");
        }
    }
}

struct HttpPoller {
    client: reqwest::blocking::Client,
}

impl HttpPoller {
    fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build state poll client")?;
        Ok(Self { client })
    }
}

impl StatePoller for HttpPoller {
    fn fetch(&mut self, url: &str) -> Result<StateReply, PollError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| PollError::Transport(err.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|err| PollError::Transport(err.to_string()))?;
        Ok(StateReply::new(status, body))
    }
}

struct LoggedOutputs {
    wiring: RelayWiring,
    relay_level: Option<OutputLevel>,
    indicator_lit: Option<bool>,
}

impl LoggedOutputs {
    fn new(wiring: RelayWiring) -> Self {
        Self {
            wiring,
            relay_level: None,
            indicator_lit: None,
        }
    }

    fn apply(&mut self, ctx: &DeviceContext) {
        let level = self.wiring.level_for(ctx.relay);
        if self.relay_level != Some(level) {
            info!("relay pin -> {level:?} ({})", ctx.relay.as_str());
            self.relay_level = Some(level);
        }
        if self.indicator_lit != Some(ctx.indicator_lit) {
            debug!(
                "indicator -> {}",
                if ctx.indicator_lit { "on" } else { "off" }
            );
            self.indicator_lit = Some(ctx.indicator_lit);
        }
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
