use std::{
    iter,
    sync::{Arc, Mutex, OnceLock, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Input, Output, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{
        gpio::{AnyInputPin, AnyOutputPin},
        prelude::Peripherals,
    },
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sys::EspError,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use relay_common::{
    boot, handle_submit,
    poll::MAX_STATE_BODY_BYTES,
    provisioning::{render_form, render_form_with_error, MAX_FORM_BODY_BYTES},
    store::{CONFIG_NAMESPACE, KEY_APPLIANCE_ID, KEY_PASS, KEY_SSID},
    ConfigStore, ConnectError, ControlLoop, ControlTiming, DeviceConfig, DeviceContext,
    OfflinePoller, OperatingMode, OutputLevel, PollError, ProvisioningForm, RelayWiring,
    Restart, StatePoller, StateReply, StationLink, TickInput, TickOutcome, WriteError,
    CONNECTIVITY_CHECK_PATHS, DEFAULT_API_BASE, PATH_FORM, PATH_SAVE, PROVISIONING_AP_CHANNEL,
    PROVISIONING_AP_PASSWORD, PROVISIONING_AP_SSID,
};

const API_BASE: &str = match option_env!("RELAY_API_BASE") {
    Some(base) => base,
    None => DEFAULT_API_BASE,
};
const RELAY_PIN: i32 = 23;
const STATUS_LED_PIN: i32 = 2;
const RESET_BUTTON_PIN: i32 = 0;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const NVS_VALUE_CAPACITY: usize = 128;

type RequestRef<'r, 'c> =
    esp_idf_svc::http::server::Request<&'r mut esp_idf_svc::http::server::EspHttpConnection<'c>>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    // Outputs go to their safe levels before anything that can block.
    let mut outputs = BoardOutputs::new(RelayWiring::default())?;
    let reset_button = init_reset_button(RESET_BUTTON_PIN)?;

    let mut timing = ControlTiming::default();
    timing.sanitize();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let mut store = NvsStore::new(nvs_partition.clone());

    let Peripherals { modem, .. } = Peripherals::take()?;
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let selection = {
        let mut station = EspStation { wifi: &mut wifi };
        boot(&store, &mut station, &timing, thread::sleep)
    };
    let mut control = ControlLoop::from_boot(&selection, timing.clone(), API_BASE);

    let (_server, mut poller): (Option<EspHttpServer<'static>>, Box<dyn StatePoller>) =
        match control.mode() {
            OperatingMode::Provisioning => {
                start_provisioning_ap(&mut wifi)?;
                let server = create_provisioning_http_server(store.clone(), timing.clone())?;
                (Some(server), Box::new(OfflinePoller))
            }
            OperatingMode::Operational => {
                disable_wifi_power_save();
                let poller = EspPoller {
                    timeout: Duration::from_millis(timing.poll_timeout_ms),
                };
                (None, Box::new(poller))
            }
        };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let restart = run_control_loop(
        &mut control,
        &mut store,
        poller.as_mut(),
        &reset_button,
        &mut outputs,
    );

    restart_device(restart);
    Ok(())
}

fn run_control_loop(
    control: &mut ControlLoop,
    store: &mut NvsStore,
    poller: &mut dyn StatePoller,
    reset_button: &PinDriver<'static, AnyInputPin, Input>,
    outputs: &mut BoardOutputs,
) -> Restart {
    let sample_interval = Duration::from_millis(control.timing().sample_interval_ms);
    let mut ctx = control.initial_context();

    loop {
        feed_watchdog();

        let input = TickInput {
            now_ms: monotonic_ms(),
            // Active-low with the internal pull-up.
            reset_active: reset_button.is_low(),
            link_up: control.mode() == OperatingMode::Provisioning || is_wifi_station_connected(),
        };
        let outcome = control.tick(&mut ctx, input, store, poller);
        outputs.apply(&ctx);

        if let TickOutcome::Restart(restart) = outcome {
            return restart;
        }
        thread::sleep(sample_interval);
    }
}

fn restart_device(restart: Restart) {
    info!(
        "restarting in {}ms ({:?})",
        restart.delay_ms, restart.reason
    );
    thread::sleep(Duration::from_millis(restart.delay_ms));
    unsafe { esp_idf_svc::sys::esp_restart() };
}

fn spawn_restart(restart: Restart) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("prov-restart".into())
        .spawn(move || restart_device(restart))
        .context("failed to spawn restart thread")?;
    Ok(())
}

struct EspStation<'a, 'w> {
    wifi: &'a mut BlockingWifi<&'w mut EspWifi<'static>>,
}

impl StationLink for EspStation<'_, '_> {
    fn begin(&mut self, ssid: &str, passphrase: &str) -> Result<(), ConnectError> {
        let auth_method = if passphrase.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        let client = ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| ConnectError::Rejected("wifi ssid too long".to_string()))?,
            password: passphrase
                .try_into()
                .map_err(|_| ConnectError::Rejected("wifi password too long".to_string()))?,
            auth_method,
            ..Default::default()
        };

        let rejected = |err: EspError| ConnectError::Rejected(err.to_string());
        self.wifi
            .set_configuration(&Configuration::Client(client))
            .map_err(rejected)?;
        self.wifi.start().map_err(rejected)?;
        // Non-blocking connect; association is observed through `is_up`.
        self.wifi.wifi_mut().connect().map_err(rejected)?;
        Ok(())
    }

    fn is_associated(&mut self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }

    fn abort(&mut self) {
        let _ = self.wifi.disconnect();
        let _ = self.wifi.stop();
    }
}

fn start_provisioning_ap(wifi: &mut BlockingWifi<&mut EspWifi<'static>>) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: PROVISIONING_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        password: PROVISIONING_AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("provisioning AP password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: PROVISIONING_AP_CHANNEL,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!(
        "provisioning AP started on `{}` (password: `{}`)",
        PROVISIONING_AP_SSID, PROVISIONING_AP_PASSWORD
    );
    Ok(())
}

fn create_provisioning_http_server(
    store: NvsStore,
    timing: ControlTiming,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for path in iter::once(PATH_FORM).chain(CONNECTIVITY_CHECK_PATHS) {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, |req| {
            write_html(req, 200, &render_form())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>(PATH_SAVE, Method::Post, move |mut req| {
        let body = match read_request_body(&mut req) {
            Ok(body) => body,
            Err(err) => {
                warn!("provisioning submission unreadable: {err:#}");
                return write_html(req, 413, &render_form_with_error("Submission too large"));
            }
        };

        let form = match ProvisioningForm::from_urlencoded(&body) {
            Ok(form) => form,
            Err(err) => {
                warn!("provisioning submission undecodable: {err}");
                let page = render_form_with_error("Submission could not be read");
                return write_html(req, 400, &page);
            }
        };
        let mut store = store.clone();
        let outcome = handle_submit(&mut store, &form, &timing);
        write_html(req, outcome.status_code(), &outcome.page())?;

        if let Some(restart) = outcome.restart() {
            spawn_restart(restart)?;
        }
        Ok(())
    })?;

    // Registered last: httpd matches handlers in registration order.
    for method in [Method::Get, Method::Post] {
        server.fn_handler::<anyhow::Error, _>("/*", method, |req| {
            req.into_response(302, Some("Found"), &[("Location", PATH_FORM)])?;
            Ok(())
        })?;
    }

    Ok(server)
}

fn read_request_body(req: &mut RequestRef<'_, '_>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_FORM_BODY_BYTES {
        return Err(anyhow!("request body of {len} bytes too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_html(req: RequestRef<'_, '_>, status_code: u16, html: &str) -> anyhow::Result<()> {
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "text/html; charset=utf-8")],
    )?
    .write_all(html.as_bytes())?;
    Ok(())
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsStore {
    fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn open(&self) -> Result<EspNvs<NvsDefault>, WriteError> {
        EspNvs::new(self.partition.clone(), CONFIG_NAMESPACE, true)
            .map_err(|err| WriteError::Open(err.to_string()))
    }
}

fn read_key(nvs: &EspNvs<NvsDefault>, key: &str) -> String {
    let mut buffer = [0_u8; NVS_VALUE_CAPACITY];
    match nvs.get_str(key, &mut buffer) {
        Ok(Some(value)) => value.to_string(),
        Ok(None) => String::new(),
        Err(err) => {
            warn!("failed to read `{key}` from NVS: {err}");
            String::new()
        }
    }
}

fn erase_key(nvs: &mut EspNvs<NvsDefault>, key: &'static str) -> Result<(), WriteError> {
    nvs.remove(key).map(|_| ()).map_err(|err| WriteError::Erase {
        key,
        reason: err.to_string(),
    })
}

fn write_key(nvs: &mut EspNvs<NvsDefault>, key: &'static str, value: &str) -> Result<(), WriteError> {
    nvs.set_str(key, value).map_err(|err| WriteError::Write {
        key,
        reason: err.to_string(),
    })
}

impl ConfigStore for NvsStore {
    fn load(&self) -> DeviceConfig {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = match self.open() {
            Ok(nvs) => nvs,
            Err(err) => {
                warn!("{err}; treating config as empty");
                return DeviceConfig::default();
            }
        };

        DeviceConfig::new(
            read_key(&nvs, KEY_SSID),
            read_key(&nvs, KEY_PASS),
            read_key(&nvs, KEY_APPLIANCE_ID),
        )
    }

    fn save(&mut self, config: &DeviceConfig) -> Result<(), WriteError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = self.open()?;

        // `appid` marks a complete record: gone first, written last.
        erase_key(&mut nvs, KEY_APPLIANCE_ID)?;
        write_key(&mut nvs, KEY_SSID, &config.ssid)?;
        write_key(&mut nvs, KEY_PASS, &config.passphrase)?;
        write_key(&mut nvs, KEY_APPLIANCE_ID, &config.appliance_id)
    }

    fn clear(&mut self) -> Result<(), WriteError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = self.open()?;

        erase_key(&mut nvs, KEY_APPLIANCE_ID)?;
        erase_key(&mut nvs, KEY_SSID)?;
        erase_key(&mut nvs, KEY_PASS)
    }
}

struct EspPoller {
    timeout: Duration,
}

impl StatePoller for EspPoller {
    fn fetch(&mut self, url: &str) -> Result<StateReply, PollError> {
        let transport = |err: &dyn core::fmt::Debug| PollError::Transport(format!("{err:?}"));

        let http_conf = HttpClientConfiguration {
            timeout: Some(self.timeout),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&http_conf).map_err(|e| transport(&e))?;
        let mut client = HttpClient::wrap(connection);
        let request = client
            .request(Method::Get, url, &[("Accept", "application/json")])
            .map_err(|e| transport(&e))?;
        let mut response = request.submit().map_err(|e| transport(&e))?;
        let status = response.status();

        // Read one byte past the limit so oversized bodies are still detected.
        let mut body = Vec::with_capacity(512);
        let mut chunk = [0_u8; 256];
        while body.len() <= MAX_STATE_BODY_BYTES {
            let read = response.read(&mut chunk).map_err(|e| transport(&e))?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..read]);
        }

        Ok(StateReply::new(
            status,
            String::from_utf8_lossy(&body).into_owned(),
        ))
    }
}

struct BoardOutputs {
    relay: PinDriver<'static, AnyOutputPin, Output>,
    indicator: PinDriver<'static, AnyOutputPin, Output>,
    wiring: RelayWiring,
    relay_level: OutputLevel,
    indicator_lit: bool,
}

impl BoardOutputs {
    fn new(wiring: RelayWiring) -> anyhow::Result<Self> {
        let relay = unsafe { PinDriver::output(AnyOutputPin::new(RELAY_PIN)) }
            .with_context(|| format!("relay output unavailable on GPIO{RELAY_PIN}"))?;
        let indicator = unsafe { PinDriver::output(AnyOutputPin::new(STATUS_LED_PIN)) }
            .with_context(|| format!("status LED unavailable on GPIO{STATUS_LED_PIN}"))?;

        let mut outputs = Self {
            relay,
            indicator,
            wiring,
            relay_level: wiring.safe_level(),
            indicator_lit: false,
        };
        drive(&mut outputs.relay, wiring.safe_level())?;
        drive(&mut outputs.indicator, OutputLevel::Low)?;
        info!("relay on GPIO{RELAY_PIN} held de-energized");
        Ok(outputs)
    }

    fn apply(&mut self, ctx: &DeviceContext) {
        let level = self.wiring.level_for(ctx.relay);
        if level != self.relay_level {
            match drive(&mut self.relay, level) {
                Ok(()) => {
                    info!("relay -> {}", ctx.relay.as_str());
                    self.relay_level = level;
                }
                Err(err) => warn!("failed to drive relay: {err}"),
            }
        }

        if ctx.indicator_lit != self.indicator_lit {
            let level = if ctx.indicator_lit {
                OutputLevel::High
            } else {
                OutputLevel::Low
            };
            match drive(&mut self.indicator, level) {
                Ok(()) => self.indicator_lit = ctx.indicator_lit,
                Err(err) => warn!("failed to drive status LED: {err}"),
            }
        }
    }
}

fn drive(pin: &mut PinDriver<'static, AnyOutputPin, Output>, level: OutputLevel) -> Result<(), EspError> {
    if level.is_high() {
        pin.set_high()
    } else {
        pin.set_low()
    }
}

fn init_reset_button(pin: i32) -> anyhow::Result<PinDriver<'static, AnyInputPin, Input>> {
    let mut button = unsafe { PinDriver::input(AnyInputPin::new(pin)) }
        .with_context(|| format!("reset button unavailable on GPIO{pin}"))?;
    button.set_pull(Pull::Up)?;
    Ok(button)
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
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
