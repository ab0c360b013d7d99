use core::convert::TryInto;
use std::{
    net::ToSocketAddrs,
    sync::{mpsc, Arc, Mutex},
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADCPin,
    },
    gpio::{AnyIOPin, Input, PinDriver, Pull},
    peripheral::Peripheral,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection, FollowRedirectsPolicy},
        server::{Configuration as HttpServerConfiguration, EspHttpServer},
    },
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    ota::{EspOta, EspOtaUpdate},
    sntp::{EspSntp, SyncStatus},
    sys::EspError,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Deserialize;

use paperlink_common::{
    keys, BootReadings, ButtonInput, Clock, Collaborators, ContentArchive, ContentError, CycleExit,
    FirmwareError, FirmwareSink, FsArchive, Header, HttpResponse, ImagePayload, MemoryArchive,
    Network, NetworkConfig, NetworkError, RenderHints, Renderer, RequestLimits, RuntimeConfig,
    SleepPlan, StatusScreen, Store, StoreError, Transport, TransportError, WakeCause, WakeCycle,
    WakeSource,
};

const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

const NVS_CONFIG_NAMESPACE: &str = "config";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_STATE_NAMESPACE: &str = "paperlink";
const NVS_STR_BUFFER: usize = 2048;
const _: () = assert!(paperlink_common::logqueue::MAX_STORED_ENTRY_BYTES < NVS_STR_BUFFER);
const MAX_LOG_SLOTS: usize = 64;

const PORTAL_AP_SSID: &str = "TRMNL";
const PORTAL_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_PORTAL_BODY: usize = 512;
const WIFI_CONNECT_ATTEMPTS: u32 = 3;
const WIFI_RETRY_DELAY_MS: u64 = 2_000;
const SNTP_WAIT: Duration = Duration::from_secs(5);
const MIN_VALID_EPOCH: u64 = 1_600_000_000;

const HTTP_CHUNK_SIZE: usize = 4096;
const STORAGE_MOUNT: &str = "/spiffs";
const BATTERY_DIVIDER: f32 = 2.0;
const BATTERY_SAMPLES: u32 = 8;

const PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8"><meta name="viewport" content="width=device-width, initial-scale=1"><title>TRMNL Setup</title></head>
<body style="font-family:Arial,sans-serif;max-width:480px;margin:2rem auto;padding:0 1rem">
  <h1>WiFi Setup</h1>
  <label>SSID</label><input id="ssid" type="text" style="width:100%">
  <label>Password</label><input id="pass" type="password" style="width:100%">
  <button id="save">Connect</button>
  <p id="status"></p>
  <script>
    document.getElementById('save').onclick=async()=>{
      const body=JSON.stringify({wifiSsid:document.getElementById('ssid').value,wifiPass:document.getElementById('pass').value});
      const r=await fetch('/api/network',{method:'POST',headers:{'Content-Type':'application/json'},body});
      document.getElementById('status').textContent=r.ok?'Saved, connecting...':'Failed: '+r.status;
    };
  </script>
</body>
</html>
"#;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let wake_cause = read_wake_cause();
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let config_store = ConfigStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = config_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);
    runtime.sanitize();

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let Peripherals {
        modem, pins, adc1, ..
    } = Peripherals::take()?;

    #[cfg(target_arch = "riscv32")]
    let battery_pin = pins.gpio3;
    #[cfg(not(target_arch = "riscv32"))]
    let battery_pin = pins.gpio34;
    let battery_voltage = read_battery_voltage(adc1, battery_pin).unwrap_or_else(|err| {
        warn!("battery read failed: {err:#}");
        0.0
    });
    let boot = BootReadings {
        wake_cause,
        battery_voltage,
        free_heap: unsafe { esp_idf_svc::sys::esp_get_free_heap_size() },
    };

    let mut button = EspButton::new(runtime.board.wake_pin, runtime.board.wake_active_low)
        .context("failed to configure wake button")?;
    let mut clock = EspClock { sntp: None };

    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition.clone()))?;
    let mut network = EspNetwork {
        wifi: BlockingWifi::wrap(esp_wifi, sys_loop)?,
        credentials: runtime.network.clone(),
        config_store,
        connected: false,
    };

    let mut store = NvsStore::open(nvs_partition).context("failed to open state namespace")?;
    let mut transport = EspTransport;
    let mut renderer = PanelRenderer;
    let mut firmware = EspFirmwareSink { update: None };
    let mut archive: Box<dyn ContentArchive> = match mount_storage() {
        Ok(()) => Box::new(FsArchive::new(STORAGE_MOUNT)),
        Err(err) => {
            warn!("content storage unavailable, archiving in RAM: {err:#}");
            Box::new(MemoryArchive::new())
        }
    };

    let io = Collaborators {
        store: &mut store,
        clock: &mut clock,
        button: &mut button,
        network: &mut network,
        transport: &mut transport,
        renderer: &mut renderer,
        archive: archive.as_mut(),
        firmware: &mut firmware,
    };

    match WakeCycle::new(&runtime, FIRMWARE_VERSION, io).run(boot) {
        CycleExit::Sleep(plan) => enter_deep_sleep(&plan),
        CycleExit::Restart(reason) => {
            info!("restarting: {reason:?}");
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
    }
}

fn read_wake_cause() -> WakeCause {
    use esp_idf_svc::sys::{
        esp_sleep_source_t_ESP_SLEEP_WAKEUP_EXT0 as EXT0,
        esp_sleep_source_t_ESP_SLEEP_WAKEUP_EXT1 as EXT1,
        esp_sleep_source_t_ESP_SLEEP_WAKEUP_GPIO as GPIO,
        esp_sleep_source_t_ESP_SLEEP_WAKEUP_TIMER as TIMER,
        esp_sleep_source_t_ESP_SLEEP_WAKEUP_UNDEFINED as UNDEFINED,
    };

    match unsafe { esp_idf_svc::sys::esp_sleep_get_wakeup_cause() } {
        TIMER => WakeCause::Timer,
        GPIO | EXT0 | EXT1 => WakeCause::Button,
        UNDEFINED => WakeCause::PowerOn,
        _ => WakeCause::Other,
    }
}

fn read_battery_voltage<T: ADCPin>(
    adc: impl Peripheral<P = T::Adc> + 'static,
    pin: impl Peripheral<P = T> + 'static,
) -> anyhow::Result<f32> {
    let driver = AdcDriver::new(adc)?;
    let config = AdcChannelConfig {
        attenuation: DB_11,
        ..Default::default()
    };
    let mut channel = AdcChannelDriver::new(&driver, pin, &config)?;

    let mut total_mv = 0_u32;
    for _ in 0..BATTERY_SAMPLES {
        total_mv = total_mv.saturating_add(u32::from(driver.read(&mut channel)?));
    }
    let average_mv = total_mv / BATTERY_SAMPLES;
    Ok(average_mv as f32 * BATTERY_DIVIDER / 1000.0)
}

fn enter_deep_sleep(plan: &SleepPlan) -> ! {
    for source in &plan.wake_sources {
        match *source {
            WakeSource::Timer { seconds } => {
                let micros = u64::from(seconds).saturating_mul(1_000_000);
                unsafe { esp_idf_svc::sys::esp_sleep_enable_timer_wakeup(micros) };
            }
            WakeSource::Button { pin, active_low } => arm_button_wake(pin, active_low),
        }
    }
    info!("entering deep sleep for {}s", plan.seconds);
    unsafe { esp_idf_svc::sys::esp_deep_sleep_start() }
}

#[cfg(target_arch = "riscv32")]
fn arm_button_wake(pin: i32, active_low: bool) {
    use esp_idf_svc::sys::{
        esp_deepsleep_gpio_wake_up_mode_t_ESP_GPIO_WAKEUP_GPIO_HIGH as WAKE_HIGH,
        esp_deepsleep_gpio_wake_up_mode_t_ESP_GPIO_WAKEUP_GPIO_LOW as WAKE_LOW,
    };

    let mode = if active_low { WAKE_LOW } else { WAKE_HIGH };
    let rc = unsafe { esp_idf_svc::sys::esp_deep_sleep_enable_gpio_wakeup(1_u64 << pin, mode) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to arm gpio wake on pin {pin}: esp_err_t={rc}");
    }
}

#[cfg(not(target_arch = "riscv32"))]
fn arm_button_wake(pin: i32, active_low: bool) {
    let level = if active_low { 0 } else { 1 };
    let rc = unsafe { esp_idf_svc::sys::esp_sleep_enable_ext0_wakeup(pin, level) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to arm ext0 wake on pin {pin}: esp_err_t={rc}");
    }
}

fn mount_storage() -> anyhow::Result<()> {
    let base_path = std::ffi::CString::new(STORAGE_MOUNT)?;
    let conf = esp_idf_svc::sys::esp_vfs_spiffs_conf_t {
        base_path: base_path.as_ptr(),
        partition_label: core::ptr::null(),
        max_files: 4,
        format_if_mount_failed: true,
    };
    esp_idf_svc::sys::esp!(unsafe { esp_idf_svc::sys::esp_vfs_spiffs_register(&conf) })?;
    Ok(())
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        runtime.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or_default().to_string();
    }

    if runtime.network.wifi_pass.is_empty() {
        runtime.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or_default().to_string();
    }
}

/// Runtime config JSON in its own NVS namespace.
#[derive(Clone)]
struct ConfigStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl ConfigStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("config lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_CONFIG_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_network(&self, network: &NetworkConfig) -> anyhow::Result<()> {
        let mut runtime = self.load_runtime_config()?;
        runtime.network.wifi_ssid = network.wifi_ssid.clone();
        runtime.network.wifi_pass = network.wifi_pass.clone();

        let _guard = self.lock.lock().map_err(|_| anyhow!("config lock poisoned"))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_CONFIG_NAMESPACE, true)?;
        let payload = serde_json::to_string(&runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

/// Device record in NVS. Every `set_*` commits, so `flush` has nothing left to do.
struct NvsStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsStore {
    fn open(partition: EspDefaultNvsPartition) -> Result<Self, EspError> {
        Ok(Self {
            nvs: EspNvs::new(partition, NVS_STATE_NAMESPACE, true)?,
        })
    }
}

fn nvs_error(key: &str, err: EspError) -> StoreError {
    StoreError::Backend(format!("{key}: {err}"))
}

impl Store for NvsStore {
    fn contains(&self, key: &str) -> Result<bool, StoreError> {
        self.nvs.contains(key).map_err(|err| nvs_error(key, err))
    }

    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut buffer = vec![0_u8; NVS_STR_BUFFER];
        let value = self
            .nvs
            .get_str(key, &mut buffer)
            .map_err(|err| nvs_error(key, err))?;
        Ok(value.map(str::to_string))
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        let value = self.nvs.get_u8(key).map_err(|err| nvs_error(key, err))?;
        Ok(value.map(|raw| raw != 0))
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>, StoreError> {
        self.nvs.get_u32(key).map_err(|err| nvs_error(key, err))
    }

    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.nvs.set_str(key, value).map_err(|err| nvs_error(key, err))
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.nvs
            .set_u8(key, u8::from(value))
            .map_err(|err| nvs_error(key, err))
    }

    fn put_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError> {
        self.nvs.set_u32(key, value).map_err(|err| nvs_error(key, err))
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.nvs
            .remove(key)
            .map(|_| ())
            .map_err(|err| nvs_error(key, err))
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        let fixed = [
            keys::API_KEY,
            keys::FRIENDLY_ID,
            keys::REFRESH_RATE,
            keys::FILENAME,
            keys::REGISTERED,
            keys::LAST_SLEEP,
            keys::API_RETRY,
            keys::WIFI_RETRY,
            keys::LOG_ID,
            keys::LOG_HEAD,
            keys::SPECIAL_FUNCTION,
            keys::TEMP_PROFILE,
        ];
        for key in fixed {
            self.remove(key)?;
        }
        for slot in 0..MAX_LOG_SLOTS {
            self.remove(&keys::log_slot(slot))?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct EspClock {
    sntp: Option<EspSntp<'static>>,
}

impl Clock for EspClock {
    fn uptime_ms(&self) -> u64 {
        let micros = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
        u64::try_from(micros / 1_000).unwrap_or(0)
    }

    fn delay_ms(&mut self, ms: u32) {
        thread::sleep(Duration::from_millis(u64::from(ms)));
    }

    fn sync_time(&mut self) -> Option<u64> {
        if self.sntp.is_none() {
            match EspSntp::new_default() {
                Ok(sntp) => self.sntp = Some(sntp),
                Err(err) => {
                    warn!("sntp start failed: {err}");
                    return None;
                }
            }
        }

        let started = Instant::now();
        while started.elapsed() < SNTP_WAIT {
            let synced = self
                .sntp
                .as_ref()
                .is_some_and(|sntp| sntp.get_sync_status() == SyncStatus::Completed);
            if synced {
                return self.epoch_now();
            }
            thread::sleep(Duration::from_millis(100));
        }
        // an RTC that survived deep sleep still has usable time
        self.epoch_now()
    }

    fn epoch_now(&self) -> Option<u64> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
        (now >= MIN_VALID_EPOCH).then_some(now)
    }
}

struct EspButton {
    pin: PinDriver<'static, AnyIOPin, Input>,
    active_low: bool,
}

impl EspButton {
    fn new(gpio: i32, active_low: bool) -> Result<Self, EspError> {
        let mut pin = PinDriver::input(unsafe { AnyIOPin::new(gpio) })?;
        pin.set_pull(if active_low { Pull::Up } else { Pull::Down })?;
        Ok(Self { pin, active_low })
    }
}

impl ButtonInput for EspButton {
    fn is_pressed(&mut self) -> bool {
        if self.active_low {
            self.pin.is_low()
        } else {
            self.pin.is_high()
        }
    }
}

#[derive(Debug, Deserialize)]
struct PortalCredentials {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPass", default)]
    wifi_pass: String,
}

struct EspNetwork {
    wifi: BlockingWifi<EspWifi<'static>>,
    credentials: NetworkConfig,
    config_store: ConfigStore,
    connected: bool,
}

fn driver_error(err: EspError) -> NetworkError {
    NetworkError::Internal(err.to_string())
}

impl EspNetwork {
    fn start_access_point(&mut self) -> Result<(), NetworkError> {
        let _ = self.wifi.stop();
        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: PORTAL_AP_SSID
                    .try_into()
                    .map_err(|_| NetworkError::PortalFailed("portal SSID too long".into()))?,
                auth_method: AuthMethod::None,
                channel: 1,
                ..Default::default()
            }))
            .map_err(driver_error)?;
        self.wifi.start().map_err(driver_error)?;
        self.wifi.wait_netif_up().map_err(driver_error)?;
        info!("captive portal AP `{PORTAL_AP_SSID}` is up");
        Ok(())
    }

    fn await_portal_credentials(&mut self) -> anyhow::Result<PortalCredentials> {
        let (tx, rx) = mpsc::channel::<PortalCredentials>();
        let mut server = EspHttpServer::new(&HttpServerConfiguration {
            stack_size: 8 * 1024,
            ..Default::default()
        })?;

        server.fn_handler::<anyhow::Error, _>("/", Method::Get, |req| {
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(PORTAL_HTML.as_bytes())?;
            Ok(())
        })?;

        server.fn_handler::<anyhow::Error, _>("/api/network", Method::Post, move |mut req| {
            let len = usize::try_from(req.content_len().unwrap_or(0))?;
            if len == 0 || len > MAX_PORTAL_BODY {
                req.into_status_response(400)?;
                return Ok(());
            }
            let mut body = vec![0_u8; len];
            req.read_exact(&mut body)?;
            let credentials: PortalCredentials =
                serde_json::from_slice(&body).context("invalid credentials payload")?;
            tx.send(credentials)
                .map_err(|_| anyhow!("portal already closed"))?;
            req.into_ok_response()?.write_all(b"{\"saved\":true}")?;
            Ok(())
        })?;

        let credentials = rx
            .recv_timeout(PORTAL_TIMEOUT)
            .map_err(|_| anyhow!("no credentials submitted within {PORTAL_TIMEOUT:?}"))?;
        drop(server);
        Ok(credentials)
    }
}

impl Network for EspNetwork {
    fn has_credentials(&self) -> bool {
        !self.credentials.wifi_ssid.trim().is_empty()
    }

    fn connect(&mut self) -> Result<(), NetworkError> {
        if !self.has_credentials() {
            return Err(NetworkError::MissingCredentials);
        }

        let auth_method = if self.credentials.wifi_pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: self
                    .credentials
                    .wifi_ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| NetworkError::ConnectFailed("wifi ssid too long".into()))?,
                password: self
                    .credentials
                    .wifi_pass
                    .as_str()
                    .try_into()
                    .map_err(|_| NetworkError::ConnectFailed("wifi password too long".into()))?,
                auth_method,
                ..Default::default()
            }))
            .map_err(driver_error)?;

        if !self.wifi.is_started().map_err(driver_error)? {
            self.wifi.start().map_err(driver_error)?;
        }

        let mut last_err = None;
        for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
            match self.wifi.connect().and_then(|()| self.wifi.wait_netif_up()) {
                Ok(()) => {
                    info!("wifi connected on attempt {attempt}");
                    self.connected = true;
                    return Ok(());
                }
                Err(err) => {
                    warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err}");
                    last_err = Some(err);
                }
            }
            if attempt < WIFI_CONNECT_ATTEMPTS {
                let _ = self.wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
        }

        Err(NetworkError::ConnectFailed(
            last_err.map(|err| err.to_string()).unwrap_or_default(),
        ))
    }

    fn run_portal(&mut self) -> Result<(), NetworkError> {
        self.start_access_point()?;
        let submitted = self
            .await_portal_credentials()
            .map_err(|err| NetworkError::PortalFailed(format!("{err:#}")))?;
        let _ = self.wifi.stop();

        self.credentials.wifi_ssid = submitted.wifi_ssid;
        self.credentials.wifi_pass = submitted.wifi_pass;
        if let Err(err) = self.config_store.save_network(&self.credentials) {
            warn!("failed to persist portal credentials: {err:#}");
        }
        self.connect()
    }

    fn forget_credentials(&mut self) -> Result<(), NetworkError> {
        self.credentials.wifi_ssid.clear();
        self.credentials.wifi_pass.clear();
        self.config_store
            .save_network(&self.credentials)
            .map_err(|err| NetworkError::Internal(format!("{err:#}")))
    }

    fn is_connected(&self) -> bool {
        self.connected && self.wifi.is_connected().unwrap_or(false)
    }

    fn rssi(&self) -> i32 {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        if rc == esp_idf_svc::sys::ESP_OK {
            i32::from(ap_info.rssi)
        } else {
            0
        }
    }

    fn mac_address(&self) -> String {
        match self.wifi.wifi().sta_netif().get_mac() {
            Ok(mac) => mac
                .iter()
                .map(|byte| format!("{byte:02X}"))
                .collect::<Vec<_>>()
                .join(":"),
            Err(err) => {
                warn!("failed to read station mac: {err}");
                String::new()
            }
        }
    }

    fn disconnect(&mut self) {
        let _ = self.wifi.disconnect();
        let _ = self.wifi.stop();
        self.connected = false;
    }
}

/// HTTP over `EspHttpConnection`, one connection per request. Redirects are
/// handed back to the caller.
struct EspTransport;

impl EspTransport {
    fn client(limits: &RequestLimits) -> Result<HttpClient<EspHttpConnection>, TransportError> {
        let conf = HttpClientConfiguration {
            timeout: Some(Duration::from_millis(u64::from(limits.idle_timeout_ms))),
            follow_redirects_policy: FollowRedirectsPolicy::FollowNone,
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let connection =
            EspHttpConnection::new(&conf).map_err(|err| TransportError::Connect(err.to_string()))?;
        Ok(HttpClient::wrap(connection))
    }
}

fn header_refs(headers: &[Header]) -> Vec<(&str, &str)> {
    headers
        .iter()
        .map(|(name, value)| (*name, value.as_str()))
        .collect()
}

/// Reads a body with an overall deadline and a size cap.
fn read_body<R: Read>(
    reader: &mut R,
    limits: &RequestLimits,
    started: Instant,
) -> Result<Vec<u8>, TransportError>
where
    R::Error: core::fmt::Debug,
{
    let deadline = Duration::from_millis(u64::from(limits.timeout_ms));
    let mut body = Vec::new();
    let mut chunk = [0_u8; HTTP_CHUNK_SIZE];
    loop {
        if started.elapsed() > deadline {
            return Err(TransportError::Timeout);
        }
        let read = reader
            .read(&mut chunk)
            .map_err(|err| TransportError::Io(format!("{err:?}")))?;
        if read == 0 {
            return Ok(body);
        }
        if body.len().saturating_add(read) > limits.max_body_bytes {
            return Err(TransportError::TooLarge {
                limit: limits.max_body_bytes,
            });
        }
        body.extend_from_slice(&chunk[..read]);
    }
}

impl Transport for EspTransport {
    fn resolve(&mut self, host: &str) -> Result<(), TransportError> {
        let mut addrs = (host, 0)
            .to_socket_addrs()
            .map_err(|err| TransportError::Dns(format!("{host}: {err}")))?;
        match addrs.next() {
            Some(_) => Ok(()),
            None => Err(TransportError::Dns(host.to_string())),
        }
    }

    fn get(
        &mut self,
        url: &str,
        headers: &[Header],
        limits: &RequestLimits,
    ) -> Result<HttpResponse, TransportError> {
        let started = Instant::now();
        let mut client = Self::client(limits)?;
        let request = client
            .request(Method::Get, url, &header_refs(headers))
            .map_err(|err| TransportError::Connect(format!("{err:?}")))?;
        let mut response = request
            .submit()
            .map_err(|err| TransportError::Connect(format!("{err:?}")))?;

        let status = response.status();
        let location = response.header("Location").map(str::to_string);
        let content_type = response.header("Content-Type").map(str::to_string);
        let content_length = response
            .header("Content-Length")
            .and_then(|value| value.trim().parse::<u64>().ok());
        let body = read_body(&mut response, limits, started)?;

        Ok(HttpResponse {
            status,
            location,
            content_type,
            content_length,
            body,
        })
    }

    fn post_json(
        &mut self,
        url: &str,
        headers: &[Header],
        body: &[u8],
        limits: &RequestLimits,
    ) -> Result<HttpResponse, TransportError> {
        let started = Instant::now();
        let content_length = body.len().to_string();
        let mut all_headers = header_refs(headers);
        all_headers.push(("Content-Length", content_length.as_str()));

        let mut client = Self::client(limits)?;
        let mut request = client
            .request(Method::Post, url, &all_headers)
            .map_err(|err| TransportError::Connect(format!("{err:?}")))?;
        request
            .write_all(body)
            .map_err(|err| TransportError::Io(format!("{err:?}")))?;
        let mut response = request
            .submit()
            .map_err(|err| TransportError::Io(format!("{err:?}")))?;

        let status = response.status();
        let body = read_body(&mut response, limits, started)?;
        Ok(HttpResponse {
            status,
            body,
            ..HttpResponse::default()
        })
    }

    fn stream(
        &mut self,
        url: &str,
        headers: &[Header],
        limits: &RequestLimits,
        on_chunk: &mut dyn FnMut(&[u8]) -> Result<(), String>,
    ) -> Result<u16, TransportError> {
        let started = Instant::now();
        let deadline = Duration::from_millis(u64::from(limits.timeout_ms));
        let mut client = Self::client(limits)?;
        let request = client
            .request(Method::Get, url, &header_refs(headers))
            .map_err(|err| TransportError::Connect(format!("{err:?}")))?;
        let mut response = request
            .submit()
            .map_err(|err| TransportError::Connect(format!("{err:?}")))?;

        let status = response.status();
        if !(200..300).contains(&status) {
            return Ok(status);
        }

        let mut chunk = [0_u8; HTTP_CHUNK_SIZE];
        loop {
            if started.elapsed() > deadline {
                return Err(TransportError::Timeout);
            }
            let read = response
                .read(&mut chunk)
                .map_err(|err| TransportError::Io(format!("{err:?}")))?;
            if read == 0 {
                return Ok(status);
            }
            on_chunk(&chunk[..read]).map_err(TransportError::Aborted)?;
        }
    }
}

/// Panel driver integration point: frames are validated upstream and handed
/// over here with their refresh hints.
struct PanelRenderer;

impl Renderer for PanelRenderer {
    fn show_image(&mut self, image: &ImagePayload, hints: &RenderHints) -> Result<(), ContentError> {
        info!(
            "panel: {:?} frame of {} bytes, full refresh {}, temp profile {}, compat {}",
            image.format(),
            image.len(),
            hints.full_refresh,
            hints.temp_profile,
            hints.maximum_compatibility
        );
        Ok(())
    }

    fn show_status(&mut self, screen: &StatusScreen) -> Result<(), ContentError> {
        info!(
            "panel: {} {}",
            screen.headline(),
            screen.message.as_deref().unwrap_or_default()
        );
        Ok(())
    }
}

struct EspFirmwareSink {
    update: Option<EspOtaUpdate<'static>>,
}

fn ota_error(context: &str, err: EspError) -> FirmwareError {
    FirmwareError::Sink(format!("{context}: {err}"))
}

impl FirmwareSink for EspFirmwareSink {
    fn begin(&mut self) -> Result<(), FirmwareError> {
        // the update borrows the OTA handle until restart
        let ota: &'static mut EspOta =
            Box::leak(Box::new(EspOta::new().map_err(|err| ota_error("acquire", err))?));
        let update = ota
            .initiate_update()
            .map_err(|err| ota_error("initiate", err))?;
        self.update = Some(update);
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), FirmwareError> {
        let update = self
            .update
            .as_mut()
            .ok_or_else(|| FirmwareError::Sink("update not started".into()))?;
        update
            .write_all(chunk)
            .map_err(|err| ota_error("write", err))
    }

    fn complete(&mut self) -> Result<(), FirmwareError> {
        let update = self
            .update
            .take()
            .ok_or_else(|| FirmwareError::Sink("update not started".into()))?;
        update.complete().map_err(|err| ota_error("complete", err))
    }

    fn abort(&mut self) {
        if let Some(update) = self.update.take() {
            if let Err(err) = update.abort() {
                warn!("failed to abort OTA update: {err:?}");
            }
        }
    }
}

