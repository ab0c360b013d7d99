use std::{
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::Utc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use paperlink_common::{
    BootReadings, ButtonInput, Clock, Collaborators, ContentError, CycleExit, FirmwareError,
    FirmwareSink, FsArchive, Header, HttpResponse, ImagePayload, MemoryStore, Network,
    NetworkError, RenderHints, Renderer, RequestLimits, RuntimeConfig, StatusScreen, Store,
    StoreError, Transport, TransportError, WakeCause, WakeCycle,
};

use crate::mock;

const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");
const SIMULATED_BATTERY_VOLTAGE: f32 = 4.12;
const SIMULATED_FREE_HEAP: u32 = 212_000;
const SIMULATED_RSSI: i32 = -61;
const PORTAL_SSID: &str = "paperlink-sim";
const STREAM_CHUNK_BYTES: usize = 4096;

/// Host-only knobs, read from the environment.
struct HostSettings {
    data_dir: PathBuf,
    api_url: Option<String>,
    cycles: Option<u32>,
    sleep_scale: f64,
    button_ms: Option<u64>,
    mock_port: Option<u16>,
    mac_address: String,
}

impl HostSettings {
    fn from_env() -> Self {
        let data_dir = std::env::var("PAPERLINK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.paperlink"));

        Self {
            data_dir,
            api_url: std::env::var("PAPERLINK_API_URL").ok(),
            cycles: parse_env("PAPERLINK_CYCLES"),
            sleep_scale: parse_env::<f64>("PAPERLINK_SLEEP_SCALE")
                .filter(|scale| scale.is_finite() && *scale >= 0.0)
                .unwrap_or(0.01),
            button_ms: parse_env("PAPERLINK_BUTTON_MS"),
            mock_port: parse_env("PAPERLINK_MOCK_PORT"),
            mac_address: std::env::var("PAPERLINK_MAC")
                .unwrap_or_else(|_| "02:00:00:00:00:01".to_string()),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse::<T>().ok())
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = HostSettings::from_env();
    let mut runtime = load_runtime_config(&settings.data_dir).unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        RuntimeConfig::default()
    });

    if let Some(port) = settings.mock_port {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind mock server at {addr}"))?;
        let base_url = format!("http://{addr}");
        let app = mock::router(settings.data_dir.join("images"), base_url.clone());
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!("mock server stopped: {err}");
            }
        });
        info!("mock server listening on {base_url}");
        runtime.network.api_base_url = base_url;
    }
    if let Some(url) = settings.api_url.clone() {
        runtime.network.api_base_url = url;
    }
    runtime.sanitize();

    let mut device = HostDevice::open(&settings, runtime)?;
    let mut cause = if settings.button_ms.is_some() {
        WakeCause::Button
    } else {
        WakeCause::PowerOn
    };
    let mut completed: u32 = 0;

    loop {
        let (returned, exit) = tokio::task::spawn_blocking(move || {
            let exit = device.wake(cause);
            (device, exit)
        })
        .await
        .context("wake cycle task failed")?;
        device = returned;
        completed = completed.saturating_add(1);

        if settings.cycles.is_some_and(|limit| completed >= limit) {
            info!("completed {completed} cycles");
            break;
        }

        match exit {
            CycleExit::Sleep(plan) => {
                let nap = Duration::from_secs_f64(f64::from(plan.seconds) * settings.sleep_scale);
                info!("deep sleep {}s (simulated {nap:?})", plan.seconds);
                tokio::select! {
                    _ = tokio::time::sleep(nap) => {}
                    _ = tokio::signal::ctrl_c() => {
                        info!("interrupted during sleep");
                        break;
                    }
                }
                cause = WakeCause::Timer;
            }
            CycleExit::Restart(reason) => {
                info!("simulated restart: {reason:?}");
                cause = WakeCause::PowerOn;
            }
        }
    }
    Ok(())
}

fn load_runtime_config(data_dir: &Path) -> anyhow::Result<RuntimeConfig> {
    let path = data_dir.join("runtime.json");
    match fs::read(&path) {
        Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)
            .with_context(|| format!("invalid {}", path.display()))?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

/// Everything that survives a simulated deep sleep.
struct HostDevice {
    config: RuntimeConfig,
    store: FileStore,
    network: HostNetwork,
    transport: UreqTransport,
    renderer: FrameRenderer,
    archive: FsArchive,
    firmware: FileFirmwareSink,
    pending_hold_ms: Option<u64>,
}

impl HostDevice {
    fn open(settings: &HostSettings, config: RuntimeConfig) -> anyhow::Result<Self> {
        let data_dir = &settings.data_dir;
        let store = FileStore::open(data_dir.join("state.json"))?;
        let network = HostNetwork {
            ssid: config.network.wifi_ssid.clone(),
            connected: false,
            mac_address: settings.mac_address.clone(),
        };
        let transport = UreqTransport::new(config.cycle.idle_timeout_ms);

        Ok(Self {
            store,
            network,
            transport,
            renderer: FrameRenderer::new(data_dir.join("frames")),
            archive: FsArchive::new(data_dir.join("archive")),
            firmware: FileFirmwareSink::new(data_dir.join("firmware")),
            pending_hold_ms: settings.button_ms,
            config,
        })
    }

    fn wake(&mut self, cause: WakeCause) -> CycleExit {
        let boot = Instant::now();
        let mut clock = HostClock { boot };
        let hold_ms = match cause {
            WakeCause::Button => self.pending_hold_ms.take().unwrap_or(0),
            _ => 0,
        };
        let mut button = HostButton { boot, hold_ms };

        let io = Collaborators {
            store: &mut self.store,
            clock: &mut clock,
            button: &mut button,
            network: &mut self.network,
            transport: &mut self.transport,
            renderer: &mut self.renderer,
            archive: &mut self.archive,
            firmware: &mut self.firmware,
        };
        WakeCycle::new(&self.config, FIRMWARE_VERSION, io).run(BootReadings {
            wake_cause: cause,
            battery_voltage: SIMULATED_BATTERY_VOLTAGE,
            free_heap: SIMULATED_FREE_HEAP,
        })
    }
}

/// `MemoryStore` snapshot written to a JSON file on flush.
struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl FileStore {
    fn open(path: PathBuf) -> anyhow::Result<Self> {
        let inner = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice::<MemoryStore>(&raw)
                .with_context(|| format!("invalid store snapshot {}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => MemoryStore::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        Ok(Self { path, inner })
    }
}

impl Store for FileStore {
    fn contains(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.contains(key)
    }

    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get_str(key)
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        self.inner.get_bool(key)
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>, StoreError> {
        self.inner.get_u32(key)
    }

    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.put_str(key, value)
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.inner.put_bool(key, value)
    }

    fn put_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError> {
        self.inner.put_u32(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(key)
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.inner.clear()
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.inner.flush()?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| StoreError::Backend(err.to_string()))?;
        }
        let payload = serde_json::to_vec_pretty(&self.inner)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, payload).map_err(|err| StoreError::Backend(err.to_string()))?;
        fs::rename(&staging, &self.path).map_err(|err| StoreError::Backend(err.to_string()))
    }
}

struct HostClock {
    boot: Instant,
}

impl Clock for HostClock {
    fn uptime_ms(&self) -> u64 {
        u64::try_from(self.boot.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(u64::from(ms)));
    }

    fn sync_time(&mut self) -> Option<u64> {
        self.epoch_now()
    }

    fn epoch_now(&self) -> Option<u64> {
        u64::try_from(Utc::now().timestamp()).ok()
    }
}

/// Held from boot for `hold_ms`, then released.
struct HostButton {
    boot: Instant,
    hold_ms: u64,
}

impl ButtonInput for HostButton {
    fn is_pressed(&mut self) -> bool {
        self.boot.elapsed() < Duration::from_millis(self.hold_ms)
    }
}

struct HostNetwork {
    ssid: String,
    connected: bool,
    mac_address: String,
}

impl Network for HostNetwork {
    fn has_credentials(&self) -> bool {
        !self.ssid.is_empty()
    }

    fn connect(&mut self) -> Result<(), NetworkError> {
        if self.ssid.is_empty() {
            return Err(NetworkError::MissingCredentials);
        }
        self.connected = true;
        info!("joined simulated network `{}`", self.ssid);
        Ok(())
    }

    fn run_portal(&mut self) -> Result<(), NetworkError> {
        info!("captive portal: accepting simulated credentials for `{PORTAL_SSID}`");
        self.ssid = PORTAL_SSID.to_string();
        self.connect()
    }

    fn forget_credentials(&mut self) -> Result<(), NetworkError> {
        self.ssid.clear();
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn rssi(&self) -> i32 {
        SIMULATED_RSSI
    }

    fn mac_address(&self) -> String {
        self.mac_address.clone()
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

/// Blocking HTTP client. Redirects are surfaced to the caller, never followed.
struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    fn new(idle_timeout_ms: u32) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout_connect(Duration::from_secs(5))
                .timeout_read(Duration::from_millis(u64::from(idle_timeout_ms)))
                .redirects(0)
                .build(),
        }
    }

    fn request(
        &self,
        method: &str,
        url: &str,
        headers: &[Header],
        limits: &RequestLimits,
    ) -> ureq::Request {
        let mut request = self
            .agent
            .request(method, url)
            .timeout(Duration::from_millis(u64::from(limits.timeout_ms)));
        for (name, value) in headers {
            request = request.set(name, value);
        }
        request
    }
}

impl Transport for UreqTransport {
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
        let response = settle(self.request("GET", url, headers, limits).call())?;
        read_response(response, limits)
    }

    fn post_json(
        &mut self,
        url: &str,
        headers: &[Header],
        body: &[u8],
        limits: &RequestLimits,
    ) -> Result<HttpResponse, TransportError> {
        let response = settle(self.request("POST", url, headers, limits).send_bytes(body))?;
        read_response(response, limits)
    }

    fn stream(
        &mut self,
        url: &str,
        headers: &[Header],
        limits: &RequestLimits,
        on_chunk: &mut dyn FnMut(&[u8]) -> Result<(), String>,
    ) -> Result<u16, TransportError> {
        let response = settle(self.request("GET", url, headers, limits).call())?;
        let status = response.status();
        if !(200..300).contains(&status) {
            return Ok(status);
        }

        let mut reader = response.into_reader();
        let mut buf = vec![0_u8; STREAM_CHUNK_BYTES];
        loop {
            let read = reader
                .read(&mut buf)
                .map_err(|err| io_failure(err, limits))?;
            if read == 0 {
                return Ok(status);
            }
            on_chunk(&buf[..read]).map_err(TransportError::Aborted)?;
        }
    }
}

/// HTTP error statuses are ordinary responses here; only transport failures are errors.
fn settle(result: Result<ureq::Response, ureq::Error>) -> Result<ureq::Response, TransportError> {
    match result {
        Ok(response) | Err(ureq::Error::Status(_, response)) => Ok(response),
        Err(ureq::Error::Transport(err)) => Err(match err.kind() {
            ureq::ErrorKind::Dns => TransportError::Dns(err.to_string()),
            ureq::ErrorKind::ConnectionFailed => TransportError::Connect(err.to_string()),
            ureq::ErrorKind::Io if err.to_string().contains("timed out") => TransportError::Timeout,
            _ => TransportError::Io(err.to_string()),
        }),
    }
}

fn read_response(
    response: ureq::Response,
    limits: &RequestLimits,
) -> Result<HttpResponse, TransportError> {
    let status = response.status();
    let location = response.header("location").map(str::to_string);
    let content_type = response.header("content-type").map(str::to_string);
    let content_length = response
        .header("content-length")
        .and_then(|value| value.trim().parse::<u64>().ok());

    let max = limits.max_body_bytes;
    let cap = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);
    let mut body = Vec::new();
    response
        .into_reader()
        .take(cap)
        .read_to_end(&mut body)
        .map_err(|err| io_failure(err, limits))?;
    if body.len() > max {
        return Err(TransportError::TooLarge { limit: max });
    }

    Ok(HttpResponse {
        status,
        location,
        content_type,
        content_length,
        body,
    })
}

fn io_failure(err: std::io::Error, limits: &RequestLimits) -> TransportError {
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportError::Stalled {
            idle_ms: limits.idle_timeout_ms,
        },
        _ => TransportError::Io(err.to_string()),
    }
}

/// Writes each drawn frame to disk and appends status screens to `status.log`.
struct FrameRenderer {
    dir: PathBuf,
    frames: u32,
}

impl FrameRenderer {
    fn new(dir: PathBuf) -> Self {
        Self { dir, frames: 0 }
    }

    fn prepare(&self) -> Result<(), ContentError> {
        fs::create_dir_all(&self.dir)
            .map_err(|err| ContentError::Render(format!("{}: {err}", self.dir.display())))
    }
}

impl Renderer for FrameRenderer {
    fn show_image(&mut self, image: &ImagePayload, hints: &RenderHints) -> Result<(), ContentError> {
        self.prepare()?;
        self.frames = self.frames.wrapping_add(1);
        let path = self.dir.join(format!(
            "frame-{:04}.{}",
            self.frames,
            image.format().extension()
        ));
        fs::write(&path, image.bytes())
            .map_err(|err| ContentError::Render(format!("{}: {err}", path.display())))?;
        info!(
            "drew {} bytes to {} (full refresh {}, temp profile {})",
            image.len(),
            path.display(),
            hints.full_refresh,
            hints.temp_profile
        );
        Ok(())
    }

    fn show_status(&mut self, screen: &StatusScreen) -> Result<(), ContentError> {
        self.prepare()?;
        let line = serde_json::to_string(screen)
            .map_err(|err| ContentError::Render(err.to_string()))?;
        let path = self.dir.join("status.log");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| ContentError::Render(format!("{}: {err}", path.display())))?;
        writeln!(file, "{} {line}", Utc::now().to_rfc3339())
            .map_err(|err| ContentError::Render(err.to_string()))
    }
}

/// Stages an update in `firmware.bin.part` and renames it on completion.
struct FileFirmwareSink {
    dir: PathBuf,
    file: Option<File>,
}

impl FileFirmwareSink {
    fn new(dir: PathBuf) -> Self {
        Self { dir, file: None }
    }

    fn staging_path(&self) -> PathBuf {
        self.dir.join("firmware.bin.part")
    }
}

impl FirmwareSink for FileFirmwareSink {
    fn begin(&mut self) -> Result<(), FirmwareError> {
        fs::create_dir_all(&self.dir).map_err(|err| FirmwareError::Sink(err.to_string()))?;
        let file = File::create(self.staging_path())
            .map_err(|err| FirmwareError::Sink(err.to_string()))?;
        self.file = Some(file);
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), FirmwareError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| FirmwareError::Sink("update not started".into()))?;
        file.write_all(chunk)
            .map_err(|err| FirmwareError::Sink(err.to_string()))
    }

    fn complete(&mut self) -> Result<(), FirmwareError> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| FirmwareError::Sink("update not started".into()))?;
        file.flush()
            .map_err(|err| FirmwareError::Sink(err.to_string()))?;
        drop(file);

        let target = self.dir.join("firmware.bin");
        fs::rename(self.staging_path(), &target)
            .map_err(|err| FirmwareError::Sink(err.to_string()))?;
        info!("firmware image staged at {}", target.display());
        Ok(())
    }

    fn abort(&mut self) {
        self.file = None;
        if let Err(err) = fs::remove_file(self.staging_path()) {
            warn!("failed to discard partial firmware: {err}");
        }
    }
}
