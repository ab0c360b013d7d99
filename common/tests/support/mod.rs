#![allow(dead_code)]

use std::{
    cell::Cell,
    collections::{HashMap, VecDeque},
    rc::Rc,
};

use paperlink_common::{
    ButtonInput, Clock, Collaborators, ContentError, CycleExit, FirmwareError, FirmwareSink,
    Header, HttpResponse, ImagePayload, MemoryArchive, MemoryStore, MessageKind, Network,
    NetworkError, RenderHints, Renderer, RequestLimits, RuntimeConfig, StatusScreen, Store,
    StoreError, Transport, TransportError, WakeCause, WakeCycle, BootReadings,
};

pub const BASE_URL: &str = "https://trmnl.app";
pub const EPOCH: u64 = 1_700_000_000;

pub struct SimClock {
    pub now: Rc<Cell<u64>>,
}

impl Clock for SimClock {
    fn uptime_ms(&self) -> u64 {
        self.now.get()
    }

    fn delay_ms(&mut self, ms: u32) {
        self.now.set(self.now.get() + u64::from(ms));
    }

    fn sync_time(&mut self) -> Option<u64> {
        self.epoch_now()
    }

    fn epoch_now(&self) -> Option<u64> {
        Some(EPOCH + self.now.get() / 1_000)
    }
}

pub struct ScriptedButton {
    pub now: Rc<Cell<u64>>,
    pub presses: Vec<(u64, u64)>,
}

impl ButtonInput for ScriptedButton {
    fn is_pressed(&mut self) -> bool {
        let now = self.now.get();
        self.presses
            .iter()
            .any(|(start, end)| now >= *start && now < *end)
    }
}

pub struct FakeNetwork {
    pub credentials: bool,
    pub fail_with: Option<NetworkError>,
    pub connected: bool,
    pub portal_runs: u32,
    pub forgotten: u32,
    pub rssi: i32,
}

impl Default for FakeNetwork {
    fn default() -> Self {
        Self {
            credentials: true,
            fail_with: None,
            connected: false,
            portal_runs: 0,
            forgotten: 0,
            rssi: -58,
        }
    }
}

impl Network for FakeNetwork {
    fn has_credentials(&self) -> bool {
        self.credentials
    }

    fn connect(&mut self) -> Result<(), NetworkError> {
        if let Some(err) = self.fail_with.clone() {
            return Err(err);
        }
        self.connected = true;
        Ok(())
    }

    fn run_portal(&mut self) -> Result<(), NetworkError> {
        self.portal_runs += 1;
        self.credentials = true;
        self.connect()
    }

    fn forget_credentials(&mut self) -> Result<(), NetworkError> {
        self.forgotten += 1;
        self.credentials = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn rssi(&self) -> i32 {
        self.rssi
    }

    fn mac_address(&self) -> String {
        "AA:BB:CC:DD:EE:FF".to_string()
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

pub type Scripted = Result<HttpResponse, TransportError>;

/// Routes requests by path: setup and display pop scripted replies, logs are
/// recorded, everything else is looked up in `files`.
#[derive(Default)]
pub struct FakeServer {
    pub setup: VecDeque<Scripted>,
    pub display: VecDeque<Scripted>,
    pub files: HashMap<String, HttpResponse>,
    pub firmware: Option<Vec<u8>>,
    pub log_posts: Vec<serde_json::Value>,
    pub requests: Vec<(String, Vec<Header>)>,
    /// Limits passed with each GET, in request order.
    pub limits: Vec<(String, RequestLimits)>,
    pub log_status: u16,
}

impl FakeServer {
    pub fn json(status: u16, body: serde_json::Value) -> Scripted {
        Ok(HttpResponse {
            status,
            content_type: Some("application/json".into()),
            body: body.to_string().into_bytes(),
            ..HttpResponse::default()
        })
    }

    pub fn redirect(status: u16, location: &str) -> HttpResponse {
        HttpResponse {
            status,
            location: Some(location.to_string()),
            ..HttpResponse::default()
        }
    }

    pub fn image(bytes: Vec<u8>) -> HttpResponse {
        HttpResponse {
            status: 200,
            content_type: Some("image/bmp".into()),
            content_length: Some(bytes.len() as u64),
            body: bytes,
            ..HttpResponse::default()
        }
    }

    pub fn headers_for(&self, suffix: &str) -> &[Header] {
        self.requests
            .iter()
            .find(|(url, _)| url.ends_with(suffix))
            .map(|(_, headers)| headers.as_slice())
            .unwrap_or(&[])
    }

    pub fn requested(&self, suffix: &str) -> usize {
        self.requests
            .iter()
            .filter(|(url, _)| url.ends_with(suffix))
            .count()
    }
}

impl Transport for FakeServer {
    fn resolve(&mut self, _host: &str) -> Result<(), TransportError> {
        Ok(())
    }

    fn get(
        &mut self,
        url: &str,
        headers: &[Header],
        limits: &RequestLimits,
    ) -> Result<HttpResponse, TransportError> {
        self.requests.push((url.to_string(), headers.to_vec()));
        self.limits.push((url.to_string(), *limits));
        let unscripted = || Err(TransportError::Connect("nothing scripted".into()));

        if url.ends_with("/api/setup") {
            return self.setup.pop_front().unwrap_or_else(unscripted);
        }
        if url.ends_with("/api/display") {
            return self.display.pop_front().unwrap_or_else(unscripted);
        }

        match self.files.get(url) {
            Some(response) if response.body.len() > limits.max_body_bytes => {
                Err(TransportError::TooLarge {
                    limit: limits.max_body_bytes,
                })
            }
            Some(response) => Ok(response.clone()),
            None => Ok(HttpResponse {
                status: 404,
                ..HttpResponse::default()
            }),
        }
    }

    fn post_json(
        &mut self,
        url: &str,
        headers: &[Header],
        body: &[u8],
        _limits: &RequestLimits,
    ) -> Result<HttpResponse, TransportError> {
        self.requests.push((url.to_string(), headers.to_vec()));
        if let Ok(value) = serde_json::from_slice(body) {
            self.log_posts.push(value);
        }
        Ok(HttpResponse {
            status: if self.log_status == 0 { 204 } else { self.log_status },
            ..HttpResponse::default()
        })
    }

    fn stream(
        &mut self,
        url: &str,
        headers: &[Header],
        _limits: &RequestLimits,
        on_chunk: &mut dyn FnMut(&[u8]) -> Result<(), String>,
    ) -> Result<u16, TransportError> {
        self.requests.push((url.to_string(), headers.to_vec()));
        let Some(image) = self.firmware.clone() else {
            return Ok(404);
        };
        for chunk in image.chunks(4) {
            on_chunk(chunk).map_err(TransportError::Aborted)?;
        }
        Ok(200)
    }
}

#[derive(Default)]
pub struct RecordingRenderer {
    pub images: Vec<ImagePayload>,
    pub hints: Vec<RenderHints>,
    pub screens: Vec<StatusScreen>,
}

impl RecordingRenderer {
    pub fn kinds(&self) -> Vec<MessageKind> {
        self.screens.iter().map(|screen| screen.kind).collect()
    }
}

impl Renderer for RecordingRenderer {
    fn show_image(&mut self, image: &ImagePayload, hints: &RenderHints) -> Result<(), ContentError> {
        self.images.push(image.clone());
        self.hints.push(*hints);
        Ok(())
    }

    fn show_status(&mut self, screen: &StatusScreen) -> Result<(), ContentError> {
        self.screens.push(screen.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub written: Vec<u8>,
    pub completed: bool,
}

impl FirmwareSink for RecordingSink {
    fn begin(&mut self) -> Result<(), FirmwareError> {
        self.written.clear();
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), FirmwareError> {
        self.written.extend_from_slice(chunk);
        Ok(())
    }

    fn complete(&mut self) -> Result<(), FirmwareError> {
        self.completed = true;
        Ok(())
    }

    fn abort(&mut self) {}
}

/// Store whose flush fails, as when flash wear leaves a sector unwritable.
pub struct FailingFlushStore {
    pub inner: MemoryStore,
}

impl Store for FailingFlushStore {
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
        Err(StoreError::Backend("nvs commit failed".into()))
    }
}

/// A simulated device whose state persists across `wake` calls like flash does.
pub struct Device {
    pub config: RuntimeConfig,
    pub store: MemoryStore,
    pub network: FakeNetwork,
    pub server: FakeServer,
    pub renderer: RecordingRenderer,
    pub archive: MemoryArchive,
    pub firmware: RecordingSink,
    pub presses: Vec<(u64, u64)>,
    pub boot_uptime_ms: u64,
}

impl Device {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            store: MemoryStore::new(),
            network: FakeNetwork::default(),
            server: FakeServer::default(),
            renderer: RecordingRenderer::default(),
            archive: MemoryArchive::new(),
            firmware: RecordingSink::default(),
            presses: Vec::new(),
            boot_uptime_ms: 100,
        }
    }

    /// A device that already completed setup.
    pub fn registered() -> Self {
        let mut device = Self::new();
        device.store.put_str("api_key", "key-1").unwrap();
        device.store.put_str("friendly_id", "F1").unwrap();
        device
    }

    pub fn wake(&mut self, cause: WakeCause) -> CycleExit {
        let mut store = std::mem::take(&mut self.store);
        let exit = self.wake_with_store(cause, &mut store);
        self.store = store;
        exit
    }

    pub fn wake_with_store(&mut self, cause: WakeCause, store: &mut dyn Store) -> CycleExit {
        let now = Rc::new(Cell::new(self.boot_uptime_ms));
        let mut clock = SimClock { now: now.clone() };
        let mut button = ScriptedButton {
            now,
            presses: std::mem::take(&mut self.presses),
        };

        let io = Collaborators {
            store,
            clock: &mut clock,
            button: &mut button,
            network: &mut self.network,
            transport: &mut self.server,
            renderer: &mut self.renderer,
            archive: &mut self.archive,
            firmware: &mut self.firmware,
        };
        WakeCycle::new(&self.config, "1.5.2", io).run(BootReadings {
            wake_cause: cause,
            battery_voltage: 4.05,
            free_heap: 180_000,
        })
    }
}

pub fn sleep_seconds(exit: &CycleExit) -> u32 {
    match exit {
        CycleExit::Sleep(plan) => plan.seconds,
        CycleExit::Restart(reason) => panic!("expected sleep, got restart: {reason:?}"),
    }
}

pub fn bmp(fill: u8, len: usize) -> Vec<u8> {
    let mut bytes = b"BM".to_vec();
    bytes.resize(len, fill);
    bytes
}
