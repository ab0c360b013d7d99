use serde::{Deserialize, Serialize};

pub const DEFAULT_API_BASE_URL: &str = "https://trmnl.app";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleConfig {
    pub default_refresh_seconds: u32,
    pub not_registered_seconds: u32,
    pub placeholder_seconds: u32,
    pub api_retry_ladder: Vec<u32>,
    pub wifi_retry_ladder: Vec<u32>,
    pub log_capacity: usize,
    pub max_image_bytes: usize,
    pub max_response_bytes: usize,
    pub http_timeout_ms: u32,
    pub idle_timeout_ms: u32,
    pub firmware_timeout_ms: u32,
    pub image_timeout_cap_ms: u32,
    pub dns_attempts: u32,
    pub dns_retry_delay_ms: u32,
    pub weak_signal_rssi: i32,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            default_refresh_seconds: 900,
            not_registered_seconds: 5,
            placeholder_seconds: 5,
            api_retry_ladder: vec![15, 30, 60],
            wifi_retry_ladder: vec![60, 180, 300],
            log_capacity: 10,
            max_image_bytes: 90_000,
            max_response_bytes: 16 * 1024,
            http_timeout_ms: 15_000,
            idle_timeout_ms: 5_000,
            firmware_timeout_ms: 30_000,
            image_timeout_cap_ms: 65_535,
            dns_attempts: 5,
            dns_retry_delay_ms: 2_000,
            weak_signal_rssi: -100,
        }
    }
}

/// Press-duration thresholds for the wake button, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ButtonConfig {
    pub noise_ms: u32,
    pub medium_hold_ms: u32,
    pub long_hold_ms: u32,
    pub soft_reset_ms: u32,
    pub double_click_window_ms: u32,
    pub released_at_boot_ms: u32,
    pub poll_interval_ms: u32,
}

impl Default for ButtonConfig {
    fn default() -> Self {
        Self {
            noise_ms: 50,
            medium_hold_ms: 1_000,
            long_hold_ms: 5_000,
            soft_reset_ms: 15_000,
            double_click_window_ms: 800,
            released_at_boot_ms: 2_000,
            poll_interval_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoardConfig {
    pub model: String,
    pub wake_pin: i32,
    pub wake_active_low: bool,
    pub button_wake: bool,
    pub width: u16,
    pub height: u16,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            model: "og".to_string(),
            wake_pin: 2,
            wake_active_low: true,
            button_wake: true,
            width: 800,
            height: 480,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    #[serde(rename = "apiBaseUrl")]
    pub api_base_url: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    pub cycle: CycleConfig,
    #[serde(default)]
    pub button: ButtonConfig,
    #[serde(default)]
    pub board: BoardConfig,
    pub network: NetworkConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cycle: CycleConfig::default(),
            button: ButtonConfig::default(),
            board: BoardConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.cycle.sanitize();
        self.button.sanitize();
        self.board.sanitize();
        self.network.sanitize();
    }
}

impl CycleConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        self.default_refresh_seconds = self.default_refresh_seconds.clamp(1, 86_400);
        self.not_registered_seconds = self.not_registered_seconds.max(1);
        self.placeholder_seconds = self.placeholder_seconds.max(1);

        if self.api_retry_ladder.is_empty() {
            self.api_retry_ladder = defaults.api_retry_ladder;
        }
        if self.wifi_retry_ladder.is_empty() {
            self.wifi_retry_ladder = defaults.wifi_retry_ladder;
        }
        for tier in self
            .api_retry_ladder
            .iter_mut()
            .chain(self.wifi_retry_ladder.iter_mut())
        {
            *tier = (*tier).max(1);
        }

        // two halves of at least one slot each
        self.log_capacity = self.log_capacity.clamp(2, 64);
        if self.log_capacity % 2 == 1 {
            self.log_capacity += 1;
        }

        if self.max_image_bytes == 0 {
            self.max_image_bytes = defaults.max_image_bytes;
        }
        self.max_response_bytes = self.max_response_bytes.max(1_024);
        self.http_timeout_ms = self.http_timeout_ms.clamp(1_000, 60_000);
        self.idle_timeout_ms = self.idle_timeout_ms.clamp(500, self.http_timeout_ms);
        self.firmware_timeout_ms = self.firmware_timeout_ms.max(self.http_timeout_ms);
        self.image_timeout_cap_ms = self.image_timeout_cap_ms.min(65_535);
        self.dns_attempts = self.dns_attempts.clamp(1, 10);
    }
}

impl ButtonConfig {
    pub fn sanitize(&mut self) {
        self.poll_interval_ms = self.poll_interval_ms.clamp(1, 100);
        self.medium_hold_ms = self.medium_hold_ms.max(self.noise_ms + 1);
        self.long_hold_ms = self.long_hold_ms.max(self.medium_hold_ms + 1);
        self.soft_reset_ms = self.soft_reset_ms.max(self.long_hold_ms + 1);
    }
}

impl BoardConfig {
    pub fn sanitize(&mut self) {
        if self.wake_pin < 0 {
            self.wake_pin = 2;
        }

        if self.width == 0 || self.height == 0 {
            self.width = 800;
            self.height = 480;
        }

        if self.model.trim().is_empty() {
            self.model = "og".to_string();
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        let trimmed = self.api_base_url.trim().trim_end_matches('/');
        self.api_base_url = if trimmed.is_empty() {
            DEFAULT_API_BASE_URL.to_string()
        } else {
            trimmed.to_string()
        };
    }
}
