use std::fmt;

use log::{info, warn};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use url::{Host, Url};

use crate::{
    config::CycleConfig,
    error::{ProtocolError, TransportError},
    interpret::{interpret, DisplayDirective},
};

pub const SETUP_PATH: &str = "/api/setup";
pub const DISPLAY_PATH: &str = "/api/display";
pub const LOG_PATH: &str = "/api/log";

pub type Header = (&'static str, String);

/// Headers that identify the device; never sent to a foreign host.
const IDENTITY_HEADERS: [&str; 2] = ["ID", "Access-Token"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    pub timeout_ms: u32,
    pub idle_timeout_ms: u32,
    pub max_body_bytes: usize,
}

impl RequestLimits {
    pub fn for_api(cfg: &CycleConfig) -> Self {
        Self {
            timeout_ms: cfg.http_timeout_ms,
            idle_timeout_ms: cfg.idle_timeout_ms,
            max_body_bytes: cfg.max_response_bytes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub location: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }
}

/// Blocking HTTP plumbing. Implementations must not follow redirects.
pub trait Transport {
    fn resolve(&mut self, host: &str) -> Result<(), TransportError>;

    fn get(
        &mut self,
        url: &str,
        headers: &[Header],
        limits: &RequestLimits,
    ) -> Result<HttpResponse, TransportError>;

    fn post_json(
        &mut self,
        url: &str,
        headers: &[Header],
        body: &[u8],
        limits: &RequestLimits,
    ) -> Result<HttpResponse, TransportError>;

    /// Streams a 2xx body chunk by chunk and returns the HTTP status.
    /// Non-2xx responses are returned without invoking `on_chunk`.
    fn stream(
        &mut self,
        url: &str,
        headers: &[Header],
        limits: &RequestLimits,
        on_chunk: &mut dyn FnMut(&[u8]) -> Result<(), String>,
    ) -> Result<u16, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpecialFunction {
    #[default]
    None,
    Identify,
    Sleep,
    AddWifi,
    RestartPlaylist,
    Rewind,
    SendToMe,
    GuestMode,
}

impl SpecialFunction {
    pub const ALL: [Self; 8] = [
        Self::None,
        Self::Identify,
        Self::Sleep,
        Self::AddWifi,
        Self::RestartPlaylist,
        Self::Rewind,
        Self::SendToMe,
        Self::GuestMode,
    ];

    pub fn code(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Identify => 1,
            Self::Sleep => 2,
            Self::AddWifi => 3,
            Self::RestartPlaylist => 4,
            Self::Rewind => 5,
            Self::SendToMe => 6,
            Self::GuestMode => 7,
        }
    }

    pub fn from_code(code: u32) -> Self {
        Self::ALL
            .into_iter()
            .find(|sf| sf.code() == code)
            .unwrap_or_default()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Identify => "identify",
            Self::Sleep => "sleep",
            Self::AddWifi => "add_wifi",
            Self::RestartPlaylist => "restart_playlist",
            Self::Rewind => "rewind",
            Self::SendToMe => "send_to_me",
            Self::GuestMode => "guest_mode",
        }
    }

    /// The `action` the server must echo while this function is active.
    pub fn verb(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            other => Some(other.name()),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL.into_iter().find(|sf| sf.name() == name)
    }
}

impl fmt::Display for SpecialFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiDisplayResponse {
    #[serde(deserialize_with = "null_as_default")]
    pub status: u32,
    pub image_url: Option<String>,
    /// Seconds; zero means the default request timeout.
    #[serde(deserialize_with = "null_as_default")]
    pub image_url_timeout: u32,
    #[serde(deserialize_with = "null_as_default")]
    pub filename: String,
    pub firmware_url: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub update_firmware: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub refresh_rate: u32,
    #[serde(deserialize_with = "null_as_default")]
    pub reset_firmware: bool,
    pub special_function: Option<String>,
    pub action: Option<String>,
    pub message: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub maximum_compatibility: bool,
    pub temp_profile: Option<u32>,
}

/// Servers send `null` where a field is simply absent.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSetupResponse {
    pub status: u32,
    pub api_key: Option<String>,
    pub friendly_id: Option<String>,
    pub image_url: Option<String>,
    pub message: Option<String>,
}

/// Identity and telemetry attached to every server request.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceHeaders {
    pub mac_address: String,
    pub api_key: Option<String>,
    pub firmware_version: String,
    pub model: String,
    pub battery_voltage: f32,
    pub rssi: i32,
    pub refresh_rate: u32,
    pub width: u16,
    pub height: u16,
    pub special_function: SpecialFunction,
}

impl DeviceHeaders {
    pub fn setup_headers(&self) -> Vec<Header> {
        vec![
            ("ID", self.mac_address.clone()),
            ("FW-Version", self.firmware_version.clone()),
            ("Model", self.model.clone()),
        ]
    }

    pub fn display_headers(&self) -> Vec<Header> {
        let mut headers = self.identity_headers();
        headers.extend([
            ("Refresh-Rate", self.refresh_rate.to_string()),
            ("Battery-Voltage", format!("{:.2}", self.battery_voltage)),
            ("FW-Version", self.firmware_version.clone()),
            ("RSSI", self.rssi.to_string()),
            ("Width", self.width.to_string()),
            ("Height", self.height.to_string()),
            ("Model", self.model.clone()),
        ]);
        if self.special_function != SpecialFunction::None {
            headers.push(("special_function", self.special_function.name().to_string()));
        }
        headers
    }

    pub fn identity_headers(&self) -> Vec<Header> {
        let mut headers = vec![("ID", self.mac_address.clone())];
        if let Some(key) = &self.api_key {
            headers.push(("Access-Token", key.clone()));
        }
        headers
    }
}

/// Host name of an absolute URL, without IPv6 brackets.
pub fn host(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    Some(match url.host()? {
        Host::Domain(domain) => domain.to_string(),
        Host::Ipv4(addr) => addr.to_string(),
        Host::Ipv6(addr) => addr.to_string(),
    })
}

/// True when both URLs share scheme, host and effective port.
pub fn same_origin(url: &str, base: &str) -> bool {
    let (Ok(url), Ok(base)) = (Url::parse(url), Url::parse(base)) else {
        return false;
    };
    url.scheme() == base.scheme()
        && url.host_str().is_some()
        && url.host_str() == base.host_str()
        && url.port_or_known_default() == base.port_or_known_default()
}

/// Joins a `Location` value against the URL that answered with it.
pub fn resolve_location(request_url: &str, location: &str) -> Option<String> {
    let base = Url::parse(request_url).ok()?;
    base.join(location).ok().map(String::from)
}

/// One request per call against the device API, plus at most one redirect.
pub struct ProtocolSession<'a> {
    transport: &'a mut dyn Transport,
    base_url: &'a str,
    limits: RequestLimits,
}

impl<'a> ProtocolSession<'a> {
    pub fn new(transport: &'a mut dyn Transport, base_url: &'a str, cfg: &CycleConfig) -> Self {
        Self {
            transport,
            base_url,
            limits: RequestLimits::for_api(cfg),
        }
    }

    pub fn base_url(&self) -> &str {
        self.base_url
    }

    pub fn resolve_api_host(&mut self) -> Result<(), TransportError> {
        let host = host(self.base_url).ok_or_else(|| TransportError::Dns(self.base_url.into()))?;
        self.transport.resolve(&host)
    }

    pub fn setup(&mut self, device: &DeviceHeaders) -> Result<ApiSetupResponse, ProtocolError> {
        let url = format!("{}{SETUP_PATH}", self.base_url);
        info!("setup request to {url}");
        let limits = self.limits;
        let response = self.fetch(&url, &device.setup_headers(), &limits)?;
        expect_ok(&response)?;
        parse_json(&response.body)
    }

    pub fn display(&mut self, device: &DeviceHeaders) -> Result<ApiDisplayResponse, ProtocolError> {
        let url = format!("{}{DISPLAY_PATH}", self.base_url);
        info!("display request to {url}");
        let limits = self.limits;
        let response = self.fetch(&url, &device.display_headers(), &limits)?;
        expect_ok(&response)?;
        parse_json(&response.body)
    }

    /// Display exchange decoded against the special function in `device`.
    pub fn poll(
        &mut self,
        device: &DeviceHeaders,
    ) -> Result<(DisplayDirective, ApiDisplayResponse), ProtocolError> {
        let response = self.display(device)?;
        let directive = interpret(&response, device.special_function)?;
        Ok((directive, response))
    }

    pub fn submit_logs(&mut self, device: &DeviceHeaders, body: &[u8]) -> Result<(), ProtocolError> {
        let url = format!("{}{LOG_PATH}", self.base_url);
        let mut headers = device.identity_headers();
        headers.push(("Content-Type", "application/json".to_string()));
        let response = self
            .transport
            .post_json(&url, &headers, body, &self.limits)?;
        if !response.is_success() {
            return Err(ProtocolError::HttpStatus(response.status));
        }
        Ok(())
    }

    /// GET that follows a single redirect. Relative locations are joined to the
    /// request URL.
    pub fn fetch(
        &mut self,
        url: &str,
        headers: &[Header],
        limits: &RequestLimits,
    ) -> Result<HttpResponse, ProtocolError> {
        let response = self.transport.get(url, headers, limits)?;
        if !response.is_redirect() {
            return Ok(response);
        }

        let location = response
            .location
            .as_deref()
            .ok_or(ProtocolError::RedirectWithoutLocation)?;
        let target = resolve_location(url, location).ok_or(ProtocolError::RedirectWithoutLocation)?;
        info!("following redirect {} -> {target}", response.status);

        let followed = if same_origin(&target, url) {
            self.transport.get(&target, headers, limits)?
        } else {
            let headers: Vec<Header> = headers
                .iter()
                .filter(|(name, _)| !IDENTITY_HEADERS.contains(name))
                .cloned()
                .collect();
            self.transport.get(&target, &headers, limits)?
        };
        if followed.is_redirect() {
            warn!("second redirect from {target} not followed");
            return Err(ProtocolError::TooManyRedirects);
        }
        Ok(followed)
    }
}

fn expect_ok(response: &HttpResponse) -> Result<(), ProtocolError> {
    if response.status == 200 {
        Ok(())
    } else {
        Err(ProtocolError::HttpStatus(response.status))
    }
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProtocolError> {
    if body.is_empty() {
        return Err(ProtocolError::Malformed("empty body".to_string()));
    }
    serde_json::from_slice(body).map_err(|err| ProtocolError::Malformed(err.to_string()))
}
