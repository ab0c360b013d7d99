//! Minimal display server for host runs: registers devices, rotates through
//! the images in one directory and prints submitted logs.

use std::{
    collections::HashMap,
    fmt::Write as _,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tower_http::services::ServeDir;
use tracing::{info, warn};

const MOCK_REFRESH_SECONDS: u32 = 300;
const IMAGE_EXTENSIONS: [&str; 4] = ["bmp", "png", "jpg", "jpeg"];

#[derive(Clone)]
struct MockState {
    inner: Arc<Mutex<Registry>>,
    images_dir: Arc<PathBuf>,
    base_url: Arc<String>,
}

#[derive(Default)]
struct Registry {
    devices: HashMap<String, MockDevice>,
    next_image: usize,
}

struct MockDevice {
    api_key: String,
    friendly_id: String,
    polls: u32,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn router(images_dir: PathBuf, base_url: String) -> Router {
    let state = MockState {
        inner: Arc::new(Mutex::new(Registry::default())),
        images_dir: Arc::new(images_dir.clone()),
        base_url: Arc::new(base_url),
    };

    Router::new()
        .route("/api/setup", get(handle_setup))
        .route("/api/display", get(handle_display))
        .route("/api/log", post(handle_log))
        .nest_service("/images", ServeDir::new(images_dir))
        .with_state(state)
}

async fn handle_setup(State(state): State<MockState>, headers: HeaderMap) -> Response {
    let Some(mac) = header(&headers, "ID") else {
        return Json(json!({ "status": 404, "message": "missing ID header" })).into_response();
    };

    let mut registry = state.inner.lock().await;
    let device = registry
        .devices
        .entry(mac.to_string())
        .or_insert_with(|| MockDevice::register(mac));
    info!("mock setup for {mac}: friendly id {}", device.friendly_id);

    Json(json!({
        "status": 200,
        "api_key": device.api_key,
        "friendly_id": device.friendly_id,
        "image_url": Value::Null,
        "message": "Registered with the local mock server",
    }))
    .into_response()
}

async fn handle_display(State(state): State<MockState>, headers: HeaderMap) -> Response {
    let token = header(&headers, "Access-Token").unwrap_or_default();
    let mut registry = state.inner.lock().await;

    let Some(device) = registry
        .devices
        .values_mut()
        .find(|device| device.api_key == token)
    else {
        warn!("mock display poll with unknown access token");
        return Json(json!({ "status": 500, "reset_firmware": true })).into_response();
    };

    // first poll after setup mimics a device not yet paired to an account
    device.polls = device.polls.saturating_add(1);
    if device.polls == 1 {
        return Json(json!({ "status": 202 })).into_response();
    }

    let action = header(&headers, "special_function").map(str::to_string);
    let images = match list_images(&state.images_dir).await {
        Ok(images) => images,
        Err(err) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{err}"));
        }
    };

    let mut body = json!({
        "status": 0,
        "refresh_rate": MOCK_REFRESH_SECONDS,
        "filename": "empty_state",
    });
    if let Some(action) = action {
        body["action"] = Value::String(action);
    }

    if !images.is_empty() {
        let index = registry.next_image % images.len();
        registry.next_image = registry.next_image.wrapping_add(1);
        let name = &images[index];
        match tokio::fs::read(state.images_dir.join(name)).await {
            Ok(bytes) => {
                body["filename"] = Value::String(content_filename(name, &bytes));
                body["image_url"] = Value::String(format!("{}/images/{name}", state.base_url));
            }
            Err(err) => {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("failed to read {name}: {err}"),
                );
            }
        }
    }

    Json(body).into_response()
}

async fn handle_log(headers: HeaderMap, Json(payload): Json<Value>) -> StatusCode {
    let id = header(&headers, "ID").unwrap_or("unknown");
    let logs = payload
        .get("logs")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for entry in &logs {
        let message = entry
            .get("log_message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        info!("device {id} log: {message}");
    }
    StatusCode::NO_CONTENT
}

impl MockDevice {
    fn register(mac: &str) -> Self {
        let digest = hex_digest(mac.as_bytes());
        Self {
            api_key: digest[..24].to_string(),
            friendly_id: digest[..6].to_ascii_uppercase(),
            polls: 0,
        }
    }
}

async fn list_images(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let supported = name
            .rsplit_once('.')
            .is_some_and(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if supported {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Same bytes, same filename: the device skips redraws of unchanged content.
fn content_filename(name: &str, bytes: &[u8]) -> String {
    let ext = name.rsplit_once('.').map_or("bmp", |(_, ext)| ext);
    format!("{}.{ext}", &hex_digest(bytes)[..16])
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
