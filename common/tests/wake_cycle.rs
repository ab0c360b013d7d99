mod support;

use paperlink_common::{
    keys, ArchiveSlot, ContentArchive, CycleExit, ImageFormat, ImagePayload, LogQueue,
    MessageKind, NetworkError, RestartReason, Store, TransportError, WakeCause,
};
use pretty_assertions::assert_eq;
use serde_json::json;

use support::{bmp, sleep_seconds, Device, FailingFlushStore, FakeServer, BASE_URL};

fn display(body: serde_json::Value) -> support::Scripted {
    FakeServer::json(200, body)
}

#[test]
fn first_boot_registers_renders_and_sleeps_at_server_rate() {
    let mut device = Device::new();
    device.server.setup.push_back(FakeServer::json(
        200,
        json!({"status": 200, "api_key": "key-1", "friendly_id": "F1", "message": "welcome"}),
    ));
    device.server.display.push_back(display(json!({
        "status": 0,
        "image_url": format!("{BASE_URL}/img/a.bmp"),
        "filename": "a.bmp",
        "refresh_rate": 1800
    })));
    device
        .server
        .files
        .insert(format!("{BASE_URL}/img/a.bmp"), FakeServer::image(bmp(1, 512)));

    let exit = device.wake(WakeCause::Timer);

    assert_eq!(sleep_seconds(&exit), 1800);
    assert_eq!(device.store.get_str(keys::API_KEY).unwrap().as_deref(), Some("key-1"));
    assert_eq!(device.store.get_str(keys::FRIENDLY_ID).unwrap().as_deref(), Some("F1"));
    assert_eq!(device.store.get_str(keys::FILENAME).unwrap().as_deref(), Some("a.bmp"));
    assert_eq!(device.store.get_u32(keys::API_RETRY).unwrap(), Some(1));
    assert_eq!(device.store.get_u32(keys::WIFI_RETRY).unwrap(), Some(1));
    assert_eq!(device.renderer.images.len(), 1);
    assert!(device.renderer.kinds().contains(&MessageKind::FriendlyId));
    assert_eq!(
        device.archive.load(ArchiveSlot::Current).unwrap().len(),
        512
    );

    let (_, image_headers) = device
        .server
        .requests
        .iter()
        .find(|(url, _)| url.ends_with("/img/a.bmp"))
        .unwrap();
    assert!(image_headers
        .iter()
        .any(|(name, value)| *name == "Access-Token" && value == "key-1"));
}

#[test]
fn consecutive_api_failures_walk_the_ladder() {
    let mut device = Device::registered();

    let sleeps: Vec<u32> = (0..5)
        .map(|_| {
            device
                .server
                .display
                .push_back(Err(TransportError::Connect("refused".into())));
            sleep_seconds(&device.wake(WakeCause::Timer))
        })
        .collect();

    assert_eq!(sleeps, vec![15, 30, 60, 900, 900]);
    assert_eq!(device.store.get_u32(keys::API_RETRY).unwrap(), Some(6));
    assert!(device.renderer.kinds().contains(&MessageKind::ApiRequestFailed));

    device.server.display.push_back(display(json!({"status": 0, "refresh_rate": 300})));
    assert_eq!(sleep_seconds(&device.wake(WakeCause::Timer)), 300);
    assert_eq!(device.store.get_u32(keys::API_RETRY).unwrap(), Some(1));
}

#[test]
fn unchanged_filename_skips_render_but_applies_refresh_rate() {
    let mut device = Device::registered();
    device.store.put_str(keys::FILENAME, "a.bmp").unwrap();
    device.server.display.push_back(display(json!({
        "status": 0,
        "image_url": format!("{BASE_URL}/img/a.bmp"),
        "filename": "a.bmp",
        "refresh_rate": 600
    })));

    let exit = device.wake(WakeCause::Timer);

    assert_eq!(sleep_seconds(&exit), 600);
    assert!(device.renderer.images.is_empty());
    assert_eq!(device.server.requested("/img/a.bmp"), 0);
    assert_eq!(device.store.get_u32(keys::REFRESH_RATE).unwrap(), Some(600));
}

#[test]
fn soft_reset_clears_store_and_restarts_without_sleeping() {
    let mut device = Device::registered();
    device.store.put_u32(keys::REFRESH_RATE, 600).unwrap();
    device.presses = vec![(0, 40_000)];

    let exit = device.wake(WakeCause::Button);

    assert_eq!(exit, CycleExit::Restart(RestartReason::CredentialReset));
    assert!(device.store.is_empty());
    assert!(device.server.requests.is_empty());
    assert_eq!(device.network.forgotten, 1);
}

#[test]
fn not_registered_sleeps_short_even_at_max_retry_tier() {
    let mut device = Device::registered();
    device.store.put_u32(keys::API_RETRY, 4).unwrap();
    for _ in 0..2 {
        device.server.display.push_back(display(json!({"status": 202})));
    }

    assert_eq!(sleep_seconds(&device.wake(WakeCause::Timer)), 5);
    assert_eq!(sleep_seconds(&device.wake(WakeCause::Timer)), 5);

    let placeholders = device
        .renderer
        .kinds()
        .into_iter()
        .filter(|kind| *kind == MessageKind::FriendlyId)
        .count();
    assert_eq!(placeholders, 1);
}

#[test]
fn reset_status_drops_api_credentials() {
    let mut device = Device::registered();
    device.server.display.push_back(display(json!({"status": 500})));

    assert_eq!(sleep_seconds(&device.wake(WakeCause::Timer)), 5);
    assert!(!device.store.contains(keys::API_KEY).unwrap());
    assert!(!device.store.contains(keys::FRIENDLY_ID).unwrap());
}

#[test]
fn wifi_failure_uses_wifi_ladder_and_queues_log_for_next_cycle() {
    let mut device = Device::registered();
    device.network.fail_with = Some(NetworkError::ConnectFailed("auth".into()));

    assert_eq!(sleep_seconds(&device.wake(WakeCause::Timer)), 60);
    assert!(device.server.requests.is_empty());
    assert_eq!(device.renderer.kinds(), vec![MessageKind::WifiFailed]);
    let queue = LogQueue::new(device.config.cycle.log_capacity);
    assert_eq!(queue.len(&device.store).unwrap(), 1);

    device.network.fail_with = None;
    device.server.display.push_back(display(json!({"status": 0})));
    assert_eq!(sleep_seconds(&device.wake(WakeCause::Timer)), 900);

    assert_eq!(device.server.log_posts.len(), 1);
    let logs = &device.server.log_posts[0]["logs"];
    assert_eq!(logs[0]["retry_attempt"], 1);
    assert!(logs[0]["log_message"]
        .as_str()
        .unwrap()
        .contains("wifi connection failed"));
    assert!(queue.is_empty(&device.store).unwrap());
    assert_eq!(device.store.get_u32(keys::WIFI_RETRY).unwrap(), Some(1));
}

#[test]
fn oversize_image_aborts_render_only() {
    let mut device = Device::registered();
    device.server.display.push_back(display(json!({
        "status": 0,
        "image_url": "https://cdn.example/big.bmp",
        "filename": "big.bmp",
        "refresh_rate": 1200
    })));
    device.server.files.insert(
        "https://cdn.example/big.bmp".into(),
        FakeServer::image(bmp(0, 95_000)),
    );

    let exit = device.wake(WakeCause::Timer);

    assert_eq!(sleep_seconds(&exit), 1200);
    assert!(device.renderer.images.is_empty());
    assert!(device.renderer.kinds().contains(&MessageKind::ImageTooBig));
    assert_eq!(device.store.get_u32(keys::API_RETRY).unwrap(), Some(1));
    assert_eq!(device.store.get_str(keys::FILENAME).unwrap(), None);

    let (_, headers) = device
        .server
        .requests
        .iter()
        .find(|(url, _)| url.ends_with("big.bmp"))
        .unwrap();
    assert!(!headers.iter().any(|(name, _)| *name == "Access-Token"));
}

#[test]
fn firmware_update_restarts_the_device() {
    let mut device = Device::registered();
    device.server.firmware = Some(b"new firmware image".to_vec());
    device.server.display.push_back(display(json!({
        "status": 0,
        "update_firmware": true,
        "firmware_url": format!("{BASE_URL}/fw/1.6.0.bin")
    })));

    let exit = device.wake(WakeCause::Timer);

    assert_eq!(exit, CycleExit::Restart(RestartReason::FirmwareUpdate));
    assert!(device.firmware.completed);
    assert_eq!(device.firmware.written, b"new firmware image");
    assert!(device.store.contains(keys::LAST_SLEEP).unwrap());
    assert!(device
        .renderer
        .kinds()
        .ends_with(&[MessageKind::FirmwareUpdate, MessageKind::FirmwareUpdateSuccess]));
}

#[test]
fn double_click_runs_rewind_from_archive() {
    let mut device = Device::registered();
    device.store.put_u32(keys::SPECIAL_FUNCTION, 5).unwrap();
    let older = ImagePayload::with_format(bmp(1, 16), ImageFormat::Bmp).unwrap();
    let newer = ImagePayload::with_format(bmp(2, 16), ImageFormat::Bmp).unwrap();
    device.archive.store_current(&older).unwrap();
    device.archive.store_current(&newer).unwrap();
    device.presses = vec![(0, 300), (600, 700)];
    device.server.display.push_back(display(json!({
        "status": 0,
        "action": "rewind",
        "filename": "c.bmp"
    })));

    let exit = device.wake(WakeCause::Button);

    assert_eq!(sleep_seconds(&exit), 900);
    assert_eq!(device.renderer.images, vec![older]);
    let (_, headers) = device
        .server
        .requests
        .iter()
        .find(|(url, _)| url.ends_with("/api/display"))
        .unwrap();
    assert!(headers
        .iter()
        .any(|(name, value)| *name == "special_function" && value == "rewind"));
}

#[test]
fn mismatched_action_changes_nothing_and_is_logged() {
    let mut device = Device::registered();
    device.store.put_u32(keys::SPECIAL_FUNCTION, 2).unwrap();
    device.presses = vec![(0, 2_000)];
    device.server.display.push_back(display(json!({
        "status": 0,
        "action": "identify",
        "refresh_rate": 60
    })));
    device.server.log_status = 500;

    let exit = device.wake(WakeCause::Button);

    assert_eq!(sleep_seconds(&exit), 900);
    assert_eq!(device.store.get_u32(keys::REFRESH_RATE).unwrap(), None);
    let entries = LogQueue::new(10).entries(&device.store).unwrap();
    assert!(entries
        .iter()
        .any(|entry| entry.log_message.contains("special function sleep")));
}

#[test]
fn unknown_device_shows_mac_screen_and_sleeps_default() {
    let mut device = Device::new();
    device
        .server
        .setup
        .push_back(FakeServer::json(200, json!({"status": 404})));

    let exit = device.wake(WakeCause::PowerOn);

    assert_eq!(sleep_seconds(&exit), 900);
    assert_eq!(
        device.renderer.kinds(),
        vec![MessageKind::Loading, MessageKind::MacNotRegistered]
    );
    assert_eq!(device.server.requested("/api/display"), 0);
    assert_eq!(device.store.get_u32(keys::API_RETRY).unwrap(), None);
}

#[test]
fn long_press_forgets_wifi_and_opens_portal() {
    let mut device = Device::registered();
    device.presses = vec![(0, 7_000)];
    device.server.display.push_back(display(json!({"status": 0})));

    let exit = device.wake(WakeCause::Button);

    assert_eq!(sleep_seconds(&exit), 900);
    assert_eq!(device.network.forgotten, 1);
    assert_eq!(device.network.portal_runs, 1);
    assert!(device.renderer.kinds().contains(&MessageKind::WifiConnect));
}

#[test]
fn placeholder_is_drawn_once_then_real_content_replaces_it() {
    let mut device = Device::registered();
    for _ in 0..2 {
        device
            .server
            .display
            .push_back(display(json!({"status": 0, "filename": "empty_state"})));
    }
    device.server.display.push_back(display(json!({
        "status": 0,
        "image_url": format!("{BASE_URL}/img/b.bmp"),
        "filename": "b.bmp"
    })));
    device
        .server
        .files
        .insert(format!("{BASE_URL}/img/b.bmp"), FakeServer::image(bmp(3, 64)));

    assert_eq!(sleep_seconds(&device.wake(WakeCause::Timer)), 5);
    assert_eq!(sleep_seconds(&device.wake(WakeCause::Timer)), 5);
    assert_eq!(device.renderer.kinds(), vec![MessageKind::FriendlyId]);

    assert_eq!(sleep_seconds(&device.wake(WakeCause::Timer)), 900);
    assert_eq!(device.renderer.images.len(), 1);
    assert_eq!(device.store.get_bool(keys::REGISTERED).unwrap(), Some(true));
}

#[test]
fn flush_failure_forces_restart() {
    let mut device = Device::registered();
    device.server.display.push_back(display(json!({"status": 0})));
    let mut store = FailingFlushStore {
        inner: std::mem::take(&mut device.store),
    };

    let exit = device.wake_with_store(WakeCause::Timer, &mut store);

    assert_eq!(exit, CycleExit::Restart(RestartReason::DurabilityFailure));
}

#[test]
fn non_timer_wake_redraws_same_content() {
    let mut device = Device::registered();
    device.store.put_str(keys::FILENAME, "a.bmp").unwrap();
    device.server.display.push_back(display(json!({
        "status": 0,
        "image_url": format!("{BASE_URL}/img/a.bmp"),
        "filename": "a.bmp"
    })));
    device
        .server
        .files
        .insert(format!("{BASE_URL}/img/a.bmp"), FakeServer::image(bmp(1, 64)));

    device.wake(WakeCause::PowerOn);

    assert_eq!(device.renderer.images.len(), 1);
    assert!(device.renderer.hints[0].full_refresh);
    assert_eq!(device.renderer.kinds()[0], MessageKind::Loading);
}

fn sends_token(headers: &[paperlink_common::Header]) -> bool {
    headers.iter().any(|(name, _)| *name == "Access-Token")
}

#[test]
fn relative_redirect_is_followed_within_the_api_host() {
    let mut device = Device::registered();
    device.server.display.push_back(display(json!({
        "status": 0,
        "image_url": format!("{BASE_URL}/img/render/a.bmp"),
        "filename": "a.bmp"
    })));
    device.server.files.insert(
        format!("{BASE_URL}/img/render/a.bmp"),
        FakeServer::redirect(307, "b.bmp"),
    );
    device
        .server
        .files
        .insert(format!("{BASE_URL}/img/render/b.bmp"), FakeServer::image(bmp(4, 64)));

    let exit = device.wake(WakeCause::Timer);

    assert_eq!(sleep_seconds(&exit), 900);
    assert_eq!(device.renderer.images.len(), 1);
    assert_eq!(device.store.get_str(keys::FILENAME).unwrap().as_deref(), Some("a.bmp"));
    assert!(sends_token(device.server.headers_for("/img/render/b.bmp")));
}

#[test]
fn absolute_redirect_to_another_host_drops_the_token() {
    let mut device = Device::registered();
    device.server.display.push_back(display(json!({
        "status": 0,
        "image_url": format!("{BASE_URL}/img/a.bmp"),
        "filename": "a.bmp"
    })));
    device.server.files.insert(
        format!("{BASE_URL}/img/a.bmp"),
        FakeServer::redirect(308, "https://cdn.example/a.bmp"),
    );
    device
        .server
        .files
        .insert("https://cdn.example/a.bmp".into(), FakeServer::image(bmp(5, 64)));

    device.wake(WakeCause::Timer);

    assert_eq!(device.renderer.images.len(), 1);
    assert!(sends_token(device.server.headers_for("/img/a.bmp")));
    assert_eq!(device.server.requested("cdn.example/a.bmp"), 1);
    assert!(!sends_token(device.server.headers_for("cdn.example/a.bmp")));
}

#[test]
fn lookalike_image_host_gets_no_identity_headers() {
    let mut device = Device::registered();
    let url = format!("{BASE_URL}.evil.com/a.bmp");
    device.server.display.push_back(display(json!({
        "status": 0,
        "image_url": url,
        "filename": "a.bmp"
    })));
    device.server.files.insert(url, FakeServer::image(bmp(6, 64)));

    device.wake(WakeCause::Timer);

    assert_eq!(device.renderer.images.len(), 1);
    let headers = device.server.headers_for(".evil.com/a.bmp");
    assert!(!sends_token(headers));
    assert!(!headers.iter().any(|(name, _)| *name == "ID"));
}

#[test]
fn image_timeout_is_capped() {
    let mut device = Device::registered();
    device.server.display.push_back(display(json!({
        "status": 0,
        "image_url": format!("{BASE_URL}/img/slow.bmp"),
        "image_url_timeout": 120,
        "filename": "slow.bmp"
    })));
    device
        .server
        .files
        .insert(format!("{BASE_URL}/img/slow.bmp"), FakeServer::image(bmp(7, 64)));

    device.wake(WakeCause::Timer);

    let (_, limits) = device
        .server
        .limits
        .iter()
        .find(|(url, _)| url.ends_with("/img/slow.bmp"))
        .unwrap();
    assert_eq!(limits.timeout_ms, 65_535);
    assert_eq!(limits.max_body_bytes, device.config.cycle.max_image_bytes);
    assert_eq!(device.renderer.images.len(), 1);
}

#[test]
fn reset_request_skips_the_image_download() {
    let mut device = Device::registered();
    device.server.display.push_back(display(json!({
        "status": 0,
        "reset_firmware": true,
        "image_url": format!("{BASE_URL}/img/a.bmp"),
        "filename": "a.bmp"
    })));
    device
        .server
        .files
        .insert(format!("{BASE_URL}/img/a.bmp"), FakeServer::image(bmp(1, 64)));

    let exit = device.wake(WakeCause::Timer);

    assert_eq!(sleep_seconds(&exit), 5);
    assert_eq!(device.server.requested("/img/a.bmp"), 0);
    assert!(device.renderer.images.is_empty());
    assert!(!device.store.contains(keys::API_KEY).unwrap());
}

#[test]
fn firmware_update_skips_the_image_download() {
    let mut device = Device::registered();
    device.server.firmware = Some(b"new firmware image".to_vec());
    device.server.display.push_back(display(json!({
        "status": 0,
        "update_firmware": true,
        "firmware_url": format!("{BASE_URL}/fw/1.6.0.bin"),
        "image_url": format!("{BASE_URL}/img/a.bmp"),
        "filename": "a.bmp"
    })));
    device
        .server
        .files
        .insert(format!("{BASE_URL}/img/a.bmp"), FakeServer::image(bmp(1, 64)));

    let exit = device.wake(WakeCause::Timer);

    assert_eq!(exit, CycleExit::Restart(RestartReason::FirmwareUpdate));
    assert_eq!(device.server.requested("/img/a.bmp"), 0);
    assert!(device.renderer.images.is_empty());
    assert!(device.firmware.completed);
}

#[test]
fn unreachable_firmware_server_shows_update_error() {
    let mut device = Device::registered();
    device.server.display.push_back(display(json!({
        "status": 0,
        "update_firmware": true,
        "firmware_url": format!("{BASE_URL}/fw/missing.bin")
    })));

    let exit = device.wake(WakeCause::Timer);

    assert_eq!(exit, CycleExit::Restart(RestartReason::FirmwareUpdate));
    assert!(!device.firmware.completed);
    assert!(device
        .renderer
        .kinds()
        .ends_with(&[MessageKind::FirmwareUpdate, MessageKind::ApiFirmwareUpdateError]));
}
