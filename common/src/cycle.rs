//! One wake cycle, from wake classification to the sleep decision.

use log::{error, info, warn};

use crate::{
    archive::{ArchiveSlot, ContentArchive},
    config::RuntimeConfig,
    content::{self, EMPTY_STATE},
    error::{ContentError, FirmwareError, ProtocolError, StoreError, TransportError},
    interpret::{DisplayDirective, PollStatus, RenderRequest},
    logqueue::{DeviceStatusStamp, LogDrain, LogEntry, LogQueue},
    ota::{self, FirmwareSink},
    payload::ImagePayload,
    platform::{ButtonInput, Clock, Network, RenderHints, Renderer},
    protocol::{
        same_origin, DeviceHeaders, ProtocolSession, RequestLimits, SpecialFunction, Transport,
    },
    retry::{self, RetryDomain},
    sleep::{CycleExit, CycleOutcome, RestartReason, SleepScheduler},
    status::{
        screen_for_api_error, screen_for_content_error, screen_for_network_error, MessageKind,
        StatusScreen,
    },
    store::{keys, Store},
    wake::{ButtonAction, WakeCause, WakeClassifier},
};

/// Hardware and service handles borrowed for the length of one cycle.
pub struct Collaborators<'a> {
    pub store: &'a mut dyn Store,
    pub clock: &'a mut dyn Clock,
    pub button: &'a mut dyn ButtonInput,
    pub network: &'a mut dyn Network,
    pub transport: &'a mut dyn Transport,
    pub renderer: &'a mut dyn Renderer,
    pub archive: &'a mut dyn ContentArchive,
    pub firmware: &'a mut dyn FirmwareSink,
}

/// Readings taken at boot, before the radio is powered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BootReadings {
    pub wake_cause: WakeCause,
    pub battery_voltage: f32,
    pub free_heap: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub wake_cause: WakeCause,
    pub button_action: ButtonAction,
    pub special_function: SpecialFunction,
    pub battery_voltage: f32,
    pub free_heap: u32,
    pub mac_address: String,
    pub wifi_connected: bool,
    pub rssi: i32,
    pub time_since_sleep: u64,
}

pub struct WakeCycle<'a> {
    config: &'a RuntimeConfig,
    firmware_version: &'a str,
    io: Collaborators<'a>,
}

impl<'a> WakeCycle<'a> {
    pub fn new(config: &'a RuntimeConfig, firmware_version: &'a str, io: Collaborators<'a>) -> Self {
        Self {
            config,
            firmware_version,
            io,
        }
    }

    /// Runs the cycle to its single exit. A store failure at any point turns
    /// into a restart.
    pub fn run(mut self, boot: BootReadings) -> CycleExit {
        match self.execute(boot) {
            Ok(exit) => exit,
            Err(err) => {
                error!("persistent store failure, restarting: {err}");
                CycleExit::Restart(RestartReason::DurabilityFailure)
            }
        }
    }

    fn execute(&mut self, boot: BootReadings) -> Result<CycleExit, StoreError> {
        let config = self.config;
        let action = WakeClassifier::new(&config.button, &mut *self.io.button, &mut *self.io.clock)
            .classify(boot.wake_cause);
        info!(
            "wake cause {}, button {action:?}, battery {:.2}V",
            boot.wake_cause, boot.battery_voltage
        );

        let mut ctx = SessionContext {
            wake_cause: boot.wake_cause,
            button_action: action,
            special_function: SpecialFunction::None,
            battery_voltage: boot.battery_voltage,
            free_heap: boot.free_heap,
            mac_address: self.io.network.mac_address(),
            wifi_connected: false,
            rssi: 0,
            time_since_sleep: 0,
        };
        let mut outcome = CycleOutcome::default();

        match action {
            ButtonAction::SoftReset => return self.soft_reset(),
            ButtonAction::LongPress => {
                warn!("long press: forgetting wifi credentials");
                if let Err(err) = self.io.network.forget_credentials() {
                    warn!("failed to forget wifi credentials: {err}");
                }
            }
            ButtonAction::DoubleClick => {
                let code = self.io.store.u32_or(keys::SPECIAL_FUNCTION, 0)?;
                ctx.special_function = SpecialFunction::from_code(code);
                info!("double click: special function {}", ctx.special_function);
            }
            ButtonAction::ShortPress | ButtonAction::NoAction => {}
        }
        outcome.special_function = ctx.special_function;

        if !boot.wake_cause.is_timer() {
            self.show_status(
                StatusScreen::new(MessageKind::Loading).with_firmware_version(self.firmware_version),
            );
            content::invalidate(&mut *self.io.store)?;
        }

        if !self.connect(&mut ctx, &mut outcome)? {
            return self.finish(&ctx, &outcome);
        }
        self.measure_time_since_sleep(&mut ctx)?;

        if !self.ensure_registered(&ctx, &mut outcome)? {
            return self.finish(&ctx, &outcome);
        }

        self.drain_logs(&ctx)?;
        self.preresolve_api_host();
        self.poll_display(&ctx, &mut outcome)?;
        self.finish(&ctx, &outcome)
    }

    fn soft_reset(&mut self) -> Result<CycleExit, StoreError> {
        warn!("soft reset: clearing all stored state");
        if let Err(err) = self.io.network.forget_credentials() {
            warn!("failed to forget wifi credentials: {err}");
        }
        self.io.store.clear()?;
        self.io.store.flush()?;
        Ok(CycleExit::Restart(RestartReason::CredentialReset))
    }

    fn connect(
        &mut self,
        ctx: &mut SessionContext,
        outcome: &mut CycleOutcome,
    ) -> Result<bool, StoreError> {
        let use_portal = ctx.special_function == SpecialFunction::AddWifi
            || !self.io.network.has_credentials();

        let result = if use_portal {
            info!("starting captive portal");
            self.show_status(StatusScreen::new(MessageKind::WifiConnect));
            self.io.network.run_portal()
        } else {
            self.io.network.connect()
        };

        match result {
            Ok(()) => {
                retry::record_success(&mut *self.io.store, RetryDomain::Wifi)?;
                ctx.wifi_connected = true;
                ctx.rssi = self.io.network.rssi();
                info!("wifi connected, rssi {}dBm", ctx.rssi);
                Ok(true)
            }
            Err(err) => {
                warn!("wifi connection failed: {err}");
                let step =
                    retry::record_failure(&mut *self.io.store, RetryDomain::Wifi, &self.config.cycle)?;
                outcome.retry = Some(step);
                self.show_status(screen_for_network_error(&err));
                let entry = self
                    .log_entry(ctx, format!("wifi connection failed: {err}"))?
                    .with_retry_attempt(step.attempt);
                self.queue_log(entry)?;
                Ok(false)
            }
        }
    }

    fn measure_time_since_sleep(&mut self, ctx: &mut SessionContext) -> Result<(), StoreError> {
        let now = self.io.clock.sync_time();
        if now.is_none() {
            warn!("wall clock sync failed");
        }
        let last = u64::from(self.io.store.u32_or(keys::LAST_SLEEP, 0)?);
        ctx.time_since_sleep = match now {
            Some(now) if last > 0 && now >= last => now - last,
            _ => 0,
        };
        Ok(())
    }

    /// Runs the setup exchange when no access key is stored. Returns whether
    /// the cycle may continue to the display poll.
    fn ensure_registered(
        &mut self,
        ctx: &SessionContext,
        outcome: &mut CycleOutcome,
    ) -> Result<bool, StoreError> {
        if self.io.store.contains(keys::API_KEY)? && self.io.store.contains(keys::FRIENDLY_ID)? {
            return Ok(true);
        }

        info!("no api key stored; running setup");
        let config = self.config;
        let device = self.device_headers(ctx)?;
        let result = ProtocolSession::new(
            &mut *self.io.transport,
            &config.network.api_base_url,
            &config.cycle,
        )
        .setup(&device);

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                self.api_failure(ctx, outcome, err, Some(MessageKind::ApiSetupFailed))?;
                return Ok(false);
            }
        };

        match response.status {
            200 => {
                let api_key = response.api_key.as_deref().filter(|key| !key.is_empty());
                let friendly_id = response.friendly_id.as_deref().filter(|id| !id.is_empty());
                let (Some(api_key), Some(friendly_id)) = (api_key, friendly_id) else {
                    let missing = if api_key.is_none() { "api_key" } else { "friendly_id" };
                    let err = ProtocolError::MissingField(missing);
                    self.api_failure(ctx, outcome, err, Some(MessageKind::ApiSetupFailed))?;
                    return Ok(false);
                };

                self.io.store.put_str(keys::API_KEY, api_key)?;
                self.io.store.put_str(keys::FRIENDLY_ID, friendly_id)?;
                info!("setup complete, friendly id {friendly_id}");

                let mut screen = StatusScreen::new(MessageKind::FriendlyId)
                    .with_friendly_id(friendly_id)
                    .with_firmware_version(self.firmware_version);
                if let Some(message) = response.message.as_deref() {
                    screen = screen.with_message(message);
                }
                self.show_status(screen);
                Ok(true)
            }
            404 => {
                warn!("mac address {} is not registered", ctx.mac_address);
                self.show_status(
                    StatusScreen::new(MessageKind::MacNotRegistered)
                        .with_message(ctx.mac_address.clone()),
                );
                let entry = self.log_entry(ctx, "setup rejected: mac address not registered")?;
                self.queue_log(entry)?;
                outcome.unprovisioned = true;
                Ok(false)
            }
            other => {
                let err = ProtocolError::UnexpectedStatus(other);
                self.api_failure(ctx, outcome, err, Some(MessageKind::ApiSetupFailed))?;
                Ok(false)
            }
        }
    }

    fn api_failure(
        &mut self,
        ctx: &SessionContext,
        outcome: &mut CycleOutcome,
        err: ProtocolError,
        kind: Option<MessageKind>,
    ) -> Result<(), StoreError> {
        warn!("api request failed: {err}");
        let step = retry::record_failure(&mut *self.io.store, RetryDomain::Api, &self.config.cycle)?;
        outcome.retry = Some(step);

        let screen = screen_for_api_error(&err, ctx.rssi, self.config.cycle.weak_signal_rssi);
        let screen = match kind {
            Some(kind) if screen.kind != MessageKind::WifiWeak => StatusScreen::new(kind),
            _ => screen,
        };
        self.show_status(screen);

        let entry = self
            .log_entry(ctx, format!("api request failed: {err}"))?
            .with_retry_attempt(step.attempt);
        self.queue_log(entry)
    }

    fn preresolve_api_host(&mut self) {
        let config = self.config;
        let attempts = config.cycle.dns_attempts.max(1);
        let mut session = ProtocolSession::new(
            &mut *self.io.transport,
            &config.network.api_base_url,
            &config.cycle,
        );

        for attempt in 1..=attempts {
            match session.resolve_api_host() {
                Ok(()) => return,
                Err(err) => warn!("dns attempt {attempt}/{attempts} failed: {err}"),
            }
            if attempt < attempts {
                self.io.clock.delay_ms(config.cycle.dns_retry_delay_ms);
            }
        }
    }

    fn poll_display(
        &mut self,
        ctx: &SessionContext,
        outcome: &mut CycleOutcome,
    ) -> Result<(), StoreError> {
        let config = self.config;
        let device = self.device_headers(ctx)?;
        let result = ProtocolSession::new(
            &mut *self.io.transport,
            &config.network.api_base_url,
            &config.cycle,
        )
        .poll(&device);

        let directive = match result {
            Ok((directive, _)) => directive,
            Err(err) => return self.api_failure(ctx, outcome, err, None),
        };
        retry::record_success(&mut *self.io.store, RetryDomain::Api)?;
        outcome.status = Some(directive.status);

        match directive.status {
            PollStatus::ResetRequested => {
                self.reset_api_credentials()?;
                Ok(())
            }
            PollStatus::NotRegistered => {
                info!("device not yet paired");
                self.show_placeholder()?;
                Ok(())
            }
            PollStatus::Normal => self.apply_directive(ctx, outcome, &device, directive),
        }
    }

    fn apply_directive(
        &mut self,
        ctx: &SessionContext,
        outcome: &mut CycleOutcome,
        device: &DeviceHeaders,
        directive: DisplayDirective,
    ) -> Result<(), StoreError> {
        if directive.reset_credentials {
            self.reset_api_credentials()?;
            outcome.status = Some(PollStatus::ResetRequested);
        }

        if let Some(err) = &directive.action_error {
            warn!("special function {} ignored: {err}", ctx.special_function);
            let entry = self.log_entry(ctx, format!("special function {}: {err}", ctx.special_function))?;
            self.queue_log(entry)?;
        }

        let store = &mut *self.io.store;
        if let Some(next) = directive.next_function {
            if store.set_u32_if_changed(keys::SPECIAL_FUNCTION, next.code())? {
                info!("special function selector set to {next}");
            }
        }
        if let Some(rate) = directive.refresh_rate {
            if store.set_u32_if_changed(keys::REFRESH_RATE, rate)? {
                info!("refresh rate changed to {rate}s");
            }
        }
        if let Some(profile) = directive.temp_profile {
            if store.set_u32_if_changed(keys::TEMP_PROFILE, profile.min(3))? {
                info!("temperature profile changed to {profile}");
            }
        }

        let hints = RenderHints {
            full_refresh: directive.maximum_compatibility || !ctx.wake_cause.is_timer(),
            temp_profile: store.u32_or(keys::TEMP_PROFILE, 0)?,
            maximum_compatibility: directive.maximum_compatibility,
        };

        // a reset or firmware update supersedes this poll's content
        let content_deferred = directive.reset_credentials || directive.firmware_url.is_some();
        match &directive.render {
            RenderRequest::Nothing => {}
            RenderRequest::Placeholder | RenderRequest::Fetch { .. } if content_deferred => {
                info!("skipping content {}: reset or firmware update pending", directive.identity);
            }
            RenderRequest::Placeholder => {
                outcome.placeholder = true;
                self.show_placeholder()?;
            }
            RenderRequest::Fetch { url, timeout_ms } => {
                self.render_remote(ctx, outcome, device, url, *timeout_ms, &directive.identity, &hints)?;
            }
            RenderRequest::Archived(slot) => self.render_archived(ctx, *slot, &hints)?,
        }

        if let Some(url) = &directive.firmware_url {
            self.update_firmware(ctx, outcome, device, url)?;
        }
        Ok(())
    }

    fn reset_api_credentials(&mut self) -> Result<(), StoreError> {
        warn!("server requested a credential reset");
        self.io.store.remove(keys::API_KEY)?;
        self.io.store.remove(keys::FRIENDLY_ID)?;
        Ok(())
    }

    fn show_placeholder(&mut self) -> Result<(), StoreError> {
        if !content::should_render(&*self.io.store, EMPTY_STATE)? {
            info!("placeholder already on screen");
            return Ok(());
        }
        let friendly_id = self.io.store.str_or(keys::FRIENDLY_ID, "")?;
        let screen = StatusScreen::new(MessageKind::FriendlyId)
            .with_friendly_id(friendly_id)
            .with_firmware_version(self.firmware_version);
        if self.show_status(screen) {
            content::commit(&mut *self.io.store, EMPTY_STATE)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn render_remote(
        &mut self,
        ctx: &SessionContext,
        outcome: &mut CycleOutcome,
        device: &DeviceHeaders,
        url: &str,
        timeout_ms: Option<u32>,
        identity: &str,
        hints: &RenderHints,
    ) -> Result<(), StoreError> {
        if !content::should_render(&*self.io.store, identity)? {
            info!("content {identity} unchanged, skipping render");
            return Ok(());
        }

        let image = self
            .download_image(device, url, timeout_ms)
            .and_then(|image| self.io.renderer.show_image(&image, hints).map(|()| image));

        match image {
            Ok(image) => {
                if let Err(err) = self.io.archive.store_current(&image) {
                    warn!("failed to archive rendered image: {err}");
                }
                content::commit(&mut *self.io.store, identity)?;
                info!("rendered {identity} ({} bytes)", image.len());
                outcome.rendered = Some(identity.to_string());
                Ok(())
            }
            Err(err) => self.content_failure(ctx, &err, identity),
        }
    }

    fn download_image(
        &mut self,
        device: &DeviceHeaders,
        url: &str,
        timeout_ms: Option<u32>,
    ) -> Result<ImagePayload, ContentError> {
        let cycle = &self.config.cycle;
        let base_url = &self.config.network.api_base_url;

        let timeout_ms = match timeout_ms {
            Some(requested) if requested > cycle.image_timeout_cap_ms => {
                warn!(
                    "image timeout {requested}ms capped at {}ms",
                    cycle.image_timeout_cap_ms
                );
                cycle.image_timeout_cap_ms
            }
            Some(requested) => requested,
            None => cycle.http_timeout_ms,
        };
        let limits = RequestLimits {
            timeout_ms,
            idle_timeout_ms: cycle.idle_timeout_ms,
            max_body_bytes: cycle.max_image_bytes,
        };

        let mut headers = vec![("Accept-Encoding", "identity".to_string())];
        if same_origin(url, base_url) {
            headers.extend(device.identity_headers());
        }

        info!("downloading image {url}");
        let response = ProtocolSession::new(&mut *self.io.transport, base_url, cycle)
            .fetch(url, &headers, &limits)
            .map_err(|err| match err {
                ProtocolError::Transport(TransportError::TooLarge { limit }) => {
                    ContentError::TooLarge {
                        size: limit.saturating_add(1),
                        limit,
                    }
                }
                other => ContentError::Download(other),
            })?;

        if !response.is_success() {
            return Err(ContentError::Download(ProtocolError::HttpStatus(
                response.status,
            )));
        }
        if let Some(declared) = response.content_length {
            if declared > cycle.max_image_bytes as u64 {
                return Err(ContentError::TooLarge {
                    size: usize::try_from(declared).unwrap_or(usize::MAX),
                    limit: cycle.max_image_bytes,
                });
            }
        }

        ImagePayload::new(
            response.body,
            response.content_type.as_deref(),
            cycle.max_image_bytes,
        )
    }

    fn render_archived(
        &mut self,
        ctx: &SessionContext,
        slot: ArchiveSlot,
        hints: &RenderHints,
    ) -> Result<(), StoreError> {
        let shown = self
            .io
            .archive
            .load(slot)
            .and_then(|image| self.io.renderer.show_image(&image, hints));

        match shown {
            Ok(()) => {
                info!("re-rendered archived {} image", slot.name());
                // the next regular poll must redraw whatever is current
                content::invalidate(&mut *self.io.store)
            }
            Err(err) => self.content_failure(ctx, &err, slot.name()),
        }
    }

    /// Content problems end the render step only; the rest of the poll stands.
    fn content_failure(
        &mut self,
        ctx: &SessionContext,
        err: &ContentError,
        identity: &str,
    ) -> Result<(), StoreError> {
        warn!("render of {identity} failed: {err}");
        self.show_status(screen_for_content_error(err));

        let current = content::last_identity(&*self.io.store)?;
        let entry = self
            .log_entry(ctx, format!("render failed: {err}"))?
            .with_filenames(&current, identity);
        self.queue_log(entry)
    }

    fn update_firmware(
        &mut self,
        ctx: &SessionContext,
        outcome: &mut CycleOutcome,
        device: &DeviceHeaders,
        url: &str,
    ) -> Result<(), StoreError> {
        outcome.firmware_attempted = true;
        self.show_status(
            StatusScreen::new(MessageKind::FirmwareUpdate).with_firmware_version(self.firmware_version),
        );

        let cycle = &self.config.cycle;
        let limits = RequestLimits {
            timeout_ms: cycle.firmware_timeout_ms,
            idle_timeout_ms: cycle.idle_timeout_ms,
            max_body_bytes: usize::MAX,
        };
        let headers = if same_origin(url, &self.config.network.api_base_url) {
            device.identity_headers()
        } else {
            Vec::new()
        };

        let message = match ota::install_firmware(
            &mut *self.io.transport,
            &mut *self.io.firmware,
            url,
            &headers,
            &limits,
        ) {
            Ok(report) => {
                self.show_status(StatusScreen::new(MessageKind::FirmwareUpdateSuccess));
                format!(
                    "firmware update written: {} bytes, sha256 {}",
                    report.bytes_written, report.sha256
                )
            }
            Err(err) => {
                warn!("firmware update failed: {err}");
                let kind = match &err {
                    FirmwareError::Transport(_) | FirmwareError::HttpStatus(_) => {
                        MessageKind::ApiFirmwareUpdateError
                    }
                    FirmwareError::Empty | FirmwareError::Sink(_) => MessageKind::FirmwareUpdateFailed,
                };
                self.show_status(StatusScreen::new(kind).with_message(err.to_string()));
                format!("firmware update failed: {err}")
            }
        };

        let entry = self.log_entry(ctx, message)?;
        self.queue_log(entry)
    }

    fn drain_logs(&mut self, ctx: &SessionContext) -> Result<(), StoreError> {
        let config = self.config;
        let device = self.device_headers(ctx)?;
        let connected = self.io.network.is_connected();
        let queue = LogQueue::new(config.cycle.log_capacity);

        let mut session = ProtocolSession::new(
            &mut *self.io.transport,
            &config.network.api_base_url,
            &config.cycle,
        );
        let drained = queue.drain_if_connected(&mut *self.io.store, connected, &mut |body| {
            match session.submit_logs(&device, body) {
                Ok(()) => true,
                Err(err) => {
                    warn!("log submit failed: {err}");
                    false
                }
            }
        })?;
        match drained {
            LogDrain::Kept(count) => warn!("{count} log entries kept for the next cycle"),
            LogDrain::Submitted(_) | LogDrain::Idle => {}
        }
        Ok(())
    }

    fn finish(&mut self, ctx: &SessionContext, outcome: &CycleOutcome) -> Result<CycleExit, StoreError> {
        if ctx.wifi_connected {
            self.drain_logs(ctx)?;
            self.io.network.disconnect();
        }
        let now = self.io.clock.epoch_now();
        SleepScheduler::new(&self.config.cycle, &self.config.board).finalize(
            &mut *self.io.store,
            outcome,
            now,
        )
    }

    fn device_headers(&self, ctx: &SessionContext) -> Result<DeviceHeaders, StoreError> {
        let config = self.config;
        Ok(DeviceHeaders {
            mac_address: ctx.mac_address.clone(),
            api_key: self.io.store.get_str(keys::API_KEY)?,
            firmware_version: self.firmware_version.to_string(),
            model: config.board.model.clone(),
            battery_voltage: ctx.battery_voltage,
            rssi: ctx.rssi,
            refresh_rate: self
                .io
                .store
                .u32_or(keys::REFRESH_RATE, config.cycle.default_refresh_seconds)?,
            width: config.board.width,
            height: config.board.height,
            special_function: ctx.special_function,
        })
    }

    fn log_entry(
        &self,
        ctx: &SessionContext,
        message: impl Into<String>,
    ) -> Result<LogEntry, StoreError> {
        let stamp = DeviceStatusStamp {
            wifi_rssi_level: ctx.rssi,
            wifi_status: if ctx.wifi_connected { "connected" } else { "disconnected" }.to_string(),
            refresh_rate: self
                .io
                .store
                .u32_or(keys::REFRESH_RATE, self.config.cycle.default_refresh_seconds)?,
            time_since_last_sleep: ctx.time_since_sleep,
            current_fw_version: self.firmware_version.to_string(),
            special_function: ctx.special_function.name().to_string(),
            battery_voltage: ctx.battery_voltage,
            wakeup_reason: ctx.wake_cause.as_str().to_string(),
            free_heap_size: ctx.free_heap,
        };
        let timestamp = self.io.clock.epoch_now().unwrap_or(0);
        Ok(LogEntry::new(message, stamp, timestamp))
    }

    fn queue_log(&mut self, entry: LogEntry) -> Result<(), StoreError> {
        LogQueue::new(self.config.cycle.log_capacity).push(&mut *self.io.store, entry)?;
        Ok(())
    }

    fn show_status(&mut self, screen: StatusScreen) -> bool {
        info!("status screen: {}", screen.headline());
        match self.io.renderer.show_status(&screen) {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to show {:?} screen: {err}", screen.kind);
                false
            }
        }
    }
}
