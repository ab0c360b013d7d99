use crate::{
    archive::ArchiveSlot,
    content::EMPTY_STATE,
    error::ProtocolError,
    protocol::{ApiDisplayResponse, SpecialFunction},
};

pub const STATUS_OK: u32 = 0;
pub const STATUS_NOT_REGISTERED: u32 = 202;
pub const STATUS_RESET: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Normal,
    NotRegistered,
    ResetRequested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderRequest {
    Nothing,
    Placeholder,
    Fetch { url: String, timeout_ms: Option<u32> },
    Archived(ArchiveSlot),
}

/// Every signal a display response carries, decoded once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayDirective {
    pub status: PollStatus,
    pub active_function: SpecialFunction,
    pub render: RenderRequest,
    pub identity: String,
    pub firmware_url: Option<String>,
    pub reset_credentials: bool,
    pub refresh_rate: Option<u32>,
    pub next_function: Option<SpecialFunction>,
    pub temp_profile: Option<u32>,
    pub maximum_compatibility: bool,
    pub message: Option<String>,
    /// Action verb mismatch; the response still counts as a successful exchange.
    pub action_error: Option<ProtocolError>,
}

impl DisplayDirective {
    fn empty(status: PollStatus, active_function: SpecialFunction) -> Self {
        Self {
            status,
            active_function,
            render: RenderRequest::Nothing,
            identity: String::new(),
            firmware_url: None,
            reset_credentials: false,
            refresh_rate: None,
            next_function: None,
            temp_profile: None,
            maximum_compatibility: false,
            message: None,
            action_error: None,
        }
    }
}

type Handler = fn(&ApiDisplayResponse, &mut DisplayDirective);

/// Signals honoured per special function. `None` is the regular poll.
const HANDLERS: &[(SpecialFunction, &[Handler])] = &[
    (
        SpecialFunction::None,
        &[apply_image, apply_firmware, apply_refresh_rate],
    ),
    (SpecialFunction::Identify, &[apply_image]),
    (SpecialFunction::Sleep, &[apply_refresh_rate]),
    (SpecialFunction::AddWifi, &[]),
    (SpecialFunction::RestartPlaylist, &[apply_image]),
    (SpecialFunction::Rewind, &[show_last]),
    (SpecialFunction::SendToMe, &[show_current]),
    (SpecialFunction::GuestMode, &[apply_image, apply_refresh_rate]),
];

fn handlers_for(function: SpecialFunction) -> &'static [Handler] {
    HANDLERS
        .iter()
        .find(|(sf, _)| *sf == function)
        .map(|(_, handlers)| *handlers)
        .unwrap_or(&[])
}

fn apply_image(response: &ApiDisplayResponse, directive: &mut DisplayDirective) {
    directive.identity = response.filename.clone();
    if response.filename == EMPTY_STATE {
        directive.render = RenderRequest::Placeholder;
        return;
    }
    if let Some(url) = response.image_url.as_deref().filter(|url| !url.is_empty()) {
        directive.render = RenderRequest::Fetch {
            url: url.to_string(),
            timeout_ms: (response.image_url_timeout > 0)
                .then(|| response.image_url_timeout.saturating_mul(1_000)),
        };
    }
}

fn apply_firmware(response: &ApiDisplayResponse, directive: &mut DisplayDirective) {
    if !response.update_firmware {
        return;
    }
    directive.firmware_url = response
        .firmware_url
        .as_deref()
        .filter(|url| !url.is_empty())
        .map(str::to_string);
}

fn apply_refresh_rate(response: &ApiDisplayResponse, directive: &mut DisplayDirective) {
    if response.refresh_rate > 0 {
        directive.refresh_rate = Some(response.refresh_rate);
    }
}

fn show_last(_: &ApiDisplayResponse, directive: &mut DisplayDirective) {
    directive.render = RenderRequest::Archived(ArchiveSlot::Last);
}

fn show_current(_: &ApiDisplayResponse, directive: &mut DisplayDirective) {
    directive.render = RenderRequest::Archived(ArchiveSlot::Current);
}

/// Decodes a display response for the given active special function.
///
/// Unknown statuses are a protocol error. A special function whose action
/// verb is missing or wrong yields a directive with no content change and
/// `action_error` set.
pub fn interpret(
    response: &ApiDisplayResponse,
    active: SpecialFunction,
) -> Result<DisplayDirective, ProtocolError> {
    let status = match response.status {
        STATUS_OK => PollStatus::Normal,
        STATUS_NOT_REGISTERED => PollStatus::NotRegistered,
        STATUS_RESET => PollStatus::ResetRequested,
        other => return Err(ProtocolError::UnexpectedStatus(other)),
    };

    let mut directive = DisplayDirective::empty(status, active);
    directive.message = response.message.clone();
    if status != PollStatus::Normal {
        directive.reset_credentials = status == PollStatus::ResetRequested;
        return Ok(directive);
    }

    directive.reset_credentials = response.reset_firmware;
    directive.next_function = response
        .special_function
        .as_deref()
        .and_then(SpecialFunction::parse);
    directive.temp_profile = response.temp_profile;
    directive.maximum_compatibility = response.maximum_compatibility;

    if let Some(expected) = active.verb() {
        if response.action.as_deref() != Some(expected) {
            directive.action_error = Some(ProtocolError::ActionMismatch {
                expected,
                found: response.action.clone(),
            });
            return Ok(directive);
        }
    }

    for handler in handlers_for(active) {
        handler(response, &mut directive);
    }
    Ok(directive)
}
