use serde::Serialize;

use crate::error::{ContentError, NetworkError, ProtocolError, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Loading,
    FriendlyId,
    WifiConnect,
    WifiFailed,
    WifiInternalError,
    WifiWeak,
    ApiRequestFailed,
    ApiUnableToConnect,
    ApiSetupFailed,
    ApiSizeError,
    ApiImageDownloadError,
    ApiFirmwareUpdateError,
    FirmwareUpdate,
    FirmwareUpdateFailed,
    FirmwareUpdateSuccess,
    ImageTooBig,
    ImageFormatError,
    MacNotRegistered,
}

impl MessageKind {
    pub fn headline(self) -> &'static str {
        match self {
            Self::Loading => "Loading...",
            Self::FriendlyId => "Please sign up at usetrmnl.com/signup with Friendly ID",
            Self::WifiConnect => "Connect phone or computer to \"TRMNL\" WiFi network or scan QR code.",
            Self::WifiFailed => "Can't establish WiFi connection.",
            Self::WifiInternalError => "WiFi connected, but API connection cannot be established.",
            Self::WifiWeak => "WiFi connected but signal is weak.",
            Self::ApiRequestFailed => "WiFi connected, request to API failed.",
            Self::ApiUnableToConnect => "WiFi connected, API unreachable.",
            Self::ApiSetupFailed => "WiFi connected, but device setup failed.",
            Self::ApiSizeError => "WiFi connected, API response was malformed or too large.",
            Self::ApiImageDownloadError => "WiFi connected, image download failed.",
            Self::ApiFirmwareUpdateError => "WiFi connected, could not reach firmware server.",
            Self::FirmwareUpdate => "Firmware update in progress.",
            Self::FirmwareUpdateFailed => "Firmware update failed.",
            Self::FirmwareUpdateSuccess => "Firmware update successful.",
            Self::ImageTooBig => "The image file from this URL is too large.",
            Self::ImageFormatError => "The image format is incorrect",
            Self::MacNotRegistered => "MAC address is not registered.",
        }
    }
}

/// A full-screen status message. One value covers every message layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusScreen {
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub friendly_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusScreen {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            friendly_id: None,
            firmware_version: None,
            message: None,
        }
    }

    pub fn with_friendly_id(mut self, friendly_id: impl Into<String>) -> Self {
        self.friendly_id = Some(friendly_id.into());
        self
    }

    pub fn with_firmware_version(mut self, version: impl Into<String>) -> Self {
        self.firmware_version = Some(version.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn headline(&self) -> &'static str {
        self.kind.headline()
    }
}

pub fn screen_for_network_error(err: &NetworkError) -> StatusScreen {
    match err {
        NetworkError::Internal(_) => StatusScreen::new(MessageKind::WifiInternalError),
        _ => StatusScreen::new(MessageKind::WifiFailed),
    }
}

/// A weak link explains most API failures, so it overrides the specific screen.
pub fn screen_for_api_error(err: &ProtocolError, rssi: i32, weak_signal_rssi: i32) -> StatusScreen {
    if rssi <= weak_signal_rssi {
        return StatusScreen::new(MessageKind::WifiWeak);
    }

    let kind = match err {
        ProtocolError::Transport(TransportError::Dns(_) | TransportError::Connect(_)) => {
            MessageKind::ApiUnableToConnect
        }
        ProtocolError::Transport(TransportError::TooLarge { .. })
        | ProtocolError::Malformed(_)
        | ProtocolError::MissingField(_) => MessageKind::ApiSizeError,
        _ => MessageKind::ApiRequestFailed,
    };
    StatusScreen::new(kind)
}

pub fn screen_for_content_error(err: &ContentError) -> StatusScreen {
    let kind = match err {
        ContentError::TooLarge { .. } => MessageKind::ImageTooBig,
        ContentError::UnknownFormat => MessageKind::ImageFormatError,
        _ => MessageKind::ApiImageDownloadError,
    };
    StatusScreen::new(kind)
}
