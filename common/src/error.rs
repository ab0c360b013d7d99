use thiserror::Error;

/// Coarse failure classes; each maps to one recovery policy in the wake cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Connectivity,
    Protocol,
    Content,
    Durability,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("key `{key}` holds a {found} value, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("stored value for `{key}` is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("dns lookup failed for `{0}`")]
    Dns(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("transfer stalled for more than {idle_ms}ms")]
    Stalled { idle_ms: u32 },
    #[error("transport i/o failure: {0}")]
    Io(String),
    #[error("response body exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("transfer aborted by receiver: {0}")]
    Aborted(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),
    #[error("unexpected response status {0}")]
    UnexpectedStatus(u32),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("response is missing `{0}`")]
    MissingField(&'static str),
    #[error("redirect without a location header")]
    RedirectWithoutLocation,
    #[error("more than one redirect")]
    TooManyRedirects,
    #[error("expected action `{expected}`, server sent {found:?}")]
    ActionMismatch {
        expected: &'static str,
        found: Option<String>,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContentError {
    #[error("image payload is empty")]
    Empty,
    #[error("image payload of {size} bytes exceeds {limit} bytes")]
    TooLarge { size: usize, limit: usize },
    #[error("unrecognized image format")]
    UnknownFormat,
    #[error("image download failed: {0}")]
    Download(ProtocolError),
    #[error("renderer failed: {0}")]
    Render(String),
    #[error("nothing archived in the {0} slot")]
    NothingArchived(&'static str),
    #[error("content archive failure: {0}")]
    Archive(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("no wifi credentials stored")]
    MissingCredentials,
    #[error("wifi connection failed: {0}")]
    ConnectFailed(String),
    #[error("captive portal ended without credentials: {0}")]
    PortalFailed(String),
    #[error("wifi driver error: {0}")]
    Internal(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FirmwareError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("firmware download failed with HTTP {0}")]
    HttpStatus(u16),
    #[error("firmware download body is empty")]
    Empty,
    #[error("firmware sink failure: {0}")]
    Sink(String),
}

impl ProtocolError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transport(TransportError::TooLarge { .. }) => ErrorClass::Protocol,
            Self::Transport(_) => ErrorClass::Connectivity,
            _ => ErrorClass::Protocol,
        }
    }
}

impl ContentError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Content
    }
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Durability
    }
}

impl NetworkError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Connectivity
    }
}
