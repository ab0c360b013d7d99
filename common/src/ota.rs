use core::fmt::Write as _;

use log::{info, warn};
use sha2::{Digest, Sha256};

use crate::{
    error::FirmwareError,
    protocol::{Header, RequestLimits, Transport},
};

/// Destination of a streamed firmware image.
pub trait FirmwareSink {
    fn begin(&mut self) -> Result<(), FirmwareError>;
    fn write(&mut self, chunk: &[u8]) -> Result<(), FirmwareError>;
    fn complete(&mut self) -> Result<(), FirmwareError>;
    fn abort(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareReport {
    pub bytes_written: u64,
    pub sha256: String,
}

pub fn install_firmware(
    transport: &mut dyn Transport,
    sink: &mut dyn FirmwareSink,
    url: &str,
    headers: &[Header],
    limits: &RequestLimits,
) -> Result<FirmwareReport, FirmwareError> {
    info!("downloading firmware from {url}");

    let mut hasher = Sha256::new();
    let mut written = 0_u64;
    let mut started = false;

    let result = transport.stream(url, headers, limits, &mut |chunk| {
        if !started {
            sink.begin().map_err(|err| err.to_string())?;
            started = true;
        }
        sink.write(chunk).map_err(|err| err.to_string())?;
        hasher.update(chunk);
        written = written.saturating_add(chunk.len() as u64);
        Ok(())
    });

    let status = match result {
        Ok(status) => status,
        Err(err) => {
            if started {
                sink.abort();
            }
            warn!("firmware download failed after {written} bytes: {err}");
            return Err(err.into());
        }
    };

    if !(200..300).contains(&status) {
        return Err(FirmwareError::HttpStatus(status));
    }
    if written == 0 {
        if started {
            sink.abort();
        }
        return Err(FirmwareError::Empty);
    }

    sink.complete()?;

    let mut sha256 = String::with_capacity(64);
    for byte in hasher.finalize() {
        let _ = write!(&mut sha256, "{byte:02x}");
    }
    info!("firmware image written: {written} bytes, sha256 {sha256}");

    Ok(FirmwareReport {
        bytes_written: written,
        sha256,
    })
}
