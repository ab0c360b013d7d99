use log::{info, warn};

use crate::{
    config::CycleConfig,
    error::StoreError,
    store::{keys, Store},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDomain {
    Wifi,
    Api,
}

impl RetryDomain {
    pub fn key(self) -> &'static str {
        match self {
            Self::Wifi => keys::WIFI_RETRY,
            Self::Api => keys::API_RETRY,
        }
    }

    pub fn ladder(self, cfg: &CycleConfig) -> &[u32] {
        match self {
            Self::Wifi => &cfg.wifi_retry_ladder,
            Self::Api => &cfg.api_retry_ladder,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStep {
    pub domain: RetryDomain,
    /// Counter value this failure was classified with.
    pub attempt: u32,
    pub sleep_seconds: u32,
    /// Past the last tier; the device is back on its normal cadence.
    pub exhausted: bool,
}

pub fn current_attempt(store: &dyn Store, domain: RetryDomain) -> Result<u32, StoreError> {
    Ok(store.u32_or(domain.key(), 1)?.max(1))
}

/// Classifies this failure by the persisted counter, then advances it.
pub fn record_failure(
    store: &mut dyn Store,
    domain: RetryDomain,
    cfg: &CycleConfig,
) -> Result<RetryStep, StoreError> {
    let attempt = current_attempt(store, domain)?;
    let ladder = domain.ladder(cfg);
    let index = attempt as usize - 1;

    let (sleep_seconds, exhausted) = match ladder.get(index) {
        Some(seconds) => (*seconds, false),
        None => (cfg.default_refresh_seconds, true),
    };

    store.put_u32(domain.key(), attempt.saturating_add(1))?;

    if exhausted {
        warn!("{domain:?} retries exhausted after {attempt} attempts; sleeping {sleep_seconds}s");
    } else {
        info!("{domain:?} failure #{attempt}; retrying in {sleep_seconds}s");
    }

    Ok(RetryStep {
        domain,
        attempt,
        sleep_seconds,
        exhausted,
    })
}

pub fn record_success(store: &mut dyn Store, domain: RetryDomain) -> Result<(), StoreError> {
    if store.set_u32_if_changed(domain.key(), 1)? {
        info!("{domain:?} retry counter reset");
    }
    Ok(())
}
