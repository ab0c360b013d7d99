use log::info;

use crate::{
    config::{BoardConfig, CycleConfig},
    error::StoreError,
    interpret::PollStatus,
    protocol::SpecialFunction,
    retry::RetryStep,
    store::{keys, Store},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSource {
    Timer { seconds: u32 },
    Button { pin: i32, active_low: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SleepPlan {
    pub seconds: u32,
    pub wake_sources: Vec<WakeSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    FirmwareUpdate,
    CredentialReset,
    DurabilityFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleExit {
    Sleep(SleepPlan),
    Restart(RestartReason),
}

/// Everything the cycle learned that bears on how it ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub retry: Option<RetryStep>,
    pub status: Option<PollStatus>,
    pub placeholder: bool,
    pub unprovisioned: bool,
    pub firmware_attempted: bool,
    pub special_function: SpecialFunction,
    pub rendered: Option<String>,
}

pub struct SleepScheduler<'a> {
    cycle: &'a CycleConfig,
    board: &'a BoardConfig,
}

impl<'a> SleepScheduler<'a> {
    pub fn new(cycle: &'a CycleConfig, board: &'a BoardConfig) -> Self {
        Self { cycle, board }
    }

    /// Picks the sleep duration, stamps the sleep time and flushes the store.
    /// The first matching rule wins.
    pub fn decide(&self, store: &dyn Store, outcome: &CycleOutcome) -> Result<CycleExit, StoreError> {
        if let Some(step) = outcome.retry {
            return Ok(self.sleep(step.sleep_seconds));
        }

        match outcome.status {
            Some(PollStatus::NotRegistered | PollStatus::ResetRequested) => {
                return Ok(self.sleep(self.cycle.not_registered_seconds));
            }
            _ => {}
        }

        if outcome.placeholder {
            return Ok(self.sleep(self.cycle.placeholder_seconds));
        }

        if outcome.unprovisioned {
            return Ok(self.sleep(self.cycle.default_refresh_seconds));
        }

        if outcome.firmware_attempted && outcome.special_function == SpecialFunction::None {
            return Ok(CycleExit::Restart(RestartReason::FirmwareUpdate));
        }

        let refresh = store.u32_or(keys::REFRESH_RATE, self.cycle.default_refresh_seconds)?;
        Ok(self.sleep(refresh))
    }

    pub fn finalize(
        &self,
        store: &mut dyn Store,
        outcome: &CycleOutcome,
        now_epoch: Option<u64>,
    ) -> Result<CycleExit, StoreError> {
        let exit = self.decide(store, outcome)?;

        let stamp = now_epoch
            .and_then(|now| u32::try_from(now).ok())
            .unwrap_or(0);
        store.put_u32(keys::LAST_SLEEP, stamp)?;
        store.flush()?;

        match &exit {
            CycleExit::Sleep(plan) => info!("sleeping for {}s", plan.seconds),
            CycleExit::Restart(reason) => info!("restarting: {reason:?}"),
        }
        Ok(exit)
    }

    fn sleep(&self, seconds: u32) -> CycleExit {
        let seconds = seconds.max(1);
        let mut wake_sources = vec![WakeSource::Timer { seconds }];
        if self.board.button_wake {
            wake_sources.push(WakeSource::Button {
                pin: self.board.wake_pin,
                active_low: self.board.wake_active_low,
            });
        }
        CycleExit::Sleep(SleepPlan {
            seconds,
            wake_sources,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        retry::{record_failure, RetryDomain},
        store::MemoryStore,
    };

    fn seconds(exit: &CycleExit) -> u32 {
        match exit {
            CycleExit::Sleep(plan) => plan.seconds,
            CycleExit::Restart(reason) => panic!("unexpected restart: {reason:?}"),
        }
    }

    #[test]
    fn normal_cycle_uses_persisted_refresh_rate() {
        let (cycle, board) = (CycleConfig::default(), BoardConfig::default());
        let scheduler = SleepScheduler::new(&cycle, &board);
        let mut store = MemoryStore::new();
        let outcome = CycleOutcome {
            status: Some(PollStatus::Normal),
            ..CycleOutcome::default()
        };

        assert_eq!(seconds(&scheduler.decide(&store, &outcome).unwrap()), 900);
        store.put_u32(keys::REFRESH_RATE, 300).unwrap();
        assert_eq!(seconds(&scheduler.decide(&store, &outcome).unwrap()), 300);
    }

    #[test]
    fn not_registered_is_short_even_at_max_retry_tier() {
        let (cycle, board) = (CycleConfig::default(), BoardConfig::default());
        let scheduler = SleepScheduler::new(&cycle, &board);
        let mut store = MemoryStore::new();
        store.put_u32(keys::API_RETRY, 9).unwrap();
        store.put_u32(keys::REFRESH_RATE, 1_800).unwrap();

        for status in [PollStatus::NotRegistered, PollStatus::ResetRequested] {
            let outcome = CycleOutcome {
                status: Some(status),
                ..CycleOutcome::default()
            };
            assert_eq!(seconds(&scheduler.decide(&store, &outcome).unwrap()), 5);
        }
    }

    #[test]
    fn failure_defers_to_ladder() {
        let (cycle, board) = (CycleConfig::default(), BoardConfig::default());
        let scheduler = SleepScheduler::new(&cycle, &board);
        let mut store = MemoryStore::new();
        record_failure(&mut store, RetryDomain::Api, &cycle).unwrap();
        let step = record_failure(&mut store, RetryDomain::Api, &cycle).unwrap();

        let outcome = CycleOutcome {
            retry: Some(step),
            ..CycleOutcome::default()
        };
        assert_eq!(seconds(&scheduler.decide(&store, &outcome).unwrap()), 30);
    }

    #[test]
    fn pending_firmware_restarts_only_without_special_function() {
        let (cycle, board) = (CycleConfig::default(), BoardConfig::default());
        let scheduler = SleepScheduler::new(&cycle, &board);
        let store = MemoryStore::new();
        let mut outcome = CycleOutcome {
            status: Some(PollStatus::Normal),
            firmware_attempted: true,
            ..CycleOutcome::default()
        };

        assert_eq!(
            scheduler.decide(&store, &outcome).unwrap(),
            CycleExit::Restart(RestartReason::FirmwareUpdate)
        );

        outcome.special_function = SpecialFunction::Identify;
        assert_eq!(seconds(&scheduler.decide(&store, &outcome).unwrap()), 900);
    }

    #[test]
    fn finalize_stamps_sleep_time_and_arms_both_sources() {
        let (cycle, board) = (CycleConfig::default(), BoardConfig::default());
        let scheduler = SleepScheduler::new(&cycle, &board);
        let mut store = MemoryStore::new();

        let exit = scheduler
            .finalize(&mut store, &CycleOutcome::default(), Some(1_700_000_000))
            .unwrap();

        assert_eq!(store.get_u32(keys::LAST_SLEEP).unwrap(), Some(1_700_000_000));
        let CycleExit::Sleep(plan) = exit else {
            panic!("expected sleep");
        };
        assert_eq!(
            plan.wake_sources,
            vec![
                WakeSource::Timer { seconds: 900 },
                WakeSource::Button {
                    pin: 2,
                    active_low: true
                },
            ]
        );
    }

    #[test]
    fn zero_refresh_rate_still_sleeps() {
        let cycle = CycleConfig::default();
        let board = BoardConfig {
            button_wake: false,
            ..BoardConfig::default()
        };
        let scheduler = SleepScheduler::new(&cycle, &board);
        let mut store = MemoryStore::new();
        store.put_u32(keys::REFRESH_RATE, 0).unwrap();

        let exit = scheduler.decide(&store, &CycleOutcome::default()).unwrap();
        assert_eq!(
            exit,
            CycleExit::Sleep(SleepPlan {
                seconds: 1,
                wake_sources: vec![WakeSource::Timer { seconds: 1 }],
            })
        );
    }
}
