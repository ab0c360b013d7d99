use std::fmt;

use crate::{
    config::ButtonConfig,
    platform::{ButtonInput, Clock},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCause {
    /// Cold boot or reset; no sleep preceded this cycle.
    PowerOn,
    Timer,
    Button,
    Other,
}

impl WakeCause {
    pub fn is_timer(self) -> bool {
        self == Self::Timer
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PowerOn => "power_on",
            Self::Timer => "timer",
            Self::Button => "button",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for WakeCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    NoAction,
    ShortPress,
    DoubleClick,
    LongPress,
    SoftReset,
}

/// Maps a single hold duration to its class. `None` means the hold was
/// short enough that a second press may still upgrade it.
pub fn classify_hold(held_ms: u64, cfg: &ButtonConfig) -> Option<ButtonAction> {
    if held_ms >= u64::from(cfg.soft_reset_ms) {
        Some(ButtonAction::SoftReset)
    } else if held_ms > u64::from(cfg.long_hold_ms) {
        Some(ButtonAction::LongPress)
    } else if held_ms > u64::from(cfg.medium_hold_ms) {
        Some(ButtonAction::DoubleClick)
    } else {
        None
    }
}

pub struct WakeClassifier<'a> {
    cfg: &'a ButtonConfig,
    button: &'a mut dyn ButtonInput,
    clock: &'a mut dyn Clock,
}

impl<'a> WakeClassifier<'a> {
    pub fn new(
        cfg: &'a ButtonConfig,
        button: &'a mut dyn ButtonInput,
        clock: &'a mut dyn Clock,
    ) -> Self {
        Self { cfg, button, clock }
    }

    pub fn classify(&mut self, cause: WakeCause) -> ButtonAction {
        if cause != WakeCause::Button {
            return ButtonAction::NoAction;
        }

        if self.button.is_pressed() {
            let held = self.measure_hold();
            if held < u64::from(self.cfg.noise_ms) {
                return ButtonAction::NoAction;
            }
            if let Some(action) = classify_hold(held, self.cfg) {
                return action;
            }
        } else if self.clock.uptime_ms() > u64::from(self.cfg.released_at_boot_ms) {
            return ButtonAction::NoAction;
        }

        if !self.wait_for_press(self.cfg.double_click_window_ms) {
            return ButtonAction::ShortPress;
        }

        let second = self.measure_hold();
        match classify_hold(second, self.cfg) {
            Some(action @ (ButtonAction::LongPress | ButtonAction::SoftReset)) => action,
            _ => ButtonAction::DoubleClick,
        }
    }

    /// Polls until release, bounded by the soft-reset threshold.
    fn measure_hold(&mut self) -> u64 {
        let start = self.clock.uptime_ms();
        let limit = u64::from(self.cfg.soft_reset_ms);
        loop {
            let held = self.clock.uptime_ms().saturating_sub(start);
            if held >= limit || !self.button.is_pressed() {
                return held;
            }
            self.clock.delay_ms(self.cfg.poll_interval_ms);
        }
    }

    fn wait_for_press(&mut self, window_ms: u32) -> bool {
        let start = self.clock.uptime_ms();
        while self.clock.uptime_ms().saturating_sub(start) < u64::from(window_ms) {
            if self.button.is_pressed() {
                return true;
            }
            self.clock.delay_ms(self.cfg.poll_interval_ms);
        }
        false
    }
}
