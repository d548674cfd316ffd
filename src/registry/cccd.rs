//! CCCD reference counting.
//!
//! One [`CccdTracker`] exists per device and subscribable characteristic.
//! It counts subscriber references and decides when a physical CCCD write
//! is needed. Only the 0→1 and 1→0 transitions write, and at most one write
//! is outstanding at a time.

use std::fmt;

/// Physical state of a characteristic's CCCD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CccdState {
    /// Pushes are off and no write is outstanding.
    #[default]
    Disabled,
    /// An enable write is outstanding.
    Enabling,
    /// Pushes are on and no write is outstanding.
    Enabled,
    /// A disable write is outstanding.
    Disabling,
}

impl CccdState {
    /// Check if a write is outstanding.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Enabling | Self::Disabling)
    }

    /// Check if the device last confirmed pushes as on.
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled | Self::Disabling)
    }
}

impl fmt::Display for CccdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "Disabled"),
            Self::Enabling => write!(f, "Enabling"),
            Self::Enabled => write!(f, "Enabled"),
            Self::Disabling => write!(f, "Disabling"),
        }
    }
}

/// What the caller must do after a tracker transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CccdAction {
    /// Nothing to write.
    None,
    /// Issue a CCCD write enabling (`true`) or disabling (`false`) pushes.
    Write(bool),
}

/// Reference count and physical state for one characteristic on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CccdTracker {
    state: CccdState,
    count: u32,
}

impl CccdTracker {
    /// Current state.
    pub fn state(&self) -> CccdState {
        self.state
    }

    /// Subscriber references.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Check if the device last confirmed pushes as on.
    pub fn is_enabled(&self) -> bool {
        self.state.is_enabled()
    }

    /// A subscriber asked for pushes.
    pub fn request_enable(&mut self) -> CccdAction {
        self.count += 1;
        if self.state == CccdState::Disabled {
            self.state = CccdState::Enabling;
            CccdAction::Write(true)
        } else {
            CccdAction::None
        }
    }

    /// A subscriber no longer wants pushes.
    pub fn request_disable(&mut self) -> CccdAction {
        self.count = self.count.saturating_sub(1);
        if self.count == 0 && self.state == CccdState::Enabled {
            self.state = CccdState::Disabling;
            CccdAction::Write(false)
        } else {
            CccdAction::None
        }
    }

    /// The write requested by the last transition could not be submitted.
    /// Undo that transition.
    pub fn abort_write(&mut self, enable: bool) {
        if enable {
            self.count = self.count.saturating_sub(1);
            self.state = CccdState::Disabled;
        } else {
            self.count += 1;
            self.state = CccdState::Enabled;
        }
    }

    /// A CCCD write completed.
    ///
    /// On success the state settles, and if the subscriber count moved the
    /// other way while the write was in flight a corrective write is
    /// requested. On failure the state reverts; reference rollback for the
    /// requester is the caller's job through [`release`](Self::release) and
    /// [`retain`](Self::retain).
    pub fn write_completed(&mut self, enable: bool, success: bool) -> CccdAction {
        match (enable, success) {
            (true, true) => {
                if self.count == 0 {
                    self.state = CccdState::Disabling;
                    CccdAction::Write(false)
                } else {
                    self.state = CccdState::Enabled;
                    CccdAction::None
                }
            }
            (false, true) => {
                if self.count > 0 {
                    self.state = CccdState::Enabling;
                    CccdAction::Write(true)
                } else {
                    self.state = CccdState::Disabled;
                    CccdAction::None
                }
            }
            (true, false) => {
                self.state = CccdState::Disabled;
                CccdAction::None
            }
            (false, false) => {
                self.state = CccdState::Enabled;
                CccdAction::None
            }
        }
    }

    /// Drop one reference without touching the physical state.
    pub fn release(&mut self) {
        self.count = self.count.saturating_sub(1);
    }

    /// Add one reference without touching the physical state.
    pub fn retain(&mut self) {
        self.count += 1;
    }

    /// Adopt a persisted "enabled" flag for a bonded device.
    ///
    /// Only a settled `Disabled` tracker is changed. Returns the resulting
    /// enabled flag.
    pub fn restore(&mut self, enabled: bool) -> bool {
        if enabled && self.state == CccdState::Disabled {
            self.state = CccdState::Enabled;
        }
        self.is_enabled()
    }
}
