//! AFH Mask Computer: turns a WLAN-channels-in-use bitmap into a 79-bit
//! Bluetooth channel exclusion mask, with an optional Channel Assessment
//! (CA) coupling policy that can ask the controller to stand down its own
//! channel classification while WLAN is active.

use crate::error::Status;

/// Default guard band: number of BT channels excluded on either side of a
/// WLAN carrier's nearest BT channel.
pub const DEFAULT_GUARD_BAND: u8 = 11;

/// Minimum number of BT channels that must remain enabled for a single
/// active WLAN channel; `79 - 2*29 - 1 = 20`, which is also why
/// `afh_guard_band` must stay `<= 29`.
const N_MIN: usize = 20;

/// How the crate should couple AFH mask pushes to the controller's Channel
/// Assessment feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaMode {
    /// Never touch the controller's CA mode.
    LeaveAlone,
    /// Query the controller's current CA mode on first WLAN activity.
    ReadFromController,
    /// Assume CA starts on; always turn it off when WLAN becomes active.
    AssumeInitiallyOn,
    /// Assume CA starts off; never needs turning off.
    AssumeInitiallyOff,
}

/// The controller's last-known Channel Assessment mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CaControllerMode {
    Off,
    On,
    #[default]
    Unknown,
}

/// The platform sink the AFH computer drives: pushing the computed mask and,
/// for `CaMode::ReadFromController`, reading/writing the controller's CA
/// mode.
pub trait AfhSink: Send + Sync {
    fn push(&self, mask: [u8; 10]);
    fn read_mode(&self) -> CaControllerMode;
    fn write_mode(&self, on: bool);
}

/// Maps a WLAN channel number (1..=14) to its center frequency in MHz.
fn wlan_channel_freq_mhz(channel: u8) -> u16 {
    if channel == 14 {
        2484
    } else {
        2412 + 5 * (channel as u16 - 1)
    }
}

/// Builds the 79-bit, 10-byte little-endian-bit-packed BT channel exclusion
/// mask for `bitmap` (bit n set means WLAN channel n+1 is in use) with the
/// given guard band. Logs, but does not alter, a mask-floor violation.
pub fn compute_mask(bitmap: u16, guard_band: u8) -> [u8; 10] {
    let mut enabled = [true; 79];

    for channel in 1..=14u8 {
        let bit = channel - 1;
        if bitmap & (1 << bit) == 0 {
            continue;
        }
        let freq = wlan_channel_freq_mhz(channel) as i32;
        let center = freq - 2402;
        for (i, slot) in enabled.iter_mut().enumerate() {
            if (i as i32 - center).abs() <= guard_band as i32 {
                *slot = false;
            }
        }
    }

    let channels_in_use = bitmap.count_ones();
    let remaining = enabled.iter().filter(|&&b| b).count();
    if channels_in_use > 1 && remaining < N_MIN {
        log::error!(
            "AFH mask floor violated: only {} of 79 BT channels remain enabled with {} WLAN channels in use",
            remaining,
            channels_in_use
        );
    }

    let mut mask = [0u8; 10];
    for (i, &is_enabled) in enabled.iter().enumerate() {
        if is_enabled {
            mask[i / 8] |= 1 << (i % 8);
        }
    }
    mask
}

/// Owns the cached WLAN bitmap, the guard band policy, and the CA-coupling
/// memory. A single instance is meant to outlive `init`/`deinit` cycles of
/// the core so the last-known WLAN bitmap survives re-initialization.
pub struct AfhComputer {
    guard_band: u8,
    ca_mode: CaMode,
    last_bitmap: Option<u16>,
    wlan_active: bool,
    ca_remembered: CaControllerMode,
    ca_turned_off_by_us: bool,
}

impl AfhComputer {
    pub fn new(guard_band: u8, ca_mode: CaMode) -> Self {
        debug_assert!(guard_band <= 29, "afh_guard_band must stay <= 29 to preserve the N_MIN floor");
        AfhComputer {
            guard_band,
            ca_mode,
            last_bitmap: None,
            wlan_active: false,
            ca_remembered: CaControllerMode::Unknown,
            ca_turned_off_by_us: false,
        }
    }

    /// Validates and stores a new WLAN-channel bitmap, returning whether it
    /// differs from the previously stored value. Storing always succeeds
    /// regardless of whether the core is initialized; only pushing to the
    /// sink depends on that, which is the caller's decision.
    pub fn set_wlan_channels(&mut self, bitmap: u16) -> Result<bool, Status> {
        if bitmap & 0xC000 != 0 {
            return Err(Status::InvalidParameters);
        }
        let changed = self.last_bitmap != Some(bitmap);
        self.last_bitmap = Some(bitmap);
        Ok(changed)
    }

    pub fn last_bitmap(&self) -> u16 {
        self.last_bitmap.unwrap_or(0)
    }

    /// Re-applies the immutable-per-init `Config` on a fresh `init()` while
    /// preserving the cached WLAN bitmap, which survives re-initialization.
    pub fn reconfigure(&mut self, guard_band: u8, ca_mode: CaMode) {
        debug_assert!(guard_band <= 29, "afh_guard_band must stay <= 29 to preserve the N_MIN floor");
        self.guard_band = guard_band;
        self.ca_mode = ca_mode;
        self.wlan_active = false;
        self.ca_remembered = CaControllerMode::Unknown;
        self.ca_turned_off_by_us = false;
    }

    pub fn compute_current_mask(&self) -> [u8; 10] {
        compute_mask(self.last_bitmap(), self.guard_band)
    }

    /// Pushes the current mask to `sink` and applies any CA-mode coupling
    /// transition triggered by WLAN activity becoming active/idle.
    pub fn push_and_couple(&mut self, sink: &dyn AfhSink) {
        sink.push(self.compute_current_mask());

        let now_active = self.last_bitmap() != 0;
        if now_active != self.wlan_active {
            if now_active {
                self.on_wlan_became_active(sink);
            } else {
                self.on_wlan_became_idle(sink);
            }
            self.wlan_active = now_active;
        }
    }

    fn on_wlan_became_active(&mut self, sink: &dyn AfhSink) {
        let controller_on = match self.ca_mode {
            CaMode::LeaveAlone => return,
            CaMode::ReadFromController => {
                let mode = sink.read_mode();
                self.ca_remembered = mode;
                // An Unknown read is treated conservatively as "assume on".
                !matches!(mode, CaControllerMode::Off)
            }
            CaMode::AssumeInitiallyOn => true,
            CaMode::AssumeInitiallyOff => false,
        };

        if controller_on {
            sink.write_mode(false);
            self.ca_turned_off_by_us = true;
        }
    }

    fn on_wlan_became_idle(&mut self, sink: &dyn AfhSink) {
        if self.ca_turned_off_by_us {
            sink.write_mode(true);
            self.ca_turned_off_by_us = false;
        }
        if self.ca_mode == CaMode::ReadFromController {
            self.ca_remembered = CaControllerMode::Unknown;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn wlan_channel_6_excludes_expected_bt_range() {
        // Channel 6 -> 2437 MHz -> BT center index 35; guard 11 -> 24..=46.
        let mask = compute_mask(0x0020, DEFAULT_GUARD_BAND);
        for i in 0..79 {
            let byte = mask[i / 8];
            let bit_set = byte & (1 << (i % 8)) != 0;
            let expected = !(24..=46).contains(&i);
            assert_eq!(bit_set, expected, "bit {} mismatch", i);
        }
        // Bit 79 (byte 9, bit 7) must always be clear.
        assert_eq!(mask[9] & 0x80, 0);
    }

    #[test]
    fn no_channels_in_use_enables_all_79_bits() {
        let mask = compute_mask(0, DEFAULT_GUARD_BAND);
        assert_eq!(mask, [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F]);
    }

    #[test]
    fn set_wlan_channels_rejects_reserved_bits() {
        let mut afh = AfhComputer::new(DEFAULT_GUARD_BAND, CaMode::LeaveAlone);
        assert_eq!(afh.set_wlan_channels(0x4000), Err(Status::InvalidParameters));
        assert_eq!(afh.set_wlan_channels(0x8000), Err(Status::InvalidParameters));
    }

    #[test]
    fn set_wlan_channels_reports_change_only_once() {
        let mut afh = AfhComputer::new(DEFAULT_GUARD_BAND, CaMode::LeaveAlone);
        assert_eq!(afh.set_wlan_channels(0x0020), Ok(true));
        assert_eq!(afh.set_wlan_channels(0x0020), Ok(false));
    }

    #[derive(Default)]
    struct MockAfhSink {
        pushed: RefCell<Vec<[u8; 10]>>,
        read_mode: RefCell<CaControllerMode>,
        writes: RefCell<Vec<bool>>,
    }

    impl AfhSink for MockAfhSink {
        fn push(&self, mask: [u8; 10]) {
            self.pushed.borrow_mut().push(mask);
        }
        fn read_mode(&self) -> CaControllerMode {
            *self.read_mode.borrow()
        }
        fn write_mode(&self, on: bool) {
            self.writes.borrow_mut().push(on);
        }
    }

    #[test]
    fn read_from_controller_turns_ca_off_on_unknown_and_restores_on_idle() {
        let sink = MockAfhSink::default();
        *sink.read_mode.borrow_mut() = CaControllerMode::Unknown;

        let mut afh = AfhComputer::new(DEFAULT_GUARD_BAND, CaMode::ReadFromController);
        afh.set_wlan_channels(0x0001).unwrap();
        afh.push_and_couple(&sink);
        assert_eq!(*sink.writes.borrow(), vec![false]);

        afh.set_wlan_channels(0x0000).unwrap();
        afh.push_and_couple(&sink);
        assert_eq!(*sink.writes.borrow(), vec![false, true]);
    }

    #[test]
    fn leave_alone_never_touches_controller() {
        let sink = MockAfhSink::default();
        let mut afh = AfhComputer::new(DEFAULT_GUARD_BAND, CaMode::LeaveAlone);
        afh.set_wlan_channels(0x0001).unwrap();
        afh.push_and_couple(&sink);
        assert!(sink.writes.borrow().is_empty());
    }
}
