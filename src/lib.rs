//! A passive Bluetooth Coexistence Event Source (BT-CES): observes a
//! bidirectional HCI byte stream plus a handful of out-of-band platform
//! notifications, reconstructs what the Bluetooth radio is doing, and emits a
//! normalized activity stream to a single registered subscriber. Separately,
//! a WLAN-channels-in-use bitmap is translated into a 79-bit AFH channel
//! exclusion mask pushed to an injected platform sink.
//!
//! This crate never drives a transport, socket, or bus, and it never
//! initiates Bluetooth commands of its own; the host embedding it is
//! responsible for feeding [`BtCoexCore::on_hci_command`] /
//! [`BtCoexCore::on_hci_event`] from whatever HCI transport it owns, and for
//! implementing the [`Platform`] sinks ([`timer::TimerSink`],
//! [`afh::AfhSink`], [`PowerSink`]).
//!
//! All entry points are serialized by a single reentrant token mutex, mirroring
//! the original platform's single caller-held lock: a subscriber callback
//! invoked from inside [`BtCoexCore::register`] or [`BtCoexCore::on_hci_event`]
//! is free to call back into [`BtCoexCore::state_report`] on the same thread
//! without deadlocking.

mod decode;
mod hci;
mod state;
mod table;

pub mod afh;
pub mod error;
pub mod event;
pub mod native;
pub mod timer;

pub use hci::common::{AclMode, BdAddr, ConnectionHandle, LinkType};

use std::cell::RefCell;
use std::sync::{Arc, Weak};

use parking_lot::ReentrantMutex;

use afh::{AfhComputer, AfhSink, CaMode};
use error::Status;
use event::EventSink;
use native::NativeEvent;
use state::{ActivityStateMachine, TimerDispatch, TimerSlot};
use timer::TimerSink;

/// Whether the Bluetooth controller's radio was already on when
/// [`PowerSink::query_initial_bt_power`] was asked, at [`BtCoexCore::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialBtPower {
    Off,
    On,
}

/// Queried once, at `init`, to learn whether the controller's radio is
/// already on — e.g. the host process restarted mid-session and the
/// controller was never reset.
pub trait PowerSink: Send + Sync {
    fn query_initial_bt_power(&self) -> InitialBtPower;
}

/// The three sinks the core drives: a timer service, the AFH/CA platform
/// hooks, and a one-shot initial-power query. Bundled together because they
/// are all supplied exactly once, at [`BtCoexCore::init`].
pub struct Platform {
    pub timer: Arc<dyn TimerSink>,
    pub afh: Arc<dyn AfhSink>,
    pub power: Arc<dyn PowerSink>,
}

/// Configuration fixed at `init` time and immutable afterward.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub ca_mode: CaMode,
    /// Number of BT channels excluded on either side of a WLAN carrier's
    /// nearest BT channel. Must stay `<= 29` to preserve the single-channel
    /// `N_MIN` floor (`79 - 29*2 - 1 = 20`); checked with `debug_assert!` at
    /// `init`, matching the original's documentation-only constraint made
    /// into an assertion (see `DESIGN.md`).
    pub afh_guard_band: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ca_mode: CaMode::LeaveAlone,
            afh_guard_band: afh::DEFAULT_GUARD_BAND,
        }
    }
}

struct Inner {
    self_weak: Weak<BtCoexCore>,
    sm: Option<ActivityStateMachine>,
    afh: AfhComputer,
    platform: Option<Platform>,
}

/// The process-wide core handle. Owned by the caller (typically behind one
/// `Arc`, shared with whatever worker feeds it HCI bytes) rather than a
/// static global, so a fresh instance is just `BtCoexCore::new()` and nothing
/// prevents running more than one in the same process (e.g. in tests).
pub struct BtCoexCore {
    inner: ReentrantMutex<RefCell<Inner>>,
}

impl BtCoexCore {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| BtCoexCore {
            inner: ReentrantMutex::new(RefCell::new(Inner {
                self_weak: weak.clone(),
                sm: None,
                afh: AfhComputer::new(afh::DEFAULT_GUARD_BAND, CaMode::LeaveAlone),
                platform: None,
            })),
        })
    }

    /// Initializes the core: queries the controller's current power state,
    /// builds a fresh activity state machine wired to `platform.timer`, and
    /// stores `platform` for later AFH pushes and CA coupling. The cached
    /// WLAN-channels bitmap (if any was set via `set_wlan_channels` before or
    /// across a prior `deinit`) survives, per the AFH Mask Computer's
    /// re-initialization contract.
    pub fn init(self: &Arc<Self>, config: Config, platform: Platform) -> Status {
        debug_assert!(config.afh_guard_band <= 29);

        let initial_power = platform.power.query_initial_bt_power();

        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.sm.is_some() {
            return Status::AlreadyInitialized;
        }

        inner.afh.reconfigure(config.afh_guard_band, config.ca_mode);

        let weak = inner.self_weak.clone();
        let dispatch: TimerDispatch = Arc::new(move |slot, tag| {
            if let Some(core) = weak.upgrade() {
                core.on_timer_fire(slot, tag);
            }
        });
        let mut sm = ActivityStateMachine::new(platform.timer.clone(), dispatch);

        if initial_power == InitialBtPower::On {
            sm.power_on();
            inner.afh.push_and_couple(platform.afh.as_ref());
        }

        inner.sm = Some(sm);
        inner.platform = Some(platform);
        Status::Ok
    }

    /// Tears down the activity state machine and releases the platform
    /// sinks. A timer that fires after `deinit` finds `sm` gone and is a
    /// no-op (`on_timer_fire` below), matching the "not initialized" contract
    /// for late timer callbacks.
    pub fn deinit(&self) -> Status {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.sm.take().is_none() {
            return Status::NotInitialized;
        }
        inner.platform = None;
        Status::Ok
    }

    /// Registers the single subscriber. On success, immediately replays a
    /// full state snapshot to it under the same lock (see
    /// `ActivityStateMachine::register`), so the subscriber never misses
    /// activity that predates it.
    pub fn register(&self, sink: impl EventSink + 'static) -> Result<(), Status> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let sm = inner.sm.as_mut().ok_or(Status::NotInitialized)?;
        sm.register(Box::new(sink))
    }

    /// Clears the subscriber slot and hands back the boxed subscriber,
    /// mirroring the original API's `Option<opaque>` return — reclaiming
    /// ownership of whatever state the subscriber captured is the idiomatic
    /// stand-in for a caller-supplied `void *opaque` pointer.
    pub fn deregister(&self) -> Result<Box<dyn EventSink>, Status> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let sm = inner.sm.as_mut().ok_or(Status::NotInitialized)?;
        sm.deregister()
    }

    /// Idempotently replays the current state snapshot to the registered
    /// subscriber. Safe to call from inside a subscriber callback already
    /// running under this same lock, on the same thread.
    pub fn state_report(&self) -> Result<(), Status> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let sm = inner.sm.as_mut().ok_or(Status::NotInitialized)?;
        sm.state_report()
    }

    /// Feeds one outgoing HCI command frame to the decoder and activity
    /// state machine. A silent no-op if the core is not initialized.
    pub fn on_hci_command(&self, bytes: &[u8]) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let Inner { sm, afh, platform, .. } = &mut *inner;
        let (Some(sm), Some(platform)) = (sm.as_mut(), platform.as_ref()) else {
            return;
        };

        Self::ensure_powered_on(sm, afh, platform);

        let cmd = decode::decode_command(bytes);
        let is_reset = matches!(cmd, decode::Command::Reset);
        sm.handle_command(cmd);

        if is_reset {
            // The controller reset wipes its own AFH map; re-push ours.
            afh.push_and_couple(platform.afh.as_ref());
        }
    }

    /// Feeds one incoming HCI event frame to the decoder and activity state
    /// machine. A silent no-op if the core is not initialized.
    pub fn on_hci_event(&self, bytes: &[u8]) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let Inner { sm, afh, platform, .. } = &mut *inner;
        let (Some(sm), Some(platform)) = (sm.as_mut(), platform.as_ref()) else {
            return;
        };

        Self::ensure_powered_on(sm, afh, platform);
        sm.handle_event(decode::decode_event(bytes));
    }

    /// Feeds one out-of-band platform notification. A silent no-op if the
    /// core is not initialized.
    pub fn on_native(&self, event: NativeEvent) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let Inner { sm, afh, platform, .. } = &mut *inner;
        let (Some(sm), Some(platform)) = (sm.as_mut(), platform.as_ref()) else {
            return;
        };

        // DeviceSwitchedOff is the power-off signal itself and must not
        // implicitly power back on; every other native event can.
        if !matches!(event, NativeEvent::DeviceSwitchedOff) {
            Self::ensure_powered_on(sm, afh, platform);
        }
        sm.handle_native(event);
    }

    /// Validates and stores a new WLAN-channels-in-use bitmap. Works even
    /// when the core is not initialized — the value is simply cached so it
    /// survives a later `init`. Pushes the recomputed AFH mask only when the
    /// value changed and the core is initialized with BT currently on.
    pub fn set_wlan_channels(&self, bitmap: u16) -> Result<(), Status> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let Inner { sm, afh, platform, .. } = &mut *inner;

        let changed = afh.set_wlan_channels(bitmap)?;
        if changed {
            if let (Some(sm), Some(platform)) = (sm.as_ref(), platform.as_ref()) {
                if sm.is_bt_on() {
                    afh.push_and_couple(platform.afh.as_ref());
                }
            }
        }
        Ok(())
    }

    /// Performs the implicit power-on described in `spec.md` §4.4.1: any HCI
    /// traffic or qualifying native event observed while BT is off first
    /// brings BT on and pushes the cached WLAN mask.
    fn ensure_powered_on(sm: &mut ActivityStateMachine, afh: &mut AfhComputer, platform: &Platform) {
        if !sm.is_bt_on() {
            sm.power_on();
            afh.push_and_couple(platform.afh.as_ref());
        }
    }

    /// Re-enters the core from a timer firing. Stale firings (tag mismatch)
    /// and firings after `deinit` (no `sm`) are both silent no-ops.
    fn on_timer_fire(&self, slot: TimerSlot, tag: u64) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let Some(sm) = inner.sm.as_mut() else { return };
        match slot {
            TimerSlot::Page => sm.on_page_timer_fire(tag),
            TimerSlot::PeriodicInquiry => sm.on_periodic_inquiry_timer_fire(tag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::afh::CaControllerMode;
    use crate::timer::StdTimerSink;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct MockAfhSink {
        pushed: StdMutex<Vec<[u8; 10]>>,
    }

    impl AfhSink for MockAfhSink {
        fn push(&self, mask: [u8; 10]) {
            self.pushed.lock().unwrap().push(mask);
        }
        fn read_mode(&self) -> CaControllerMode {
            CaControllerMode::Unknown
        }
        fn write_mode(&self, _on: bool) {}
    }

    struct AlwaysOff;
    impl PowerSink for AlwaysOff {
        fn query_initial_bt_power(&self) -> InitialBtPower {
            InitialBtPower::Off
        }
    }

    fn test_platform() -> (Arc<MockAfhSink>, Platform) {
        let afh_sink = Arc::new(MockAfhSink {
            pushed: StdMutex::new(Vec::new()),
        });
        let platform = Platform {
            timer: Arc::new(StdTimerSink::new()),
            afh: afh_sink.clone(),
            power: Arc::new(AlwaysOff),
        };
        (afh_sink, platform)
    }

    #[test]
    fn double_init_is_rejected() {
        let core = BtCoexCore::new();
        let (_afh, platform1) = test_platform();
        assert_eq!(core.init(Config::default(), platform1), Status::Ok);

        let (_afh2, platform2) = test_platform();
        assert_eq!(core.init(Config::default(), platform2), Status::AlreadyInitialized);
    }

    #[test]
    fn uninitialized_calls_are_silent_no_ops() {
        let core = BtCoexCore::new();
        // Must not panic.
        core.on_hci_command(&[0x01, 0x04, 0x05, 0x33, 0x8B, 0x9E, 0x08, 0x00]);
        core.on_native(NativeEvent::DeviceSwitchedOn);
        assert_eq!(core.deinit(), Status::NotInitialized);
        assert_eq!(core.state_report(), Err(Status::NotInitialized));
    }

    #[test]
    fn set_wlan_channels_works_before_init_and_rejects_reserved_bits() {
        let core = BtCoexCore::new();
        assert!(core.set_wlan_channels(0x0020).is_ok());
        assert_eq!(core.set_wlan_channels(0x8000), Err(Status::InvalidParameters));
    }

    #[test]
    fn implicit_power_on_pushes_cached_wlan_mask() {
        let core = BtCoexCore::new();
        core.set_wlan_channels(0x0020).unwrap();

        let (afh_sink, platform) = test_platform();
        assert_eq!(core.init(Config::default(), platform), Status::Ok);

        core.on_native(NativeEvent::DeviceSwitchedOn);
        assert_eq!(afh_sink.pushed.lock().unwrap().len(), 1);
    }

    #[test]
    fn register_replays_snapshot_and_deregister_returns_subscriber() {
        let core = BtCoexCore::new();
        let (_afh, platform) = test_platform();
        core.init(Config::default(), platform);

        let received = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = received.clone();
        core.register(move |event| received_clone.lock().unwrap().push(event)).unwrap();

        // Initial snapshot while BT is off: just BtPowerOff.
        assert_eq!(*received.lock().unwrap(), vec![event::ActivityEvent::BtPowerOff]);

        assert!(matches!(core.register(|_| {}), Err(Status::AlreadyRegistered)));

        let subscriber = core.deregister().unwrap();
        drop(subscriber);
        assert!(matches!(core.deregister(), Err(Status::NotRegistered)));
    }

    #[test]
    fn reset_command_re_pushes_afh_mask() {
        let core = BtCoexCore::new();
        core.set_wlan_channels(0x0020).unwrap();
        let (afh_sink, platform) = test_platform();
        assert_eq!(core.init(Config::default(), platform), Status::Ok);

        core.on_hci_command(&[0x03, 0x0C, 0x00]);
        // Implicit power-on pushes once, HCI_Reset pushes again.
        assert_eq!(afh_sink.pushed.lock().unwrap().len(), 2);
    }

    #[test]
    fn page_timer_survives_a_real_sleep() {
        let core = BtCoexCore::new();
        let (_afh, platform) = test_platform();
        core.init(Config::default(), platform);

        let received = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = received.clone();
        core.register(move |event| received_clone.lock().unwrap().push(event)).unwrap();
        received.lock().unwrap().clear();

        // Forces a Page_Timeout of 1ms so the test doesn't wait 5.12s.
        core.on_hci_command(&[0x18, 0x0C, 0x02, 0x02, 0x00]); // HCI_Write_Page_Timeout(2 slots)
        core.on_hci_command(&[
            0x05, 0x04, 0x0D, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x18, 0xCC, 0x02, 0x00, 0x00,
            0x00, 0x01,
        ]);

        std::thread::sleep(Duration::from_millis(200));

        let events = received.lock().unwrap().clone();
        assert!(events.contains(&event::ActivityEvent::PageStarted));
        assert!(events.contains(&event::ActivityEvent::PageStopped));
    }
}
