//! Platform notifications: the out-of-band events the host reports because
//! HCI traffic analysis alone cannot observe them.

use crate::hci::common::BdAddr;

/// A platform event reported once, in the order it occurred, via
/// `on_native`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeEvent {
    DeviceSwitchedOn,
    DeviceSwitchedOff,
    A2DPStreamStart(BdAddr),
    A2DPStreamStop(BdAddr),
}
