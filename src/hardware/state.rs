//! Per-device connection/motion state machine.
//!
//! ```text
//! Disconnected ─► Connecting ─► Connected ─► Moving ⇄ Stationary
//!                     │                        │
//!                     └──► Error | Alarm | Timeout ◄┘
//! ```
//!
//! Fault states are left only through an explicit stop/reset (back to
//! `Connected`) or a disconnect. Every accepted transition is published on a
//! `tokio::sync::watch` channel so observers always see the latest state.

use crate::hardware::error::{DriverError, DriverErrorKind, DriverResult};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// State of a single sub-device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeviceState {
    /// Not connected.
    #[default]
    Disconnected,
    /// Connection in progress.
    Connecting,
    /// Connected and idle; no motion has been issued since connect/reset.
    Connected,
    /// Motion in progress.
    Moving,
    /// Last motion finished.
    Stationary,
    /// Device fault.
    Error,
    /// Motor driver alarm.
    Alarm,
    /// Device did not respond in time.
    Timeout,
}

impl DeviceState {
    /// True for `Error`, `Alarm` and `Timeout`.
    pub fn is_fault(self) -> bool {
        matches!(
            self,
            DeviceState::Error | DeviceState::Alarm | DeviceState::Timeout
        )
    }

    /// True when the device is connected and healthy.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            DeviceState::Connected | DeviceState::Moving | DeviceState::Stationary
        )
    }

    /// True when the device accepted a connection, fault states included.
    pub fn is_attached(self) -> bool {
        !matches!(self, DeviceState::Disconnected | DeviceState::Connecting)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: DeviceState) -> bool {
        use DeviceState::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Disconnected, Connecting) => true,
            (Connecting, Connected | Disconnected | Error | Alarm | Timeout) => true,
            (Connected | Stationary, Moving) => true,
            (Moving, Stationary | Connected | Error | Alarm | Timeout) => true,
            (Stationary, Connected) => true,
            (Error | Alarm | Timeout, Connected) => true,
            (_, Disconnected) => true,
            _ => false,
        }
    }

    /// Driver error matching a fault state, `None` otherwise.
    pub fn fault_error(self, device: &str) -> Option<DriverError> {
        let kind = match self {
            DeviceState::Error => DriverErrorKind::Hardware,
            DeviceState::Alarm => DriverErrorKind::Alarm,
            DeviceState::Timeout => DriverErrorKind::Timeout,
            _ => return None,
        };
        Some(DriverError::new(
            device,
            kind,
            format!("device is in {:?} state", self),
        ))
    }
}

/// Owns the current [`DeviceState`] of one device and broadcasts changes.
#[derive(Debug)]
pub struct StateTracker {
    device: String,
    tx: watch::Sender<DeviceState>,
}

impl StateTracker {
    /// New tracker starting in `Disconnected`.
    pub fn new(device: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(DeviceState::Disconnected);
        Self {
            device: device.into(),
            tx,
        }
    }

    /// Current state.
    pub fn current(&self) -> DeviceState {
        *self.tx.borrow()
    }

    /// Receiver that observes every subsequent transition.
    pub fn subscribe(&self) -> watch::Receiver<DeviceState> {
        self.tx.subscribe()
    }

    /// Apply a transition, rejecting illegal ones.
    pub fn transition(&self, next: DeviceState) -> DriverResult<DeviceState> {
        let mut rejected = None;
        self.tx.send_if_modified(|state| {
            if !state.can_transition_to(next) {
                rejected = Some(*state);
                return false;
            }
            let changed = *state != next;
            *state = next;
            changed
        });
        match rejected {
            Some(from) => Err(DriverError::new(
                &self.device,
                DriverErrorKind::InvalidParameter,
                format!("illegal state transition {:?} -> {:?}", from, next),
            )),
            None => {
                tracing::trace!(device = %self.device, state = ?next, "state transition");
                Ok(next)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_move_disconnect_is_legal() {
        let tracker = StateTracker::new("focus");
        for next in [
            DeviceState::Connecting,
            DeviceState::Connected,
            DeviceState::Moving,
            DeviceState::Stationary,
            DeviceState::Moving,
            DeviceState::Stationary,
            DeviceState::Disconnected,
        ] {
            tracker.transition(next).unwrap();
        }
        assert_eq!(tracker.current(), DeviceState::Disconnected);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let tracker = StateTracker::new("focus");
        let err = tracker.transition(DeviceState::Moving).unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::InvalidParameter);
        assert_eq!(tracker.current(), DeviceState::Disconnected);
    }

    #[test]
    fn fault_recovers_only_through_reset() {
        let tracker = StateTracker::new("nd");
        tracker.transition(DeviceState::Connecting).unwrap();
        tracker.transition(DeviceState::Connected).unwrap();
        tracker.transition(DeviceState::Moving).unwrap();
        tracker.transition(DeviceState::Alarm).unwrap();

        assert!(tracker.transition(DeviceState::Moving).is_err());
        assert!(tracker.transition(DeviceState::Stationary).is_err());
        tracker.transition(DeviceState::Connected).unwrap();
        tracker.transition(DeviceState::Moving).unwrap();
    }

    #[tokio::test]
    async fn subscribers_observe_transitions() {
        let tracker = StateTracker::new("camera");
        let mut rx = tracker.subscribe();
        tracker.transition(DeviceState::Connecting).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), DeviceState::Connecting);
    }

    #[test]
    fn faulted_device_is_attached_but_not_connected() {
        for state in [DeviceState::Error, DeviceState::Alarm, DeviceState::Timeout] {
            assert!(state.is_attached());
            assert!(!state.is_connected());
        }
        assert!(DeviceState::Stationary.is_connected());
        assert!(!DeviceState::Connecting.is_attached());
    }

    #[test]
    fn fault_error_kinds() {
        assert_eq!(
            DeviceState::Alarm.fault_error("nd").unwrap().kind,
            DriverErrorKind::Alarm
        );
        assert!(DeviceState::Moving.fault_error("nd").is_none());
    }
}
