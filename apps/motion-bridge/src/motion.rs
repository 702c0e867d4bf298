//! Motion events as produced by the detector and shared with the lobby.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_INTENSITY: f64 = 100.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MotionError {
    #[error("intensity {0} outside 0..=100")]
    IntensityOutOfRange(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionEvent {
    pub detected: bool,
    pub intensity: f64,
    /// Epoch milliseconds.
    pub timestamp: u64,
}

impl MotionEvent {
    pub fn new(detected: bool, intensity: f64, timestamp: u64) -> Result<Self, MotionError> {
        let event = Self {
            detected,
            intensity,
            timestamp,
        };
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> Result<(), MotionError> {
        if !(0.0..=MAX_INTENSITY).contains(&self.intensity) {
            return Err(MotionError::IntensityOutOfRange(self.intensity));
        }
        Ok(())
    }
}

/// Passes at most one detected event per cooldown window, optionally
/// ignoring events below an intensity threshold.
#[derive(Debug, Clone)]
pub struct MotionCooldown {
    cooldown_ms: u64,
    min_intensity: f64,
    last_fired: Option<u64>,
}

impl MotionCooldown {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown_ms: cooldown.as_millis() as u64,
            min_intensity: 0.0,
            last_fired: None,
        }
    }

    pub fn with_min_intensity(mut self, min_intensity: f64) -> Self {
        self.min_intensity = min_intensity;
        self
    }

    pub fn admit(&mut self, event: &MotionEvent) -> bool {
        if !event.detected || event.intensity < self.min_intensity {
            return false;
        }
        if let Some(last) = self.last_fired {
            if event.timestamp.saturating_sub(last) < self.cooldown_ms {
                return false;
            }
        }
        self.last_fired = Some(event.timestamp);
        true
    }

    pub fn reset(&mut self) {
        self.last_fired = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intensity_bounds() {
        assert!(MotionEvent::new(true, 0.0, 1).is_ok());
        assert!(MotionEvent::new(true, 100.0, 1).is_ok());
        assert_eq!(
            MotionEvent::new(true, 100.5, 1),
            Err(MotionError::IntensityOutOfRange(100.5))
        );
        assert!(MotionEvent::new(true, f64::NAN, 1).is_err());
    }

    #[test]
    fn wire_shape() {
        let event: MotionEvent =
            serde_json::from_str(r#"{"detected":true,"intensity":42.5,"timestamp":1700000000123}"#)
                .expect("parse");
        assert_eq!(event.timestamp, 1_700_000_000_123);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn cooldown_gates_bursts() {
        let mut gate = MotionCooldown::new(Duration::from_millis(500)).with_min_intensity(10.0);
        let at = |timestamp, intensity| MotionEvent {
            detected: true,
            intensity,
            timestamp,
        };
        assert!(gate.admit(&at(1_000, 50.0)));
        assert!(!gate.admit(&at(1_200, 80.0)));
        assert!(!gate.admit(&at(1_600, 5.0)));
        assert!(gate.admit(&at(1_500, 50.0)));
        assert!(!gate.admit(&MotionEvent {
            detected: false,
            intensity: 90.0,
            timestamp: 9_000,
        }));
        gate.reset();
        assert!(gate.admit(&at(1_501, 50.0)));
    }
}
