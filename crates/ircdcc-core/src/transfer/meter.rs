//! Speed and ETA estimation.
//!
//! The meter keeps a short rolling log of `(elapsed ms, position)` samples.
//! Current speed is measured across that window; average speed across the
//! whole transfer. Every figure can also be a sentinel, see [`Estimate`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::TransferStatus;

/// Samples older than this (relative to the newest) are discarded.
pub const SAMPLE_WINDOW: Duration = Duration::from_secs(5);

/// A measured value or the reason there is none.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Estimate<T> {
    /// A real measurement
    Value(T),
    /// Not enough samples yet
    Calculating,
    /// The transfer is not moving data
    NotInTransfer,
    /// Zero or unmeasurable speed
    Infinite,
}

impl<T: Copy> Estimate<T> {
    /// The measurement, if there is one.
    #[must_use]
    pub const fn value(&self) -> Option<T> {
        match self {
            Self::Value(v) => Some(*v),
            _ => None,
        }
    }
}

/// Rolling speed/ETA estimator for one transfer.
#[derive(Debug, Clone)]
pub struct TransferMeter {
    started: Option<Instant>,
    start_position: u64,
    samples: VecDeque<(u64, u64)>,
    average_speed: Estimate<f64>,
    current_speed: Estimate<f64>,
    time_left: Estimate<Duration>,
}

impl Default for TransferMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferMeter {
    /// A meter for a transfer that has not started moving data.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            started: None,
            start_position: 0,
            samples: VecDeque::new(),
            average_speed: Estimate::NotInTransfer,
            current_speed: Estimate::NotInTransfer,
            time_left: Estimate::NotInTransfer,
        }
    }

    /// Starts measuring from `position`.
    pub fn start(&mut self, now: Instant, position: u64) {
        self.started = Some(now);
        self.start_position = position;
        self.samples.clear();
        self.average_speed = Estimate::Calculating;
        self.current_speed = Estimate::Calculating;
        self.time_left = Estimate::Calculating;
    }

    /// Records a sample and recomputes the estimates.
    pub fn sample(&mut self, now: Instant, position: u64, size: u64) {
        let Some(started) = self.started else {
            return;
        };
        let elapsed = now.saturating_duration_since(started);
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.samples.push_back((elapsed_ms, position));

        let window_ms = u64::try_from(SAMPLE_WINDOW.as_millis()).unwrap_or(u64::MAX);
        while let Some(&(oldest, _)) = self.samples.front() {
            if oldest.saturating_add(window_ms) < elapsed_ms {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        if self.samples.len() < 2 || elapsed.as_secs() == 0 {
            self.average_speed = Estimate::Calculating;
            self.current_speed = Estimate::Calculating;
        } else {
            let moved = position.saturating_sub(self.start_position);
            self.average_speed = Estimate::Value(moved as f64 / elapsed.as_secs_f64());

            let (first_ms, first_pos) = self.samples[0];
            let (last_ms, last_pos) = self.samples[self.samples.len() - 1];
            self.current_speed = if last_ms == first_ms {
                Estimate::Calculating
            } else {
                let bytes = last_pos.saturating_sub(first_pos) as f64;
                Estimate::Value(bytes / (last_ms - first_ms) as f64 * 1000.0)
            };
        }

        self.time_left = if size > 0 && position >= size {
            Estimate::Value(Duration::ZERO)
        } else {
            match self.current_speed {
                Estimate::Value(speed) if speed > 0.0 => Estimate::Value(Duration::from_secs_f64(
                    size.saturating_sub(position) as f64 / speed,
                )),
                Estimate::Calculating => Estimate::Calculating,
                _ => Estimate::Infinite,
            }
        };
    }

    /// Freezes the estimates for a transfer that stopped at `position`.
    pub fn finish(&mut self, now: Instant, position: u64, status: TransferStatus) {
        self.samples.clear();
        let Some(started) = self.started else {
            self.average_speed = Estimate::NotInTransfer;
            self.current_speed = Estimate::NotInTransfer;
            self.time_left = Estimate::NotInTransfer;
            return;
        };

        let elapsed = now.saturating_duration_since(started);
        self.average_speed = if elapsed <= Duration::from_secs(1) {
            Estimate::Infinite
        } else {
            let moved = position.saturating_sub(self.start_position);
            Estimate::Value(moved as f64 / elapsed.as_secs_f64())
        };
        self.current_speed = Estimate::Value(0.0);
        self.time_left = if status == TransferStatus::Done {
            Estimate::Value(Duration::ZERO)
        } else {
            Estimate::NotInTransfer
        };
    }

    /// Average speed in bytes per second.
    #[must_use]
    pub const fn average_speed(&self) -> Estimate<f64> {
        self.average_speed
    }

    /// Speed over the last few seconds, in bytes per second.
    #[must_use]
    pub const fn current_speed(&self) -> Estimate<f64> {
        self.current_speed
    }

    /// Estimated time to completion.
    #[must_use]
    pub const fn time_left(&self) -> Estimate<Duration> {
        self.time_left
    }

    /// Number of samples in the window.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}
