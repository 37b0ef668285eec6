
use std::collections::VecDeque;

use crate::types::PacketResult;
use crate::units::{DataRate, DataSize, TimeDelta, Timestamp};

/// RateStatistics measures a byte rate over a sliding time window.
#[derive(Debug)]
pub struct RateStatistics {
    samples: VecDeque<(i64, i64)>,
    accumulated_bytes: i64,
    window_size: TimeDelta,
}

impl RateStatistics {
    pub fn new(window_size: TimeDelta) -> Self {
        RateStatistics {
            samples: VecDeque::new(),
            accumulated_bytes: 0,
            window_size,
        }
    }

    pub fn update(&mut self, size: DataSize, now: Timestamp) {
        self.erase_old(now);
        self.samples.push_back((now.ms(), size.bytes()));
        self.accumulated_bytes += size.bytes();
    }

    /// rate returns the measured rate over the active window, or `None`
    /// until enough samples have been collected to span one.
    pub fn rate(&mut self, now: Timestamp) -> Option<DataRate> {
        self.erase_old(now);
        let (oldest_time, _) = *self.samples.front()?;
        let active_window_ms = now.ms() - oldest_time + 1;
        if active_window_ms <= 1
            || (self.samples.len() <= 1 && active_window_ms < self.window_size.ms())
        {
            return None;
        }
        let bps = (self.accumulated_bytes as f64 * 8000.0 / active_window_ms as f64 + 0.5) as i64;
        Some(DataRate::from_bps(bps))
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.accumulated_bytes = 0;
    }

    fn erase_old(&mut self, now: Timestamp) {
        let limit = now.ms() - self.window_size.ms();
        while let Some(&(time, bytes)) = self.samples.front() {
            if time > limit {
                break;
            }
            self.accumulated_bytes -= bytes;
            self.samples.pop_front();
        }
    }
}

const ACKNOWLEDGED_RATE_WINDOW_MS: i64 = 500;

/// AcknowledgedBitrateEstimator measures the throughput actually achieved
/// over the path from packets the receiver has acknowledged.
#[derive(Debug)]
pub struct AcknowledgedBitrateEstimator {
    rate: RateStatistics,
    alr_ended_time: Option<Timestamp>,
}

impl Default for AcknowledgedBitrateEstimator {
    fn default() -> Self {
        AcknowledgedBitrateEstimator::new()
    }
}

impl AcknowledgedBitrateEstimator {
    pub fn new() -> Self {
        AcknowledgedBitrateEstimator {
            rate: RateStatistics::new(TimeDelta::from_millis(ACKNOWLEDGED_RATE_WINDOW_MS)),
            alr_ended_time: None,
        }
    }

    /// incoming_packet_feedbacks folds a batch of received packets into the
    /// throughput window.
    pub fn incoming_packet_feedbacks(&mut self, packet_feedbacks: &[PacketResult]) {
        for packet in packet_feedbacks {
            let sent = match packet.sent_packet {
                Some(sent) => sent,
                None => continue,
            };
            if !packet.receive_time.is_finite() {
                continue;
            }
            if let Some(alr_ended) = self.alr_ended_time {
                // The rate observed while application limited does not
                // reflect what the link can carry.
                if sent.send_time > alr_ended {
                    self.rate.reset();
                }
                self.alr_ended_time = None;
            }
            self.rate.update(sent.size, packet.receive_time);
        }
    }

    pub fn set_alr_ended(&mut self, at_time: Timestamp) {
        self.alr_ended_time = Some(at_time);
    }

    pub fn bitrate(&mut self, at_time: Timestamp) -> Option<DataRate> {
        self.rate.rate(at_time)
    }
}
