
use std::collections::VecDeque;

use crate::units::{TimeDelta, Timestamp};

const DEFAULT_TRENDLINE_WINDOW_SIZE: usize = 20;
const DEFAULT_TRENDLINE_SMOOTHING_COEFF: f64 = 0.9;
const DEFAULT_TRENDLINE_THRESHOLD_GAIN: f64 = 4.0;

const K_ABOVE_THRESHOLD: f64 = 0.039;
const K_BELOW_THRESHOLD: f64 = 0.0087;
const MAX_ADAPT_OFFSET_MS: f64 = 15.0;
const MAX_TIME_DELTA_MS: i64 = 100;
const OVER_USING_TIME_THRESHOLD_MS: f64 = 10.0;
const THRESHOLD_CLAMP_MIN: f64 = 6.0;
const THRESHOLD_CLAMP_MAX: f64 = 600.0;

/// Three-valued congestion signal derived from the delay trend.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthUsage {
    #[default]
    Normal,
    Underusing,
    Overusing,
}

#[derive(Debug, Clone)]
struct PacketTiming {
    arrival_time_ms: f64,
    smoothed_delay_ms: f64,
    #[allow(dead_code)]
    accumulated_delay_ms: f64,
}

/// TrendlineEstimator fits a line to the smoothed accumulated one-way
/// delay as a function of arrival time. A positive slope means queues are
/// filling up; the slope, scaled by the window size and a fixed gain, is
/// compared against an adaptive threshold to produce the usage signal.
#[derive(Debug)]
pub struct TrendlineEstimator {
    window_size: usize,
    smoothing_coef: f64,
    threshold_gain: f64,
    num_of_deltas: usize,
    first_arrival_time: Timestamp,
    accumulated_delay: f64,
    smoothed_delay: f64,
    delay_hist: VecDeque<PacketTiming>,
    threshold: f64,
    prev_trend: f64,
    last_update: Timestamp,
    time_over_using: Option<f64>,
    overuse_counter: usize,
    hypothesis: BandwidthUsage,
}

impl Default for TrendlineEstimator {
    fn default() -> Self {
        TrendlineEstimator::new(
            DEFAULT_TRENDLINE_WINDOW_SIZE,
            DEFAULT_TRENDLINE_SMOOTHING_COEFF,
            DEFAULT_TRENDLINE_THRESHOLD_GAIN,
        )
    }
}

impl TrendlineEstimator {
    pub fn new(window_size: usize, smoothing_coef: f64, threshold_gain: f64) -> Self {
        TrendlineEstimator {
            window_size,
            smoothing_coef,
            threshold_gain,
            num_of_deltas: 0,
            first_arrival_time: Timestamp::not_initialized(),
            accumulated_delay: 0.0,
            smoothed_delay: 0.0,
            delay_hist: VecDeque::with_capacity(window_size + 1),
            threshold: 12.5,
            prev_trend: 0.0,
            last_update: Timestamp::not_initialized(),
            time_over_using: None,
            overuse_counter: 0,
            hypothesis: BandwidthUsage::Normal,
        }
    }

    /// update feeds one inter-group delta into the estimator. The deltas
    /// are those produced by the packet grouper.
    pub fn update(&mut self, recv_delta: TimeDelta, send_delta: TimeDelta, arrival_time: Timestamp) {
        let delta_ms = recv_delta.ms_f64() - send_delta.ms_f64();
        self.num_of_deltas += 1;
        if !self.first_arrival_time.is_finite() {
            self.first_arrival_time = arrival_time;
        }

        self.accumulated_delay += delta_ms;
        self.smoothed_delay = self.smoothing_coef * self.smoothed_delay
            + (1.0 - self.smoothing_coef) * self.accumulated_delay;

        self.delay_hist.push_back(PacketTiming {
            arrival_time_ms: (arrival_time - self.first_arrival_time).ms_f64(),
            smoothed_delay_ms: self.smoothed_delay,
            accumulated_delay_ms: self.accumulated_delay,
        });
        if self.delay_hist.len() > self.window_size {
            self.delay_hist.pop_front();
        }

        let trend = if self.delay_hist.len() == self.window_size {
            // A trend between 0 and 1 means the delay is increasing and
            // queues are filling up, 0 that the delay is unchanged, below
            // 0 that queues are being emptied.
            linear_fit_slope(&self.delay_hist).unwrap_or(self.prev_trend)
        } else {
            self.prev_trend
        };

        self.detect(trend, send_delta.ms_f64(), arrival_time);
    }

    pub fn state(&self) -> BandwidthUsage {
        self.hypothesis
    }

    /// threshold exposes the current adaptive threshold for inspection.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn detect(&mut self, trend: f64, ts_delta_ms: f64, now: Timestamp) {
        if self.num_of_deltas < 2 {
            self.hypothesis = BandwidthUsage::Normal;
            return;
        }
        let modified_trend =
            self.delay_hist.len() as f64 * trend * self.threshold_gain;

        if modified_trend > self.threshold {
            match self.time_over_using {
                None => {
                    // Assume overuse started halfway between the samples.
                    self.time_over_using = Some(ts_delta_ms / 2.0);
                }
                Some(ref mut time) => {
                    *time += ts_delta_ms;
                }
            }
            self.overuse_counter += 1;
            if self.time_over_using.unwrap_or(0.0) > OVER_USING_TIME_THRESHOLD_MS
                && self.overuse_counter > 1
            {
                self.time_over_using = Some(0.0);
                self.overuse_counter = 0;
                self.hypothesis = BandwidthUsage::Overusing;
            }
        } else if modified_trend < -self.threshold {
            self.time_over_using = None;
            self.overuse_counter = 0;
            self.hypothesis = BandwidthUsage::Underusing;
        } else {
            self.time_over_using = None;
            self.overuse_counter = 0;
            self.hypothesis = BandwidthUsage::Normal;
        }
        self.prev_trend = trend;
        self.update_threshold(modified_trend, now);
    }

    fn update_threshold(&mut self, modified_trend: f64, now: Timestamp) {
        if !self.last_update.is_finite() {
            self.last_update = now;
        }
        if modified_trend.abs() > self.threshold + MAX_ADAPT_OFFSET_MS {
            // Do not adapt the threshold to big latency spikes such as a
            // sudden capacity drop.
            self.last_update = now;
            return;
        }
        let k = if modified_trend.abs() > self.threshold {
            K_ABOVE_THRESHOLD
        } else {
            K_BELOW_THRESHOLD
        };
        let time_delta_ms = (now - self.last_update).ms().min(MAX_TIME_DELTA_MS);
        self.threshold += k * (modified_trend.abs() - self.threshold) * time_delta_ms as f64;
        self.threshold = self.threshold.clamp(THRESHOLD_CLAMP_MIN, THRESHOLD_CLAMP_MAX);
        self.last_update = now;
    }
}

/// Least squares slope of smoothed delay over arrival time,
/// k = sum (x_i-x_avg)(y_i-y_avg) / sum (x_i-x_avg)^2.
fn linear_fit_slope(timings: &VecDeque<PacketTiming>) -> Option<f64> {
    debug_assert!(timings.len() >= 2);
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    for timing in timings {
        sum_x += timing.arrival_time_ms;
        sum_y += timing.smoothed_delay_ms;
    }
    let x_avg = sum_x / timings.len() as f64;
    let y_avg = sum_y / timings.len() as f64;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for timing in timings {
        let x = timing.arrival_time_ms;
        let y = timing.smoothed_delay_ms;
        numerator += (x - x_avg) * (y - y_avg);
        denominator += (x - x_avg) * (x - x_avg);
    }
    if denominator == 0.0 {
        None
    } else {
        Some(numerator / denominator)
    }
}
