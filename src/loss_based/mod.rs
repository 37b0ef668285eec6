
use std::collections::VecDeque;

use crate::units::{DataRate, TimeDelta, Timestamp};

const BWE_INCREASE_INTERVAL: TimeDelta = TimeDelta::from_millis(1000);
const BWE_DECREASE_INTERVAL: TimeDelta = TimeDelta::from_millis(300);
const LIMIT_NUM_PACKETS: i64 = 20;
const AVG_PACKET_SIZE_BYTES: f64 = 1000.0;

/// The rate TCP-Friendly Rate Control would allow, per RFC 3448 section
/// 3.1. Used as a floor under loss driven decreases.
fn calc_tfrc_rate(rtt: TimeDelta, fraction_loss: u8) -> DataRate {
    if rtt.is_zero() || fraction_loss == 0 {
        return DataRate::zero();
    }
    let r = rtt.ms_f64() / 1000.0;
    let b = 1.0;
    let t_rto = 4.0 * r;
    let p = fraction_loss as f64 / 255.0;
    let s = AVG_PACKET_SIZE_BYTES;

    // Send rate in bytes/second.
    let x = s
        / (r * (2.0 * b * p / 3.0).sqrt()
            + t_rto * (3.0 * (3.0 * b * p / 8.0).sqrt() * p * (1.0 + 32.0 * p * p)));
    DataRate::from_bps((x * 8.0) as i64)
}

/// LossBasedBandwidthEstimation drives the bitrate from receiver loss
/// reports: ramp up under low loss, hold in a dead zone, and back off
/// under heavy loss with hysteresis and a TCP-friendly floor. The final
/// reported target is additionally capped by the delay based estimate and
/// any REMB from the remote side.
pub struct LossBasedBandwidthEstimation {
    accumulated_lost_packets_q8: i64,
    accumulated_expected_packets: i64,

    bitrate: DataRate,
    min_bitrate_configured: DataRate,
    max_bitrate_configured: DataRate,

    last_fraction_loss: u8,
    last_round_trip_time: TimeDelta,

    /// Receiver-side cap (REMB).
    bwe_incoming: DataRate,
    /// Delay based cap.
    delay_based_limit: DataRate,

    time_last_receiver_block: Timestamp,
    time_last_decrease: Timestamp,

    /// Sliding minimum of the bitrate over the last increase interval,
    /// kept as a monotone deque.
    min_bitrate_history: VecDeque<(Timestamp, DataRate)>,
}

impl LossBasedBandwidthEstimation {
    pub fn new() -> Self {
        LossBasedBandwidthEstimation {
            accumulated_lost_packets_q8: 0,
            accumulated_expected_packets: 0,
            bitrate: DataRate::zero(),
            min_bitrate_configured: DataRate::zero(),
            max_bitrate_configured: DataRate::plus_infinity(),
            last_fraction_loss: 0,
            last_round_trip_time: TimeDelta::zero(),
            bwe_incoming: DataRate::zero(),
            delay_based_limit: DataRate::plus_infinity(),
            time_last_receiver_block: Timestamp::not_initialized(),
            time_last_decrease: Timestamp::not_initialized(),
            min_bitrate_history: VecDeque::new(),
        }
    }

    /// set_bitrates configures the starting rate and the clamp range.
    pub fn set_bitrates(
        &mut self,
        send_bitrate: Option<DataRate>,
        min_bitrate: DataRate,
        max_bitrate: DataRate,
    ) {
        self.set_min_max_bitrate(min_bitrate, max_bitrate);
        if let Some(send_bitrate) = send_bitrate {
            self.set_send_bitrate(send_bitrate);
        }
    }

    /// set_send_bitrate forces the current bitrate, clearing the history
    /// so the new value is not capped by past minimums.
    pub fn set_send_bitrate(&mut self, bitrate: DataRate) {
        debug_assert!(bitrate > DataRate::zero());
        self.bitrate = bitrate;
        self.min_bitrate_history.clear();
    }

    pub fn set_min_max_bitrate(&mut self, min_bitrate: DataRate, max_bitrate: DataRate) {
        self.min_bitrate_configured = min_bitrate;
        self.max_bitrate_configured = if max_bitrate > DataRate::zero() {
            max_bitrate.max(min_bitrate)
        } else {
            DataRate::plus_infinity()
        };
        self.cap_bitrate_to_thresholds();
    }

    /// update_receiver_estimate records a REMB-style cap from the remote.
    pub fn update_receiver_estimate(&mut self, bandwidth: DataRate) {
        self.bwe_incoming = bandwidth;
        self.cap_bitrate_to_thresholds();
    }

    /// update_delay_based_estimate records the delay based cap.
    pub fn update_delay_based_estimate(&mut self, _at_time: Timestamp, bitrate: DataRate) {
        self.delay_based_limit = bitrate;
        self.cap_bitrate_to_thresholds();
    }

    pub fn update_rtt(&mut self, rtt: TimeDelta, _at_time: Timestamp) {
        self.last_round_trip_time = rtt;
    }

    /// update_packets_lost accumulates loss counters; once at least 20
    /// packets are covered the loss fraction is computed, the counters
    /// reset and the estimate advanced.
    pub fn update_packets_lost(&mut self, packets_lost: i64, number_of_packets: i64, at_time: Timestamp) {
        if number_of_packets <= 0 {
            return;
        }
        // Accumulate in Q8 so short reports keep their precision.
        self.accumulated_lost_packets_q8 += (packets_lost << 8).max(0);
        self.accumulated_expected_packets += number_of_packets;
        if self.accumulated_expected_packets < LIMIT_NUM_PACKETS {
            return;
        }
        let fraction =
            self.accumulated_lost_packets_q8 / self.accumulated_expected_packets;
        self.last_fraction_loss = fraction.clamp(0, 255) as u8;
        self.accumulated_lost_packets_q8 = 0;
        self.accumulated_expected_packets = 0;

        self.time_last_receiver_block = at_time;
        self.update_estimate(at_time);
    }

    /// update_estimate advances the bitrate from the current loss state.
    pub fn update_estimate(&mut self, at_time: Timestamp) {
        self.update_min_history(at_time);

        // Only adjust from loss once loss reports are flowing.
        if self.time_last_receiver_block.is_finite() {
            if self.last_fraction_loss <= 5 {
                // Loss < 2%: increase to 8% above the minimum bitrate seen
                // over the last increase interval. Remembering the minimum
                // lets the rate ramp a full interval faster than
                // compounding from the present value would.
                let min_in_window = self
                    .min_bitrate_history
                    .front()
                    .map(|&(_, bitrate)| bitrate)
                    .unwrap_or(self.bitrate);
                self.bitrate = min_in_window * 1.08 + DataRate::from_kbps(1);
            } else if self.last_fraction_loss <= 26 {
                // Loss 2% to 10%: hold.
            } else {
                // Loss > 10%: decrease, limited to once per decrease
                // interval plus RTT.
                let can_decrease = !self.time_last_decrease.is_finite()
                    || at_time - self.time_last_decrease
                        >= BWE_DECREASE_INTERVAL + self.last_round_trip_time;
                if can_decrease {
                    self.time_last_decrease = at_time;
                    let loss = self.last_fraction_loss as i64;
                    self.bitrate = self.bitrate * ((512 - loss) as f64 / 512.0);
                    // Do not drop below what TFRC would allow here.
                    self.bitrate = self
                        .bitrate
                        .max(calc_tfrc_rate(self.last_round_trip_time, self.last_fraction_loss));
                }
            }
        }
        self.cap_bitrate_to_thresholds();
    }

    pub fn fraction_loss(&self) -> u8 {
        self.last_fraction_loss
    }

    pub fn round_trip_time(&self) -> TimeDelta {
        self.last_round_trip_time
    }

    pub fn target_rate(&self) -> DataRate {
        self.bitrate
    }

    fn update_min_history(&mut self, at_time: Timestamp) {
        // Drop points older than the increase interval; one extra
        // millisecond so a value off by rounding can still raise the rate.
        while let Some(&(time, _)) = self.min_bitrate_history.front() {
            if at_time - time + TimeDelta::from_millis(1) <= BWE_INCREASE_INTERVAL {
                break;
            }
            self.min_bitrate_history.pop_front();
        }

        // Monotone deque: pop entries that can no longer be the minimum.
        while let Some(&(_, bitrate)) = self.min_bitrate_history.back() {
            if self.bitrate > bitrate {
                break;
            }
            self.min_bitrate_history.pop_back();
        }
        self.min_bitrate_history.push_back((at_time, self.bitrate));
    }

    fn cap_bitrate_to_thresholds(&mut self) {
        if self.bwe_incoming > DataRate::zero() && self.bitrate > self.bwe_incoming {
            self.bitrate = self.bwe_incoming;
        }
        if self.delay_based_limit.is_finite() && self.bitrate > self.delay_based_limit {
            self.bitrate = self.delay_based_limit;
        }
        if self.bitrate > self.max_bitrate_configured {
            self.bitrate = self.max_bitrate_configured;
        }
        if self.bitrate < self.min_bitrate_configured {
            log::warn!(
                "estimated available bandwidth {} is below configured min bitrate {}",
                self.bitrate,
                self.min_bitrate_configured
            );
            self.bitrate = self.min_bitrate_configured;
        }
    }
}

impl Default for LossBasedBandwidthEstimation {
    fn default() -> Self {
        LossBasedBandwidthEstimation::new()
    }
}
