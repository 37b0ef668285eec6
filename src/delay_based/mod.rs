#[cfg(test)]
mod delay_based_test;
mod link_capacity;

pub(crate) use link_capacity::LinkCapacityEstimator;

use crate::config::{KeyValueConfig, TrialGroup};
use crate::grouping::PacketDelayGrouper;
use crate::trendline::{BandwidthUsage, TrendlineEstimator};
use crate::types::{TargetRateConstraints, TransportPacketsFeedback};
use crate::units::{DataRate, TimeDelta, Timestamp};

const DEFAULT_START_RATE: DataRate = DataRate::from_kbps(300);

/// Tuning knobs for the delay based controller, overridable through the
/// `WebRTC-Bwe-DelayBasedRateController` trial group.
#[derive(Debug, Clone)]
pub(crate) struct DelayBasedRateControllerConfig {
    pub(crate) no_ack_backoff_fraction: f64,
    pub(crate) no_ack_backoff_interval: TimeDelta,
    pub(crate) ack_backoff_fraction: f64,
    pub(crate) initial_increase_rate: f64,
    pub(crate) increase_rate: f64,
    pub(crate) stop_increase_after: TimeDelta,
    pub(crate) min_increase_interval: TimeDelta,
    pub(crate) linear_increase_threshold: DataRate,
    pub(crate) reference_duration_offset: TimeDelta,
}

impl DelayBasedRateControllerConfig {
    pub(crate) fn new(key_value_config: &dyn KeyValueConfig) -> Self {
        let group = TrialGroup::new(key_value_config.lookup("WebRTC-Bwe-DelayBasedRateController"));
        DelayBasedRateControllerConfig {
            no_ack_backoff_fraction: group.parameter_f64("no_ack_frac", 0.8),
            no_ack_backoff_interval: group
                .parameter_time_delta("no_ack_int", TimeDelta::from_millis(1000)),
            ack_backoff_fraction: group.parameter_f64("ack_dec", 0.90),
            initial_increase_rate: group.parameter_f64("probe_inc", 0.03),
            increase_rate: group.parameter_f64("inc", 0.01),
            stop_increase_after: group.parameter_time_delta("stop", TimeDelta::from_millis(500)),
            min_increase_interval: group.parameter_time_delta("int", TimeDelta::from_millis(100)),
            linear_increase_threshold: group.parameter_data_rate("cut", DataRate::from_kbps(300)),
            reference_duration_offset: group
                .parameter_time_delta("dur_offs", TimeDelta::from_millis(100)),
        }
    }
}

/// DelayBasedRateController turns the three-state usage signal from the
/// overuse detector into a target rate. It holds on overuse, backs off to
/// a fraction of the acknowledged throughput, and otherwise ramps up on
/// the periodic tick with an RTT dependent increase rate.
pub struct DelayBasedRateController {
    conf: DelayBasedRateControllerConfig,
    packet_grouper: PacketDelayGrouper,
    overuse_detector: TrendlineEstimator,
    link_capacity: LinkCapacityEstimator,

    min_rate: DataRate,
    max_rate: DataRate,

    acknowledged_rate: Option<DataRate>,
    last_rtt: TimeDelta,
    first_unacked_send: Timestamp,
    last_feedback_update: Timestamp,

    target_rate: DataRate,

    last_no_ack_backoff: Timestamp,
    increasing_state: bool,
    accumulated_duration: f64,
    last_increase_update: Timestamp,
    increase_reference: DataRate,
}

impl DelayBasedRateController {
    pub fn new(key_value_config: &dyn KeyValueConfig, constraints: TargetRateConstraints) -> Self {
        DelayBasedRateController::with_config(
            DelayBasedRateControllerConfig::new(key_value_config),
            constraints,
        )
    }

    pub(crate) fn with_config(
        conf: DelayBasedRateControllerConfig,
        constraints: TargetRateConstraints,
    ) -> Self {
        let mut controller = DelayBasedRateController {
            conf,
            packet_grouper: PacketDelayGrouper::new(),
            overuse_detector: TrendlineEstimator::default(),
            link_capacity: LinkCapacityEstimator::new(),
            min_rate: DataRate::zero(),
            max_rate: DataRate::plus_infinity(),
            acknowledged_rate: None,
            last_rtt: TimeDelta::from_secs(1),
            first_unacked_send: Timestamp::plus_infinity(),
            last_feedback_update: Timestamp::not_initialized(),
            target_rate: constraints.starting_rate.unwrap_or(DEFAULT_START_RATE),
            last_no_ack_backoff: Timestamp::not_initialized(),
            increasing_state: false,
            accumulated_duration: 0.0,
            last_increase_update: Timestamp::plus_infinity(),
            increase_reference: DataRate::plus_infinity(),
        };
        controller.update_constraints(constraints);
        controller
    }

    pub fn update_constraints(&mut self, msg: TargetRateConstraints) {
        if let Some(min_data_rate) = msg.min_data_rate {
            self.min_rate = min_data_rate;
        }
        if let Some(max_data_rate) = msg.max_data_rate {
            self.max_rate = max_data_rate;
        }
        if let Some(starting_rate) = msg.starting_rate {
            self.target_rate = starting_rate;
        }
        self.target_rate = self.target_rate.clamped(self.min_rate, self.max_rate);
    }

    pub fn set_acknowledged_rate(&mut self, acknowledged_rate: DataRate) {
        self.acknowledged_rate = Some(acknowledged_rate);
        if acknowledged_rate > self.link_capacity.upper_bound() {
            // The path carries more than the belief allows for, start
            // looking for a new capacity estimate.
            self.link_capacity.reset();
        }
    }

    /// set_rtt feeds the smoothed round trip time reported over RTCP.
    pub fn set_rtt(&mut self, rtt: TimeDelta) {
        self.last_rtt = rtt;
    }

    /// on_transport_packets_feedback runs the packet grouper and overuse
    /// detector over a feedback batch and applies backoff decisions. A
    /// probe result, when present, overrides the target with the probed
    /// capacity.
    pub fn on_transport_packets_feedback(
        &mut self,
        msg: &TransportPacketsFeedback,
        probe_bitrate: Option<DataRate>,
    ) {
        let packets = msg.received_with_send_info();
        if let Some(last) = packets.last() {
            self.last_rtt = msg.feedback_time - last.sent_packet.as_ref().unwrap().send_time;
        }
        self.first_unacked_send = msg.first_unacked_send_time;

        for packet in &packets {
            self.packet_grouper.add_packet_info(packet, msg.feedback_time);
        }
        for delta in self.packet_grouper.pop_deltas() {
            self.overuse_detector
                .update(delta.receive, delta.send, delta.receive_time);
        }

        let usage = self.overuse_detector.state();
        let at_time = msg.feedback_time;
        self.last_feedback_update = at_time;
        if let Some(probe_bitrate) = probe_bitrate {
            if self.acknowledged_rate.is_none() {
                self.acknowledged_rate = Some(probe_bitrate);
            }
            self.target_rate = probe_bitrate;
            self.increase_reference = self.target_rate;
            self.link_capacity.on_probe_rate(probe_bitrate);
        }

        if usage == BandwidthUsage::Normal {
            if !self.increasing_state {
                self.increasing_state = true;
                // Offset the next increase by one RTT to avoid increasing
                // too soon after overuse.
                self.last_increase_update = at_time + self.last_rtt;
                self.accumulated_duration = 0.0;
                self.increase_reference = self.target_rate;
            }
        } else if usage == BandwidthUsage::Overusing && probe_bitrate.is_none() {
            self.increasing_state = false;
            if self.acknowledged_rate.is_none() && self.no_ack_backoff_allowed(at_time) {
                // Until the first acknowledged rate arrives, back off from
                // the target rate itself, paced so the rate is not dropped
                // too fast.
                self.last_no_ack_backoff = at_time;
                self.target_rate = self.target_rate * self.conf.no_ack_backoff_fraction;
            } else if let Some(acknowledged_rate) = self.acknowledged_rate {
                if acknowledged_rate < self.link_capacity.lower_bound() {
                    self.link_capacity.reset();
                }
                self.link_capacity.on_overuse_detected(acknowledged_rate);
                self.target_rate = acknowledged_rate * self.conf.ack_backoff_fraction;
            }
            self.target_rate = self.target_rate.clamped(self.min_rate, self.max_rate);
        }
    }

    /// on_time_update advances the increase ramp on the periodic tick.
    pub fn on_time_update(&mut self, at_time: Timestamp) {
        if !self.increasing_state
            || at_time < self.last_increase_update + self.conf.min_increase_interval
        {
            return;
        }
        let time_span = at_time - self.last_increase_update;
        self.last_increase_update = at_time;

        if at_time > self.last_feedback_update + self.conf.stop_increase_after {
            return;
        }

        let rtt_lower_bound = if self.first_unacked_send.is_finite() {
            self.last_rtt.max(at_time - self.first_unacked_send)
        } else {
            self.last_rtt
        };
        let reference_span = rtt_lower_bound + self.conf.reference_duration_offset;
        self.accumulated_duration += time_span / reference_span;

        if self.link_capacity.has_estimate()
            && self.increase_reference > self.conf.linear_increase_threshold
        {
            let linear_increase_rate =
                self.conf.linear_increase_threshold * self.conf.increase_rate;
            let increase_amount = linear_increase_rate * self.accumulated_duration;
            self.target_rate = self.increase_reference + increase_amount;
        } else {
            let increase_rate = if self.link_capacity.has_estimate() {
                self.conf.increase_rate
            } else {
                self.conf.initial_increase_rate
            };
            let increase_factor = (1.0 + increase_rate).powf(self.accumulated_duration);
            self.target_rate = self.increase_reference * increase_factor;
        }
        self.target_rate = self.target_rate.clamped(self.min_rate, self.max_rate);
    }

    /// expected_bandwidth_period reports the periodicity at which the rate
    /// is expected to cycle between backoff and full ramp, used by callers
    /// for external backoff cadence.
    pub fn expected_bandwidth_period(&self) -> TimeDelta {
        let expected_overuse = 0.05;
        let bandwidth_cycle_max_min_ratio = 1.0 / self.conf.ack_backoff_fraction + expected_overuse;
        let reference_span = self.last_rtt + self.conf.reference_duration_offset;
        let period = reference_span
            * (bandwidth_cycle_max_min_ratio.ln() / (1.0 + self.conf.increase_rate).ln());
        period.clamped(TimeDelta::from_secs(1), TimeDelta::from_secs(20))
    }

    pub fn target_rate(&self) -> DataRate {
        self.target_rate
    }

    pub fn bandwidth_usage(&self) -> BandwidthUsage {
        self.overuse_detector.state()
    }

    pub(crate) fn detector_threshold(&self) -> f64 {
        self.overuse_detector.threshold()
    }

    pub(crate) fn link_capacity_estimate(&self) -> Option<DataRate> {
        self.link_capacity.estimate()
    }

    fn no_ack_backoff_allowed(&self, at_time: Timestamp) -> bool {
        !self.last_no_ack_backoff.is_finite()
            || at_time - self.last_no_ack_backoff >= self.conf.no_ack_backoff_interval
    }
}
