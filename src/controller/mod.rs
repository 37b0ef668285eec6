
use std::collections::VecDeque;
use std::sync::Arc;

use rtcp::transport_feedbacks::transport_layer_cc::TransportLayerCc;

use crate::alr::{AlrDetector, AlrExperimentSettings};
use crate::config::{KeyValueConfig, TrialGroup};
use crate::delay_based::{DelayBasedRateController, DelayBasedRateControllerConfig};
use crate::feedback::{SentPacketInfo, TransportFeedbackAdapter};
use crate::loss_based::LossBasedBandwidthEstimation;
use crate::probe::{ProbeBitrateEstimator, ProbeController};
use crate::rate::AcknowledgedBitrateEstimator;
use crate::trendline::BandwidthUsage;
use crate::types::{
    CongestionWindow, NetworkAvailability, NetworkEstimate, NetworkRouteChange, PacerConfig,
    ProbeClusterConfig, ProcessInterval, RemoteBitrateReport, RoundTripTimeUpdate, SentPacket,
    StreamsConfig, TargetRateConstraints, TargetTransferRate, TransportLossReport,
    TransportPacketsFeedback, NO_PROBE_CLUSTER_ID,
};
use crate::units::{DataRate, DataSize, TimeDelta, Timestamp};

/// Pacing rate relative to the target rate. A higher factor drains
/// encoder overshoots faster at the cost of more aggressive bursts.
const DEFAULT_PACE_MULTIPLIER: f64 = 2.5;
/// Lowest bitrate the controller will be configured with.
const MIN_CONFIGURABLE_BITRATE: DataRate = DataRate::from_bps(10_000);
const DEFAULT_ACCEPTED_QUEUE: TimeDelta = TimeDelta::from_millis(250);
const MIN_CONGESTION_WINDOW: DataSize = DataSize::from_bytes(2 * 1500);
const FEEDBACK_RTT_WINDOW: usize = 32;

const CWND_EXPERIMENT: &str = "WebRTC-CwndExperiment";

/// NetworkControllerObserver receives the configuration messages the
/// controller produces. Implementations must not block and must not call
/// back into the controller.
pub trait NetworkControllerObserver {
    /// on_congestion_window is called when the congestion window
    /// configuration is changed.
    fn on_congestion_window(&mut self, window: CongestionWindow);
    /// on_pacer_config is called when the pacer configuration is changed.
    fn on_pacer_config(&mut self, config: PacerConfig);
    /// on_probe_cluster_config is called to request a new probe cluster.
    fn on_probe_cluster_config(&mut self, config: ProbeClusterConfig);
    /// on_target_transfer_rate is called with the current target rate and
    /// the network estimate it is based on.
    fn on_target_transfer_rate(&mut self, target: TargetTransferRate);
}

/// Point-in-time snapshot of the controller internals, pulled on demand
/// by debugging tools.
#[derive(Debug, Clone, Copy)]
pub struct DebugState {
    pub target_rate: DataRate,
    pub delay_based_target: DataRate,
    pub loss_based_target: DataRate,
    pub bandwidth_usage: BandwidthUsage,
    pub detector_threshold: f64,
    pub link_capacity: Option<DataRate>,
    pub fraction_loss: u8,
    pub round_trip_time: TimeDelta,
    pub in_alr: bool,
}

/// NetworkController combines the delay based controller, the loss based
/// estimation and the probing machinery into one send-side congestion
/// controller. The emitted target is the lower of the delay and loss
/// based estimates, clamped to the configured range; pacer and probe
/// configuration messages are pushed to the observer as they change.
///
/// All methods are expected to be called from one task. The transport
/// feedback adapter handle is the only part that may be shared with
/// other contexts.
pub struct NetworkController {
    observer: Box<dyn NetworkControllerObserver + Send>,

    transport_feedback_adapter: Arc<TransportFeedbackAdapter>,
    probe_controller: ProbeController,
    bandwidth_estimation: LossBasedBandwidthEstimation,
    alr_detector: AlrDetector,
    delay_based_controller: DelayBasedRateController,
    acknowledged_bitrate_estimator: AcknowledgedBitrateEstimator,
    probe_bitrate_estimator: ProbeBitrateEstimator,

    delay_controller_config: DelayBasedRateControllerConfig,

    pacing_factor: f64,
    min_pacing_rate: DataRate,
    max_padding_rate: DataRate,

    in_cwnd_experiment: bool,
    accepted_queue: TimeDelta,

    feedback_rtts: VecDeque<TimeDelta>,
    min_feedback_rtt: Option<TimeDelta>,
    previously_in_alr: bool,

    last_estimate: Option<NetworkEstimate>,
    last_target_rate: DataRate,
    last_fraction_loss: u8,
    last_round_trip_time: TimeDelta,
}

impl NetworkController {
    pub fn new(
        key_value_config: &dyn KeyValueConfig,
        observer: Box<dyn NetworkControllerObserver + Send>,
        constraints: TargetRateConstraints,
    ) -> Self {
        let constraints = clamp_constraints(constraints);
        let alr_experiment = AlrExperimentSettings::parse_from_trial(key_value_config);
        let (in_cwnd_experiment, accepted_queue) = read_cwnd_experiment(key_value_config);
        if TrialGroup::new(key_value_config.lookup("WebRTC-Bwe-OverusePredictor")).has_flag("Enabled")
        {
            log::info!("overuse predictor has no network estimate source here, ignoring");
        }

        let mut bandwidth_estimation = LossBasedBandwidthEstimation::new();
        bandwidth_estimation.set_bitrates(
            constraints.starting_rate,
            constraints.min_data_rate.unwrap_or(MIN_CONFIGURABLE_BITRATE),
            constraints.max_data_rate.unwrap_or(DataRate::plus_infinity()),
        );
        let delay_controller_config = DelayBasedRateControllerConfig::new(key_value_config);

        let mut controller = NetworkController {
            observer,
            transport_feedback_adapter: Arc::new(TransportFeedbackAdapter::new()),
            probe_controller: ProbeController::new(),
            bandwidth_estimation,
            alr_detector: AlrDetector::new(key_value_config),
            delay_based_controller: DelayBasedRateController::with_config(
                delay_controller_config.clone(),
                constraints,
            ),
            acknowledged_bitrate_estimator: AcknowledgedBitrateEstimator::new(),
            probe_bitrate_estimator: ProbeBitrateEstimator::new(),
            delay_controller_config,
            pacing_factor: alr_experiment
                .map(|settings| settings.pacing_factor)
                .unwrap_or(DEFAULT_PACE_MULTIPLIER),
            min_pacing_rate: DataRate::zero(),
            max_padding_rate: DataRate::zero(),
            in_cwnd_experiment,
            accepted_queue,
            feedback_rtts: VecDeque::new(),
            min_feedback_rtt: None,
            previously_in_alr: false,
            last_estimate: None,
            last_target_rate: DataRate::zero(),
            last_fraction_loss: 0,
            last_round_trip_time: TimeDelta::zero(),
        };

        let probes = controller.probe_controller.set_bitrates(
            constraints.min_data_rate.unwrap_or(MIN_CONFIGURABLE_BITRATE),
            constraints.starting_rate.unwrap_or(DataRate::zero()),
            constraints.max_data_rate.unwrap_or(DataRate::plus_infinity()),
            constraints.at_time,
        );
        controller.emit_probes(probes);
        controller.maybe_trigger_on_network_changed(constraints.at_time);
        controller
    }

    /// process_interval is the periodicity at which on_process_interval
    /// is expected to be driven.
    pub const fn process_interval() -> TimeDelta {
        TimeDelta::from_millis(25)
    }

    /// transport_feedback_adapter exposes the send history, e.g. so a
    /// pacer can query outstanding data from its own task.
    pub fn transport_feedback_adapter(&self) -> Arc<TransportFeedbackAdapter> {
        Arc::clone(&self.transport_feedback_adapter)
    }

    /// process_sent_packet records the confirmed egress of a packet and
    /// feeds the resulting summary into the controller.
    pub fn process_sent_packet(&mut self, sent_packet: &SentPacketInfo) {
        if let Some(sent) = self.transport_feedback_adapter.process_sent_packet(sent_packet) {
            self.on_sent_packet(sent);
        }
    }

    /// process_transport_feedback matches a parsed transport-wide
    /// feedback block against the send history and runs the estimators
    /// over the result.
    pub fn process_transport_feedback(
        &mut self,
        feedback: &TransportLayerCc,
        feedback_time: Timestamp,
    ) {
        let report = self
            .transport_feedback_adapter
            .process_transport_feedback(feedback, feedback_time);
        if let Some(report) = report {
            self.on_transport_packets_feedback(report);
        }
    }

    pub fn on_network_availability(&mut self, msg: NetworkAvailability) {
        let probes = self
            .probe_controller
            .on_network_availability(msg.network_available, msg.at_time);
        self.emit_probes(probes);
    }

    /// on_network_route_change resets the estimators for a fresh path and
    /// emits the initial state for it. Repeating a route change with equal
    /// constraints emits the same state again.
    pub fn on_network_route_change(&mut self, msg: NetworkRouteChange) {
        let constraints = clamp_constraints(msg.constraints);

        self.bandwidth_estimation = LossBasedBandwidthEstimation::new();
        self.bandwidth_estimation.set_bitrates(
            constraints.starting_rate,
            constraints.min_data_rate.unwrap_or(MIN_CONFIGURABLE_BITRATE),
            constraints.max_data_rate.unwrap_or(DataRate::plus_infinity()),
        );
        self.delay_based_controller =
            DelayBasedRateController::with_config(self.delay_controller_config.clone(), constraints);
        self.acknowledged_bitrate_estimator = AcknowledgedBitrateEstimator::new();
        self.probe_bitrate_estimator = ProbeBitrateEstimator::new();
        self.min_feedback_rtt = None;
        self.feedback_rtts.clear();

        self.probe_controller.reset(msg.at_time);
        let probes = self.probe_controller.set_bitrates(
            constraints.min_data_rate.unwrap_or(MIN_CONFIGURABLE_BITRATE),
            constraints.starting_rate.unwrap_or(DataRate::zero()),
            constraints.max_data_rate.unwrap_or(DataRate::plus_infinity()),
            msg.at_time,
        );
        self.emit_probes(probes);

        self.maybe_trigger_on_network_changed(msg.at_time);
    }

    /// on_process_interval advances the periodic work: the loss based
    /// window, probe timeouts, ALR probing and the delay based ramp.
    pub fn on_process_interval(&mut self, msg: ProcessInterval) {
        self.bandwidth_estimation.update_estimate(msg.at_time);
        let alr_start = self.alr_detector.application_limited_region_start_time();
        self.probe_controller.set_alr_start_time(alr_start);
        let probes = self.probe_controller.process(msg.at_time);
        self.emit_probes(probes);
        self.delay_based_controller.on_time_update(msg.at_time);
        self.maybe_trigger_on_network_changed(msg.at_time);
    }

    pub fn on_remote_bitrate_report(&mut self, msg: RemoteBitrateReport) {
        self.bandwidth_estimation.update_receiver_estimate(msg.bandwidth);
    }

    pub fn on_round_trip_time_update(&mut self, msg: RoundTripTimeUpdate) {
        if msg.smoothed {
            self.delay_based_controller.set_rtt(msg.round_trip_time);
        } else {
            self.bandwidth_estimation
                .update_rtt(msg.round_trip_time, msg.receive_time);
        }
    }

    pub fn on_sent_packet(&mut self, sent_packet: SentPacket) {
        self.alr_detector
            .on_bytes_sent(sent_packet.size, sent_packet.send_time);
    }

    pub fn on_streams_config(&mut self, msg: StreamsConfig) {
        self.probe_controller
            .enable_periodic_alr_probing(msg.requests_alr_probing);

        let mut pacing_changed = false;
        if let Some(pacing_factor) = msg.pacing_factor {
            if pacing_factor != self.pacing_factor {
                self.pacing_factor = pacing_factor;
                pacing_changed = true;
            }
        }
        if let Some(min_pacing_rate) = msg.min_pacing_rate {
            if min_pacing_rate != self.min_pacing_rate {
                self.min_pacing_rate = min_pacing_rate;
                pacing_changed = true;
            }
        }
        if let Some(max_padding_rate) = msg.max_padding_rate {
            if max_padding_rate != self.max_padding_rate {
                self.max_padding_rate = max_padding_rate;
                pacing_changed = true;
            }
        }
        if pacing_changed {
            self.update_pacing_rates(msg.at_time);
        }
    }

    pub fn on_target_rate_constraints(&mut self, msg: TargetRateConstraints) {
        let constraints = clamp_constraints(msg);

        let probes = self.probe_controller.set_bitrates(
            constraints.min_data_rate.unwrap_or(MIN_CONFIGURABLE_BITRATE),
            constraints.starting_rate.unwrap_or(DataRate::zero()),
            constraints.max_data_rate.unwrap_or(DataRate::plus_infinity()),
            constraints.at_time,
        );
        self.emit_probes(probes);

        self.bandwidth_estimation.set_bitrates(
            constraints.starting_rate,
            constraints.min_data_rate.unwrap_or(MIN_CONFIGURABLE_BITRATE),
            constraints.max_data_rate.unwrap_or(DataRate::plus_infinity()),
        );
        self.delay_based_controller.update_constraints(constraints);

        self.maybe_trigger_on_network_changed(constraints.at_time);
    }

    pub fn on_transport_loss_report(&mut self, msg: TransportLossReport) {
        let total_packets_delta = msg.packets_received_delta + msg.packets_lost_delta;
        self.bandwidth_estimation.update_packets_lost(
            msg.packets_lost_delta as i64,
            total_packets_delta as i64,
            msg.receive_time,
        );
    }

    /// on_transport_packets_feedback is the hot path: one call per
    /// feedback batch from the remote.
    pub fn on_transport_packets_feedback(&mut self, report: TransportPacketsFeedback) {
        let mut feedback_rtt: Option<TimeDelta> = None;
        for feedback in report.packets_with_feedback() {
            if let Some(sent) = &feedback.sent_packet {
                if feedback.receive_time.is_finite() {
                    // max() accounts for feedback delayed by the receiver.
                    let rtt = report.feedback_time - sent.send_time;
                    feedback_rtt = Some(feedback_rtt.map_or(rtt, |prev| prev.max(rtt)));
                }
            }
        }
        if let Some(feedback_rtt) = feedback_rtt {
            self.feedback_rtts.push_back(feedback_rtt);
            if self.feedback_rtts.len() > FEEDBACK_RTT_WINDOW {
                self.feedback_rtts.pop_front();
            }
            self.min_feedback_rtt = self.feedback_rtts.iter().min().copied();
        }

        let alr_start_time = self.alr_detector.application_limited_region_start_time();
        if self.previously_in_alr && alr_start_time.is_none() {
            self.acknowledged_bitrate_estimator
                .set_alr_ended(report.feedback_time);
            self.probe_controller
                .set_alr_ended_time(report.feedback_time);
        }
        self.previously_in_alr = alr_start_time.is_some();

        let received = report.received_with_send_info();
        self.acknowledged_bitrate_estimator
            .incoming_packet_feedbacks(&received);
        if let Some(acknowledged) = self
            .acknowledged_bitrate_estimator
            .bitrate(report.feedback_time)
        {
            self.delay_based_controller
                .set_acknowledged_rate(acknowledged);
        }

        let mut probe_bitrate = None;
        for packet in &received {
            let pacing_info = packet.sent_packet.as_ref().unwrap().pacing_info;
            if pacing_info.probe_cluster_id != NO_PROBE_CLUSTER_ID {
                if let Some(estimate) = self
                    .probe_bitrate_estimator
                    .handle_probe_and_estimate_bitrate(packet)
                {
                    probe_bitrate = Some(estimate);
                }
            }
        }

        let prev_usage = self.delay_based_controller.bandwidth_usage();
        let prev_target = self.delay_based_controller.target_rate();
        self.delay_based_controller
            .on_transport_packets_feedback(&report, probe_bitrate);
        let target = self.delay_based_controller.target_rate();

        if probe_bitrate.is_some() {
            // The probe result replaces the loss based state; the delay
            // based cap has to be re-applied afterwards.
            self.bandwidth_estimation.set_send_bitrate(target);
        }
        if target != prev_target || probe_bitrate.is_some() {
            self.bandwidth_estimation
                .update_delay_based_estimate(report.feedback_time, target);
            self.maybe_trigger_on_network_changed(report.feedback_time);
        }

        let recovered_from_overuse = prev_usage == BandwidthUsage::Overusing
            && self.delay_based_controller.bandwidth_usage() == BandwidthUsage::Normal;
        if recovered_from_overuse {
            self.probe_controller.set_alr_start_time(alr_start_time);
            let probes = self.probe_controller.request_probe(report.feedback_time);
            self.emit_probes(probes);
        }

        self.maybe_update_congestion_window();
    }

    /// debug_state publishes a snapshot of the controller internals.
    pub fn debug_state(&self) -> DebugState {
        DebugState {
            target_rate: self.bandwidth_estimation.target_rate(),
            delay_based_target: self.delay_based_controller.target_rate(),
            loss_based_target: self.bandwidth_estimation.target_rate(),
            bandwidth_usage: self.delay_based_controller.bandwidth_usage(),
            detector_threshold: self.delay_based_controller.detector_threshold(),
            link_capacity: self.delay_based_controller.link_capacity_estimate(),
            fraction_loss: self.bandwidth_estimation.fraction_loss(),
            round_trip_time: self.bandwidth_estimation.round_trip_time(),
            in_alr: self
                .alr_detector
                .application_limited_region_start_time()
                .is_some(),
        }
    }

    fn maybe_trigger_on_network_changed(&mut self, at_time: Timestamp) {
        let estimated_bitrate = self.bandwidth_estimation.target_rate();
        let fraction_loss = self.bandwidth_estimation.fraction_loss();
        let round_trip_time = self.bandwidth_estimation.round_trip_time();

        if estimated_bitrate == self.last_target_rate
            && fraction_loss == self.last_fraction_loss
            && round_trip_time == self.last_round_trip_time
        {
            return;
        }
        self.last_target_rate = estimated_bitrate;
        self.last_fraction_loss = fraction_loss;
        self.last_round_trip_time = round_trip_time;

        let estimate = NetworkEstimate {
            at_time,
            bandwidth: estimated_bitrate,
            round_trip_time,
            bwe_period: self.delay_based_controller.expected_bandwidth_period(),
            loss_rate_ratio: fraction_loss as f32 / 255.0,
        };
        self.last_estimate = Some(estimate);

        self.update_pacing_rates(at_time);
        self.alr_detector.set_estimated_bitrate(estimated_bitrate);
        let probes = self
            .probe_controller
            .set_estimated_bitrate(estimated_bitrate, at_time);
        self.emit_probes(probes);

        self.observer.on_target_transfer_rate(TargetTransferRate {
            at_time,
            target_rate: estimated_bitrate,
            network_estimate: estimate,
        });
    }

    fn update_pacing_rates(&mut self, at_time: Timestamp) {
        let estimate = match &self.last_estimate {
            Some(estimate) => *estimate,
            None => return,
        };
        let pacing_rate = self.min_pacing_rate.max(estimate.bandwidth) * self.pacing_factor;
        let padding_rate = self.max_padding_rate.min(estimate.bandwidth);
        let time_window = TimeDelta::from_secs(1);
        self.observer.on_pacer_config(PacerConfig {
            at_time,
            time_window,
            data_window: pacing_rate * time_window,
            pad_window: padding_rate * time_window,
        });
    }

    fn maybe_update_congestion_window(&mut self) {
        if !self.in_cwnd_experiment {
            return;
        }
        // Without a feedback RTT there is no meaningful way to bound the
        // outstanding data.
        let min_feedback_rtt = match self.min_feedback_rtt {
            Some(rtt) => rtt,
            None => return,
        };
        let estimate = match &self.last_estimate {
            Some(estimate) => *estimate,
            None => return,
        };
        let time_window = min_feedback_rtt + self.accepted_queue;
        let data_window = (estimate.bandwidth * time_window).max(MIN_CONGESTION_WINDOW);
        self.observer.on_congestion_window(CongestionWindow {
            enabled: true,
            data_window,
        });
    }

    fn emit_probes(&mut self, probes: Vec<ProbeClusterConfig>) {
        for probe in probes {
            self.observer.on_probe_cluster_config(probe);
        }
    }
}

/// Makes sure the bitrate and the min and max values are in valid range.
fn clamp_constraints(msg: TargetRateConstraints) -> TargetRateConstraints {
    let min_data_rate = msg
        .min_data_rate
        .unwrap_or(DataRate::zero())
        .max(MIN_CONFIGURABLE_BITRATE);
    let max_data_rate = msg.max_data_rate.map(|max_data_rate| {
        if max_data_rate < min_data_rate {
            log::warn!(
                "max bitrate {} is below min bitrate {}, raising",
                max_data_rate,
                min_data_rate
            );
            min_data_rate
        } else {
            max_data_rate
        }
    });
    let starting_rate = msg.starting_rate.map(|start| start.max(min_data_rate));
    TargetRateConstraints {
        at_time: msg.at_time,
        starting_rate,
        min_data_rate: Some(min_data_rate),
        max_data_rate,
    }
}

/// The congestion window experiment is enabled by a group string of the
/// form `Enabled-<accepted queue ms>`.
fn read_cwnd_experiment(key_value_config: &dyn KeyValueConfig) -> (bool, TimeDelta) {
    let group = key_value_config.lookup(CWND_EXPERIMENT);
    if !group.starts_with("Enabled") {
        return (false, DEFAULT_ACCEPTED_QUEUE);
    }
    match group
        .strip_prefix("Enabled-")
        .and_then(|queue| queue.parse::<i64>().ok())
    {
        Some(accepted_queue_ms) if accepted_queue_ms >= 0 => {
            (true, TimeDelta::from_millis(accepted_queue_ms))
        }
        _ => {
            log::warn!("failed to parse parameters for {}, disabling", CWND_EXPERIMENT);
            (false, DEFAULT_ACCEPTED_QUEUE)
        }
    }
}
