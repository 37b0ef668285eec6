
use std::collections::HashMap;

use crate::types::{PacketResult, ProbeClusterConfig};
use crate::units::{DataRate, DataSize, TimeDelta, Timestamp};

const MIN_CLUSTER_PROBES: usize = 5;
const MIN_RECEIVE_SPAN: TimeDelta = TimeDelta::from_millis(15);
/// Packets below this size are padding the pacer added to keep the probe
/// going and do not count toward the probe threshold.
const MIN_PROBE_PACKET_SIZE: DataSize = DataSize::from_bytes(200);
const MAX_CLUSTER_AGE: TimeDelta = TimeDelta::from_secs(5);
/// Probe results are scaled down so the first ramp after a probe does not
/// immediately overshoot the capacity the probe measured.
const TARGET_UTILIZATION_FRACTION: f64 = 0.85;

#[derive(Debug, Default, Clone)]
struct AggregatedCluster {
    num_probes: usize,
    first_send: Timestamp,
    last_send: Timestamp,
    first_receive: Timestamp,
    last_receive: Timestamp,
    size_last_send: DataSize,
    size_first_receive: DataSize,
    size_total: DataSize,
}

impl AggregatedCluster {
    fn new() -> Self {
        AggregatedCluster {
            num_probes: 0,
            first_send: Timestamp::plus_infinity(),
            last_send: Timestamp::not_initialized(),
            first_receive: Timestamp::plus_infinity(),
            last_receive: Timestamp::not_initialized(),
            size_last_send: DataSize::zero(),
            size_first_receive: DataSize::zero(),
            size_total: DataSize::zero(),
        }
    }
}

/// ProbeBitrateEstimator collects sent-and-received packets tagged with a
/// probe cluster id and computes the instantaneous bitrate the cluster
/// measured once enough of it has been received.
#[derive(Debug, Default)]
pub struct ProbeBitrateEstimator {
    clusters: HashMap<i32, AggregatedCluster>,
}

impl ProbeBitrateEstimator {
    pub fn new() -> Self {
        ProbeBitrateEstimator::default()
    }

    /// handle_probe_and_estimate_bitrate folds one received probe packet
    /// into its cluster and returns a bitrate when the cluster completes,
    /// either by reaching the probe count and receive span thresholds or
    /// by a packet from a later cluster closing it.
    pub fn handle_probe_and_estimate_bitrate(&mut self, packet: &PacketResult) -> Option<DataRate> {
        let sent = packet.sent_packet.as_ref()?;
        let cluster_id = sent.pacing_info.probe_cluster_id;
        debug_assert!(cluster_id >= 0);
        if !packet.receive_time.is_finite() {
            return None;
        }

        self.erase_old_clusters(sent.send_time - MAX_CLUSTER_AGE);

        // A later cluster proves the earlier ones stopped; flush them.
        let closed_ids: Vec<i32> = self
            .clusters
            .keys()
            .filter(|&&id| id < cluster_id)
            .cloned()
            .collect();
        let mut closed_estimate = None;
        for id in closed_ids {
            let cluster = self.clusters.remove(&id).unwrap();
            if let Some(estimate) = estimate_cluster_rate(&cluster) {
                closed_estimate = Some(estimate);
            }
        }

        let cluster = self
            .clusters
            .entry(cluster_id)
            .or_insert_with(AggregatedCluster::new);
        if sent.send_time < cluster.first_send {
            cluster.first_send = sent.send_time;
        }
        if !cluster.last_send.is_finite() || sent.send_time > cluster.last_send {
            cluster.last_send = sent.send_time;
            cluster.size_last_send = sent.size;
        }
        if packet.receive_time < cluster.first_receive {
            cluster.first_receive = packet.receive_time;
            cluster.size_first_receive = sent.size;
        }
        if !cluster.last_receive.is_finite() || packet.receive_time > cluster.last_receive {
            cluster.last_receive = packet.receive_time;
        }
        cluster.size_total += sent.size;
        if sent.size >= MIN_PROBE_PACKET_SIZE {
            cluster.num_probes += 1;
        }

        if cluster.num_probes >= MIN_CLUSTER_PROBES
            && cluster.last_receive - cluster.first_receive >= MIN_RECEIVE_SPAN
        {
            estimate_cluster_rate(cluster).or(closed_estimate)
        } else {
            closed_estimate
        }
    }

    fn erase_old_clusters(&mut self, limit: Timestamp) {
        self.clusters
            .retain(|_, cluster| !cluster.last_send.is_finite() || cluster.last_send > limit);
    }
}

/// The cluster rate is the higher of the send and receive side rates.
/// The last sent and first received packet sizes are excluded from their
/// respective rates since the spans cover the gaps between packets, not
/// the packets themselves.
fn estimate_cluster_rate(cluster: &AggregatedCluster) -> Option<DataRate> {
    if !cluster.last_send.is_finite() || !cluster.last_receive.is_finite() {
        return None;
    }
    let send_interval = cluster.last_send - cluster.first_send;
    let receive_interval = cluster.last_receive - cluster.first_receive;
    if send_interval <= TimeDelta::zero() || receive_interval <= TimeDelta::zero() {
        log::debug!("probe cluster without usable send or receive interval, ignoring");
        return None;
    }
    let send_rate = (cluster.size_total - cluster.size_last_send) / send_interval;
    let receive_rate = (cluster.size_total - cluster.size_first_receive) / receive_interval;
    Some(send_rate.max(receive_rate) * TARGET_UTILIZATION_FRACTION)
}

const MAX_WAITING_TIME_FOR_PROBING_RESULT: TimeDelta = TimeDelta::from_secs(5);
const ALR_PERIODIC_PROBING_INTERVAL: TimeDelta = TimeDelta::from_secs(5);
const ALR_ENDED_TIMEOUT: TimeDelta = TimeDelta::from_secs(3);
const BITRATE_DROP_TIMEOUT: TimeDelta = TimeDelta::from_secs(5);
const MIN_TIME_BETWEEN_DROP_PROBES: TimeDelta = TimeDelta::from_secs(1);

const FIRST_EXPONENTIAL_PROBE_SCALE: f64 = 3.0;
const SECOND_EXPONENTIAL_PROBE_SCALE: f64 = 6.0;
const FURTHER_EXPONENTIAL_PROBE_SCALE: f64 = 2.0;
const FURTHER_PROBE_THRESHOLD: f64 = 0.7;
const BITRATE_DROP_THRESHOLD: f64 = 0.66;
const PROBE_FRACTION_AFTER_DROP: f64 = 0.85;
const PROBE_UNCERTAINTY: f64 = 0.05;

const PROBE_DURATION: TimeDelta = TimeDelta::from_millis(15);
const PROBE_COUNT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbingState {
    Init,
    WaitingForProbingResult,
    ProbingComplete,
}

/// ProbeController decides when to send probe clusters: exponential
/// probing at startup, repeated probing while results keep exceeding
/// expectations, periodic probing in application limited regions, and a
/// recovery probe after a large estimate drop.
pub struct ProbeController {
    network_available: bool,
    state: ProbingState,
    min_bitrate_to_probe_further: Option<DataRate>,
    time_last_probing_initiated: Timestamp,
    estimated_bitrate: DataRate,
    start_bitrate: DataRate,
    max_bitrate: DataRate,
    alr_start_time: Option<Timestamp>,
    alr_end_time: Option<Timestamp>,
    enable_periodic_alr_probing: bool,
    time_of_last_large_drop: Timestamp,
    bitrate_before_last_large_drop: DataRate,
    last_drop_probing_time: Timestamp,
}

impl Default for ProbeController {
    fn default() -> Self {
        ProbeController::new()
    }
}

impl ProbeController {
    pub fn new() -> Self {
        ProbeController {
            network_available: true,
            state: ProbingState::Init,
            min_bitrate_to_probe_further: None,
            time_last_probing_initiated: Timestamp::not_initialized(),
            estimated_bitrate: DataRate::zero(),
            start_bitrate: DataRate::zero(),
            max_bitrate: DataRate::zero(),
            alr_start_time: None,
            alr_end_time: None,
            enable_periodic_alr_probing: false,
            time_of_last_large_drop: Timestamp::not_initialized(),
            bitrate_before_last_large_drop: DataRate::zero(),
            last_drop_probing_time: Timestamp::not_initialized(),
        }
    }

    pub fn set_bitrates(
        &mut self,
        min_bitrate: DataRate,
        start_bitrate: DataRate,
        max_bitrate: DataRate,
        at_time: Timestamp,
    ) -> Vec<ProbeClusterConfig> {
        self.start_bitrate = if start_bitrate > DataRate::zero() {
            start_bitrate
        } else {
            min_bitrate
        };
        let old_max_bitrate = self.max_bitrate;
        self.max_bitrate = max_bitrate;

        match self.state {
            ProbingState::Init => {
                if self.network_available && self.start_bitrate > DataRate::zero() {
                    return self.initiate_exponential_probing(at_time);
                }
            }
            ProbingState::WaitingForProbingResult => {}
            ProbingState::ProbingComplete => {
                // A probe at the new max is worthwhile when the ceiling was
                // raised above what has been estimated so far.
                if !self.estimated_bitrate.is_zero()
                    && old_max_bitrate < max_bitrate
                    && self.estimated_bitrate < max_bitrate
                {
                    return self.initiate_probing(at_time, &[max_bitrate], false);
                }
            }
        }
        vec![]
    }

    pub fn on_network_availability(
        &mut self,
        network_available: bool,
        at_time: Timestamp,
    ) -> Vec<ProbeClusterConfig> {
        self.network_available = network_available;
        if !self.network_available && self.state == ProbingState::WaitingForProbingResult {
            self.state = ProbingState::ProbingComplete;
            self.min_bitrate_to_probe_further = None;
        }
        if self.network_available
            && self.state == ProbingState::Init
            && !self.start_bitrate.is_zero()
        {
            return self.initiate_exponential_probing(at_time);
        }
        vec![]
    }

    pub fn set_estimated_bitrate(
        &mut self,
        bitrate: DataRate,
        at_time: Timestamp,
    ) -> Vec<ProbeClusterConfig> {
        let mut probes = vec![];
        if self.state == ProbingState::WaitingForProbingResult {
            if let Some(min_bitrate_to_probe_further) = self.min_bitrate_to_probe_further {
                if bitrate > min_bitrate_to_probe_further {
                    // The probe result exceeded expectations, the channel
                    // may have even more capacity.
                    probes = self.initiate_probing(
                        at_time,
                        &[bitrate * FURTHER_EXPONENTIAL_PROBE_SCALE],
                        true,
                    );
                }
            }
        }
        if bitrate < self.estimated_bitrate * BITRATE_DROP_THRESHOLD {
            self.time_of_last_large_drop = at_time;
            self.bitrate_before_last_large_drop = self.estimated_bitrate;
        }
        self.estimated_bitrate = bitrate;
        probes
    }

    pub fn enable_periodic_alr_probing(&mut self, enable: bool) {
        self.enable_periodic_alr_probing = enable;
    }

    pub fn set_alr_start_time(&mut self, alr_start_time: Option<Timestamp>) {
        self.alr_start_time = alr_start_time;
    }

    pub fn set_alr_ended_time(&mut self, alr_end_time: Timestamp) {
        self.alr_end_time = Some(alr_end_time);
    }

    /// request_probe asks for a recovery probe, used after the estimate
    /// recovered from an overuse triggered drop. It is honored while in or
    /// shortly after an application limited region, when the drop was
    /// recent and large enough that probing above the current estimate is
    /// expected to succeed.
    pub fn request_probe(&mut self, at_time: Timestamp) -> Vec<ProbeClusterConfig> {
        let in_alr = self.alr_start_time.is_some();
        let alr_ended_recently = self
            .alr_end_time
            .map_or(false, |end| at_time - end < ALR_ENDED_TIMEOUT);
        if !(in_alr || alr_ended_recently) || self.state != ProbingState::ProbingComplete {
            return vec![];
        }
        if self.bitrate_before_last_large_drop.is_zero()
            || !self.time_of_last_large_drop.is_finite()
            || at_time - self.time_of_last_large_drop > BITRATE_DROP_TIMEOUT
        {
            return vec![];
        }
        if self.last_drop_probing_time.is_finite()
            && at_time - self.last_drop_probing_time <= MIN_TIME_BETWEEN_DROP_PROBES
        {
            return vec![];
        }
        let suggested_probe = self.bitrate_before_last_large_drop * PROBE_FRACTION_AFTER_DROP;
        let min_expected_probe_result = suggested_probe * (1.0 - PROBE_UNCERTAINTY);
        if min_expected_probe_result > self.estimated_bitrate {
            self.last_drop_probing_time = at_time;
            return self.initiate_probing(at_time, &[suggested_probe], false);
        }
        vec![]
    }

    pub fn reset(&mut self, at_time: Timestamp) {
        self.network_available = true;
        self.state = ProbingState::Init;
        self.min_bitrate_to_probe_further = None;
        self.time_last_probing_initiated = Timestamp::not_initialized();
        self.estimated_bitrate = DataRate::zero();
        self.start_bitrate = DataRate::zero();
        self.max_bitrate = DataRate::zero();
        self.alr_end_time = None;
        self.time_of_last_large_drop = at_time;
        self.bitrate_before_last_large_drop = DataRate::zero();
        self.last_drop_probing_time = at_time;
    }

    pub fn process(&mut self, at_time: Timestamp) -> Vec<ProbeClusterConfig> {
        if self.state == ProbingState::WaitingForProbingResult
            && at_time - self.time_last_probing_initiated > MAX_WAITING_TIME_FOR_PROBING_RESULT
        {
            log::info!("kWaitingForProbingResult: timeout");
            self.state = ProbingState::ProbingComplete;
            self.min_bitrate_to_probe_further = None;
        }

        if self.state != ProbingState::ProbingComplete || !self.enable_periodic_alr_probing {
            return vec![];
        }
        if let Some(alr_start_time) = self.alr_start_time {
            let estimate = if !self.estimated_bitrate.is_zero() {
                self.estimated_bitrate
            } else {
                self.start_bitrate
            };
            if estimate.is_zero() {
                return vec![];
            }
            let next_probe_time = alr_start_time.max(self.time_last_probing_initiated)
                + ALR_PERIODIC_PROBING_INTERVAL;
            if at_time >= next_probe_time {
                return self.initiate_probing(
                    at_time,
                    &[estimate * FURTHER_EXPONENTIAL_PROBE_SCALE],
                    true,
                );
            }
        }
        vec![]
    }

    fn initiate_exponential_probing(&mut self, at_time: Timestamp) -> Vec<ProbeClusterConfig> {
        debug_assert!(!self.start_bitrate.is_zero());
        // When the ramp-up is fast the estimate converges on the first
        // probe; the second, larger probe saves a round of waiting when
        // there is more capacity.
        self.initiate_probing(
            at_time,
            &[
                self.start_bitrate * FIRST_EXPONENTIAL_PROBE_SCALE,
                self.start_bitrate * SECOND_EXPONENTIAL_PROBE_SCALE,
            ],
            true,
        )
    }

    fn initiate_probing(
        &mut self,
        at_time: Timestamp,
        bitrates_to_probe: &[DataRate],
        probe_further: bool,
    ) -> Vec<ProbeClusterConfig> {
        let mut probe_further = probe_further;
        let mut max_probe_bitrate = DataRate::zero();
        let mut configs = Vec::with_capacity(bitrates_to_probe.len());
        for &bitrate in bitrates_to_probe {
            let mut bitrate = bitrate;
            if !self.max_bitrate.is_zero() && bitrate > self.max_bitrate {
                bitrate = self.max_bitrate;
                probe_further = false;
            }
            max_probe_bitrate = max_probe_bitrate.max(bitrate);
            configs.push(ProbeClusterConfig {
                at_time,
                target_data_rate: bitrate,
                target_duration: PROBE_DURATION,
                target_probe_count: PROBE_COUNT,
            });
        }
        self.time_last_probing_initiated = at_time;
        if probe_further {
            self.state = ProbingState::WaitingForProbingResult;
            self.min_bitrate_to_probe_further = Some(max_probe_bitrate * FURTHER_PROBE_THRESHOLD);
        } else {
            self.state = ProbingState::ProbingComplete;
            self.min_bitrate_to_probe_further = None;
        }
        configs
    }
}
