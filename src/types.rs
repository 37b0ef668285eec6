use crate::units::{DataRate, DataSize, TimeDelta, Timestamp};

/// Probe cluster id tagging a packet that is not part of a probe.
pub const NO_PROBE_CLUSTER_ID: i32 = -1;

/// Pacing metadata attached to a sent packet by the pacer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacedPacketInfo {
    pub probe_cluster_id: i32,
    pub probe_cluster_min_probes: i32,
    pub probe_cluster_min_bytes: i32,
}

impl Default for PacedPacketInfo {
    fn default() -> Self {
        PacedPacketInfo {
            probe_cluster_id: NO_PROBE_CLUSTER_ID,
            probe_cluster_min_probes: 0,
            probe_cluster_min_bytes: 0,
        }
    }
}

impl PacedPacketInfo {
    pub fn with_probe_cluster_id(probe_cluster_id: i32) -> Self {
        PacedPacketInfo {
            probe_cluster_id,
            ..Default::default()
        }
    }
}

/// Stream information required for specific adjustments to the controller,
/// mostly used by experiments.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamsConfig {
    pub at_time: Timestamp,
    pub requests_alr_probing: bool,
    pub pacing_factor: Option<f64>,
    pub min_pacing_rate: Option<DataRate>,
    pub max_padding_rate: Option<DataRate>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TargetRateConstraints {
    pub at_time: Timestamp,
    pub starting_rate: Option<DataRate>,
    pub min_data_rate: Option<DataRate>,
    pub max_data_rate: Option<DataRate>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkAvailability {
    pub at_time: Timestamp,
    pub network_available: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkRouteChange {
    pub at_time: Timestamp,
    /// The constraints are set here so they can be changed synchronously
    /// when the network route changes.
    pub constraints: TargetRateConstraints,
}

/// Summary of a packet confirmed sent on the network.
#[derive(Debug, Default, Clone, Copy)]
pub struct SentPacket {
    pub send_time: Timestamp,
    pub size: DataSize,
    pub pacing_info: PacedPacketInfo,
    /// Transport-wide sequence number, unwrapped to 64 bits.
    pub sequence_number: i64,
    /// Size of preceding data that was not tracked with a sequence number
    /// but is still unacknowledged.
    pub prior_unacked_data: DataSize,
    pub data_in_flight: DataSize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RemoteBitrateReport {
    pub receive_time: Timestamp,
    pub bandwidth: DataRate,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RoundTripTimeUpdate {
    pub receive_time: Timestamp,
    pub round_trip_time: TimeDelta,
    pub smoothed: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TransportLossReport {
    pub receive_time: Timestamp,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub packets_lost_delta: u64,
    pub packets_received_delta: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessInterval {
    pub at_time: Timestamp,
}

/// Per-packet feedback produced by the transport feedback adapter. A lost
/// packet is reported with an infinite receive time; a packet the sender
/// has no record of is reported without the sent-packet snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketResult {
    pub sent_packet: Option<SentPacket>,
    pub receive_time: Timestamp,
}

impl PacketResult {
    pub fn received_with_send_info(&self) -> bool {
        self.sent_packet.is_some() && self.receive_time.is_finite()
    }
}

#[derive(Debug, Default, Clone)]
pub struct TransportPacketsFeedback {
    pub feedback_time: Timestamp,
    pub data_in_flight: DataSize,
    pub prior_in_flight: DataSize,
    pub packet_feedbacks: Vec<PacketResult>,
    /// Send time of the earliest packet not yet acknowledged.
    pub first_unacked_send_time: Timestamp,
}

impl TransportPacketsFeedback {
    pub fn received_with_send_info(&self) -> Vec<PacketResult> {
        self.packet_feedbacks
            .iter()
            .filter(|fb| fb.received_with_send_info())
            .cloned()
            .collect()
    }

    pub fn lost_with_send_info(&self) -> Vec<PacketResult> {
        self.packet_feedbacks
            .iter()
            .filter(|fb| fb.sent_packet.is_some() && fb.receive_time.is_infinite())
            .cloned()
            .collect()
    }

    pub fn packets_with_feedback(&self) -> &[PacketResult] {
        &self.packet_feedbacks
    }
}

/// The current network estimate underlying an emitted target rate.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkEstimate {
    pub at_time: Timestamp,
    pub bandwidth: DataRate,
    pub round_trip_time: TimeDelta,
    pub bwe_period: TimeDelta,
    pub loss_rate_ratio: f32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CongestionWindow {
    pub enabled: bool,
    pub data_window: DataSize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PacerConfig {
    pub at_time: Timestamp,
    /// The pacer should send at most data_window over time_window.
    pub data_window: DataSize,
    pub time_window: TimeDelta,
    /// The pacer should send at least pad_window over time_window.
    pub pad_window: DataSize,
}

impl PacerConfig {
    pub fn data_rate(&self) -> DataRate {
        self.data_window / self.time_window
    }

    pub fn pad_rate(&self) -> DataRate {
        self.pad_window / self.time_window
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProbeClusterConfig {
    pub at_time: Timestamp,
    pub target_data_rate: DataRate,
    pub target_duration: TimeDelta,
    pub target_probe_count: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TargetTransferRate {
    pub at_time: Timestamp,
    pub target_rate: DataRate,
    /// The estimate the target rate is based on.
    pub network_estimate: NetworkEstimate,
}
