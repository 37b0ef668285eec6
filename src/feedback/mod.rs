#[cfg(test)]
mod feedback_test;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use rtcp::transport_feedbacks::transport_layer_cc::{
    PacketStatusChunk, SymbolTypeTcc, TransportLayerCc,
};

use crate::error::{Error, Result};
use crate::types::{PacedPacketInfo, PacketResult, SentPacket, TransportPacketsFeedback};
use crate::units::{DataSize, TimeDelta, Timestamp};

/// Sent packets older than this are dropped from the send history.
const SEND_TIME_HISTORY_WINDOW: TimeDelta = TimeDelta::from_millis(60_000);

/// A jump of the reconstructed receive-time base beyond this is treated as
/// a clock step on the remote side.
const RECEIVE_TIME_OFFSET_THRESHOLD: TimeDelta = TimeDelta::from_millis(3000);

/// The feedback reference time is a 24-bit counter in 64 ms ticks.
const BASE_TIME_WRAP_PERIOD_US: i64 = 64_000 * (1 << 24);

/// Description of an outgoing packet handed to the adapter before it is
/// paced onto the wire.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketSendInfo {
    pub ssrc: u32,
    pub rtp_sequence_number: Option<u16>,
    pub transport_sequence_number: u16,
    pub length: DataSize,
    pub pacing_info: PacedPacketInfo,
}

/// Notification that a packet left the socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct SentPacketInfo {
    /// Transport-wide sequence number, present for packets tracked in
    /// transport feedback.
    pub packet_id: Option<u16>,
    pub send_time: Timestamp,
    pub packet_size: DataSize,
    /// True for packets that count toward the bitrate allocation but are
    /// not tracked with a transport sequence number (e.g. audio without
    /// the transport-cc extension).
    pub included_in_allocation: bool,
}

/// PacketFeedbackObserver is notified about tracked packets and matched
/// feedback, keyed by (ssrc, transport sequence number).
pub trait PacketFeedbackObserver: Send + Sync {
    fn on_packet_added(&self, ssrc: u32, seq_num: u16);
    fn on_packet_feedback_vector(&self, packet_feedbacks: &[PacketResult]);
}

/// Unwraps 16-bit transport-wide sequence numbers to a monotonically
/// increasing 64-bit space. State persists across feedback reports.
#[derive(Debug, Default)]
pub(crate) struct SequenceNumberUnwrapper {
    last_value: Option<u16>,
    last_unwrapped: i64,
}

impl SequenceNumberUnwrapper {
    pub(crate) fn unwrap(&mut self, value: u16) -> i64 {
        if let Some(last) = self.last_value {
            let forward = value.wrapping_sub(last) as i64;
            if forward < (1 << 15) {
                self.last_unwrapped += forward;
            } else {
                self.last_unwrapped -= (1 << 16) - forward;
            }
        } else {
            self.last_unwrapped = value as i64;
        }
        self.last_value = Some(value);
        self.last_unwrapped
    }
}

/// Record of a sent packet kept until it is acknowledged or aged out.
#[derive(Debug, Clone)]
struct PacketFeedback {
    creation_time: Timestamp,
    /// Set when egress is confirmed; uninitialized before that.
    send_time: Timestamp,
    /// Receive time reported by the remote; plus infinity when lost.
    arrival_time: Timestamp,
    sequence_number: i64,
    payload_size: DataSize,
    local_net_id: u16,
    remote_net_id: u16,
    pacing_info: PacedPacketInfo,
    /// Untracked data sent before this packet and not yet acknowledged.
    unacknowledged_data: DataSize,
    #[allow(dead_code)]
    ssrc: Option<u32>,
    #[allow(dead_code)]
    rtp_sequence_number: Option<u16>,
}

#[derive(Default)]
struct AdapterState {
    history: BTreeMap<i64, PacketFeedback>,
    seq_num_unwrapper: SequenceNumberUnwrapper,
    in_flight_bytes: HashMap<(u16, u16), i64>,
    last_ack_seq_num: i64,
    pending_untracked_size: DataSize,
    last_send_time: Timestamp,
    last_untracked_send_time: Timestamp,
    local_net_id: u16,
    remote_net_id: u16,
    /// Local time base the remote receive timestamps are mapped onto.
    current_offset: Timestamp,
    /// Last remote base time, for computing base deltas across reports.
    last_base_time_us: Option<i64>,
}

impl AdapterState {
    fn new() -> Self {
        AdapterState {
            last_ack_seq_num: -1,
            pending_untracked_size: DataSize::zero(),
            ..Default::default()
        }
    }

    fn outstanding_data(&self) -> DataSize {
        match self
            .in_flight_bytes
            .get(&(self.local_net_id, self.remote_net_id))
        {
            Some(bytes) => DataSize::from_bytes(*bytes),
            None => DataSize::zero(),
        }
    }

    fn add_in_flight(&mut self, packet: &PacketFeedback) {
        debug_assert!(packet.send_time.is_finite());
        if self.last_ack_seq_num >= packet.sequence_number {
            return;
        }
        *self
            .in_flight_bytes
            .entry((packet.local_net_id, packet.remote_net_id))
            .or_insert(0) += packet.payload_size.bytes();
    }

    fn remove_in_flight(&mut self, packet: &PacketFeedback) {
        if !packet.send_time.is_finite() || self.last_ack_seq_num >= packet.sequence_number {
            return;
        }
        if let Some(bytes) = self
            .in_flight_bytes
            .get_mut(&(packet.local_net_id, packet.remote_net_id))
        {
            *bytes -= packet.payload_size.bytes();
            if *bytes == 0 {
                self.in_flight_bytes
                    .remove(&(packet.local_net_id, packet.remote_net_id));
            }
        }
    }

    /// Matches a reported sequence number against the send history and
    /// retires in-flight bytes for everything the report acknowledges.
    fn get_feedback(&mut self, seq_num: u16, remove: bool) -> Option<PacketFeedback> {
        let acked_seq_num = self.seq_num_unwrapper.unwrap(seq_num);
        if acked_seq_num > self.last_ack_seq_num {
            let newly_acked: Vec<i64> = self
                .history
                .range(self.last_ack_seq_num..=acked_seq_num)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in newly_acked {
                let packet = self.history[&seq].clone();
                self.remove_in_flight(&packet);
            }
            self.last_ack_seq_num = acked_seq_num;
        }

        if remove {
            self.history.remove(&acked_seq_num)
        } else {
            // Not removed: the packet may be reported as received by a
            // later feedback message.
            self.history.get(&acked_seq_num).cloned()
        }
    }
}

/// TransportFeedbackAdapter remembers packets the sender put on the wire
/// and matches transport-wide feedback from the receiver against them,
/// producing the per-packet results that drive the bandwidth estimators.
///
/// All state is behind a single mutex so outstanding data can be queried
/// from a different context, e.g. a pacer task.
pub struct TransportFeedbackAdapter {
    state: Mutex<AdapterState>,
    observers: Mutex<Vec<Arc<dyn PacketFeedbackObserver>>>,
}

impl Default for TransportFeedbackAdapter {
    fn default() -> Self {
        TransportFeedbackAdapter::new()
    }
}

impl TransportFeedbackAdapter {
    pub fn new() -> Self {
        TransportFeedbackAdapter {
            state: Mutex::new(AdapterState::new()),
            observers: Mutex::new(vec![]),
        }
    }

    pub fn register_packet_feedback_observer(&self, observer: Arc<dyn PacketFeedbackObserver>) {
        let mut observers = self.observers.lock().unwrap();
        observers.push(observer);
    }

    pub fn deregister_packet_feedback_observer(&self, observer: &Arc<dyn PacketFeedbackObserver>) {
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
    }

    /// add_packet records a packet that is about to be sent. Packets older
    /// than the history window are evicted from the front.
    pub fn add_packet(
        &self,
        packet_info: &PacketSendInfo,
        overhead: DataSize,
        creation_time: Timestamp,
    ) {
        {
            let mut state = self.state.lock().unwrap();
            let sequence_number = state
                .seq_num_unwrapper
                .unwrap(packet_info.transport_sequence_number);
            let packet = PacketFeedback {
                creation_time,
                send_time: Timestamp::not_initialized(),
                arrival_time: Timestamp::not_initialized(),
                sequence_number,
                payload_size: packet_info.length + overhead,
                local_net_id: state.local_net_id,
                remote_net_id: state.remote_net_id,
                pacing_info: packet_info.pacing_info,
                unacknowledged_data: DataSize::zero(),
                ssrc: Some(packet_info.ssrc),
                rtp_sequence_number: packet_info.rtp_sequence_number,
            };

            loop {
                let (seq, front) = match state.history.iter().next() {
                    Some((&seq, front))
                        if creation_time - front.creation_time > SEND_TIME_HISTORY_WINDOW =>
                    {
                        (seq, front.clone())
                    }
                    _ => break,
                };
                state.remove_in_flight(&front);
                state.history.remove(&seq);
            }
            state.history.insert(sequence_number, packet);
        }

        let observers = self.observers.lock().unwrap();
        for observer in observers.iter() {
            observer.on_packet_added(packet_info.ssrc, packet_info.transport_sequence_number);
        }
    }

    /// process_sent_packet attaches the confirmed send time to the matching
    /// record and returns a summary for the controller. Returns `None` for
    /// retransmits of an already sent record and for packets tracked only
    /// for allocation accounting.
    pub fn process_sent_packet(&self, sent_packet: &SentPacketInfo) -> Option<SentPacket> {
        let mut state = self.state.lock().unwrap();
        if let Some(packet_id) = sent_packet.packet_id {
            if state.last_send_time.is_finite() && sent_packet.send_time < state.last_send_time {
                log::warn!(
                    "sent packet send time is out of order ({} < {})",
                    sent_packet.send_time,
                    state.last_send_time
                );
            }
            let unwrapped_seq_num = state.seq_num_unwrapper.unwrap(packet_id);
            let pending_untracked_size = state.pending_untracked_size;
            let last_untracked_send_time = state.last_untracked_send_time;

            let entry = state.history.get_mut(&unwrapped_seq_num)?;
            let packet_retransmit = entry.send_time.is_finite();
            entry.send_time = sent_packet.send_time;
            if !pending_untracked_size.is_zero() {
                if last_untracked_send_time.is_finite()
                    && sent_packet.send_time < last_untracked_send_time
                {
                    log::warn!(
                        "appending acknowledged data for out of order packet (diff: {})",
                        last_untracked_send_time - sent_packet.send_time
                    );
                }
                entry.unacknowledged_data += pending_untracked_size;
            }
            let packet = entry.clone();

            state.pending_untracked_size = DataSize::zero();
            state.last_send_time = state.last_send_time.max(sent_packet.send_time);
            if !packet_retransmit {
                state.add_in_flight(&packet);
                return Some(SentPacket {
                    send_time: packet.send_time,
                    size: packet.payload_size,
                    pacing_info: packet.pacing_info,
                    sequence_number: packet.sequence_number,
                    prior_unacked_data: packet.unacknowledged_data,
                    data_in_flight: state.outstanding_data(),
                });
            }
        } else if sent_packet.included_in_allocation {
            if state.last_send_time.is_finite() && sent_packet.send_time < state.last_send_time {
                log::warn!("ignoring untracked data for out of order packet");
            }
            state.pending_untracked_size += sent_packet.packet_size;
            state.last_untracked_send_time =
                state.last_untracked_send_time.max(sent_packet.send_time);
        }
        None
    }

    /// process_transport_feedback matches a transport-wide feedback block
    /// against the send history and produces one result per reported
    /// sequence number, ordered as reported.
    pub fn process_transport_feedback(
        &self,
        feedback: &TransportLayerCc,
        feedback_time: Timestamp,
    ) -> Option<TransportPacketsFeedback> {
        let prior_in_flight = self.get_outstanding_data();

        let packet_feedbacks = match self.packet_feedback_vector(feedback, feedback_time) {
            Ok(feedbacks) => feedbacks,
            Err(err) => {
                log::warn!("failed to process transport feedback: {}", err);
                return None;
            }
        };

        {
            let observers = self.observers.lock().unwrap();
            for observer in observers.iter() {
                observer.on_packet_feedback_vector(&packet_feedbacks);
            }
        }
        if packet_feedbacks.is_empty() {
            return None;
        }

        let state = self.state.lock().unwrap();
        let first_unacked_send_time = state
            .history
            .range(state.last_ack_seq_num + 1..)
            .map(|(_, packet)| packet.send_time)
            .find(|send_time| send_time.is_finite())
            .unwrap_or(Timestamp::plus_infinity());
        let data_in_flight = state.outstanding_data();

        Some(TransportPacketsFeedback {
            feedback_time,
            data_in_flight,
            prior_in_flight,
            packet_feedbacks,
            first_unacked_send_time,
        })
    }

    pub fn set_network_ids(&self, local_id: u16, remote_id: u16) {
        let mut state = self.state.lock().unwrap();
        state.local_net_id = local_id;
        state.remote_net_id = remote_id;
    }

    /// get_outstanding_data returns the bytes in flight for the active
    /// network id pair.
    pub fn get_outstanding_data(&self) -> DataSize {
        let state = self.state.lock().unwrap();
        state.outstanding_data()
    }

    fn packet_feedback_vector(
        &self,
        feedback: &TransportLayerCc,
        feedback_time: Timestamp,
    ) -> Result<Vec<PacketResult>> {
        if feedback.packet_status_count == 0 {
            log::info!("empty transport feedback packet received");
            return Ok(vec![]);
        }

        let mut state = self.state.lock().unwrap();

        // Remote receive times are deltas against a 24-bit base in 64 ms
        // ticks. They are accumulated onto a local time base picked from
        // the first feedback so the timestamps stay easy to inspect.
        let base_time_us = feedback.reference_time as i64 * 64_000;
        match state.last_base_time_us {
            Some(last_base_time_us) => {
                let mut base_delta_us = base_time_us - last_base_time_us;
                if base_delta_us < -BASE_TIME_WRAP_PERIOD_US / 2 {
                    base_delta_us += BASE_TIME_WRAP_PERIOD_US;
                } else if base_delta_us > BASE_TIME_WRAP_PERIOD_US / 2 {
                    base_delta_us -= BASE_TIME_WRAP_PERIOD_US;
                }
                state.current_offset = state.current_offset + TimeDelta::from_micros(base_delta_us);
            }
            None => state.current_offset = feedback_time,
        }
        state.last_base_time_us = Some(base_time_us);
        if (state.current_offset - feedback_time).abs() > RECEIVE_TIME_OFFSET_THRESHOLD {
            log::warn!(
                "receive time base jumped (offset {}, feedback at {}), resetting",
                state.current_offset,
                feedback_time
            );
            state.current_offset = feedback_time;
        }

        let mut symbols = Vec::with_capacity(feedback.packet_status_count as usize);
        for chunk in &feedback.packet_chunks {
            match chunk {
                PacketStatusChunk::RunLengthChunk(run) => {
                    for _ in 0..run.run_length {
                        symbols.push(run.packet_status_symbol);
                    }
                }
                PacketStatusChunk::StatusVectorChunk(vector) => {
                    symbols.extend_from_slice(&vector.symbol_list);
                }
            }
        }
        symbols.truncate(feedback.packet_status_count as usize);

        let mut packet_feedbacks = Vec::with_capacity(symbols.len());
        let mut deltas = feedback.recv_deltas.iter();
        let mut offset_us = 0i64;
        let mut seq_num = feedback.base_sequence_number;
        let mut failed_lookups = 0usize;
        for symbol in symbols {
            // A received packet that carries no delta cannot be placed in
            // time; it stays unacknowledged until a later report.
            let received = matches!(
                symbol,
                SymbolTypeTcc::PacketReceivedSmallDelta | SymbolTypeTcc::PacketReceivedLargeDelta
            );
            let arrival_time = if received {
                let delta = deltas.next().ok_or(Error::ErrMissingRecvDeltas)?;
                offset_us += delta.delta;
                state.current_offset + TimeDelta::from_micros(offset_us)
            } else {
                Timestamp::plus_infinity()
            };

            let packet = state.get_feedback(seq_num, received);
            match packet {
                Some(mut packet) => {
                    packet.arrival_time = arrival_time;
                    if packet.local_net_id == state.local_net_id
                        && packet.remote_net_id == state.remote_net_id
                    {
                        packet_feedbacks.push(packet_result(&packet));
                    }
                }
                None => {
                    failed_lookups += 1;
                    packet_feedbacks.push(PacketResult {
                        sent_packet: None,
                        receive_time: arrival_time,
                    });
                }
            }
            seq_num = seq_num.wrapping_add(1);
        }

        if failed_lookups > 0 {
            log::warn!(
                "failed to lookup send time for {} packet(s), send time history too small?",
                failed_lookups
            );
        }
        Ok(packet_feedbacks)
    }
}

fn packet_result(packet: &PacketFeedback) -> PacketResult {
    let sent_packet = if packet.send_time.is_finite() {
        Some(SentPacket {
            send_time: packet.send_time,
            size: packet.payload_size,
            pacing_info: packet.pacing_info,
            sequence_number: packet.sequence_number,
            prior_unacked_data: packet.unacknowledged_data,
            data_in_flight: DataSize::zero(),
        })
    } else {
        None
    };
    PacketResult {
        sent_packet,
        receive_time: packet.arrival_time,
    }
}
