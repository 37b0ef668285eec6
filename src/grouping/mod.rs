
use std::collections::VecDeque;

use crate::types::PacketResult;
use crate::units::{TimeDelta, Timestamp};

const MAX_SEND_TIME_GROUP_DURATION: TimeDelta = TimeDelta::from_millis(5);
const MAX_RECEIVE_TIME_BURST_DELTA: TimeDelta = TimeDelta::from_millis(5);
const MAX_RECEIVE_TIME_BURST_DURATION: TimeDelta = TimeDelta::from_millis(100);
const RECEIVE_TIME_OFFSET_THRESHOLD: TimeDelta = TimeDelta::from_millis(3000);
const REORDERED_RESET_THRESHOLD: usize = 3;

/// A cluster of packets sent close enough together to be treated as one
/// unit when measuring inter-group delay variation.
#[derive(Debug, Clone)]
pub(crate) struct PacketDelayGroup {
    pub(crate) first_send_time: Timestamp,
    pub(crate) last_send_time: Timestamp,
    pub(crate) first_receive_time: Timestamp,
    pub(crate) last_receive_time: Timestamp,
    pub(crate) last_feedback_time: Timestamp,
}

impl PacketDelayGroup {
    fn new(packet: &PacketResult, feedback_time: Timestamp) -> Self {
        let send_time = packet.sent_packet.as_ref().unwrap().send_time;
        PacketDelayGroup {
            first_send_time: send_time,
            last_send_time: send_time,
            first_receive_time: packet.receive_time,
            last_receive_time: packet.receive_time,
            last_feedback_time: feedback_time,
        }
    }

    fn add_packet_info(&mut self, packet: &PacketResult, feedback_time: Timestamp) {
        let send_time = packet.sent_packet.as_ref().unwrap().send_time;
        self.last_send_time = self.last_send_time.max(send_time);
        self.first_receive_time = self.first_receive_time.min(packet.receive_time);
        self.last_receive_time = self.last_receive_time.max(packet.receive_time);
        self.last_feedback_time = self.last_feedback_time.max(feedback_time);
    }

    fn belongs_to_group(&self, packet: &PacketResult) -> bool {
        let send_time = packet.sent_packet.as_ref().unwrap().send_time;
        send_time - self.first_send_time <= MAX_SEND_TIME_GROUP_DURATION
    }

    /// A packet belongs to a receive-side burst when it arrives faster than
    /// it was sent, within a short delta of the previous arrival and not
    /// too long after the first arrival in the group. This absorbs bursts
    /// introduced by pacing on the wire.
    fn belongs_to_burst(&self, packet: &PacketResult) -> bool {
        let send_time_delta =
            packet.sent_packet.as_ref().unwrap().send_time - self.first_send_time;
        let receive_time_delta = packet.receive_time - self.last_receive_time;
        let receive_time_duration = packet.receive_time - self.first_receive_time;
        let receiving_faster_than_sent = receive_time_delta < send_time_delta;
        receiving_faster_than_sent
            && receive_time_delta <= MAX_RECEIVE_TIME_BURST_DELTA
            && receive_time_duration <= MAX_RECEIVE_TIME_BURST_DURATION
    }
}

/// Inter-group deltas between two consecutive closed packet groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketDelayDelta {
    pub receive_time: Timestamp,
    pub send: TimeDelta,
    pub receive: TimeDelta,
    pub feedback: TimeDelta,
}

/// PacketDelayGrouper clusters received packets into send-time groups and
/// produces the send/receive/feedback deltas between consecutive groups.
#[derive(Debug, Default)]
pub(crate) struct PacketDelayGrouper {
    packet_groups: VecDeque<PacketDelayGroup>,
    num_consecutive_reordered_packets: usize,
}

impl PacketDelayGrouper {
    pub(crate) fn new() -> Self {
        PacketDelayGrouper::default()
    }

    /// add_packet_info admits a received packet with send info. Packets
    /// whose send time precedes the current group are reordered in send
    /// time and dropped here.
    pub(crate) fn add_packet_info(&mut self, packet: &PacketResult, feedback_time: Timestamp) {
        debug_assert!(packet.received_with_send_info());
        match self.packet_groups.back_mut() {
            None => {
                self.packet_groups
                    .push_back(PacketDelayGroup::new(packet, feedback_time));
            }
            Some(group) => {
                let send_time = packet.sent_packet.as_ref().unwrap().send_time;
                if send_time >= group.first_send_time {
                    if group.belongs_to_group(packet) || group.belongs_to_burst(packet) {
                        group.add_packet_info(packet, feedback_time);
                    } else {
                        self.packet_groups
                            .push_back(PacketDelayGroup::new(packet, feedback_time));
                    }
                }
            }
        }
    }

    /// pop_deltas consumes closed groups. A group is proven closed by a
    /// third group behind it, so deltas are emitted while at least three
    /// groups exist.
    pub(crate) fn pop_deltas(&mut self) -> Vec<PacketDelayDelta> {
        let mut deltas = vec![];
        while self.packet_groups.len() >= 3 {
            let delta = PacketDelayDelta {
                receive_time: self.packet_groups[1].last_receive_time,
                send: self.packet_groups[1].last_send_time - self.packet_groups[0].last_send_time,
                receive: self.packet_groups[1].last_receive_time
                    - self.packet_groups[0].last_receive_time,
                feedback: self.packet_groups[1].last_feedback_time
                    - self.packet_groups[0].last_feedback_time,
            };
            self.packet_groups.pop_front();

            if delta.receive - delta.feedback >= RECEIVE_TIME_OFFSET_THRESHOLD {
                log::warn!(
                    "receive clock offset has changed (diff = {}), resetting",
                    delta.receive - delta.feedback
                );
                self.packet_groups.pop_front();
            } else if delta.receive < TimeDelta::zero() {
                self.num_consecutive_reordered_packets += 1;
                if self.num_consecutive_reordered_packets >= REORDERED_RESET_THRESHOLD {
                    log::warn!(
                        "decreasing receive time in multiple consecutive packet groups, resetting"
                    );
                    self.packet_groups.pop_front();
                }
            } else {
                self.num_consecutive_reordered_packets = 0;
                deltas.push(delta);
            }
        }
        deltas
    }

    pub(crate) fn reset(&mut self) {
        self.packet_groups.clear();
        self.num_consecutive_reordered_packets = 0;
    }
}
