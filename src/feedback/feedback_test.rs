use rtcp::transport_feedbacks::transport_layer_cc::{
    PacketStatusChunk, RecvDelta, RunLengthChunk, StatusChunkTypeTcc, SymbolTypeTcc,
    TransportLayerCc,
};

use super::*;

/// Builds a parsed feedback block. `statuses` holds one entry per
/// sequence number starting at `base_seq`: `Some(delta_us)` for received
/// packets, `None` for lost ones.
fn build_feedback(base_seq: u16, reference_time: u32, statuses: &[Option<i64>]) -> TransportLayerCc {
    let mut packet_chunks = vec![];
    let mut recv_deltas = vec![];
    for status in statuses {
        let symbol = match status {
            Some(delta_us) => {
                recv_deltas.push(RecvDelta {
                    type_tcc_packet: SymbolTypeTcc::PacketReceivedSmallDelta,
                    delta: *delta_us,
                });
                SymbolTypeTcc::PacketReceivedSmallDelta
            }
            None => SymbolTypeTcc::PacketNotReceived,
        };
        packet_chunks.push(PacketStatusChunk::RunLengthChunk(RunLengthChunk {
            type_tcc: StatusChunkTypeTcc::RunLengthChunk,
            packet_status_symbol: symbol,
            run_length: 1,
        }));
    }
    TransportLayerCc {
        base_sequence_number: base_seq,
        packet_status_count: statuses.len() as u16,
        reference_time,
        packet_chunks,
        recv_deltas,
        ..Default::default()
    }
}

fn add_and_send(adapter: &TransportFeedbackAdapter, seq: u16, bytes: i64, send_time_ms: i64) {
    adapter.add_packet(
        &PacketSendInfo {
            ssrc: 0x1234,
            transport_sequence_number: seq,
            length: DataSize::from_bytes(bytes),
            ..Default::default()
        },
        DataSize::zero(),
        Timestamp::from_millis(send_time_ms),
    );
    let sent = adapter.process_sent_packet(&SentPacketInfo {
        packet_id: Some(seq),
        send_time: Timestamp::from_millis(send_time_ms),
        packet_size: DataSize::from_bytes(bytes),
        included_in_allocation: false,
    });
    assert!(sent.is_some());
}

#[test]
fn unwrapper_output_is_monotone_for_monotone_input() {
    let mut unwrapper = SequenceNumberUnwrapper::default();
    let mut last = None;
    let mut seq = 65_000u16;
    for _ in 0..2000 {
        let unwrapped = unwrapper.unwrap(seq);
        if let Some(last) = last {
            assert!(unwrapped > last);
        }
        last = Some(unwrapped);
        seq = seq.wrapping_add(1);
    }
}

#[test]
fn unwrapper_tolerates_reordering() {
    let mut unwrapper = SequenceNumberUnwrapper::default();
    assert_eq!(unwrapper.unwrap(10), 10);
    assert_eq!(unwrapper.unwrap(12), 12);
    assert_eq!(unwrapper.unwrap(11), 11);
    // Backwards past a wrap boundary.
    let mut unwrapper = SequenceNumberUnwrapper::default();
    assert_eq!(unwrapper.unwrap(0), 0);
    assert_eq!(unwrapper.unwrap(65_535), -1);
}

#[test]
fn outstanding_data_tracks_sent_and_acked_bytes() {
    let adapter = TransportFeedbackAdapter::new();
    assert_eq!(adapter.get_outstanding_data(), DataSize::zero());

    add_and_send(&adapter, 1, 1200, 1000);
    assert_eq!(adapter.get_outstanding_data(), DataSize::from_bytes(1200));
    add_and_send(&adapter, 2, 800, 1010);
    assert_eq!(adapter.get_outstanding_data(), DataSize::from_bytes(2000));

    // Acknowledge the first packet.
    let feedback = build_feedback(1, 100, &[Some(5000)]);
    let report = adapter
        .process_transport_feedback(&feedback, Timestamp::from_millis(1100))
        .unwrap();
    assert_eq!(report.packet_feedbacks.len(), 1);
    assert_eq!(adapter.get_outstanding_data(), DataSize::from_bytes(800));
    assert_eq!(report.prior_in_flight, DataSize::from_bytes(2000));
    assert_eq!(report.data_in_flight, DataSize::from_bytes(800));
}

#[test]
fn feedback_reports_results_in_reported_order() {
    let adapter = TransportFeedbackAdapter::new();
    for seq in 1..=4u16 {
        add_and_send(&adapter, seq, 1000, 1000 + seq as i64 * 10);
    }
    let feedback = build_feedback(1, 100, &[Some(1000), Some(2000), Some(3000), Some(4000)]);
    let report = adapter
        .process_transport_feedback(&feedback, Timestamp::from_millis(1200))
        .unwrap();

    assert_eq!(report.packet_feedbacks.len(), 4);
    let sequence_numbers: Vec<i64> = report
        .packet_feedbacks
        .iter()
        .map(|fb| fb.sent_packet.as_ref().unwrap().sequence_number)
        .collect();
    assert_eq!(sequence_numbers, vec![1, 2, 3, 4]);

    // Arrival times accumulate the per packet deltas onto the local base.
    let receive_times: Vec<i64> = report
        .packet_feedbacks
        .iter()
        .map(|fb| fb.receive_time.ms())
        .collect();
    assert_eq!(receive_times, vec![1201, 1203, 1206, 1210]);
}

#[test]
fn sequence_numbers_unwrap_across_the_wrap_boundary() {
    let adapter = TransportFeedbackAdapter::new();
    let seqs: Vec<u16> = (65530..=65535).chain(0..=2).collect();
    for (i, &seq) in seqs.iter().enumerate() {
        add_and_send(&adapter, seq, 1000, 1000 + i as i64 * 10);
    }

    let statuses: Vec<Option<i64>> = (0..9).map(|_| Some(1000)).collect();
    let feedback = build_feedback(65530, 100, &statuses);
    let report = adapter
        .process_transport_feedback(&feedback, Timestamp::from_millis(1200))
        .unwrap();

    assert_eq!(report.packet_feedbacks.len(), 9);
    let unwrapped: Vec<i64> = report
        .packet_feedbacks
        .iter()
        .map(|fb| fb.sent_packet.as_ref().unwrap().sequence_number)
        .collect();
    for pair in unwrapped.windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }
}

#[test]
fn lost_packets_have_infinite_receive_time() {
    let adapter = TransportFeedbackAdapter::new();
    for seq in 1..=3u16 {
        add_and_send(&adapter, seq, 1000, 1000 + seq as i64 * 10);
    }
    let feedback = build_feedback(1, 100, &[Some(1000), None, Some(2000)]);
    let report = adapter
        .process_transport_feedback(&feedback, Timestamp::from_millis(1200))
        .unwrap();

    assert_eq!(report.packet_feedbacks.len(), 3);
    assert!(report.packet_feedbacks[0].receive_time.is_finite());
    assert!(report.packet_feedbacks[1].receive_time.is_infinite());
    assert!(report.packet_feedbacks[2].receive_time.is_finite());
    // The lost packet still carries its send info.
    assert!(report.packet_feedbacks[1].sent_packet.is_some());
}

#[test]
fn feedback_for_unknown_packet_has_no_send_info() {
    let adapter = TransportFeedbackAdapter::new();
    let feedback = build_feedback(7, 100, &[Some(1000)]);
    let report = adapter
        .process_transport_feedback(&feedback, Timestamp::from_millis(1200))
        .unwrap();
    assert_eq!(report.packet_feedbacks.len(), 1);
    assert!(report.packet_feedbacks[0].sent_packet.is_none());
}

#[test]
fn duplicate_feedback_does_not_double_count_in_flight() {
    let adapter = TransportFeedbackAdapter::new();
    add_and_send(&adapter, 1, 1200, 1000);

    let feedback = build_feedback(1, 100, &[Some(1000)]);
    adapter
        .process_transport_feedback(&feedback, Timestamp::from_millis(1100))
        .unwrap();
    assert_eq!(adapter.get_outstanding_data(), DataSize::zero());

    // The same sequence number reported again: the record is gone, the
    // tally is untouched.
    let feedback = build_feedback(1, 101, &[Some(1000)]);
    let report = adapter
        .process_transport_feedback(&feedback, Timestamp::from_millis(1150))
        .unwrap();
    assert!(report.packet_feedbacks[0].sent_packet.is_none());
    assert_eq!(adapter.get_outstanding_data(), DataSize::zero());
}

#[test]
fn network_id_change_filters_stale_packets() {
    let adapter = TransportFeedbackAdapter::new();
    adapter.set_network_ids(1, 1);
    add_and_send(&adapter, 1, 1200, 1000);

    adapter.set_network_ids(1, 2);
    assert_eq!(adapter.get_outstanding_data(), DataSize::zero());

    // Feedback for the packet sent on the previous route is dropped.
    let feedback = build_feedback(1, 100, &[Some(1000)]);
    assert!(adapter
        .process_transport_feedback(&feedback, Timestamp::from_millis(1100))
        .is_none());
}

#[test]
fn old_packets_are_evicted_from_history() {
    let adapter = TransportFeedbackAdapter::new();
    add_and_send(&adapter, 1, 1200, 1000);
    // A packet added more than a minute later pushes the first one out.
    add_and_send(&adapter, 2, 1000, 1000 + 61_000);

    let feedback = build_feedback(1, 100, &[Some(1000)]);
    let report = adapter
        .process_transport_feedback(&feedback, Timestamp::from_millis(63_000))
        .unwrap();
    assert!(report.packet_feedbacks[0].sent_packet.is_none());
}

#[test]
fn untracked_allocation_bytes_attach_to_next_tracked_packet() {
    let adapter = TransportFeedbackAdapter::new();
    // Audio-only data counted toward the allocation, no sequence number.
    let untracked = adapter.process_sent_packet(&SentPacketInfo {
        packet_id: None,
        send_time: Timestamp::from_millis(990),
        packet_size: DataSize::from_bytes(500),
        included_in_allocation: true,
    });
    assert!(untracked.is_none());

    adapter.add_packet(
        &PacketSendInfo {
            ssrc: 0x1234,
            transport_sequence_number: 1,
            length: DataSize::from_bytes(1200),
            ..Default::default()
        },
        DataSize::zero(),
        Timestamp::from_millis(1000),
    );
    let sent = adapter
        .process_sent_packet(&SentPacketInfo {
            packet_id: Some(1),
            send_time: Timestamp::from_millis(1000),
            packet_size: DataSize::from_bytes(1200),
            included_in_allocation: false,
        })
        .unwrap();
    assert_eq!(sent.prior_unacked_data, DataSize::from_bytes(500));
}

#[test]
fn retransmission_is_not_reported_again() {
    let adapter = TransportFeedbackAdapter::new();
    add_and_send(&adapter, 1, 1200, 1000);
    let retransmit = adapter.process_sent_packet(&SentPacketInfo {
        packet_id: Some(1),
        send_time: Timestamp::from_millis(1050),
        packet_size: DataSize::from_bytes(1200),
        included_in_allocation: false,
    });
    assert!(retransmit.is_none());
    // In-flight still counts the packet once.
    assert_eq!(adapter.get_outstanding_data(), DataSize::from_bytes(1200));
}

#[test]
fn first_unacked_send_time_is_reported() {
    let adapter = TransportFeedbackAdapter::new();
    for seq in 1..=3u16 {
        add_and_send(&adapter, seq, 1000, 1000 + seq as i64 * 10);
    }
    let feedback = build_feedback(1, 100, &[Some(1000)]);
    let report = adapter
        .process_transport_feedback(&feedback, Timestamp::from_millis(1100))
        .unwrap();
    // Packets 2 and 3 are unacknowledged; 2 was sent at 1020.
    assert_eq!(report.first_unacked_send_time, Timestamp::from_millis(1020));
}

#[test]
fn receive_clock_step_resets_time_base() {
    let adapter = TransportFeedbackAdapter::new();
    for seq in 1..=2u16 {
        add_and_send(&adapter, seq, 1000, 1000 + seq as i64 * 10);
    }
    let feedback = build_feedback(1, 100, &[Some(1000)]);
    adapter
        .process_transport_feedback(&feedback, Timestamp::from_millis(1100))
        .unwrap();

    // The next feedback's base jumps five seconds ahead; 5000 ms is 78
    // ticks of 64 ms. The adapter re-anchors on the local feedback time.
    let feedback = build_feedback(2, 100 + 78, &[Some(1000)]);
    let report = adapter
        .process_transport_feedback(&feedback, Timestamp::from_millis(1125))
        .unwrap();
    let receive_time = report.packet_feedbacks[0].receive_time;
    assert!((receive_time - Timestamp::from_millis(1125)).abs() < TimeDelta::from_millis(100));
}
