use super::*;
use crate::config::FieldTrials;
use crate::types::{PacketResult, SentPacket};
use crate::units::DataSize;

fn constraints(start_kbps: i64, min_kbps: i64, max_kbps: i64) -> TargetRateConstraints {
    TargetRateConstraints {
        at_time: Timestamp::from_millis(0),
        starting_rate: Some(DataRate::from_kbps(start_kbps)),
        min_data_rate: Some(DataRate::from_kbps(min_kbps)),
        max_data_rate: Some(DataRate::from_kbps(max_kbps)),
    }
}

fn feedback_batch(feedback_time_ms: i64, sends_and_receives: &[(i64, i64)]) -> TransportPacketsFeedback {
    let packet_feedbacks = sends_and_receives
        .iter()
        .map(|&(send_ms, recv_ms)| PacketResult {
            sent_packet: Some(SentPacket {
                send_time: Timestamp::from_millis(send_ms),
                size: DataSize::from_bytes(1200),
                ..Default::default()
            }),
            receive_time: Timestamp::from_millis(recv_ms),
        })
        .collect::<Vec<_>>();
    let first_unacked = sends_and_receives.last().map(|&(send, _)| send + 5).unwrap_or(0);
    TransportPacketsFeedback {
        feedback_time: Timestamp::from_millis(feedback_time_ms),
        packet_feedbacks,
        first_unacked_send_time: Timestamp::from_millis(first_unacked),
        ..Default::default()
    }
}

/// Drives clean, undelayed feedback in 25 ms batches with two packet
/// groups per batch, advancing the periodic tick alongside.
fn run_clean_feedback(
    controller: &mut DelayBasedRateController,
    from_ms: i64,
    until_ms: i64,
) -> Vec<DataRate> {
    let mut targets = vec![];
    let mut t = from_ms;
    while t < until_ms {
        let batch = feedback_batch(t, &[(t - 20, t - 10), (t - 10, t)]);
        controller.on_transport_packets_feedback(&batch, None);
        controller.on_time_update(Timestamp::from_millis(t));
        targets.push(controller.target_rate());
        t += 25;
    }
    targets
}

#[test]
fn ramps_up_on_clean_feedback() {
    let trials = FieldTrials::new();
    let mut controller = DelayBasedRateController::new(&trials, constraints(500, 100, 2000));

    let targets = run_clean_feedback(&mut controller, 100, 2100);

    let final_target = *targets.last().unwrap();
    assert!(final_target > DataRate::from_kbps(500), "got {final_target}");
    assert!(final_target <= DataRate::from_kbps(2000));

    let mut distinct = targets.clone();
    distinct.dedup();
    assert!(distinct.len() >= 8, "only {} rate steps", distinct.len());
}

#[test]
fn target_never_leaves_configured_range() {
    let trials = FieldTrials::new();
    let mut controller = DelayBasedRateController::new(&trials, constraints(500, 100, 550));

    for target in run_clean_feedback(&mut controller, 100, 4100) {
        assert!(target >= DataRate::from_kbps(100));
        assert!(target <= DataRate::from_kbps(550));
    }
    assert_eq!(controller.target_rate(), DataRate::from_kbps(550));
}

#[test]
fn overuse_backs_off_to_fraction_of_acknowledged_rate() {
    let trials = FieldTrials::new();
    let mut controller = DelayBasedRateController::new(&trials, constraints(800, 100, 2000));
    run_clean_feedback(&mut controller, 100, 1100);
    controller.set_acknowledged_rate(DataRate::from_kbps(600));

    // Inject growing one-way delay, +30 ms per batch.
    let mut t = 1100;
    let mut extra = 0;
    for _ in 0..10 {
        extra += 30;
        let batch = feedback_batch(
            t,
            &[(t - 20, t - 10 + extra), (t - 10, t + extra)],
        );
        controller.on_transport_packets_feedback(&batch, None);
        t += 25;
    }

    assert_eq!(controller.bandwidth_usage(), BandwidthUsage::Overusing);
    assert_eq!(
        controller.target_rate(),
        DataRate::from_kbps(600) * 0.9
    );
}

#[test]
fn no_increase_while_in_hold_after_overuse() {
    let trials = FieldTrials::new();
    let mut controller = DelayBasedRateController::new(&trials, constraints(800, 100, 2000));
    run_clean_feedback(&mut controller, 100, 1100);
    controller.set_acknowledged_rate(DataRate::from_kbps(600));

    let mut t = 1100;
    let mut extra = 0;
    for _ in 0..10 {
        extra += 30;
        let batch = feedback_batch(t, &[(t - 20, t - 10 + extra), (t - 10, t + extra)]);
        controller.on_transport_packets_feedback(&batch, None);
        t += 25;
    }
    let backed_off = controller.target_rate();

    // The periodic tick must not raise the rate while holding.
    for _ in 0..8 {
        controller.on_time_update(Timestamp::from_millis(t));
        t += 25;
    }
    assert_eq!(controller.target_rate(), backed_off);
}

#[test]
fn backs_off_without_acknowledged_rate_at_most_once_per_interval() {
    let trials = FieldTrials::new();
    let mut controller = DelayBasedRateController::new(&trials, constraints(800, 100, 2000));
    run_clean_feedback(&mut controller, 100, 1100);
    let before_overuse = controller.target_rate();

    let mut t = 1100;
    let mut extra = 0;
    for _ in 0..10 {
        extra += 30;
        let batch = feedback_batch(t, &[(t - 20, t - 10 + extra), (t - 10, t + extra)]);
        controller.on_transport_packets_feedback(&batch, None);
        t += 25;
    }
    assert_eq!(controller.bandwidth_usage(), BandwidthUsage::Overusing);
    // A single 0.8 backoff within the one second window.
    assert_eq!(controller.target_rate(), before_overuse * 0.8);
}

#[test]
fn probe_result_overrides_target() {
    let trials = FieldTrials::new();
    let mut controller = DelayBasedRateController::new(&trials, constraints(500, 100, 2000));

    let batch = feedback_batch(100, &[(80, 90), (90, 100)]);
    controller.on_transport_packets_feedback(&batch, Some(DataRate::from_kbps(680)));
    assert_eq!(controller.target_rate(), DataRate::from_kbps(680));
    assert!(controller.link_capacity_estimate().is_some());
}

#[test]
fn increase_stops_after_feedback_goes_silent() {
    let trials = FieldTrials::new();
    let mut controller = DelayBasedRateController::new(&trials, constraints(500, 100, 2000));
    run_clean_feedback(&mut controller, 100, 1100);
    // The ramp keeps going until stop_increase_after has elapsed since
    // the last feedback, then freezes.
    for i in 1..6 {
        controller.on_time_update(Timestamp::from_millis(1100 + i * 100));
    }
    let stalled = controller.target_rate();
    for i in 6..20 {
        controller.on_time_update(Timestamp::from_millis(1100 + i * 100));
    }
    assert_eq!(controller.target_rate(), stalled);
}

#[test]
fn expected_bandwidth_period_is_clamped() {
    let trials = FieldTrials::new();
    let mut controller = DelayBasedRateController::new(&trials, constraints(500, 100, 2000));
    let period = controller.expected_bandwidth_period();
    assert!(period >= TimeDelta::from_secs(1));
    assert!(period <= TimeDelta::from_secs(20));

    controller.set_rtt(TimeDelta::from_secs(5));
    let long_rtt_period = controller.expected_bandwidth_period();
    assert_eq!(long_rtt_period, TimeDelta::from_secs(20));
}
