use crate::units::DataRate;

/// LinkCapacityEstimator keeps a smoothed belief about the bottleneck
/// capacity, fed by acknowledged throughput seen at overuse and by probe
/// results. The belief is dropped whenever the evidence contradicts it.
#[derive(Debug, Default)]
pub(crate) struct LinkCapacityEstimator {
    estimate_kbps: Option<f64>,
    deviation_kbps: f64,
}

impl LinkCapacityEstimator {
    pub(crate) fn new() -> Self {
        LinkCapacityEstimator {
            estimate_kbps: None,
            deviation_kbps: 0.4,
        }
    }

    pub(crate) fn has_estimate(&self) -> bool {
        self.estimate_kbps.is_some()
    }

    pub(crate) fn estimate(&self) -> Option<DataRate> {
        self.estimate_kbps
            .map(|kbps| DataRate::from_bps((kbps * 1000.0) as i64))
    }

    pub(crate) fn upper_bound(&self) -> DataRate {
        match self.estimate_kbps {
            Some(estimate) => {
                DataRate::from_bps(((estimate + 3.0 * self.deviation_estimate_kbps()) * 1000.0) as i64)
            }
            None => DataRate::plus_infinity(),
        }
    }

    pub(crate) fn lower_bound(&self) -> DataRate {
        match self.estimate_kbps {
            Some(estimate) => DataRate::from_bps(
                ((estimate - 3.0 * self.deviation_estimate_kbps()).max(0.0) * 1000.0) as i64,
            ),
            None => DataRate::zero(),
        }
    }

    pub(crate) fn on_overuse_detected(&mut self, acknowledged_rate: DataRate) {
        self.update(acknowledged_rate, 0.05);
    }

    pub(crate) fn on_probe_rate(&mut self, probe_rate: DataRate) {
        self.update(probe_rate, 0.5);
    }

    pub(crate) fn reset(&mut self) {
        self.estimate_kbps = None;
        self.deviation_kbps = 0.4;
    }

    fn update(&mut self, sample: DataRate, alpha: f64) {
        let sample_kbps = sample.bps() as f64 / 1000.0;
        let estimate_kbps = match self.estimate_kbps {
            None => sample_kbps,
            Some(estimate) => (1.0 - alpha) * estimate + alpha * sample_kbps,
        };
        // The deviation is normalized by the estimate so its scale tracks
        // the magnitude of the belief.
        let error_kbps = estimate_kbps - sample_kbps;
        self.deviation_kbps = ((1.0 - alpha) * self.deviation_kbps
            + alpha * error_kbps * error_kbps / estimate_kbps.max(1.0))
        .clamp(0.4, 2500.0);
        self.estimate_kbps = Some(estimate_kbps);
    }

    fn deviation_estimate_kbps(&self) -> f64 {
        // Estimate of the standard deviation in kbps.
        (self.deviation_kbps * self.estimate_kbps.unwrap_or(0.0)).sqrt()
    }
}
