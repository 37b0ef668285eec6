
use crate::config::KeyValueConfig;
use crate::rate::RateStatistics;
use crate::units::{DataRate, DataSize, TimeDelta, Timestamp};

/// Time period over which outgoing traffic is measured.
const MEASUREMENT_PERIOD: TimeDelta = TimeDelta::from_millis(500);

const DEFAULT_ALR_START_USAGE_PERCENT: i64 = 60;
const DEFAULT_ALR_END_USAGE_PERCENT: i64 = 70;

const SCREENSHARE_PROBING_BWE_EXPERIMENT: &str = "WebRTC-ProbingScreenshareBwe";

/// Overrides from the screenshare probing experiment, encoded as a
/// `pacing_factor-max_queue_time-start_percent-end_percent` tuple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlrExperimentSettings {
    pub pacing_factor: f64,
    pub max_paced_queue_time: TimeDelta,
    pub alr_start_usage_percent: i64,
    pub alr_end_usage_percent: i64,
}

impl AlrExperimentSettings {
    /// parse_from_trial reads the experiment tuple, ignoring a trailing
    /// `_Dogfood` marker. Malformed groups yield `None`.
    pub fn parse_from_trial(key_value_config: &dyn KeyValueConfig) -> Option<Self> {
        let group = key_value_config.lookup(SCREENSHARE_PROBING_BWE_EXPERIMENT);
        let group = group.strip_suffix("_Dogfood").unwrap_or(group);
        if group.is_empty() {
            return None;
        }
        let fields: Vec<&str> = group.split('-').collect();
        if fields.len() != 4 {
            log::warn!("invalid experiment settings: {}", group);
            return None;
        }
        let parsed = (
            fields[0].parse::<f64>(),
            fields[1].parse::<i64>(),
            fields[2].parse::<i64>(),
            fields[3].parse::<i64>(),
        );
        match parsed {
            (Ok(pacing_factor), Ok(max_queue_ms), Ok(start), Ok(end)) => {
                Some(AlrExperimentSettings {
                    pacing_factor,
                    max_paced_queue_time: TimeDelta::from_millis(max_queue_ms),
                    alr_start_usage_percent: start,
                    alr_end_usage_percent: end,
                })
            }
            _ => {
                log::warn!("invalid experiment settings: {}", group);
                None
            }
        }
    }
}

/// AlrDetector watches the rate actually sent against the estimated
/// capacity and flags the application limited region: the sender has less
/// to send than the path could carry. Bandwidth in ALR is unused and the
/// estimate can only be grown there by probing.
pub struct AlrDetector {
    alr_start_usage_percent: i64,
    alr_end_usage_percent: i64,
    rate: RateStatistics,
    estimated_bitrate: DataRate,
    alr_started_time: Option<Timestamp>,
}

impl AlrDetector {
    pub fn new(key_value_config: &dyn KeyValueConfig) -> Self {
        let experiment = AlrExperimentSettings::parse_from_trial(key_value_config);
        let (alr_start_usage_percent, alr_end_usage_percent) = match experiment {
            Some(settings) => (
                settings.alr_start_usage_percent,
                settings.alr_end_usage_percent,
            ),
            None => (
                DEFAULT_ALR_START_USAGE_PERCENT,
                DEFAULT_ALR_END_USAGE_PERCENT,
            ),
        };
        AlrDetector {
            alr_start_usage_percent,
            alr_end_usage_percent,
            rate: RateStatistics::new(MEASUREMENT_PERIOD),
            estimated_bitrate: DataRate::zero(),
            alr_started_time: None,
        }
    }

    pub fn on_bytes_sent(&mut self, bytes_sent: DataSize, send_time: Timestamp) {
        debug_assert!(!self.estimated_bitrate.is_zero());

        self.rate.update(bytes_sent, send_time);
        let rate = match self.rate.rate(send_time) {
            Some(rate) => rate,
            None => return,
        };

        let percentage = rate.bps() * 100 / self.estimated_bitrate.bps();
        if percentage < self.alr_start_usage_percent && self.alr_started_time.is_none() {
            self.alr_started_time = Some(send_time);
        } else if percentage > self.alr_end_usage_percent && self.alr_started_time.is_some() {
            self.alr_started_time = None;
        }
    }

    pub fn set_estimated_bitrate(&mut self, bitrate: DataRate) {
        debug_assert!(!bitrate.is_zero());
        self.estimated_bitrate = bitrate;
    }

    /// application_limited_region_start_time reports when the current ALR
    /// began, or `None` while the sender is keeping the link busy.
    pub fn application_limited_region_start_time(&self) -> Option<Timestamp> {
        self.alr_started_time
    }
}
