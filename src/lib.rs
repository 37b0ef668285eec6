#![warn(rust_2018_idioms)]

//! Send-side bandwidth estimation for RTP senders: per-packet transport
//! feedback is turned into a delay gradient signal and a loss signal,
//! which drive a delay based controller and a loss based controller. The
//! emitted target rate is the lower of the two, together with pacing and
//! probing instructions for the pacer.

pub mod alr;
pub mod config;
pub mod controller;
pub mod delay_based;
mod error;
pub mod feedback;
pub mod grouping;
pub mod loss_based;
pub mod probe;
pub mod rate;
pub mod trendline;
pub mod types;
pub mod units;

pub use config::{FieldTrials, KeyValueConfig};
pub use controller::{DebugState, NetworkController, NetworkControllerObserver};
pub use error::Error;
pub use feedback::{
    PacketFeedbackObserver, PacketSendInfo, SentPacketInfo, TransportFeedbackAdapter,
};
pub use trendline::BandwidthUsage;
pub use types::*;
pub use units::{DataRate, DataSize, TimeDelta, Timestamp};
