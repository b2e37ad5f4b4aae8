/// Balance Tuner Library
///
/// Ground-side gain tuning for a self-balancing robot: telemetry link,
/// trial sampling and scoring, hill-climbing search and the session supervisor
/// shared by the CLI and GUI binaries.

pub mod config_loader;
pub mod gains;
pub mod telemetry;
pub mod udp_link;
pub mod sampler;
pub mod scoring;
pub mod search;
pub mod session;
pub mod manual_tuner;
