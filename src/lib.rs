pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod host_filter;
pub mod jitter;
pub mod lifecycle;
pub mod pipeline;
pub mod prober;
pub mod probes;
pub mod rds;
pub mod servers;
pub mod surfacers;
pub mod sysvars;
pub mod targets;

pub use cadence_common::{MeasurementEvent, MetricKind, Value};
pub use error::{CadenceError, Code, Result};
pub use prober::{Prober, ProberBuilder};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
