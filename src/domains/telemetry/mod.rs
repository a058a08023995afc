pub mod client;
pub mod sink;


pub use client::{
    default_data_dir, HandlerRegistration, TelemetryClient, TelemetryError, IDENTIFIER_FILE,
};
pub use sink::{MetricsSink, MixpanelConfig, MixpanelSink};
