pub mod consent;
pub mod telemetry;
