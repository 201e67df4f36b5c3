pub mod telemetry;

pub use telemetry::{TelemetryError, TelemetryGuard, setup_telemetry};
