mod logging;

pub use logging::{build_env_filter, init, LogFormat, TelemetryConfig, TelemetryError, TelemetryGuard};
