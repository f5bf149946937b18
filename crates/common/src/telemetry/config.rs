/// Configuration for telemetry initialization
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub log_level: String,
    /// Include span context on every log line
    pub with_spans: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "lifecycle-worker".to_string(),
            log_level: "info".to_string(),
            with_spans: true,
        }
    }
}
