use std::time::Duration;

use common::utils::config::AppConfig;

/// Pacing knobs for the document loop. Both delays default to zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTuning {
    pub iteration_delay: Duration,
    pub file_delay: Duration,
}

impl RunTuning {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            iteration_delay: Duration::from_millis(config.iteration_delay_ms),
            file_delay: Duration::from_millis(config.file_delay_ms),
        }
    }
}
