use std::time::Duration;

use veriface_core::{BlinkStrategy, LivenessConfig};

/// Liveness tuning from `VERIFACE_*` variables, defaults otherwise.
pub fn liveness_config_from_env() -> LivenessConfig {
    liveness_config_with(|key| std::env::var(key).ok())
}

fn liveness_config_with(lookup: impl Fn(&str) -> Option<String>) -> LivenessConfig {
    let parse_f32 = |key: &str| lookup(key).and_then(|v| v.parse::<f32>().ok());
    let parse_u64 = |key: &str| {
        lookup(key)
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
    };

    let mut config = LivenessConfig::default();
    if let Some(v) = parse_f32("VERIFACE_MATCH_THRESHOLD") {
        config.matcher.threshold = v;
    }
    if let Some(v) = parse_f32("VERIFACE_EAR_THRESHOLD") {
        config.blink.ear_threshold = v;
    }
    if let Some(v) = lookup("VERIFACE_REQUIRED_BLINKS")
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
    {
        config.blink.required_blinks = v;
    }
    match lookup("VERIFACE_BLINK_STRATEGY").as_deref() {
        Some("moving-average") => config.blink.strategy = BlinkStrategy::MovingAverage,
        Some("debounced") | None => {}
        Some(other) => tracing::warn!(value = other, "unknown blink strategy, using debounced"),
    }
    config.antispoof_threshold = parse_f32("VERIFACE_ANTISPOOF_THRESHOLD");
    if let Some(ms) = parse_u64("VERIFACE_TICK_MS") {
        config.tick_interval = Duration::from_millis(ms);
    }
    if let Some(secs) = parse_u64("VERIFACE_ATTEMPT_TIMEOUT_SECS") {
        config.attempt_timeout = Duration::from_secs(secs);
    }
    config
}
