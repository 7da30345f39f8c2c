//! Small ffmpeg argument helpers shared across generators (spec §4.2).

use crate::config::EngineConfig;

/// `["-threads", "N"]` or empty when threads are left to ffmpeg's own "auto"
/// heuristic.
pub fn thread_flags(config: &EngineConfig) -> Vec<String> {
    match config.ffmpeg_threads {
        Some(n) if n > 0 => vec!["-threads".to_string(), n.to_string()],
        _ => Vec::new(),
    }
}

/// `["-hwaccel", VALUE]` or empty when no hardware acceleration is configured.
pub fn hwaccel_flags(config: &EngineConfig) -> Vec<String> {
    match &config.ffmpeg_hwaccel {
        Some(value) if !value.trim().is_empty() => {
            vec!["-hwaccel".to_string(), value.clone()]
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_flags_empty_when_auto() {
        let cfg = EngineConfig::default();
        assert!(thread_flags(&cfg).is_empty());
    }

    #[test]
    fn hwaccel_flags_empty_when_unset() {
        let cfg = EngineConfig::default();
        assert!(hwaccel_flags(&cfg).is_empty());
    }
}
