//! Parsing for ffmpeg's `-progress pipe:1` key=value stream (spec §4.3,
//! §9 "Progress reporting from ffmpeg").

#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressSample {
    pub out_time_seconds: Option<f64>,
    pub speed: Option<f64>,
    pub frame: Option<u64>,
    pub is_end: bool,
}

pub fn parse_progress_line(line: &str, acc: &mut ProgressSample) {
    let Some((key, value)) = line.split_once('=') else { return };
    let key = key.trim();
    let value = value.trim();
    match key {
        "out_time_ms" => {
            if let Ok(us) = value.parse::<f64>() {
                acc.out_time_seconds = Some(us / 1_000_000.0);
            }
        }
        "out_time" => {
            acc.out_time_seconds = Some(parse_hms(value));
        }
        "speed" => {
            let trimmed = value.trim_end_matches('x');
            acc.speed = trimmed.parse::<f64>().ok();
        }
        "frame" => {
            acc.frame = value.parse::<u64>().ok();
        }
        "progress" => {
            acc.is_end = value.eq_ignore_ascii_case("end");
        }
        _ => {}
    }
}

fn parse_hms(s: &str) -> f64 {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() == 3 {
        let h: f64 = parts[0].parse().unwrap_or(0.0);
        let m: f64 = parts[1].parse().unwrap_or(0.0);
        let sec: f64 = parts[2].parse().unwrap_or(0.0);
        h * 3600.0 + m * 60.0 + sec
    } else {
        s.parse().unwrap_or(0.0)
    }
}

/// Maps elapsed encoder output seconds onto a 0..100 percentage given a
/// known total duration.
pub fn elapsed_to_percent(total_duration: Option<f64>, elapsed_seconds: f64) -> f64 {
    match total_duration {
        Some(total) if total.is_finite() && total > 0.0 => {
            let elapsed = if elapsed_seconds.is_finite() && elapsed_seconds > 0.0 {
                elapsed_seconds
            } else {
                0.0
            };
            (elapsed / total * 100.0).clamp(0.0, 100.0)
        }
        _ => 0.0,
    }
}

/// A watchdog that fires when no progress token has been observed for the
/// configured idle window (spec §4.4.3 "stall watchdog").
pub struct StallWatchdog {
    last_progress_at: std::time::Instant,
    warn_after: std::time::Duration,
    kill_after: std::time::Duration,
    warned: bool,
}

pub enum WatchdogState {
    Ok,
    Warn,
    Kill,
}

impl StallWatchdog {
    pub fn new(warn_after: std::time::Duration, kill_after: std::time::Duration) -> Self {
        Self {
            last_progress_at: std::time::Instant::now(),
            warn_after,
            kill_after,
            warned: false,
        }
    }

    pub fn mark_progress(&mut self) {
        self.last_progress_at = std::time::Instant::now();
        self.warned = false;
    }

    pub fn idle(&self) -> std::time::Duration {
        self.last_progress_at.elapsed()
    }

    /// Threshold comparisons only; callers that want "0 disables this
    /// watchdog" (spec §4.2's convention for the per-command timeout)
    /// should substitute `Duration::MAX` for a disabled threshold before
    /// constructing the watchdog, same as they would for any other
    /// never-fires deadline.
    pub fn poll(&mut self) -> WatchdogState {
        let idle = self.idle();
        if idle >= self.kill_after {
            WatchdogState::Kill
        } else if !self.warned && idle >= self.warn_after {
            self.warned = true;
            WatchdogState::Warn
        } else {
            WatchdogState::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_out_time_ms_and_speed() {
        let mut acc = ProgressSample::default();
        parse_progress_line("out_time_ms=2500000", &mut acc);
        parse_progress_line("speed=1.5x", &mut acc);
        parse_progress_line("progress=continue", &mut acc);
        assert_eq!(acc.out_time_seconds, Some(2.5));
        assert_eq!(acc.speed, Some(1.5));
        assert!(!acc.is_end);
    }

    #[test]
    fn recognizes_progress_end() {
        let mut acc = ProgressSample::default();
        parse_progress_line("progress=end", &mut acc);
        assert!(acc.is_end);
    }

    #[test]
    fn elapsed_to_percent_clamps() {
        assert_eq!(elapsed_to_percent(Some(10.0), 20.0), 100.0);
        assert_eq!(elapsed_to_percent(Some(10.0), -5.0), 0.0);
        assert_eq!(elapsed_to_percent(None, 5.0), 0.0);
    }

    #[test]
    fn watchdog_kills_after_idle_window() {
        let mut wd = StallWatchdog::new(
            std::time::Duration::from_millis(0),
            std::time::Duration::from_millis(0),
        );
        assert!(matches!(wd.poll(), WatchdogState::Kill));
        wd.mark_progress();
        // immediately after marking progress, idle is ~0 but kill_after is
        // also 0 so it still reports Kill; use a nonzero window to see Ok.
        let mut wd2 = StallWatchdog::new(
            std::time::Duration::from_secs(60),
            std::time::Duration::from_secs(120),
        );
        assert!(matches!(wd2.poll(), WatchdogState::Ok));
    }
}
