//! A stand-in for the real `ffmpeg`/`ffprobe` binaries, compiled as a
//! harness-less test binary (see `[[test]] harness = false` in
//! `Cargo.toml`) the same way the teacher ships `ffui_mock_ffmpeg.rs`.
//! Integration tests locate the compiled executable via
//! `CARGO_BIN_EXE_mock_ffmpeg` and point `FFMPEG`/`FFPROBE` at it, so
//! `ProcessRunner`/generator behavior (timeouts, cancellation, progress
//! parsing, nonzero exit) can be exercised without a real media toolchain.

use std::env;
use std::time::Duration;

fn main() {
    if env::var("MOCK_FFMPEG_EMIT_PROGRESS").map(|v| v == "1").unwrap_or(false) {
        eprintln!("out_time_ms=0");
        eprintln!("progress=continue");
        eprintln!("out_time_ms=500000");
        eprintln!("progress=continue");
        eprintln!("out_time_ms=1000000");
        eprintln!("progress=end");
    }

    if let Some(stdout_payload) = env::var("MOCK_FFMPEG_STDOUT").ok() {
        print!("{stdout_payload}");
    }

    if let Ok(sleep_ms) = env::var("MOCK_FFMPEG_SLEEP_MS") {
        if let Ok(ms) = sleep_ms.parse::<u64>() {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }

    let exit_code: i32 = env::var("MOCK_FFMPEG_EXIT_CODE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    std::process::exit(exit_code);
}
