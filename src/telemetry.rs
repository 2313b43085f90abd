//! `tracing-subscriber` setup for binaries embedding this crate.
//!
//! Mirrors the teacher's `EnvFilter` + `fmt` subscriber wiring; unlike the
//! teacher, PetalFlow's adapter plane and health scheduler are daemon-facing
//! and instrument unconditionally rather than treating tracing as an
//! optional consumer concern.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global `tracing` subscriber reading `RUST_LOG` (default
/// `info`), with ANSI color when the output is a terminal. Safe to call
/// once per process; a second call is a no-op error that callers may
/// ignore.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
