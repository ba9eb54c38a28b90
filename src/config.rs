use std::{path::PathBuf, time::Duration};

use anyhow::{ensure, Context, Result};

pub const DEFAULT_DEVICE: &str = "/dev/dri/card0";

#[derive(Debug, Clone)]
pub struct Config {
    pub device: PathBuf,
    /// wall-clock deadline of the presentation loop
    pub duration: Duration,
    /// modulus of the per-frame colour step
    pub color_step: u8,
    /// upper bound of a single readiness wait
    pub tick: Duration,
    /// how long shutdown waits for outstanding page-flips
    pub drain_timeout: Duration,
    pub watch_stdin: bool,
    pub log_file: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.into(),
            duration: Duration::from_secs(5),
            color_step: 5,
            tick: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(2),
            watch_stdin: true,
            log_file: false,
        }
    }
}

impl Config {
    /// the device path is the first argument, everything else comes from `STROBE_*` variables
    pub fn setup() -> Result<Config> {
        Self::from_sources(std::env::args().skip(1), |key| std::env::var(key).ok())
    }

    fn from_sources(
        mut args: impl Iterator<Item = String>,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<Config> {
        let mut config = Config::default();

        if let Some(device) = args.next() {
            config.device = device.into();
        }

        if let Some(secs) = var("STROBE_DURATION_SECS") {
            let secs = secs.parse().context("invalid STROBE_DURATION_SECS")?;
            config.duration = Duration::from_secs(secs);
        }

        if let Some(step) = var("STROBE_COLOR_STEP") {
            config.color_step = step.parse().context("invalid STROBE_COLOR_STEP")?;
            ensure!(config.color_step > 0, "STROBE_COLOR_STEP must be at least 1");
        }

        config.watch_stdin = !flag(&var, "STROBE_NO_STDIN");
        config.log_file = flag(&var, "STROBE_LOG_FILE");

        Ok(config)
    }
}

fn flag(var: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    matches!(var(key).as_deref(), Some("1"))
}
