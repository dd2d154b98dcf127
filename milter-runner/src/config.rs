use std::time::Duration;

use config::{Config, File};
use miette::{IntoDiagnostic, Result};
use milter::ActionFlags;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerCfg {
    /// How long a filter may take to answer one event before it is treated as
    /// having answered with a temporary failure.
    pub event_timeout_ms: u64,

    /// How long to wait for abort acknowledgements before escalating to an
    /// unconditional close.
    pub abort_timeout_ms: u64,

    /// Upper bound on a single read from the transport.
    pub read_buffer_size: usize,

    /// Capacity of each filter session's inbox.
    pub channel_capacity: usize,

    /// SMFIF_* bits the registered filters need the MTA to permit. Negotiation
    /// fails if the MTA does not offer all of them.
    pub required_actions: u32,
}

impl Default for RunnerCfg {
    fn default() -> Self {
        RunnerCfg {
            event_timeout_ms: 30_000,
            abort_timeout_ms: 5_000,
            read_buffer_size: 8192,
            channel_capacity: 16,
            required_actions: 0,
        }
    }
}

impl RunnerCfg {
    pub fn load(cfg_path: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(cfg_path))
            .build()
            .into_diagnostic()?;

        let cfg: RunnerCfg = settings.try_deserialize().into_diagnostic()?;

        Ok(cfg)
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }

    pub fn required_actions(&self) -> ActionFlags {
        ActionFlags::from_bits_truncate(self.required_actions)
    }
}
