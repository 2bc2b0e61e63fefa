//! Relay configuration loaded from TOML.

use std::net::IpAddr;
use std::path::PathBuf;

use micphone_audio::{MixerConfig, SinkConfig};
use micphone_discovery::DiscoveryTarget;
use micphone_rendezvous::RendezvousConfig;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub rendezvous: RendezvousSection,
    #[serde(default)]
    pub audio: AudioConfig,
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// Default tracing filter; `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Which advertised service to look for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// When false the relay only serves the rendezvous socket.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// DNS-SD type to browse, with or without the `local.` domain.
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Instance name of the peer relay.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_type: default_service_type(),
            service_name: default_service_name(),
        }
    }
}

/// Rendezvous socket settings. The port is always ephemeral.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousSection {
    /// IP address to listen on.
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for RendezvousSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Playback of the mixed signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Mono 16-bit samples per second, for peers and output alike.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,
    /// Per-stream buffer cap before the oldest samples are dropped.
    #[serde(default = "default_max_buffered_samples")]
    pub max_buffered_samples: usize,
    /// Raw PCM output file; stdout when unset.
    #[serde(default)]
    pub output: Option<PathBuf>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            frame_ms: default_frame_ms(),
            max_buffered_samples: default_max_buffered_samples(),
            output: None,
        }
    }
}

impl Config {
    pub fn discovery_target(&self) -> DiscoveryTarget {
        DiscoveryTarget::new(
            self.discovery.service_type.clone(),
            self.discovery.service_name.clone(),
        )
    }

    pub fn rendezvous_config(&self) -> Result<RendezvousConfig, RelayError> {
        let bind: IpAddr = self.rendezvous.bind.parse().map_err(|e| {
            RelayError::Config(format!("invalid bind address {:?}: {e}", self.rendezvous.bind))
        })?;
        Ok(RendezvousConfig { bind })
    }

    pub fn sink_config(&self) -> SinkConfig {
        SinkConfig {
            sample_rate: self.audio.sample_rate,
            frame_ms: self.audio.frame_ms,
        }
    }

    pub fn mixer_config(&self) -> MixerConfig {
        MixerConfig {
            max_buffered_samples: self.audio.max_buffered_samples,
        }
    }

    /// Check settings that serde alone cannot.
    pub fn validate(&self) -> Result<(), RelayError> {
        self.rendezvous_config()?;
        if self.discovery.service_name.trim().is_empty() {
            return Err(RelayError::Config("discovery.service_name is empty".into()));
        }
        if !self.discovery.service_type.starts_with('_') {
            return Err(RelayError::Config(format!(
                "discovery.service_type {:?} is not a DNS-SD service type",
                self.discovery.service_type
            )));
        }
        if self.audio.sample_rate == 0 || self.audio.frame_ms == 0 {
            return Err(RelayError::Config(
                "audio.sample_rate and audio.frame_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_service_type() -> String {
    micphone_types::DEFAULT_SERVICE_TYPE.to_string()
}

fn default_service_name() -> String {
    micphone_types::DEFAULT_SERVICE_NAME.to_string()
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_sample_rate() -> u32 {
    48_000
}

fn default_frame_ms() -> u32 {
    20
}

fn default_max_buffered_samples() -> usize {
    MixerConfig::default().max_buffered_samples
}
