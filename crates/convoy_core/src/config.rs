//! Fleet server configuration.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FleetError;
use crate::formation::{CustomEncoding, OffsetMap, default_presets};
use crate::topology::TopologyConfig;

/// Configuration for the fleet control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Address the telemetry/command socket binds to.
    #[serde(with = "socket_addr_serde")]
    pub telemetry_addr: SocketAddr,

    /// Destination UDP port for broadcast frames and global commands.
    pub broadcast_port: u16,

    /// Local port the broadcast socket binds to. `0` picks an ephemeral port.
    pub broadcast_bind_port: u16,

    /// Subnet broadcast address. `None` means detect it at startup.
    pub broadcast_addr: Option<Ipv4Addr>,

    /// Whether the periodic broadcast starts enabled.
    pub broadcast_enabled: bool,

    /// Period of the broadcast scheduler.
    #[serde(with = "duration_ms")]
    pub broadcast_interval: Duration,

    /// Maximum number of cars per broadcast frame.
    pub broadcast_group_size: usize,

    /// Pause between consecutive frames of one cycle.
    #[serde(with = "duration_ms")]
    pub group_delay: Duration,

    /// Cars silent for longer than this are left out of broadcast frames.
    #[serde(with = "duration_ms")]
    pub freshness_window: Duration,

    /// Period of the liveness check.
    #[serde(with = "duration_ms")]
    pub health_interval: Duration,

    /// Silence after which a car is marked disconnected.
    #[serde(with = "duration_ms")]
    pub liveness_timeout: Duration,

    /// Period of the reaper.
    #[serde(with = "duration_ms")]
    pub reap_interval: Duration,

    /// Silence after which a disconnected car is forgotten.
    #[serde(with = "duration_ms")]
    pub retention_timeout: Duration,

    /// Attempts per reliable unicast command.
    pub unicast_attempts: u32,

    /// Pause between reliable unicast attempts.
    #[serde(with = "duration_ms")]
    pub unicast_retry_delay: Duration,

    /// Repeats per global broadcast command.
    pub broadcast_command_repeats: u32,

    /// Pause between global broadcast command repeats.
    #[serde(with = "duration_ms")]
    pub broadcast_command_delay: Duration,

    /// Vocabulary used for custom formations.
    pub custom_formation_encoding: CustomEncoding,

    /// Named formation presets.
    pub formation_presets: BTreeMap<String, OffsetMap>,

    /// Topology installed at startup.
    pub topology: TopologyConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            telemetry_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            broadcast_port: 8081,
            broadcast_bind_port: 8081,
            broadcast_addr: None,
            broadcast_enabled: false,
            broadcast_interval: Duration::from_millis(70),
            broadcast_group_size: 1,
            group_delay: Duration::from_millis(10),
            freshness_window: Duration::from_secs(3),
            health_interval: Duration::from_secs(2),
            liveness_timeout: Duration::from_secs(5),
            reap_interval: Duration::from_secs(10),
            retention_timeout: Duration::from_secs(60),
            unicast_attempts: 4,
            unicast_retry_delay: Duration::from_millis(50),
            broadcast_command_repeats: 5,
            broadcast_command_delay: Duration::from_millis(10),
            custom_formation_encoding: CustomEncoding::default(),
            formation_presets: default_presets(),
            topology: TopologyConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Default config location: `<config dir>/convoy/config.json`.
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let base = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine config directory"))?;
        Ok(base.join("convoy").join("config.json"))
    }

    /// Reject values that would stall or spin the loops.
    pub fn validate(&self) -> Result<(), FleetError> {
        if self.broadcast_interval.is_zero() {
            return Err(FleetError::validation("broadcast_interval must be > 0"));
        }
        if self.broadcast_group_size == 0 {
            return Err(FleetError::validation("broadcast_group_size must be > 0"));
        }
        if self.unicast_attempts == 0 {
            return Err(FleetError::validation("unicast_attempts must be > 0"));
        }
        if self.broadcast_command_repeats == 0 {
            return Err(FleetError::validation(
                "broadcast_command_repeats must be > 0",
            ));
        }
        if self.health_interval.is_zero() || self.reap_interval.is_zero() {
            return Err(FleetError::validation(
                "health_interval and reap_interval must be > 0",
            ));
        }
        Ok(())
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> Result<Self, FleetError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Load config from a JSON file, or return defaults if the file is
    /// missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring config file {}: {e}", path.display());
                Self::default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
