//! Formation vocabulary: offsets, presets and the coordinator state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Follower offset relative to the leader (metres, metres, degrees).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Offset {
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
}

impl Offset {
    pub const fn new(x: f64, y: f64, yaw: f64) -> Self {
        Self { x, y, yaw }
    }
}

/// Per-car offsets keyed by car identifier.
pub type OffsetMap = BTreeMap<String, Offset>;

/// Formation used when the requested type has no preset.
pub const FALLBACK_FORMATION: &str = "line";

/// Built-in formation presets.
pub fn default_presets() -> BTreeMap<String, OffsetMap> {
    let preset = |offsets: [(f64, f64); 4]| -> OffsetMap {
        offsets
            .iter()
            .enumerate()
            .map(|(i, (x, y))| (format!("CAR{}", i + 1), Offset::new(*x, *y, 0.0)))
            .collect()
    };

    BTreeMap::from([
        (
            "line".to_string(),
            preset([(0.0, 0.0), (-0.7, 0.0), (-1.4, 0.0), (-2.1, 0.0)]),
        ),
        (
            "Diamond".to_string(),
            preset([(0.0, 0.0), (-0.7, -0.7), (-0.7, 0.7), (-1.4, 0.0)]),
        ),
        (
            "square".to_string(),
            preset([(0.0, 0.0), (0.0, -0.7), (-0.7, -0.7), (-0.7, 0.0)]),
        ),
    ])
}

/// Which vocabulary custom formations are sent in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomEncoding {
    /// `FORMATION:CUSTOM,...` strings understood by older firmware.
    #[default]
    Legacy,
    /// The bracketed `[F,...]` scheme used by preset formations.
    Bracketed,
}

/// Process-wide formation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormationState {
    /// Whether formation control is running.
    pub enabled: bool,
    /// Current or most recent leader. Kept after a stop.
    pub leader: Option<String>,
    /// Requested formation type, e.g. `line` or `custom`.
    pub formation_type: String,
}

impl Default for FormationState {
    fn default() -> Self {
        Self {
            enabled: false,
            leader: None,
            formation_type: FALLBACK_FORMATION.to_string(),
        }
    }
}

impl FormationState {
    /// Leader of the running formation, if any.
    pub fn active_leader(&self) -> Option<&str> {
        if self.enabled {
            self.leader.as_deref()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_presets() {
        let presets = default_presets();
        assert_eq!(presets.len(), 3);

        let line = &presets["line"];
        assert_eq!(line["CAR1"], Offset::default());
        assert_eq!(line["CAR4"], Offset::new(-2.1, 0.0, 0.0));

        let diamond = &presets["Diamond"];
        assert_eq!(diamond["CAR3"], Offset::new(-0.7, 0.7, 0.0));

        assert!(presets.contains_key(FALLBACK_FORMATION));
    }

    #[test]
    fn test_state_defaults_to_idle() {
        let state = FormationState::default();
        assert!(!state.enabled);
        assert!(state.active_leader().is_none());
        assert_eq!(state.formation_type, "line");
    }

    #[test]
    fn test_custom_encoding_serde() {
        let json = serde_json::to_string(&CustomEncoding::Bracketed).unwrap();
        assert_eq!(json, "\"bracketed\"");
        let parsed: CustomEncoding = serde_json::from_str("\"legacy\"").unwrap();
        assert_eq!(parsed, CustomEncoding::Legacy);
    }
}
