//! Communication topology: which cars need which other cars' data.
//!
//! The matrix is indexed by the fixed roster order `CAR1..CAR4`:
//! `matrix[observer][observed] == 1` means the observer needs the observed
//! car's state. Identifiers outside the roster are never filtered.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::car::Car;
use crate::error::FleetError;

/// Number of cars the matrix can describe.
pub const ROSTER_SIZE: usize = 4;

/// Roster order used for matrix indices.
pub const ROSTER: [&str; ROSTER_SIZE] = ["CAR1", "CAR2", "CAR3", "CAR4"];

/// Adjacency matrix, row = observer, column = observed.
pub type Matrix = [[u8; ROSTER_SIZE]; ROSTER_SIZE];

/// Matrix installed at startup: CAR1 observes every other car.
pub const DEFAULT_MATRIX: Matrix = [[0, 1, 1, 1], [0, 0, 0, 0], [0, 0, 0, 0], [0, 0, 0, 0]];

/// Roster index of a car identifier.
pub fn roster_index(car_id: &str) -> Option<usize> {
    ROSTER.iter().position(|id| *id == car_id)
}

/// Validate an untyped matrix from an external request.
pub fn parse_matrix(rows: &[Vec<i64>]) -> Result<Matrix, FleetError> {
    if rows.len() != ROSTER_SIZE {
        return Err(FleetError::validation(format!(
            "topology matrix must have {ROSTER_SIZE} rows, got {}",
            rows.len()
        )));
    }

    let mut matrix = [[0u8; ROSTER_SIZE]; ROSTER_SIZE];
    for (i, row) in rows.iter().enumerate() {
        if row.len() != ROSTER_SIZE {
            return Err(FleetError::validation(format!(
                "topology row {i} must have {ROSTER_SIZE} cells, got {}",
                row.len()
            )));
        }
        for (j, cell) in row.iter().enumerate() {
            matrix[i][j] = match cell {
                0 => 0,
                1 => 1,
                other => {
                    return Err(FleetError::validation(format!(
                        "topology cell ({i},{j}) must be 0 or 1, got {other}"
                    )));
                }
            };
        }
    }
    Ok(matrix)
}

/// Serializable view of the topology configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub matrix: Matrix,
    pub enabled: bool,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            matrix: DEFAULT_MATRIX,
            enabled: false,
        }
    }
}

/// Topology matrix with its derived visibility cache.
#[derive(Debug, Clone)]
pub struct TopologyMatrix {
    matrix: Matrix,
    enabled: bool,
    visible: BTreeMap<&'static str, Vec<&'static str>>,
}

impl TopologyMatrix {
    pub fn new(matrix: Matrix, enabled: bool) -> Self {
        let mut topology = Self {
            matrix,
            enabled,
            visible: BTreeMap::new(),
        };
        topology.rebuild_cache();
        topology
    }

    pub fn from_config(config: &TopologyConfig) -> Self {
        Self::new(config.matrix, config.enabled)
    }

    pub fn config(&self) -> TopologyConfig {
        TopologyConfig {
            matrix: self.matrix,
            enabled: self.enabled,
        }
    }

    pub fn matrix(&self) -> &Matrix {
        &self.matrix
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Replace the matrix and the enable flag together.
    pub fn set(&mut self, matrix: Matrix, enabled: bool) {
        self.matrix = matrix;
        self.enabled = enabled;
        self.rebuild_cache();
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.rebuild_cache();
    }

    /// Whether the car's state should go out in broadcast frames.
    ///
    /// A roster car is included iff some *other* roster car needs its data.
    pub fn is_broadcast(&self, car_id: &str) -> bool {
        if !self.enabled {
            return true;
        }
        let Some(k) = roster_index(car_id) else {
            return true;
        };
        (0..ROSTER_SIZE).any(|i| i != k && self.matrix[i][k] == 1)
    }

    /// Keep only the cars whose data some other car needs.
    pub fn filter(&self, cars: Vec<Car>) -> Vec<Car> {
        cars.into_iter()
            .filter(|car| {
                let keep = self.is_broadcast(&car.id);
                if !keep {
                    debug!("Topology filter: {} not needed by any car", car.id);
                }
                keep
            })
            .collect()
    }

    /// Cars that may observe `car_id`.
    ///
    /// With the topology disabled every roster car is reported.
    pub fn visible_cars(&self, car_id: &str) -> Vec<String> {
        if !self.enabled {
            return ROSTER.iter().map(|id| id.to_string()).collect();
        }
        self.visible
            .get(car_id)
            .map(|ids| ids.iter().map(|id| id.to_string()).collect())
            .unwrap_or_default()
    }

    fn rebuild_cache(&mut self) {
        self.visible.clear();
        for (t, target) in ROSTER.iter().enumerate() {
            let observers = ROSTER
                .iter()
                .enumerate()
                .filter(|(o, _)| *o != t && self.matrix[*o][t] == 1)
                .map(|(_, id)| *id)
                .collect();
            self.visible.insert(*target, observers);
        }
        debug!("Topology cache rebuilt: {:?}", self.visible);
    }
}

impl Default for TopologyMatrix {
    fn default() -> Self {
        Self::from_config(&TopologyConfig::default())
    }
}
