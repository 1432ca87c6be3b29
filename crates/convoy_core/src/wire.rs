//! Wire protocol: telemetry packets, broadcast frames and command strings.
//!
//! Every format here is consumed or produced by vehicle firmware, so the
//! encodings are byte-exact:
//!
//! ```text
//! inbound telemetry   CAR1:1.00,2.00,90.0,7.4,0.5,0.0,0.0
//! broadcast frame     [2 C1 1.00 2.00 90.0 0.5000 0.0000 0.0000 C2 ...]
//! navigation          [C,CAR1,1.50,2.30,45.0]
//! formation           [F,S,CAR1,line] [F,L,CAR1] [F,F,CAR1,-0.7,0,0] [F,T] [F,U,...]
//! topology            [T,M,0,1,1,1,...] [T,E,1]
//! reconnect ack       RECONNECT_ACK:CAR1,SERVER_READY
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::car::Car;
use crate::formation::Offset;
use crate::topology::Matrix;

/// Number of numeric fields that follow the identifier in a telemetry packet.
pub const TELEMETRY_FIELDS: usize = 7;

/// Reasons an inbound datagram was dropped.
///
/// None of these are operational failures: the telemetry channel is noisy and
/// the receive loop simply discards whatever does not decode.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WireError {
    #[error("datagram is not valid UTF-8")]
    Utf8,
    #[error("empty datagram")]
    Empty,
    #[error("expected exactly one ':' separator")]
    MissingSeparator,
    #[error("empty car identifier")]
    EmptyId,
    #[error("expected {TELEMETRY_FIELDS} fields, got {0}")]
    FieldCount(usize),
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    #[error("non-finite value in field {0}")]
    NonFinite(usize),
}

/// Pose, battery and velocity reported by one car.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Telemetry {
    /// Position in metres.
    pub x: f64,
    pub y: f64,
    /// Heading in degrees.
    pub yaw: f64,
    /// Battery voltage.
    pub voltage: f64,
    /// Velocity in m/s.
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
}

/// A decoded inbound telemetry datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryPacket {
    pub car_id: String,
    pub telemetry: Telemetry,
}

impl TelemetryPacket {
    /// Decode a raw UDP payload.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let text = std::str::from_utf8(payload).map_err(|_| WireError::Utf8)?;
        Self::parse(text)
    }

    /// Parse `<ID>:<x>,<y>,<yaw>,<voltage>,<vx>,<vy>,<vz>`.
    pub fn parse(text: &str) -> Result<Self, WireError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(WireError::Empty);
        }

        let mut parts = text.split(':');
        let (Some(id), Some(body), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(WireError::MissingSeparator);
        };

        let car_id = id.trim();
        if car_id.is_empty() {
            return Err(WireError::EmptyId);
        }

        let fields: Vec<&str> = body.split(',').collect();
        if fields.len() != TELEMETRY_FIELDS {
            return Err(WireError::FieldCount(fields.len()));
        }

        let mut values = [0.0f64; TELEMETRY_FIELDS];
        for (i, field) in fields.iter().enumerate() {
            let field = field.trim();
            let value: f64 = field
                .parse()
                .map_err(|_| WireError::InvalidNumber(field.to_string()))?;
            if !value.is_finite() {
                return Err(WireError::NonFinite(i));
            }
            values[i] = value;
        }

        let [x, y, yaw, voltage, vx, vy, vz] = values;
        Ok(Self {
            car_id: car_id.to_string(),
            telemetry: Telemetry {
                x,
                y,
                yaw,
                voltage,
                vx,
                vy,
                vz,
            },
        })
    }
}

/// Compact identifier used inside broadcast frames: `CAR1` → `C1`.
pub fn short_id(car_id: &str) -> String {
    match car_id.chars().last() {
        Some(c) => format!("C{c}"),
        None => "C".to_string(),
    }
}

/// One car block inside a broadcast frame.
pub fn encode_car_block(car: &Car) -> String {
    format!(
        "{} {:.2} {:.2} {:.1} {:.4} {:.4} {:.4}",
        short_id(&car.id),
        car.position.x,
        car.position.y,
        car.heading,
        car.velocity.vx,
        car.velocity.vy,
        car.velocity.vz
    )
}

/// Build one broadcast frame for a group of cars.
pub fn encode_frame(cars: &[Car]) -> String {
    let mut frame = format!("[{}", cars.len());
    for car in cars {
        frame.push(' ');
        frame.push_str(&encode_car_block(car));
    }
    frame.push(']');
    frame
}

/// Acknowledgment sent to a car after it (re)joins.
pub fn reconnect_ack(car_id: &str) -> String {
    format!("RECONNECT_ACK:{car_id},SERVER_READY")
}

/// Outbound command vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `[C,id,x,y,heading]`: absolute navigation target.
    Navigate {
        car_id: String,
        x: f64,
        y: f64,
        heading: f64,
    },
    /// `[F,S,leader,type]`
    FormationStart {
        leader: String,
        formation_type: String,
    },
    /// `[F,L,id]`
    AssignLeader { car_id: String },
    /// `[F,F,leader,dx,dy,dyaw]`
    AssignFollower { leader: String, offset: Offset },
    /// `[F,T]`
    FormationStop,
    /// `[F,U,leader,dx,dy,dyaw]`
    OffsetUpdate { leader: String, offset: Offset },
    /// `[T,M,<16 cells>]`
    TopologySet(Matrix),
    /// `[T,E,0|1]`
    TopologyEnable(bool),
    /// `FORMATION:CUSTOM,leader` (legacy custom vocabulary)
    LegacyCustomStart { leader: String },
    /// `FORMATION:LEADER,CUSTOM`
    LegacyCustomLeader,
    /// `FORMATION:FOLLOWER,leader,dx,dy,dyaw`
    LegacyCustomFollower { leader: String, offset: Offset },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Navigate {
                car_id,
                x,
                y,
                heading,
            } => write!(f, "[C,{car_id},{x:.2},{y:.2},{heading:.1}]"),
            Self::FormationStart {
                leader,
                formation_type,
            } => write!(f, "[F,S,{leader},{formation_type}]"),
            Self::AssignLeader { car_id } => write!(f, "[F,L,{car_id}]"),
            Self::AssignFollower { leader, offset } => write!(
                f,
                "[F,F,{leader},{},{},{}]",
                offset.x, offset.y, offset.yaw
            ),
            Self::FormationStop => f.write_str("[F,T]"),
            Self::OffsetUpdate { leader, offset } => write!(
                f,
                "[F,U,{leader},{},{},{}]",
                offset.x, offset.y, offset.yaw
            ),
            Self::TopologySet(matrix) => {
                f.write_str("[T,M,")?;
                f.write_str(&flatten_matrix(matrix))?;
                f.write_str("]")
            }
            Self::TopologyEnable(enabled) => write!(f, "[T,E,{}]", u8::from(*enabled)),
            Self::LegacyCustomStart { leader } => write!(f, "FORMATION:CUSTOM,{leader}"),
            Self::LegacyCustomLeader => f.write_str("FORMATION:LEADER,CUSTOM"),
            Self::LegacyCustomFollower { leader, offset } => write!(
                f,
                "FORMATION:FOLLOWER,{leader},{},{},{}",
                offset.x, offset.y, offset.yaw
            ),
        }
    }
}

/// Row-major comma-separated cells, as carried by `[T,M,...]`.
pub fn flatten_matrix(matrix: &Matrix) -> String {
    matrix
        .iter()
        .flat_map(|row| row.iter())
        .map(|cell| cell.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
