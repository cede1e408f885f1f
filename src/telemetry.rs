// Encoder ticks <-> joint angle conversion and per-tick telemetry sampling
//
// Each channel is read on its own. A channel that fails is left out of the
// frame for that tick; publishing zero or a stale angle could make a
// downstream planner command against a position the arm is not in.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::config::JointConfig;
use crate::error::Result;
use crate::messages::TelemetryFrame;
use crate::motor::{Channel, MotorLink};

pub type JointId = u8;

/// Radians counted per output revolution. Matches the scale the arm's
/// existing planner and calibration use; joints may set 2π instead.
pub const DEFAULT_RADIANS_PER_TURN: f64 = 6.28;

/// Encoder ticks to output-shaft angle in radians
pub fn ticks_to_angle(ticks: i32, reduction_ratio: f64, radians_per_turn: f64) -> f64 {
    ticks as f64 / reduction_ratio * radians_per_turn
}

/// Output-shaft angle in radians to encoder ticks, truncated toward zero
pub fn angle_to_ticks(angle: f64, reduction_ratio: f64, radians_per_turn: f64) -> i32 {
    // `as` saturates on overflow and maps NaN to 0
    (angle / radians_per_turn * reduction_ratio).trunc() as i32
}

/// A joint driven by one controller channel, owned by the controller session
#[derive(Debug, Clone)]
pub struct Joint {
    pub id: JointId,
    pub channel: Channel,
    pub reduction_ratio: f64,
    pub radians_per_turn: f64,
    pub last_commanded_angle: Option<f64>,
    pub last_known_ticks: Option<i32>,
}

impl Joint {
    pub fn new(id: JointId, channel: Channel, reduction_ratio: f64) -> Self {
        Self {
            id,
            channel,
            reduction_ratio,
            radians_per_turn: DEFAULT_RADIANS_PER_TURN,
            last_commanded_angle: None,
            last_known_ticks: None,
        }
    }

    pub fn with_radians_per_turn(mut self, radians_per_turn: f64) -> Self {
        self.radians_per_turn = radians_per_turn;
        self
    }

    pub fn to_angle(&self, ticks: i32) -> f64 {
        ticks_to_angle(ticks, self.reduction_ratio, self.radians_per_turn)
    }

    pub fn to_ticks(&self, angle: f64) -> i32 {
        angle_to_ticks(angle, self.reduction_ratio, self.radians_per_turn)
    }
}

impl From<&JointConfig> for Joint {
    fn from(config: &JointConfig) -> Self {
        Joint::new(config.id, config.channel, config.reduction_ratio)
            .with_radians_per_turn(config.radians_per_turn)
    }
}

/// Read one joint's encoder and convert it to radians
pub fn read_joint_angle<L: MotorLink + ?Sized>(link: &mut L, joint: &mut Joint) -> Result<f64> {
    let reading = link.read_encoder(joint.channel)?;
    joint.last_known_ticks = Some(reading.ticks);
    Ok(joint.to_angle(reading.ticks))
}

/// Read every joint, leaving failed channels out of the frame.
///
/// Returns `None` when no joint could be read.
pub fn sample<L: MotorLink + ?Sized>(link: &mut L, joints: &mut [Joint]) -> Option<TelemetryFrame> {
    let mut angles = BTreeMap::new();

    for joint in joints.iter_mut() {
        match read_joint_angle(link, joint) {
            Ok(angle) => {
                debug!("Joint {} on {}: {:.4} rad", joint.id, joint.channel, angle);
                angles.insert(joint.id, angle);
            }
            Err(e) => warn!("Skipping joint {} this tick: {}", joint.id, e),
        }
    }

    if angles.is_empty() {
        if !joints.is_empty() {
            warn!("No encoder could be read this tick, telemetry not published");
        }
        return None;
    }
    Some(TelemetryFrame { angles })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::TAU;

    use crate::motor::sim::{SimOp, SimulatedLink};

    fn arm() -> Vec<Joint> {
        vec![
            Joint::new(0, Channel::M1, 5281.1),
            Joint::new(1, Channel::M2, 5281.1),
        ]
    }

    #[test]
    fn test_one_revolution_scenario() {
        let joint = Joint::new(0, Channel::M1, 5281.1);
        assert!((joint.to_angle(5281) - 6.2798).abs() < 1e-3);
    }

    #[test]
    fn test_exact_full_turn_is_configurable() {
        let joint = Joint::new(0, Channel::M1, 5281.1).with_radians_per_turn(TAU);
        assert!((joint.to_angle(5281) - 6.28307).abs() < 1e-3);
        assert_eq!(joint.to_ticks(TAU), 5281);
    }

    #[test]
    fn test_angle_to_ticks_truncates_toward_zero() {
        assert_eq!(angle_to_ticks(TAU, 100.0, TAU), 100);
        assert_eq!(angle_to_ticks(0.999 * TAU / 100.0, 100.0, TAU), 0);
        assert_eq!(angle_to_ticks(-1.5 * TAU / 100.0, 100.0, TAU), -1);
        assert_eq!(angle_to_ticks(f64::NAN, 100.0, TAU), 0);
    }

    #[test]
    fn test_round_trip_within_one_tick() {
        for ratio in [0.5, 1.0, 64.0, 1000.0, 5281.1, 19_200.0] {
            let joint = Joint::new(0, Channel::M1, ratio);
            for i in -40..=40 {
                let angle = i as f64 * 0.37;
                let back = joint.to_angle(joint.to_ticks(angle));
                let resolution = DEFAULT_RADIANS_PER_TURN / ratio;
                assert!(
                    (back - angle).abs() <= resolution + 1e-9,
                    "ratio {ratio} angle {angle} came back as {back}"
                );
            }
        }
    }

    #[test]
    fn test_failed_channel_does_not_block_other() {
        let mut sim = SimulatedLink::new();
        sim.set_ticks(Channel::M2, 5281);
        sim.fail(SimOp::Encoder(Channel::M1));
        let mut joints = arm();

        let frame = sample(&mut sim, &mut joints).unwrap();

        assert!(!frame.angles.contains_key(&0));
        assert!((frame.angles[&1] - joints[1].to_angle(5281)).abs() < 1e-9);
        assert_eq!(joints[0].last_known_ticks, None);
        assert_eq!(joints[1].last_known_ticks, Some(5281));
    }

    #[test]
    fn test_failed_channel_is_omitted_not_stale() {
        let mut sim = SimulatedLink::new();
        sim.set_ticks(Channel::M1, 1000);
        let mut joints = arm();
        assert!(sample(&mut sim, &mut joints).unwrap().angles.contains_key(&0));

        sim.fail(SimOp::Encoder(Channel::M1));
        let frame = sample(&mut sim, &mut joints).unwrap();
        assert!(!frame.angles.contains_key(&0));
        assert!(frame.angles.contains_key(&1));
    }

    #[test]
    fn test_both_channels_failing_emits_nothing() {
        let mut sim = SimulatedLink::new();
        sim.fail(SimOp::Encoder(Channel::M1));
        sim.fail(SimOp::Encoder(Channel::M2));

        assert!(sample(&mut sim, &mut arm()).is_none());
    }
}
