// Homing: drive joints backward onto their limit switch
//
// Joints are homed one at a time. The controller raises a per-channel "home"
// bit in its error register when the switch closes; a joint is home only when
// the register equals exactly that bit. Any other combination, including the
// home bit alongside an unrelated fault, keeps the joint driving.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::task;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::config::{HomingSettings, JointConfig};
use crate::error::{Error, Result};
use crate::messages::{HomingRequest, HomingResponse};
use crate::motor::link::{self, stop_channels};
use crate::motor::{Channel, MotorLink, SharedLink};
use crate::telemetry::JointId;

/// True when the register reports exactly this channel's home switch
pub fn is_home(bitmask: u16, channel: Channel) -> bool {
    bitmask == channel.home_code()
}

#[derive(Debug, Default)]
struct Claims {
    active: BTreeSet<JointId>,
    /// Bumped every time a joint is claimed
    generation: BTreeMap<JointId, u64>,
}

/// Joints currently owned by a homing run
#[derive(Debug, Clone, Default)]
pub struct HomingCoordinator {
    claims: Arc<Mutex<Claims>>,
}

impl HomingCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Claims> {
        self.claims.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Claim joints for homing. Fails with `Busy` if any of them is already claimed.
    pub fn try_claim(&self, joints: &[JointId]) -> Result<HomingClaim> {
        let mut claims = self.lock();
        let busy: Vec<JointId> = joints
            .iter()
            .copied()
            .filter(|j| claims.active.contains(j))
            .collect();
        if !busy.is_empty() {
            return Err(Error::Busy { joints: busy });
        }

        for &joint in joints {
            claims.active.insert(joint);
            *claims.generation.entry(joint).or_default() += 1;
        }
        Ok(HomingClaim {
            joints: joints.to_vec(),
            claims: Arc::clone(&self.claims),
        })
    }

    pub fn is_homing(&self, joint: JointId) -> bool {
        self.lock().active.contains(&joint)
    }

    /// Number of homing runs that have claimed this joint so far. A command
    /// issued under an older generation refers to the pre-homing encoder zero.
    pub fn generation(&self, joint: JointId) -> u64 {
        self.lock().generation.get(&joint).copied().unwrap_or(0)
    }
}

/// Releases its joints when dropped, whichever way the run ends
#[derive(Debug)]
pub struct HomingClaim {
    joints: Vec<JointId>,
    claims: Arc<Mutex<Claims>>,
}

impl HomingClaim {
    pub fn joints(&self) -> &[JointId] {
        &self.joints
    }
}

impl Drop for HomingClaim {
    fn drop(&mut self) {
        let mut claims = self.claims.lock().unwrap_or_else(|p| p.into_inner());
        for joint in &self.joints {
            claims.active.remove(joint);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingPhase {
    Driving,
    Reached,
    TimedOut,
}

/// Homing state of a single joint, advanced once per poll
#[derive(Debug)]
pub struct JointHoming {
    joint: JointId,
    channel: Channel,
    duty: i8,
    started_at: Instant,
    timeout: Option<Duration>,
    drive_sent: bool,
    phase: HomingPhase,
}

impl JointHoming {
    pub fn new(joint: &JointConfig, settings: &HomingSettings, started_at: Instant) -> Self {
        Self {
            joint: joint.id,
            channel: joint.channel,
            duty: settings.duty,
            started_at,
            timeout: settings.timeout(),
            drive_sent: false,
            phase: HomingPhase::Driving,
        }
    }

    pub fn phase(&self) -> HomingPhase {
        self.phase
    }

    pub fn step<L: MotorLink + ?Sized>(&mut self, link: &mut L, now: Instant) -> HomingPhase {
        if self.phase != HomingPhase::Driving {
            return self.phase;
        }

        if let Some(timeout) = self.timeout {
            if now.saturating_duration_since(self.started_at) > timeout {
                warn!(
                    "Joint {} did not reach its limit within {:?}, giving up",
                    self.joint, timeout
                );
                stop_channels(link, &[self.channel]);
                self.phase = HomingPhase::TimedOut;
                return self.phase;
            }
        }

        if !self.drive_sent {
            match link.send_duty(self.channel, -self.duty) {
                Ok(()) => {
                    info!("Homing joint {} on {}", self.joint, self.channel);
                    self.drive_sent = true;
                }
                Err(e) => {
                    warn!("Homing drive for joint {} not sent, retrying: {}", self.joint, e);
                    return self.phase;
                }
            }
        }

        match link.read_error() {
            Ok(bitmask) if is_home(bitmask, self.channel) => {
                info!("Joint {} reached its limit", self.joint);
                stop_channels(link, &[self.channel]);
                if let Err(e) = link.set_encoder(self.channel, 0) {
                    warn!("Could not zero encoder of joint {}: {}", self.joint, e);
                }
                self.phase = HomingPhase::Reached;
            }
            Ok(bitmask) => debug!("Joint {} homing, error register 0x{:04X}", self.joint, bitmask),
            Err(e) => warn!("Homing poll for joint {} skipped: {}", self.joint, e),
        }
        self.phase
    }
}

/// Runs homing requests against a shared link
pub struct Homer<L> {
    link: SharedLink<L>,
    joints: Vec<JointConfig>,
    settings: HomingSettings,
    coordinator: HomingCoordinator,
}

impl<L> Clone for Homer<L> {
    fn clone(&self) -> Self {
        Self {
            link: Arc::clone(&self.link),
            joints: self.joints.clone(),
            settings: self.settings,
            coordinator: self.coordinator.clone(),
        }
    }
}

impl<L: MotorLink + 'static> Homer<L> {
    pub fn new(
        link: SharedLink<L>,
        joints: Vec<JointConfig>,
        settings: HomingSettings,
        coordinator: HomingCoordinator,
    ) -> Self {
        Self {
            link,
            joints,
            settings,
            coordinator,
        }
    }

    /// Claim the requested joints. Unknown ids are ignored.
    pub fn begin(&self, request: &HomingRequest) -> Result<HomingClaim> {
        let mut requested: Vec<JointId> = Vec::new();
        for &id in &request.joints {
            if !self.joints.iter().any(|j| j.id == id) {
                warn!("Homing request names unknown joint {}, ignoring", id);
            } else if !requested.contains(&id) {
                requested.push(id);
            }
        }
        self.coordinator.try_claim(&requested)
    }

    /// Home the claimed joints in request order
    pub async fn run(&self, claim: HomingClaim) -> HomingResponse {
        let mut response = HomingResponse {
            reached_limit: self.joints.iter().map(|j| (j.id, false)).collect::<BTreeMap<_, _>>(),
        };

        for &id in claim.joints() {
            let Some(joint) = self.joints.iter().find(|j| j.id == id) else {
                continue;
            };
            let reached = self.home_joint(joint).await;
            response.reached_limit.insert(id, reached);
        }

        drop(claim);
        response
    }

    /// Claim and run in one call
    pub async fn home(&self, request: &HomingRequest) -> Result<HomingResponse> {
        let claim = self.begin(request)?;
        Ok(self.run(claim).await)
    }

    async fn home_joint(&self, joint: &JointConfig) -> bool {
        let mut poll = interval(self.settings.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut state = JointHoming::new(joint, &self.settings, Instant::now());

        loop {
            poll.tick().await;
            // serial transactions block, keep them off the async workers
            let handle = Arc::clone(&self.link);
            let stepped = task::spawn_blocking(move || {
                let phase = state.step(&mut *link::lock(&handle), Instant::now());
                (state, phase)
            })
            .await;
            let phase = match stepped {
                Ok((next, phase)) => {
                    state = next;
                    phase
                }
                Err(e) => {
                    warn!("Homing step for joint {} aborted: {}", joint.id, e);
                    stop_channels(&mut *link::lock(&self.link), &[joint.channel]);
                    return false;
                }
            };
            match phase {
                HomingPhase::Driving => continue,
                HomingPhase::Reached => return true,
                HomingPhase::TimedOut => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::link::shared;
    use crate::motor::sim::{SentCommand, SimOp, SimulatedLink};

    fn joints() -> Vec<JointConfig> {
        vec![
            JointConfig {
                id: 0,
                channel: Channel::M1,
                reduction_ratio: 5281.1,
                radians_per_turn: std::f64::consts::TAU,
            },
            JointConfig {
                id: 1,
                channel: Channel::M2,
                reduction_ratio: 5281.1,
                radians_per_turn: std::f64::consts::TAU,
            },
        ]
    }

    fn fast_settings() -> HomingSettings {
        HomingSettings {
            duty: 63,
            poll_hz: 200,
            timeout_ms: Some(5_000),
        }
    }

    #[test]
    fn test_exact_match_only() {
        assert!(is_home(0x4000, Channel::M1));
        assert!(is_home(0x8000, Channel::M2));
        assert!(!is_home(0x4001, Channel::M1));
        assert!(!is_home(0xC000, Channel::M1));
        assert!(!is_home(0x4000, Channel::M2));
        assert!(!is_home(0, Channel::M1));
    }

    #[test]
    fn test_step_until_home_code() {
        let mut sim = SimulatedLink::new().with_polls_to_home(1000);
        sim.script_errors([0x0000, 0x0004, 0x4000 | 0x0001, 0x4000]);
        let now = Instant::now();
        let mut homing = JointHoming::new(&joints()[0], &fast_settings(), now);

        assert_eq!(homing.step(&mut sim, now), HomingPhase::Driving);
        assert_eq!(homing.step(&mut sim, now), HomingPhase::Driving);
        // compound mask containing the home bit is not home
        assert_eq!(homing.step(&mut sim, now), HomingPhase::Driving);
        assert_eq!(homing.step(&mut sim, now), HomingPhase::Reached);
        // finished joints ignore further polls
        assert_eq!(homing.step(&mut sim, now), HomingPhase::Reached);

        assert_eq!(
            sim.sent(),
            &[
                SentCommand::Duty(Channel::M1, -63),
                SentCommand::Speed(Channel::M1, 0),
                SentCommand::SetEncoder(Channel::M1, 0),
            ]
        );
    }

    #[test]
    fn test_compound_mask_never_satisfies() {
        let mut sim = SimulatedLink::new().with_polls_to_home(1000);
        sim.set_base_error(0x4000 | 0x0100);
        let now = Instant::now();
        let mut homing = JointHoming::new(&joints()[0], &fast_settings(), now);

        for _ in 0..50 {
            assert_eq!(homing.step(&mut sim, now), HomingPhase::Driving);
        }
    }

    #[test]
    fn test_timeout_stops_motor() {
        let mut sim = SimulatedLink::new().with_polls_to_home(1000);
        let t0 = Instant::now();
        let mut homing = JointHoming::new(&joints()[1], &fast_settings(), t0);

        assert_eq!(homing.step(&mut sim, t0), HomingPhase::Driving);
        assert_eq!(
            homing.step(&mut sim, t0 + Duration::from_secs(6)),
            HomingPhase::TimedOut
        );
        assert_eq!(sim.sent().last(), Some(&SentCommand::Speed(Channel::M2, 0)));
    }

    #[test]
    fn test_failed_drive_is_retried() {
        let mut sim = SimulatedLink::new().with_polls_to_home(1000);
        sim.fail_times(SimOp::Duty(Channel::M1), 1);
        let now = Instant::now();
        let mut homing = JointHoming::new(&joints()[0], &fast_settings(), now);

        homing.step(&mut sim, now);
        assert!(sim.sent().is_empty());
        homing.step(&mut sim, now);
        assert_eq!(sim.sent(), &[SentCommand::Duty(Channel::M1, -63)]);
    }

    #[test]
    fn test_overlapping_claims_are_busy() {
        let coordinator = HomingCoordinator::new();
        let claim = coordinator.try_claim(&[0]).unwrap();
        assert!(coordinator.is_homing(0));

        match coordinator.try_claim(&[1, 0]) {
            Err(Error::Busy { joints }) => assert_eq!(joints, vec![0]),
            other => panic!("expected Busy, got {other:?}"),
        }
        // disjoint joints can still be claimed
        let other = coordinator.try_claim(&[1]).unwrap();

        drop(claim);
        drop(other);
        assert!(!coordinator.is_homing(0));
        assert!(coordinator.try_claim(&[0, 1]).is_ok());
    }

    #[test]
    fn test_each_claim_bumps_generation() {
        let coordinator = HomingCoordinator::new();
        assert_eq!(coordinator.generation(0), 0);

        drop(coordinator.try_claim(&[0]).unwrap());
        assert_eq!(coordinator.generation(0), 1);
        assert_eq!(coordinator.generation(1), 0);

        // a refused claim does not count
        let claim = coordinator.try_claim(&[0, 1]).unwrap();
        assert!(coordinator.try_claim(&[1]).is_err());
        drop(claim);
        assert_eq!(coordinator.generation(0), 2);
        assert_eq!(coordinator.generation(1), 1);
    }

    #[tokio::test]
    async fn test_requested_joint_reaches_limit() {
        let link = shared(SimulatedLink::new().with_polls_to_home(3));
        let homer = Homer::new(
            Arc::clone(&link),
            joints(),
            fast_settings(),
            HomingCoordinator::new(),
        );

        let response = homer
            .home(&HomingRequest { joints: vec![0] })
            .await
            .unwrap();

        assert!(response.reached_limit[&0]);
        assert!(!response.reached_limit[&1]);
        let sim = link::lock(&link);
        assert!(sim.sent().iter().all(|c| c.channel() == Channel::M1));
    }

    #[tokio::test]
    async fn test_both_joints_home_in_sequence() {
        let link = shared(SimulatedLink::new().with_polls_to_home(2));
        let homer = Homer::new(link, joints(), fast_settings(), HomingCoordinator::new());

        let response = homer
            .home(&HomingRequest { joints: vec![1, 0, 7] })
            .await
            .unwrap();

        assert_eq!(response.reached_limit.len(), 2);
        assert!(response.reached_limit.values().all(|&reached| reached));
    }

    #[tokio::test]
    async fn test_concurrent_request_is_busy() {
        let link = shared(SimulatedLink::new().with_polls_to_home(40));
        let coordinator = HomingCoordinator::new();
        let homer = Homer::new(link, joints(), fast_settings(), coordinator.clone());

        let first = {
            let homer = homer.clone();
            tokio::spawn(async move { homer.home(&HomingRequest { joints: vec![0] }).await })
        };
        while !coordinator.is_homing(0) {
            tokio::task::yield_now().await;
        }

        let second = homer.home(&HomingRequest { joints: vec![0] }).await;
        assert!(matches!(second, Err(Error::Busy { .. })));

        let first = first.await.unwrap().unwrap();
        assert!(first.reached_limit[&0]);
        assert!(!coordinator.is_homing(0));
    }
}
