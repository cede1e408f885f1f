// 10 Hz control loop with command watchdog, encoder telemetry and diagnostics
//
// Commands, homing requests and the tick are independent event sources multiplexed
// in one select loop: a command never waits for the tick and the tick never waits
// for a command. Homing runs on its own task and shares the motor link through a mutex.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal::unix::{SignalKind, signal};
use tokio::task::block_in_place;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};
use zenoh::query::Query;
use zenoh::sample::Sample;

use crate::config::{
    DIAGNOSTICS_HZ, LOOP_HZ, MotionProfile, RuntimeConfig, TOPIC_CMD_JOINT, TOPIC_DIAGNOSTICS,
    TOPIC_HEALTH, TOPIC_HOME, TOPIC_RT_JOINTS,
};
use crate::diagnostics::DiagnosticAggregator;
use crate::error::{Error, Result};
use crate::homing::{Homer, HomingCoordinator};
use crate::messages::{
    DiagnosticSnapshot, ErrorReply, HomingRequest, JointCommand, RuntimeHealth, TelemetryFrame,
};
use crate::motor::link::{self, shared, stop_channels};
use crate::motor::{Channel, MotorLink, Roboclaw, SharedLink, SimulatedLink};
use crate::telemetry::{self, Joint, JointId};
use crate::watchdog::{CommandWatchdog, WatchdogState};

/// An accepted joint command. A newer command for the same joint replaces it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command {
    pub joint_id: JointId,
    pub target_angle: f64,
    pub issued_at: Instant,
    /// Homing generation of the joint when the command was accepted
    pub homing_generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub health: RuntimeHealth,
    pub telemetry: Option<TelemetryFrame>,
}

pub struct Controller<L> {
    link: SharedLink<L>,
    joints: Vec<Joint>,
    /// Accepted commands the controller has not acknowledged yet
    pending: BTreeMap<JointId, Command>,
    watchdog: CommandWatchdog,
    homing: HomingCoordinator,
    motion: MotionProfile,
    diagnostics: DiagnosticAggregator,
}

impl<L: MotorLink> Controller<L> {
    pub fn new(
        link: SharedLink<L>,
        config: &RuntimeConfig,
        homing: HomingCoordinator,
        started_at: Instant,
    ) -> Self {
        Self {
            link,
            joints: config.joints.iter().map(Joint::from).collect(),
            pending: BTreeMap::new(),
            watchdog: CommandWatchdog::new(config.watchdog_timeout(), started_at),
            homing,
            motion: config.motion,
            diagnostics: DiagnosticAggregator::default(),
        }
    }

    pub fn joints(&self) -> &[Joint] {
        &self.joints
    }

    pub fn watchdog_state(&self) -> WatchdogState {
        self.watchdog.state()
    }

    /// Accept a joint command and write it to the controller.
    ///
    /// A transport failure does not reject the command: it stays pending and
    /// the next tick sends it again.
    pub fn on_command(&mut self, cmd: &JointCommand, now: Instant) -> Result<()> {
        if !cmd.target_angle.is_finite() {
            return Err(Error::InvalidCommand(format!(
                "joint {}: target angle {} is not finite",
                cmd.joint_id, cmd.target_angle
            )));
        }
        let Some(joint) = self.joints.iter_mut().find(|j| j.id == cmd.joint_id) else {
            return Err(Error::InvalidCommand(format!("unknown joint {}", cmd.joint_id)));
        };
        if self.homing.is_homing(joint.id) {
            return Err(Error::Busy {
                joints: vec![joint.id],
            });
        }

        self.watchdog.on_command(now);
        joint.last_commanded_angle = Some(cmd.target_angle);
        let command = Command {
            joint_id: joint.id,
            target_angle: cmd.target_angle,
            issued_at: now,
            homing_generation: self.homing.generation(joint.id),
        };

        let mut link = link::lock(&self.link);
        match send_command(&mut *link, &self.motion, joint, &command) {
            Ok(()) => {
                self.pending.remove(&command.joint_id);
            }
            Err(e) => {
                warn!("Command for joint {} not delivered, will retry: {}", command.joint_id, e);
                self.pending.insert(command.joint_id, command);
            }
        }
        Ok(())
    }

    /// One control cycle: watchdog, command retries, telemetry
    pub fn tick(&mut self, now: Instant) -> TickReport {
        let state = self.watchdog.check(now);
        let homing: Vec<JointId> = self
            .joints
            .iter()
            .map(|j| j.id)
            .filter(|&id| self.homing.is_homing(id))
            .collect();

        let mut link = link::lock(&self.link);
        match state {
            WatchdogState::Stopped => {
                self.pending.clear();
                // channels driven by a homing run belong to it until it finishes
                let owned: Vec<Channel> = self
                    .joints
                    .iter()
                    .filter(|j| homing.contains(&j.id))
                    .map(|j| j.channel)
                    .collect();
                for channel in Channel::ALL.into_iter().filter(|c| !owned.contains(c)) {
                    if let Err(e) = link.stop(channel) {
                        warn!("Watchdog stop on {} failed, retrying next tick: {}", channel, e);
                    }
                }
            }
            WatchdogState::Active => {
                // homing moves the encoder zero, so a command queued before it is void
                let coordinator = &self.homing;
                self.pending.retain(|&joint_id, command| {
                    let current = !homing.contains(&joint_id)
                        && coordinator.generation(joint_id) == command.homing_generation;
                    if !current {
                        debug!("Dropping pending command for joint {}, superseded by homing", joint_id);
                    }
                    current
                });

                let retries: Vec<Command> = self.pending.values().copied().collect();
                for command in retries {
                    let Some(joint) = self.joints.iter().find(|j| j.id == command.joint_id) else {
                        continue;
                    };
                    match send_command(&mut *link, &self.motion, joint, &command) {
                        Ok(()) => {
                            debug!("Pending command for joint {} delivered", command.joint_id);
                            self.pending.remove(&command.joint_id);
                        }
                        Err(e) => warn!("Retry for joint {} failed: {}", command.joint_id, e),
                    }
                }
            }
        }

        let telemetry = telemetry::sample(&mut *link, &mut self.joints);
        TickReport {
            health: state.into(),
            telemetry,
        }
    }

    /// Refresh the diagnostic snapshot; `None` when the error register was unreadable
    pub fn refresh_diagnostics(&mut self) -> Option<DiagnosticSnapshot> {
        let mut link = link::lock(&self.link);
        self.diagnostics.refresh(&mut *link).cloned()
    }

    pub fn has_pending(&self, joint: JointId) -> bool {
        self.pending.contains_key(&joint)
    }
}

fn send_command<L: MotorLink + ?Sized>(
    link: &mut L,
    motion: &MotionProfile,
    joint: &Joint,
    command: &Command,
) -> Result<()> {
    let ticks = joint.to_ticks(command.target_angle);
    debug!(
        "Joint {} -> {:.4} rad ({} ticks) on {}",
        command.joint_id, command.target_angle, ticks, joint.channel
    );
    link.send_position(joint.channel, motion.to(ticks))
}

/// Stop both channels, retrying once. Logs a fatal condition if that fails.
pub fn stop_all<L: MotorLink>(link: &SharedLink<L>) -> bool {
    info!("Stopping motors");
    let mut link = link::lock(link);
    let failed = stop_channels(&mut *link, &Channel::ALL);
    if !failed.is_empty() {
        error!("Could not stop motors on {:?}!", failed);
    }
    failed.is_empty()
}

/// Resolves on Ctrl-C or SIGTERM. The SIGTERM handler is installed before
/// this returns, so a terminate sent right after startup is not lost.
fn shutdown_signal() -> io::Result<impl Future<Output = &'static str>> {
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        }
    })
}

/// Stops the motors when the control loop ends, however it ends
pub struct StopOnDrop<L: MotorLink> {
    link: SharedLink<L>,
}

impl<L: MotorLink> StopOnDrop<L> {
    pub fn new(link: SharedLink<L>) -> Self {
        Self { link }
    }
}

impl<L: MotorLink> Drop for StopOnDrop<L> {
    fn drop(&mut self) {
        stop_all(&self.link);
    }
}

pub async fn run(config: RuntimeConfig) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let address = config.validate()?;

    if config.simulate {
        info!("Using simulated controller");
        return serve(SimulatedLink::new(), config).await;
    }

    let mut claw = Roboclaw::new(config.device.as_str(), config.baudrate, address);
    claw.connect()?;
    match claw.read_version() {
        Ok(version) => info!("Connected to {} at 0x{:02X}", version, address.get()),
        Err(e) => warn!("Could not read controller version: {}", e),
    }

    // start from a known state
    stop_channels(&mut claw, &Channel::ALL);
    if let Err(e) = claw.reset_encoders() {
        warn!("Could not reset encoders: {}", e);
    }

    serve(claw, config).await
}

async fn serve<L: MotorLink + 'static>(
    link: L,
    config: RuntimeConfig,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let link = shared(link);
    let _stop_guard = StopOnDrop::new(Arc::clone(&link));

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers, subscribers and queryables...");
    let subscriber = session.declare_subscriber(TOPIC_CMD_JOINT).await?;
    let homing_queries = session.declare_queryable(TOPIC_HOME).await?;
    let pub_joints = session.declare_publisher(TOPIC_RT_JOINTS).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;
    let pub_diagnostics = session.declare_publisher(TOPIC_DIAGNOSTICS).await?;

    let coordinator = HomingCoordinator::new();
    let mut controller = Controller::new(
        Arc::clone(&link),
        &config,
        coordinator.clone(),
        Instant::now(),
    );
    let homer = Homer::new(
        Arc::clone(&link),
        config.joints.clone(),
        config.homing,
        coordinator,
    );

    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut diagnostics_tick = interval(Duration::from_millis(1000 / DIAGNOSTICS_HZ));
    diagnostics_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = shutdown_signal()?;
    tokio::pin!(shutdown);

    info!(
        "Runtime started: {}Hz loop, {}ms watchdog timeout",
        LOOP_HZ, config.watchdog_timeout_ms
    );
    info!("Subscribed to: {}, serving: {}", TOPIC_CMD_JOINT, TOPIC_HOME);
    info!(
        "Publishing to: {}, {}, {}",
        TOPIC_RT_JOINTS, TOPIC_HEALTH, TOPIC_DIAGNOSTICS
    );

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                info!("{} received, shutting down", signal);
                break;
            }

            // link transactions block on the serial port
            sample = subscriber.recv_async() => {
                let sample = sample?;
                block_in_place(|| on_sample(&mut controller, &sample));
            }

            query = homing_queries.recv_async() => {
                on_homing_query(&homer, query?).await;
            }

            _ = tick.tick() => {
                let report = block_in_place(|| controller.tick(Instant::now()));
                if let Some(frame) = &report.telemetry {
                    pub_joints.put(serde_json::to_string(frame)?).await?;
                }
                pub_health.put(serde_json::to_string(&report.health)?).await?;
            }

            _ = diagnostics_tick.tick() => {
                if let Some(snapshot) = block_in_place(|| controller.refresh_diagnostics()) {
                    pub_diagnostics.put(serde_json::to_string(&snapshot)?).await?;
                }
            }
        }
    }

    Ok(())
}

fn on_sample<L: MotorLink>(controller: &mut Controller<L>, sample: &Sample) {
    let payload = sample.payload().to_bytes();
    match serde_json::from_slice::<JointCommand>(&payload) {
        Ok(cmd) => {
            if let Err(e) = controller.on_command(&cmd, Instant::now()) {
                warn!("{}", e);
            }
        }
        Err(e) => warn!("Failed to parse command: {}", e),
    }
}

/// Claim the joints right away so a conflicting request is refused with Busy,
/// then home on a separate task and reply when done
async fn on_homing_query<L: MotorLink + 'static>(homer: &Homer<L>, query: Query) {
    let request = match query.payload() {
        Some(payload) => serde_json::from_slice::<HomingRequest>(&payload.to_bytes())
            .map_err(|e| format!("invalid homing request: {}", e)),
        None => Err("homing request without payload".to_string()),
    };

    let claim = request.and_then(|request| homer.begin(&request).map_err(|e| e.to_string()));
    let claim = match claim {
        Ok(claim) => claim,
        Err(reason) => {
            warn!("Homing request refused: {}", reason);
            reply_error(&query, reason).await;
            return;
        }
    };

    let homer = homer.clone();
    tokio::spawn(async move {
        let response = homer.run(claim).await;
        info!("Homing finished: {:?}", response.reached_limit);
        match serde_json::to_string(&response) {
            Ok(json) => {
                if let Err(e) = query.reply(query.key_expr().clone(), json).await {
                    warn!("Could not send homing reply: {}", e);
                }
            }
            Err(e) => warn!("Could not encode homing reply: {}", e),
        }
    });
}

async fn reply_error(query: &Query, reason: String) {
    let reply = ErrorReply { error: reason };
    match serde_json::to_string(&reply) {
        Ok(json) => {
            if let Err(e) = query.reply_err(json).await {
                warn!("Could not send homing error reply: {}", e);
            }
        }
        Err(e) => warn!("Could not encode homing error reply: {}", e),
    }
}
