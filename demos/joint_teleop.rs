// Keyboard teleop: W/S joint 0, E/D joint 1, R/F step size, H home, Q quit
//
// Publishes absolute joint targets at 10 Hz so the runtime watchdog stays fed.
// Usage: cargo run --example joint_teleop
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use roboclaw_arm_runtime::config::{TOPIC_CMD_JOINT, TOPIC_HOME};
use roboclaw_arm_runtime::messages::{HomingRequest, JointCommand};

const STEPS: [f64; 3] = [0.01, 0.05, 0.2]; // rad per key press
const JOINTS: [u8; 2] = [0, 1];
const PUBLISH_PERIOD: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD_JOINT).await?;

    info!("Controls: W/S=joint 0, E/D=joint 1, R/F=step, H=home, Q=quit");
    print_step(0);

    enable_raw_mode()?;
    let result = run_teleop(&session, &publisher).await;
    disable_raw_mode()?;

    result
}

async fn run_teleop(
    session: &zenoh::Session,
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut step_idx: usize = 0;
    let mut targets = [0.0_f64; 2];
    let mut last_publish = Instant::now() - PUBLISH_PERIOD;

    loop {
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;

                match code {
                    KeyCode::Char('w') if pressed => targets[0] += STEPS[step_idx],
                    KeyCode::Char('s') if pressed => targets[0] -= STEPS[step_idx],
                    KeyCode::Char('e') if pressed => targets[1] += STEPS[step_idx],
                    KeyCode::Char('d') if pressed => targets[1] -= STEPS[step_idx],

                    KeyCode::Char('r') if pressed => {
                        step_idx = (step_idx + 1).min(2);
                        print_step(step_idx);
                    }
                    KeyCode::Char('f') if pressed => {
                        step_idx = step_idx.saturating_sub(1);
                        print_step(step_idx);
                    }

                    KeyCode::Char('h') if pressed => {
                        home(session).await?;
                        // homed joints sit at zero now
                        targets = [0.0; 2];
                    }

                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => {}
                }
            }
        }

        if last_publish.elapsed() >= PUBLISH_PERIOD {
            for (joint_id, target_angle) in JOINTS.into_iter().zip(targets) {
                let cmd = JointCommand { joint_id, target_angle };
                publisher.put(serde_json::to_string(&cmd)?).await?;
            }
            last_publish = Instant::now();
        }
    }

    Ok(())
}

async fn home(session: &zenoh::Session) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let request = HomingRequest {
        joints: JOINTS.to_vec(),
    };
    info!("Homing joints {:?}...", request.joints);

    let replies = session
        .get(TOPIC_HOME)
        .payload(serde_json::to_string(&request)?)
        .timeout(Duration::from_secs(120))
        .await?;

    while let Ok(reply) = replies.recv_async().await {
        match reply.result() {
            Ok(sample) => info!("Homing done: {}", String::from_utf8_lossy(&sample.payload().to_bytes())),
            Err(err) => warn!("Homing refused: {}", String::from_utf8_lossy(&err.payload().to_bytes())),
        }
    }
    Ok(())
}

fn print_step(idx: usize) {
    info!("Step: {} rad", STEPS[idx]);
}
