// Link diagnostic: READ-ONLY probe of a RoboClaw controller
//
// Reads the firmware version, encoders, error register, voltages and
// temperatures. Nothing is written that could move a motor.
//
// Usage: cargo run --example link_diagnostic -- [port] [address]
// Example: cargo run --example link_diagnostic -- /dev/ttyACM0 0x80

use roboclaw_arm_runtime::config::{DEFAULT_ADDRESS, DEFAULT_DEVICE};
use roboclaw_arm_runtime::diagnostics;
use roboclaw_arm_runtime::motor::roboclaw::DEFAULT_BAUDRATE;
use roboclaw_arm_runtime::motor::{Address, Channel, MotorLink, Roboclaw};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::DEBUG.into())
                .from_env_lossy(),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let port = args.next().unwrap_or_else(|| DEFAULT_DEVICE.to_string());
    let raw_address = match args.next() {
        Some(raw) => match raw.strip_prefix("0x") {
            Some(hex) => u8::from_str_radix(hex, 16)?,
            None => raw.parse()?,
        },
        None => DEFAULT_ADDRESS,
    };
    let address = Address::new(raw_address)?;

    println!("RoboClaw Link Diagnostic (READ-ONLY)");
    println!();
    println!("Serial port: {}", port);
    println!("Address:     0x{:02X}", address.get());
    println!();

    println!("Step 1: Opening serial port...");
    let mut claw = Roboclaw::new(&port, DEFAULT_BAUDRATE, address);
    if let Err(e) = claw.connect() {
        println!("  x Failed to open serial port: {}", e);
        println!();
        println!("Troubleshooting:");
        println!("  - Check the port path is correct");
        println!("  - Verify the USB cable is connected and the controller is powered");
        println!("  - Check the user is in the dialout group");
        return Err(e.into());
    }
    println!("  ok Serial port opened");
    println!();

    println!("Step 2: Reading firmware version...");
    match claw.read_version() {
        Ok(version) => println!("  ok {}", version),
        Err(e) => {
            println!("  x No answer: {}", e);
            println!("  - Check the packet serial address and baud rate in Motion Studio");
            return Err(e.into());
        }
    }
    println!();

    println!("Step 3: Reading encoders...");
    for channel in Channel::ALL {
        match claw.read_encoder(channel) {
            Ok(reading) => println!(
                "  {}: {} ticks (status 0x{:02X})",
                channel, reading.ticks, reading.status
            ),
            Err(e) => println!("  {}: ERROR - {}", channel, e),
        }
    }
    println!();

    println!("Step 4: Reading controller status...");
    let snapshot = diagnostics::snapshot(&mut claw)?;
    println!("  Summary: {:?} - {}", snapshot.summary.severity, snapshot.summary.message);
    for report in &snapshot.errors {
        println!("    [{:?}] {}", report.severity, report.message);
    }
    print_reading("Main battery", snapshot.battery_voltage, "V");
    print_reading("Logic battery", snapshot.logic_voltage, "V");
    print_reading("Temperature 1", snapshot.temp1, "C");
    print_reading("Temperature 2", snapshot.temp2, "C");
    println!();

    println!("Diagnostic complete. Next: cargo run -- --device {}", port);
    Ok(())
}

fn print_reading(label: &str, value: Option<f32>, unit: &str) {
    match value {
        Some(v) => println!("  {:<14} {:.1} {}", label, v, unit),
        None => println!("  {:<14} unavailable", label),
    }
}
