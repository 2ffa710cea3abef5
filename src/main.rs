//! CLI entry point for the focuser simulator.
//!
//! Drives the full control stack against the simulated driver: connect,
//! absolute and relative seeks, presets, abort, and a hand-controller
//! button session. Useful for exercising the core without hardware and as
//! a worked example of the driver-facing API.
//!
//! # Usage
//!
//! ```bash
//! focuser_sim --max 50000 --rate 20000
//! focuser_sim --open-loop
//! ```

use anyhow::Result;
use clap::Parser;
use focuser_core::config::Settings;
use focuser_core::connection::{ConnectionMode, ConnectionModeSet, MockTransport};
use focuser_core::device::FocuserDevice;
use focuser_core::hardware::SimFocuser;
use focuser_core::motion::OverridePolicy;
use focuser_core::properties::{names, NumberItem, NumberRequest, PropertyUpdate};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "focuser_sim")]
#[command(about = "Simulated focuser exercising the control core", long_about = None)]
struct Cli {
    /// Travel limit in ticks
    #[arg(long, default_value = "50000")]
    max: u32,

    /// Simulated motion rate in ticks per second
    #[arg(long, default_value = "20000")]
    rate: f64,

    /// Simulate an open-loop motor without position feedback
    #[arg(long)]
    open_loop: bool,

    /// Load and save configuration at this path
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) if path.exists() => Settings::load(path)?,
        _ => Settings::default(),
    };

    let driver = if cli.open_loop {
        Arc::new(SimFocuser::open_loop().with_rate(cli.rate))
    } else {
        Arc::new(SimFocuser::closed_loop(cli.max).with_rate(cli.rate))
    };
    let (transport, _probe) = MockTransport::new();

    let device = FocuserDevice::builder(driver)
        .connection_modes(ConnectionModeSet::new().with(ConnectionMode::Serial))
        .transport(ConnectionMode::Serial, Box::new(transport))
        .override_policy(OverridePolicy::Reject)
        .max_position(cli.max)
        .settings(settings)
        .build()?;

    // Print every outbound update the way a protocol layer would see it.
    let mut updates = device.subscribe();
    tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            match update {
                PropertyUpdate::Message { text, .. } => println!("  [msg] {}", text),
                PropertyUpdate::Number {
                    property,
                    state,
                    items,
                    ..
                } => println!("  [num] {} {:?} {:?}", property, state, items),
                PropertyUpdate::Switch {
                    property,
                    state,
                    items,
                    ..
                } => println!("  [swt] {} {:?} {:?}", property, state, items),
                _ => {}
            }
        }
    });

    device.init_properties().await;
    device.connect().await?;

    if cli.open_loop {
        run_open_loop_session(&device).await?;
    } else {
        run_closed_loop_session(&device, cli.max).await?;
    }

    if let Some(path) = &cli.config {
        device.save_config(path).await?;
    }
    device.disconnect().await?;
    Ok(())
}

/// Seek, preset and abort demonstration on position-feedback hardware.
async fn run_closed_loop_session(device: &FocuserDevice, max: u32) -> Result<()> {
    println!("-- absolute seek to {}", max / 4);
    let req = NumberRequest::new(
        device.name(),
        names::ABS_FOCUS_POSITION,
        vec![NumberItem::new(names::FOCUS_ABSOLUTE_POSITION, (max / 4) as f64)],
    );
    device.handle_number(&req).await?;
    wait_idle(device).await?;

    println!("-- store and recall a preset");
    device.presets().set_preset(0, max / 2).await?;
    device.presets().goto_preset(0).await?;
    wait_idle(device).await?;

    println!("-- abort a long seek");
    device.motion().move_abs(max).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    device.motion().abort().await?;
    println!(
        "   aborted at position {}",
        device.motion().position().await
    );
    Ok(())
}

/// Button-driven session for hardware without position feedback.
async fn run_open_loop_session(device: &FocuserDevice) -> Result<()> {
    println!("-- hold the out button");
    device.on_button_event("Focus Out", true).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    device.on_button_event("Focus Out", false).await?;

    println!("-- timed move inward");
    device
        .motion()
        .set_direction(focuser_core::hardware::FocusDirection::Inward)
        .await?;
    device
        .motion()
        .move_timed(Duration::from_millis(200))
        .await?;
    loop {
        device.poll().await?;
        if !device.motion().state().await.is_moving() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

/// Poll until the current seek completes, like the owner's status timer.
async fn wait_idle(device: &FocuserDevice) -> Result<()> {
    loop {
        device.poll().await?;
        if !device.motion().state().await.is_moving() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
