//! Headless subcommands.

use anyhow::{bail, Context, Result};
use facecap_core::{Activity, CameraProvider, Config, Controller, StageExit, V4lCameraProvider};
use facecap_hw::Camera;
use std::path::PathBuf;
use std::time::Duration;

fn controller(config: &Config) -> Controller<V4lCameraProvider> {
    Controller::new(
        config,
        V4lCameraProvider {
            device: config.camera_device.clone(),
        },
    )
}

/// Run a whole capture session, one frame every `interval_ms`.
pub fn capture(config: &Config, dir: &str, interval_ms: u64) -> Result<()> {
    let mut ctl = controller(config);
    for path in capture_session(&mut ctl, dir, Duration::from_millis(interval_ms))? {
        println!("{}", path.display());
    }
    Ok(())
}

/// Start a session in `dir` and capture until the quota is reached.
///
/// Failed reads are skipped like the display loop does, up to `quota * 3`
/// attempts in total. Returns the saved paths in capture order.
fn capture_session<P: CameraProvider>(
    ctl: &mut Controller<P>,
    dir: &str,
    interval: Duration,
) -> Result<Vec<PathBuf>> {
    ctl.start(dir).with_context(|| format!("failed to start session {dir:?}"))?;

    let max_attempts = ctl.quota() as usize * 3;
    let mut saved = Vec::with_capacity(ctl.quota() as usize);

    for _ in 0..max_attempts {
        std::thread::sleep(interval);
        match ctl.capture() {
            Ok(outcome) => {
                tracing::debug!(path = %outcome.path.display(), "captured");
                saved.push(outcome.path);
                if outcome.complete {
                    return Ok(saved);
                }
            }
            Err(e) if ctl.activity() == Activity::Capturing => {
                tracing::warn!(error = %e, "capture failed, retrying on next interval");
            }
            Err(e) => return Err(e).context("capture session ended early"),
        }
    }

    ctl.shutdown();
    bail!(
        "gave up after {max_attempts} attempts with {}/{} images saved",
        saved.len(),
        ctl.quota()
    )
}

/// Run one stage to completion. A non-successful exit becomes the command's error.
pub fn stage(config: &Config, name: &str) -> Result<()> {
    let mut ctl = controller(config);
    ctl.run_stage(name)?;

    let Some(done) = ctl.wait_for_stage() else {
        bail!("stage {name} produced no completion event");
    };
    println!("{}: {}", done.name, done.exit);

    match done.exit {
        StageExit::Success => Ok(()),
        other => bail!("stage {name} {other}"),
    }
}

pub fn devices(json: bool) -> Result<()> {
    let devices = Camera::list_devices();

    if json {
        let list: Vec<_> = devices
            .iter()
            .map(|d| {
                serde_json::json!({
                    "path": d.path,
                    "name": d.name,
                    "driver": d.driver,
                    "bus": d.bus,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in &devices {
        println!("{}\t{} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}

pub fn print_config(config: &Config) -> Result<()> {
    print!("{}", config.to_toml_string()?);
    Ok(())
}
