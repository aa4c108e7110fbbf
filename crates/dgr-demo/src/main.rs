//! `dgr-demo`: a headless render loop kept in lockstep through DGR.
//!
//! Run one process with `DGR_MODE=master` and any number with
//! `DGR_MODE=slave`; every process logs the same scene state. Without
//! `DGR_MODE` the demo runs standalone.

use std::time::Instant;

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use clap::Parser;

use dgr::logging::{LoggingConfig, init_logging};
use dgr::{Dgr, DgrConfig};

mod clock;

use clock::{FrameClock, FrameTime};

#[derive(Parser, Debug)]
#[command(name = "dgr-demo")]
#[command(about = "Spin a replicated camera around the origin; role comes from DGR_MODE")]
struct Cli {
    /// Frames to render before exiting (master/standalone); runs forever if omitted
    #[arg(long)]
    frames: Option<u64>,

    /// Target frame rate
    #[arg(long, default_value_t = 60.0)]
    fps: f64,

    /// Orbit speed of the camera
    #[arg(long, default_value_t = 90.0)]
    degrees_per_second: f32,
}

/// Orbiting camera, replicated as a single variable.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Pod, Zeroable)]
struct Camera {
    eye: [f32; 3],
    yaw_degrees: f32,
}

const ORBIT_RADIUS: f32 = 4.0;

/// Everything the slaves need to draw the master's frame.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
struct Scene {
    angle: f32,
    frame: u64,
    camera: Camera,
}

impl Scene {
    /// Master-only simulation step.
    fn advance(&mut self, dt: f32, degrees_per_second: f32) {
        self.angle = (self.angle + degrees_per_second * dt).rem_euclid(360.0);
        self.frame += 1;

        let rad = self.angle.to_radians();
        self.camera = Camera {
            eye: [ORBIT_RADIUS * rad.cos(), 1.5, ORBIT_RADIUS * rad.sin()],
            yaw_degrees: (self.angle + 180.0).rem_euclid(360.0),
        };
    }

    fn sync(&mut self, dgr: &mut Dgr) -> dgr::Result<()> {
        dgr.sync("angle", &mut self.angle)?;
        dgr.sync("frame", &mut self.frame)?;
        dgr.sync("camera", &mut self.camera)
    }
}

/// One frame: simulate on the master, replicate, "draw".
fn run_frame(dgr: &mut Dgr, scene: &mut Scene, time: FrameTime, cli: &Cli) -> Result<()> {
    if dgr.is_master() {
        scene.advance(time.dt, cli.degrees_per_second);
        scene.sync(dgr)?;
        dgr.update().context("dgr update failed")?;
    } else {
        dgr.update().context("dgr update failed")?;
        scene.sync(dgr)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    init_logging(LoggingConfig::default());
    let cli = Cli::parse();

    let config = DgrConfig::from_env().context("invalid DGR configuration")?;
    let mut dgr = Dgr::init(config).context("failed to start DGR")?;
    log::info!("demo running as {}", dgr.role());

    let mut clock = FrameClock::new(cli.fps.max(1.0));
    let mut scene = Scene::default();
    let mut last_report: Option<Instant> = None;

    loop {
        let time = clock.tick();
        run_frame(&mut dgr, &mut scene, time, &cli)?;

        let due = last_report.is_none_or(|at| time.now.duration_since(at).as_secs() >= 1);
        if due {
            last_report = Some(time.now);
            log::info!(
                "frame {:>6}  angle {:>6.1}  eye ({:>5.2}, {:>5.2}, {:>5.2})",
                scene.frame,
                scene.angle,
                scene.camera.eye[0],
                scene.camera.eye[1],
                scene.camera.eye[2],
            );
        }

        if !dgr.is_master() && !dgr.is_enabled() {
            log::info!("master ended replication");
            break;
        }
        if dgr.is_master() && cli.frames.is_some_and(|n| time.frame_index + 1 >= n) {
            break;
        }
    }

    dgr.shutdown();
    let stats = dgr.stats();
    log::info!(
        "demo done: {} frames sent, {} applied, {} dropped",
        stats.frames_sent,
        stats.frames_applied,
        stats.datagrams_dropped
    );
    Ok(())
}
