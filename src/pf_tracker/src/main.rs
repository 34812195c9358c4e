//! Particle filter tracker host
//!
//! Builds a fleet of filter nodes on the in-process fabric, feeds it sensor
//! events from a recorded spike train or a synthetic moving circle, and
//! records the tracked `[x, y, r]` once per tick.

mod dataset;
mod params;
mod recording;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use pf_engine::codec::decode_position;
use pf_engine::fabric::OUTPUT_BASE;
use pf_engine::{ExchangeMode, Fleet, Recorder, RoleState, TickOutcome};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dataset::{EventSource, SpikeReplay, SyntheticSource};
use params::TrackerParams;
use recording::JsonLinesRecorder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Topology {
    PeerToPeer,
    Aggregated,
}

impl From<Topology> for ExchangeMode {
    fn from(t: Topology) -> Self {
        match t {
            Topology::PeerToPeer => ExchangeMode::PeerToPeer,
            Topology::Aggregated => ExchangeMode::Aggregated,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "pf_tracker", version, about = "Distributed event-based circle tracker")]
struct Args {
    /// TOML parameter file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Number of particles
    #[arg(short = 'n', long)]
    particles: Option<usize>,

    #[arg(long, value_enum)]
    topology: Option<Topology>,

    /// Ticks to run; runs until interrupted (or the dataset ends) when unset
    #[arg(short, long)]
    ticks: Option<u32>,

    #[arg(long)]
    seed: Option<u64>,

    /// Sensor width in pixels
    #[arg(long)]
    width: Option<u32>,

    /// Sensor height in pixels
    #[arg(long)]
    height: Option<u32>,

    /// Spike-train file to replay
    #[arg(short, long)]
    dataset: Option<PathBuf>,

    /// JSON-lines output for the recorded target
    #[arg(short, long)]
    record: Option<PathBuf>,

    /// Gate events through the per-row filters
    #[arg(long)]
    filters: bool,

    /// Pace ticks to the timer period
    #[arg(long)]
    realtime: bool,
}

impl Args {
    fn apply(&self, params: &mut TrackerParams) {
        if let Some(n) = self.particles {
            params.fleet.n_particles = n;
        }
        if let Some(t) = self.topology {
            params.fleet.topology = t.into();
        }
        if self.ticks.is_some() {
            params.fleet.sim.ticks = self.ticks;
        }
        if let Some(seed) = self.seed {
            params.fleet.seed = seed;
        }
        if let Some(width) = self.width {
            params.fleet.params.geometry.width = width;
        }
        if let Some(height) = self.height {
            params.fleet.params.geometry.height = height;
        }
        if self.dataset.is_some() {
            params.input.dataset = self.dataset.clone();
        }
        if self.record.is_some() {
            params.output.recording = self.record.clone();
        }
        params.fleet.filters |= self.filters;
        params.output.realtime |= self.realtime;
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let mut params = TrackerParams::load(args.config.as_deref())?;
    args.apply(&mut params);
    params.validate()?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("installing Ctrl-C handler")?;

    run(&params, &running)
}

fn run(params: &TrackerParams, running: &AtomicBool) -> Result<()> {
    let geometry = params.fleet.params.geometry;
    let period_us = params.fleet.sim.timer_period_us;

    let mut source: Box<dyn EventSource> = match &params.input.dataset {
        Some(path) => {
            let replay = SpikeReplay::open(path, period_us, &geometry)?;
            info!(
                path = %path.display(),
                events = replay.len(),
                last_tick = ?replay.last_tick(),
                "dataset loaded"
            );
            Box::new(replay)
        }
        None => {
            info!("no dataset given, using the synthetic moving circle");
            Box::new(SyntheticSource::new(
                params.input.synthetic.clone(),
                geometry,
                params.fleet.seed,
            ))
        }
    };

    let recorder: Option<Box<dyn Recorder>> = match &params.output.recording {
        Some(path) if params.fleet.record => Some(Box::new(JsonLinesRecorder::create(path)?)),
        Some(_) => {
            warn!("recording path given but fleet.record is off");
            None
        }
        None => None,
    };

    let mut fleet = Fleet::build(&params.fleet, recorder)?;
    info!(
        particles = params.fleet.n_particles,
        topology = ?params.fleet.topology,
        ticks = ?params.fleet.sim.ticks,
        "tracker started"
    );

    let period = Duration::from_micros(u64::from(period_us));
    let mut events = Vec::new();
    let mut tick: u32 = 0;
    while running.load(Ordering::SeqCst) {
        let started = Instant::now();

        events.clear();
        source.events_for_tick(tick, &mut events);
        for &(x, y) in &events {
            fleet.inject_event(x, y);
        }

        match fleet.tick() {
            TickOutcome::Running(_) => {}
            TickOutcome::Completed | TickOutcome::Paused => {
                info!(tick, "simulation complete");
                break;
            }
        }

        for packet in fleet.take_host_packets() {
            let (x, y) = decode_position(OUTPUT_BASE, packet.key);
            debug!(tick, x, y, truth = ?source.truth(), "position");
        }

        if params.fleet.sim.ticks.is_none() && source.exhausted() {
            info!(tick, "dataset exhausted");
            break;
        }
        tick = tick.wrapping_add(1);

        if params.output.realtime {
            if let Some(rest) = period.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
    }
    if !running.load(Ordering::SeqCst) {
        info!(tick, "interrupted");
    }

    summarize(&fleet, source.truth());
    Ok(())
}

fn summarize(fleet: &Fleet, truth: Option<[f32; 3]>) {
    if let Some([x, y, r]) = fleet.target() {
        match truth {
            Some([tx, ty, tr]) => {
                let error = ((x - tx).powi(2) + (y - ty).powi(2)).sqrt();
                info!(x, y, r, tx, ty, tr, error, "final target");
            }
            None => info!(x, y, r, "final target"),
        }
    }
    for node in fleet.nodes() {
        if let RoleState::Particle(p) = node.role() {
            if p.is_main() {
                let timing = p.timing();
                info!(
                    node = node.id(),
                    updates = timing.count,
                    mean_ms = timing.mean_ms(),
                    max_ms = timing.max_ms,
                    "main particle timing"
                );
            }
        }
    }
}
