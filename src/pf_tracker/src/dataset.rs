//! Event sources: spike-train replay and a synthetic moving circle.

use anyhow::{bail, Context, Result};
use pf_engine::test_utils::{background_events, MovingCircle};
use pf_engine::SensorGeometry;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io::BufRead;
use std::path::Path;

use crate::params::SyntheticParams;

/// One timed sensor event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimedEvent {
    pub tick: u32,
    pub x: u32,
    pub y: u32,
}

/// Events for each tick of the simulation.
pub trait EventSource {
    /// Append the events due at `tick` to `out`.
    fn events_for_tick(&mut self, tick: u32, out: &mut Vec<(u32, u32)>);

    /// No further events will be produced.
    fn exhausted(&self) -> bool {
        false
    }

    /// Ground truth `[x, y, r]`, when the source knows it.
    fn truth(&self) -> Option<[f32; 3]> {
        None
    }
}

/// Replay of a recorded spike train.
///
/// The file holds one pixel per line as `x;y;t1,t2,...` with spike times in
/// milliseconds; a pixel without spikes has an empty time list.
#[derive(Debug, Clone)]
pub struct SpikeReplay {
    events: Vec<TimedEvent>,
    cursor: usize,
}

impl SpikeReplay {
    pub fn open(path: &Path, timer_period_us: u32, geometry: &SensorGeometry) -> Result<Self> {
        let file =
            std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
        Self::parse(std::io::BufReader::new(file), timer_period_us, geometry)
            .with_context(|| format!("reading {}", path.display()))
    }

    pub fn parse<R: BufRead>(
        reader: R,
        timer_period_us: u32,
        geometry: &SensorGeometry,
    ) -> Result<Self> {
        if timer_period_us == 0 {
            bail!("timer period must be positive");
        }
        let mut events = Vec::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(3, ';');
            let (Some(x), Some(y), times) = (parts.next(), parts.next(), parts.next()) else {
                bail!("line {}: expected `x;y;times`", n + 1);
            };
            let x: u32 = x
                .trim()
                .parse()
                .with_context(|| format!("line {}: bad x", n + 1))?;
            let y: u32 = y
                .trim()
                .parse()
                .with_context(|| format!("line {}: bad y", n + 1))?;
            if x >= geometry.width || y >= geometry.height {
                bail!("line {}: pixel ({x}, {y}) is outside the sensor", n + 1);
            }
            for t in times.unwrap_or("").split(',').map(str::trim).filter(|t| !t.is_empty()) {
                let t_ms: u64 = t
                    .parse()
                    .with_context(|| format!("line {}: bad spike time {t:?}", n + 1))?;
                let tick = t_ms * 1000 / u64::from(timer_period_us);
                events.push(TimedEvent {
                    tick: u32::try_from(tick)
                        .with_context(|| format!("line {}: spike time out of range", n + 1))?,
                    x,
                    y,
                });
            }
        }
        events.sort();
        Ok(Self { events, cursor: 0 })
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Tick of the last event.
    pub fn last_tick(&self) -> Option<u32> {
        self.events.last().map(|e| e.tick)
    }
}

impl EventSource for SpikeReplay {
    fn events_for_tick(&mut self, tick: u32, out: &mut Vec<(u32, u32)>) {
        // late events (tick already passed) are delivered now
        while let Some(e) = self.events.get(self.cursor) {
            if e.tick > tick {
                break;
            }
            out.push((e.x, e.y));
            self.cursor += 1;
        }
    }

    fn exhausted(&self) -> bool {
        self.cursor >= self.events.len()
    }
}

/// Moving circle with background noise.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    params: SyntheticParams,
    circle: MovingCircle,
    geometry: SensorGeometry,
    rng: StdRng,
}

impl SyntheticSource {
    pub fn new(params: SyntheticParams, geometry: SensorGeometry, seed: u64) -> Self {
        let s = params.start;
        Self {
            circle: MovingCircle::new(s.x, s.y, s.r, params.vx, params.vy),
            params,
            geometry,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl EventSource for SyntheticSource {
    fn events_for_tick(&mut self, _tick: u32, out: &mut Vec<(u32, u32)>) {
        let mut edge = pf_engine::test_utils::noisy_circle_events(
            self.circle.x,
            self.circle.y,
            self.circle.r,
            self.params.events_per_tick,
            self.params.jitter,
            &self.geometry,
            &mut self.rng,
        );
        out.append(&mut edge);
        out.extend(background_events(
            self.params.noise_per_tick,
            &self.geometry,
            &mut self.rng,
        ));
        self.circle.step(&self.geometry);
    }

    fn truth(&self) -> Option<[f32; 3]> {
        Some([self.circle.x, self.circle.y, self.circle.r])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
10;20;5,1
11;20;
300;239;1000
";

    #[test]
    fn test_parse_orders_by_time() {
        let replay =
            SpikeReplay::parse(SAMPLE.as_bytes(), 1000, &SensorGeometry::default()).unwrap();
        assert_eq!(replay.len(), 3);
        assert_eq!(replay.last_tick(), Some(1000));

        let mut replay = replay;
        let mut out = Vec::new();
        replay.events_for_tick(0, &mut out);
        assert!(out.is_empty());
        replay.events_for_tick(1, &mut out);
        assert_eq!(out, vec![(10, 20)]);
        out.clear();
        // tick 5 skipped: delivered late at tick 7
        replay.events_for_tick(7, &mut out);
        assert_eq!(out, vec![(10, 20)]);
        assert!(!replay.exhausted());
        out.clear();
        replay.events_for_tick(1000, &mut out);
        assert_eq!(out, vec![(300, 239)]);
        assert!(replay.exhausted());
        assert_eq!(replay.truth(), None);
    }

    #[test]
    fn test_timer_period_scales_ticks() {
        let replay =
            SpikeReplay::parse("1;1;10\n".as_bytes(), 500, &SensorGeometry::default()).unwrap();
        assert_eq!(replay.last_tick(), Some(20));
    }

    #[test]
    fn test_parse_errors_name_the_line() {
        let geometry = SensorGeometry::default();
        let err = SpikeReplay::parse("1;1;3\nfoo;2;3\n".as_bytes(), 1000, &geometry).unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));

        assert!(SpikeReplay::parse("400;1;3\n".as_bytes(), 1000, &geometry).is_err());
        assert!(SpikeReplay::parse("7\n".as_bytes(), 1000, &geometry).is_err());
    }

    #[test]
    fn test_synthetic_is_reproducible() {
        let geometry = SensorGeometry::default();
        let mut a = SyntheticSource::new(SyntheticParams::default(), geometry, 4);
        let mut b = SyntheticSource::new(SyntheticParams::default(), geometry, 4);
        let (mut ea, mut eb) = (Vec::new(), Vec::new());
        for t in 0..3 {
            a.events_for_tick(t, &mut ea);
            b.events_for_tick(t, &mut eb);
        }
        assert_eq!(ea, eb);
        assert!(!ea.is_empty());
        assert_ne!(a.truth(), Some([152.0, 120.0, 20.0]));
        assert_eq!(a.truth(), b.truth());
    }
}
