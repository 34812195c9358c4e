//! Per-node context owned by the main loop.
//!
//! [`NodeContext`] bundles everything a node needs: its role, the simulation
//! clock, the deferred task queue, rate counters and an optional recorder.
//! The host drives it through three entry points that mirror the callback
//! priorities: [`NodeContext::on_packet`] (highest), [`NodeContext::on_tick`]
//! and [`NodeContext::run_next_task`] (lowest).

use tracing::{debug, info};

use crate::codec::Packet;
use crate::config::{FilterParams, NodeConfig, ResumePolicy, Role};
use crate::diagnostics::{RateCounters, RateReport};
use crate::error::EngineError;
use crate::recording::Recorder;
use crate::roles::{AggregatorRole, NodeServices, ParticleRole, RoiFilterRole};
use crate::scheduler::{Task, TaskQueue};
use crate::simulation::{SimClock, SimulationConfig, TickOutcome};
use crate::transport::Transport;

pub enum RoleState {
    Particle(Box<ParticleRole>),
    Aggregator(Box<AggregatorRole>),
    RoiFilter(Box<RoiFilterRole>),
}

impl RoleState {
    pub fn name(&self) -> &'static str {
        match self {
            RoleState::Particle(_) => "particle",
            RoleState::Aggregator(_) => "aggregator",
            RoleState::RoiFilter(_) => "roi_filter",
        }
    }
}

pub struct NodeContext {
    id: usize,
    config: NodeConfig,
    params: FilterParams,
    role: RoleState,
    clock: SimClock,
    tasks: TaskQueue,
    counters: RateCounters,
    recorder: Option<Box<dyn Recorder>>,
}

impl NodeContext {
    /// Validate the configuration blob and build the node. Any error here is
    /// fatal: the node never enters the main loop.
    pub fn new(
        id: usize,
        config: NodeConfig,
        params: FilterParams,
        sim: SimulationConfig,
        seed: u64,
    ) -> Result<Self, EngineError> {
        config.validate(&params)?;

        let role = match config.role {
            Role::Particle => {
                RoleState::Particle(Box::new(ParticleRole::new(&config, &params, seed)?))
            }
            Role::Aggregator => {
                RoleState::Aggregator(Box::new(AggregatorRole::new(&config, &params, seed)?))
            }
            Role::RoiFilter => {
                RoleState::RoiFilter(Box::new(RoiFilterRole::new(&config, &params)?))
            }
        };

        debug!(
            node = id,
            role = role.name(),
            ordinal = config.ordinal,
            record = config.record,
            "node initialised"
        );

        Ok(Self {
            id,
            config,
            params,
            role,
            clock: SimClock::new(sim),
            tasks: TaskQueue::default(),
            counters: RateCounters::default(),
            recorder: None,
        })
    }

    /// Attach the recording collaborator. Only used when `record` is set.
    pub fn with_recorder(mut self, recorder: Box<dyn Recorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn role(&self) -> &RoleState {
        &self.role
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    /// Counters of the current rate period.
    pub fn counters(&self) -> &RateCounters {
        &self.counters
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_paused(&self) -> bool {
        self.clock.is_paused()
    }

    /// Tracked `[x, y, r]` as seen by this node.
    pub fn target(&self) -> Option<[f32; 3]> {
        match &self.role {
            RoleState::Particle(p) => Some(p.target()),
            RoleState::Aggregator(a) => Some(a.target()),
            RoleState::RoiFilter(_) => None,
        }
    }

    /// Packet-received handler. Bounded work only; paused nodes still
    /// accept packets.
    pub fn on_packet(&mut self, packet: &Packet) {
        let mut svc = NodeServices {
            node: self.id,
            tasks: &mut self.tasks,
            counters: &mut self.counters,
        };
        match &mut self.role {
            RoleState::Particle(p) => p.on_packet(packet, &mut svc),
            RoleState::Aggregator(a) => a.on_packet(packet, &mut svc),
            RoleState::RoiFilter(f) => f.on_packet(packet, &mut svc),
        }
    }

    /// Timer tick: simulation length, recording, start-up, rate report and
    /// output cadence.
    pub fn on_tick(&mut self) -> TickOutcome {
        let outcome = self.clock.tick();
        match outcome {
            TickOutcome::Paused => {}
            TickOutcome::Completed => {
                if let Some(recorder) = self.recorder.as_mut() {
                    recorder.finalise();
                }
                info!(node = self.id, role = self.role.name(), "simulation complete, paused");
            }
            TickOutcome::Running(time) => self.running_tick(time),
        }
        outcome
    }

    fn running_tick(&mut self, time: u32) {
        if self.config.record {
            if let (Some(target), Some(recorder)) = (self.target(), self.recorder.as_mut()) {
                recorder.record(time, target);
            }
        }

        let mut svc = NodeServices {
            node: self.id,
            tasks: &mut self.tasks,
            counters: &mut self.counters,
        };
        if time == 0 {
            if let RoleState::Particle(p) = &mut self.role {
                p.on_start(&mut svc);
            }
        }
        let period = self.config.output_period_ticks;
        if period > 0 && time % period == 0 {
            svc.schedule_once(Task::Output);
        }

        if self.clock.report_due() && time > 0 {
            let period = self.counters.take();
            RateReport::from_counters(self.id, self.role.name(), &period).emit();
        }
    }

    /// Run one deferred task. Returns `false` if nothing ran.
    pub fn run_next_task(&mut self, out: &mut dyn Transport) -> bool {
        if self.clock.is_paused() {
            return false;
        }
        let Some(task) = self.tasks.pop() else {
            return false;
        };
        let mut svc = NodeServices {
            node: self.id,
            tasks: &mut self.tasks,
            counters: &mut self.counters,
        };
        match &mut self.role {
            RoleState::Particle(p) => p.run(task, &mut svc, out),
            RoleState::Aggregator(a) => a.run(task, &mut svc, out),
            RoleState::RoiFilter(f) => f.run(task, &mut svc, out),
        }
        true
    }

    /// Restart at tick 0, optionally with a new simulation length.
    pub fn resume(&mut self, ticks: Option<u32>) {
        self.clock.resume(ticks);
        if self.params.resume_policy == ResumePolicy::Reset {
            self.tasks.clear();
        }
        match &mut self.role {
            RoleState::Particle(p) => p.on_resume(),
            RoleState::Aggregator(a) => a.on_resume(),
            RoleState::RoiFilter(_) => {}
        }
        info!(
            node = self.id,
            policy = ?self.params.resume_policy,
            ticks = ?ticks,
            "resumed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_event;
    use crate::config::NodeKeys;
    use crate::error::ConfigError;
    use crate::recording::MemoryRecorder;
    use crate::transport::tests::BoundedLink;

    fn single_particle(record: bool) -> NodeConfig {
        NodeConfig {
            main: true,
            record,
            keys: NodeKeys {
                own: Some(0x0100_0000),
                peers: vec![0x0100_0000],
                ..NodeKeys::default()
            },
            ..NodeConfig::default()
        }
    }

    fn sim(ticks: Option<u32>) -> SimulationConfig {
        SimulationConfig {
            ticks,
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let mut config = single_particle(false);
        config.keys.own = None;
        let err = NodeContext::new(0, config, FilterParams::default(), sim(None), 0)
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Config(ConfigError::MissingOwnKey)));
    }

    #[test]
    fn test_records_every_tick_and_finalises() {
        let recorder = MemoryRecorder::new();
        let mut node =
            NodeContext::new(0, single_particle(true), FilterParams::default(), sim(Some(3)), 1)
                .unwrap()
                .with_recorder(Box::new(recorder.clone()));

        for t in 0..3 {
            assert_eq!(node.on_tick(), TickOutcome::Running(t));
        }
        assert_eq!(node.on_tick(), TickOutcome::Completed);
        assert_eq!(node.on_tick(), TickOutcome::Paused);

        assert_eq!(recorder.len(), 3);
        assert_eq!(recorder.records()[0].x, 64.0);
        assert_eq!(recorder.finalised(), 1);
    }

    #[test]
    fn test_start_schedules_first_send() {
        let mut node =
            NodeContext::new(0, single_particle(false), FilterParams::default(), sim(None), 1)
                .unwrap();
        assert_eq!(node.pending_tasks(), 0);
        node.on_tick();
        assert_eq!(node.pending_tasks(), 1);

        let mut link = BoundedLink::new(64, false);
        assert!(node.run_next_task(&mut link));
        assert_eq!(link.queue.len(), 6);
        // a lone particle completes its own generation and updates next
        assert_eq!(node.pending_tasks(), 1);
    }

    #[test]
    fn test_paused_node_runs_no_tasks() {
        let mut node =
            NodeContext::new(0, single_particle(false), FilterParams::default(), sim(Some(1)), 1)
                .unwrap();
        node.on_tick();
        assert_eq!(node.on_tick(), TickOutcome::Completed);
        assert!(node.is_paused());

        let mut link = BoundedLink::new(64, false);
        assert!(!node.run_next_task(&mut link));
        assert!(link.queue.is_empty());

        // packets are still accepted while paused
        node.on_packet(&Packet::no_payload(encode_event(0x0020_0000, 3, 4)));
        assert_eq!(node.counters().events_received, 1);

        node.resume(Some(2));
        assert!(!node.is_paused());
        assert_eq!(node.on_tick(), TickOutcome::Running(0));
        assert!(node.run_next_task(&mut link));
    }

    #[test]
    fn test_reset_policy_clears_tasks() {
        let params = FilterParams {
            resume_policy: ResumePolicy::Reset,
            ..FilterParams::default()
        };
        let mut node =
            NodeContext::new(0, single_particle(false), params, sim(Some(1)), 1).unwrap();
        node.on_tick();
        assert_eq!(node.pending_tasks(), 1);
        node.on_tick();
        node.resume(None);
        assert_eq!(node.pending_tasks(), 0);
    }

    #[test]
    fn test_rate_counters_reset_each_second() {
        let config = NodeConfig {
            role: Role::RoiFilter,
            filter_row: 4,
            keys: NodeKeys {
                filter_update: Some(0x0040_0000),
                ..NodeKeys::default()
            },
            ..NodeConfig::default()
        };
        let mut node = NodeContext::new(7, config, FilterParams::default(), sim(None), 0).unwrap();
        node.on_packet(&Packet::no_payload(encode_event(0x0030_0000, 3, 4)));
        assert_eq!(node.counters().events_received, 1);

        // report at t = 1000 with a 1 ms timer
        for _ in 0..1000 {
            node.on_tick();
        }
        assert_eq!(node.counters().events_received, 1);
        node.on_tick();
        assert_eq!(node.counters().events_received, 0);
    }

    #[test]
    fn test_output_period() {
        let mut config = single_particle(false);
        config.output_period_ticks = 5;
        config.keys.output = Some(0x0300_0000);
        let mut node = NodeContext::new(0, config, FilterParams::default(), sim(None), 1).unwrap();
        node.on_tick();
        // tick 0: first send and the first output
        assert_eq!(node.pending_tasks(), 2);
        let mut link = BoundedLink::new(64, false);
        while node.run_next_task(&mut link) {
            if link.queue.len() > 20 {
                break;
            }
        }
        assert!(link
            .queue
            .iter()
            .any(|p| p.key & 0xFFFC_0000 == 0x0300_0000 && !p.has_payload()));
    }
}
