//! Aggregator role: collects every particle and resamples for one partner.

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info};

use super::NodeServices;
use crate::codec::{encode_position, FieldSet, Packet};
use crate::config::{FilterParams, NodeConfig, ResumePolicy};
use crate::error::{ConfigError, EngineError};
use crate::exchange::{target_packets, Collector, Reception};
use crate::particle::{select_best_row, ParticleState};
use crate::peers::SenderIndex;
use crate::resample::{normalize, partner_target, PartnerTarget};
use crate::scheduler::Task;
use crate::transport::{Burst, Transport};

pub struct AggregatorRole {
    node: usize,
    own_key: u32,
    output_key: Option<u32>,
    partner_row: usize,
    collector: Collector,
    rng: StdRng,
    params: FilterParams,
    target: Vector3<f32>,
    representative: Option<ParticleState>,
    resampled: u64,
    passed_through: u64,
    /// Target fields not yet on the wire
    pending: Burst,
}

impl AggregatorRole {
    pub fn new(config: &NodeConfig, params: &FilterParams, seed: u64) -> Result<Self, EngineError> {
        let own_key = config.keys.own.ok_or(ConfigError::MissingOwnKey)?;
        let partner = config.keys.partner.ok_or(ConfigError::MissingPartner)?;
        let partner_row = config
            .keys
            .peers
            .iter()
            .position(|&k| k == partner)
            .ok_or(ConfigError::UnknownPartner(partner))?;

        let senders = SenderIndex::new(config.keys.peers.clone(), FieldSet::Full);
        let collector = Collector::new(senders)?;

        info!(
            node = config.ordinal,
            particles = config.keys.peers.len(),
            partner_row,
            key = %format_args!("{own_key:#010x}"),
            "aggregator ready"
        );

        let initial = config.initial;
        Ok(Self {
            node: config.ordinal,
            own_key,
            output_key: config.keys.output,
            partner_row,
            collector,
            rng: StdRng::seed_from_u64(seed),
            params: params.clone(),
            target: Vector3::new(initial.x, initial.y, initial.r),
            representative: None,
            resampled: 0,
            passed_through: 0,
            pending: Burst::new(),
        })
    }

    /// Weighted mean `[x, y, r]` of the last complete population. This is
    /// what gets recorded; the output key carries [`Self::output_position`].
    pub fn target(&self) -> [f32; 3] {
        [self.target.x, self.target.y, self.target.z]
    }

    /// Highest-weight particle of the last complete population.
    pub fn representative(&self) -> Option<&ParticleState> {
        self.representative.as_ref()
    }

    pub fn partner_row(&self) -> usize {
        self.partner_row
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    /// Position published on the output key: the representative, or the
    /// initial hypothesis before the first population.
    pub fn output_position(&self) -> (f32, f32) {
        match &self.representative {
            Some(p) => (p.x, p.y),
            None => (self.target.x, self.target.y),
        }
    }

    pub fn pending(&self) -> &Burst {
        &self.pending
    }

    /// `(resampled, passed_through)` decisions so far.
    pub fn decisions(&self) -> (u64, u64) {
        (self.resampled, self.passed_through)
    }

    pub fn on_packet(&mut self, packet: &Packet, svc: &mut NodeServices<'_>) {
        if !packet.has_payload() {
            svc.counters.protocol_errors += 1;
            error!(
                node = self.node,
                key = %format_args!("{:#010x}", packet.key),
                "aggregator received a packet without payload"
            );
            return;
        }
        match self.collector.on_packet(packet) {
            Reception::Complete { generation } => {
                debug!(node = self.node, generation, "population complete");
                svc.schedule(Task::Aggregate);
            }
            Reception::Stored { .. } => {}
            _ => svc.counters.protocol_errors += 1,
        }
    }

    pub fn on_resume(&mut self) {
        if self.params.resume_policy == ResumePolicy::Reset {
            self.collector.reset();
            self.pending.clear();
        }
    }

    pub fn run(&mut self, task: Task, svc: &mut NodeServices<'_>, out: &mut dyn Transport) {
        match task {
            Task::Aggregate => self.aggregate(svc, out),
            Task::Output => {
                if let Some(key) = self.output_key {
                    let (x, y) = self.output_position();
                    svc.send(out, [encode_position(key, x, y)], &self.params.retry);
                }
            }
            Task::Flush => {
                svc.flush(out, &mut self.pending, &self.params.retry);
            }
            other => debug!(node = self.node, task = ?other, "task not handled by aggregator"),
        }
    }

    fn aggregate(&mut self, svc: &mut NodeServices<'_>, out: &mut dyn Transport) {
        let rows = self.collector.proc_mut();
        let stats = normalize(rows);
        self.target = stats.target;
        self.representative = select_best_row(rows).map(|i| ParticleState::from_row(&rows[i]));

        let Some(decision) =
            partner_target(rows, self.partner_row, &stats, &self.params, &mut self.rng)
        else {
            return;
        };
        match decision {
            PartnerTarget::Resampled(_) => self.resampled += 1,
            PartnerTarget::PassThrough(_) => self.passed_through += 1,
        }
        if stats.degenerate {
            debug!(node = self.node, "population weights degenerate, reset to uniform");
        }

        self.pending.extend(target_packets(self.own_key, decision.state()));
        svc.flush(out, &mut self.pending, &self.params.retry);
        svc.counters.updates += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeKeys, RetryPolicy, Role};
    use crate::diagnostics::RateCounters;
    use crate::exchange::state_packets;
    use crate::scheduler::TaskQueue;
    use crate::transport::tests::BoundedLink;
    use approx::assert_relative_eq;
    use std::collections::VecDeque;

    struct Sink(VecDeque<Packet>);

    impl Transport for Sink {
        fn try_send(&mut self, packet: Packet) -> bool {
            self.0.push_back(packet);
            true
        }
    }

    const PEERS: [u32; 3] = [0x0100_0000, 0x0100_0008, 0x0100_0010];
    const OWN: u32 = 0x0200_0000;

    fn config(partner: usize) -> NodeConfig {
        NodeConfig {
            role: Role::Aggregator,
            n_particles: 3,
            keys: NodeKeys {
                own: Some(OWN),
                peers: PEERS.to_vec(),
                partner: Some(PEERS[partner]),
                output: Some(0x0300_0000),
                ..NodeKeys::default()
            },
            ..NodeConfig::default()
        }
    }

    fn feed(
        role: &mut AggregatorRole,
        states: &[ParticleState],
        tasks: &mut TaskQueue,
        counters: &mut RateCounters,
    ) {
        for (key, state) in PEERS.iter().zip(states) {
            for packet in state_packets(*key, state) {
                let mut svc = NodeServices {
                    node: 0,
                    tasks: &mut *tasks,
                    counters: &mut *counters,
                };
                role.on_packet(&packet, &mut svc);
            }
        }
    }

    fn particle(x: f32, w: f32) -> ParticleState {
        ParticleState {
            w,
            n: 100.0,
            ..ParticleState::new(x, 50.0, 20.0)
        }
    }

    #[test]
    fn test_rejects_unknown_partner() {
        let mut cfg = config(0);
        cfg.keys.partner = Some(0x0900_0000);
        assert!(AggregatorRole::new(&cfg, &FilterParams::default(), 0).is_err());
    }

    #[test]
    fn test_even_weights_pass_through() {
        let mut role = AggregatorRole::new(&config(1), &FilterParams::default(), 7).unwrap();
        let mut tasks = TaskQueue::default();
        let mut counters = RateCounters::default();
        let states = [particle(10.0, 1.0), particle(20.0, 1.0), particle(30.0, 1.0)];
        feed(&mut role, &states, &mut tasks, &mut counters);
        assert_eq!(tasks.pop(), Some(Task::Aggregate));

        let mut out = Sink(VecDeque::new());
        let mut svc = NodeServices {
            node: 0,
            tasks: &mut tasks,
            counters: &mut counters,
        };
        role.run(Task::Aggregate, &mut svc, &mut out);

        assert_eq!(role.decisions(), (0, 1));
        let [x, y, r] = role.target();
        assert_relative_eq!(x, 20.0, epsilon = 1e-4);
        assert_relative_eq!(y, 50.0, epsilon = 1e-4);
        assert_relative_eq!(r, 20.0, epsilon = 1e-4);

        // five packets from the aggregator key: the partner's row, l = 0
        assert_eq!(out.0.len(), 5);
        assert_eq!(out.0[0], crate::codec::encode_field(OWN, crate::codec::Field::X, 20.0));
        assert_eq!(out.0[3].payload, Some(0f32.to_bits()));
        assert_relative_eq!(f32::from_bits(out.0[4].payload.unwrap()), 1.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_dominant_particle_is_resampled() {
        let mut role = AggregatorRole::new(&config(0), &FilterParams::default(), 7).unwrap();
        let mut tasks = TaskQueue::default();
        let mut counters = RateCounters::default();
        let states = [particle(10.0, 0.0), particle(20.0, 0.0), particle(30.0, 5.0)];
        feed(&mut role, &states, &mut tasks, &mut counters);

        let mut out = Sink(VecDeque::new());
        let mut svc = NodeServices {
            node: 0,
            tasks: &mut tasks,
            counters: &mut counters,
        };
        role.run(Task::Aggregate, &mut svc, &mut out);

        assert_eq!(role.decisions(), (1, 0));
        assert_eq!(role.representative().unwrap().x, 30.0);
        assert_eq!(f32::from_bits(out.0[0].payload.unwrap()), 30.0);
        assert_eq!(counters.updates, 1);
    }

    #[test]
    fn test_raw_event_is_protocol_error() {
        let mut role = AggregatorRole::new(&config(0), &FilterParams::default(), 0).unwrap();
        let mut tasks = TaskQueue::default();
        let mut counters = RateCounters::default();
        let mut svc = NodeServices {
            node: 0,
            tasks: &mut tasks,
            counters: &mut counters,
        };
        role.on_packet(&Packet::no_payload(0x0020_1234), &mut svc);
        assert_eq!(counters.protocol_errors, 1);
        assert!(tasks.is_empty());
    }

    #[test]
    fn test_output_sends_position() {
        let mut role = AggregatorRole::new(&config(0), &FilterParams::default(), 0).unwrap();
        let mut tasks = TaskQueue::default();
        let mut counters = RateCounters::default();
        let mut out = Sink(VecDeque::new());
        let mut svc = NodeServices {
            node: 0,
            tasks: &mut tasks,
            counters: &mut counters,
        };
        // no population yet: the initial hypothesis
        role.run(Task::Output, &mut svc, &mut out);
        assert_eq!(out.0[0], encode_position(0x0300_0000, 64.0, 64.0));

        let states = [particle(10.0, 1.0), particle(20.0, 1.0), particle(150.0, 6.0)];
        feed(&mut role, &states, &mut tasks, &mut counters);
        let mut svc = NodeServices {
            node: 0,
            tasks: &mut tasks,
            counters: &mut counters,
        };
        role.run(Task::Aggregate, &mut svc, &mut out);
        out.0.clear();
        role.run(Task::Output, &mut svc, &mut out);

        // the highest-weight particle, not the weighted mean (x = 116.25)
        assert_eq!(out.0.len(), 1);
        assert_eq!(out.0[0], encode_position(0x0300_0000, 150.0, 50.0));
        assert_relative_eq!(role.target()[0], 116.25, epsilon = 1e-3);
    }

    #[test]
    fn test_target_burst_resumes_after_exhaustion() {
        let params = FilterParams {
            retry: RetryPolicy {
                max_attempts: 1,
                backoff_us: 0,
            },
            ..FilterParams::default()
        };
        let mut role = AggregatorRole::new(&config(0), &params, 7).unwrap();
        let mut tasks = TaskQueue::default();
        let mut counters = RateCounters::default();
        let states = [particle(10.0, 0.0), particle(20.0, 0.0), particle(30.0, 5.0)];
        feed(&mut role, &states, &mut tasks, &mut counters);
        assert_eq!(tasks.pop(), Some(Task::Aggregate));

        let mut link = BoundedLink::new(3, false);
        let mut svc = NodeServices {
            node: 0,
            tasks: &mut tasks,
            counters: &mut counters,
        };
        role.run(Task::Aggregate, &mut svc, &mut link);
        assert_eq!(link.queue.len(), 3);
        assert_eq!(role.pending().len(), 2);
        assert_eq!(counters.send_failures, 1);
        assert_eq!(tasks.pop(), Some(Task::Flush));

        link.delivered.extend(link.queue.drain(..));
        let mut svc = NodeServices {
            node: 0,
            tasks: &mut tasks,
            counters: &mut counters,
        };
        role.run(Task::Flush, &mut svc, &mut link);
        link.delivered.extend(link.queue.drain(..));

        assert!(role.pending().is_empty());
        assert!(tasks.is_empty());
        // five fields, each once, in wire order
        let keys: Vec<u32> = link.delivered.iter().map(|p| p.key).collect();
        assert_eq!(keys, (0..5).map(|i| OWN + i).collect::<Vec<_>>());
        assert_eq!(f32::from_bits(link.delivered[0].payload.unwrap()), 30.0);
    }

    #[test]
    fn test_resume_reset_drops_partial_population() {
        let params = FilterParams {
            resume_policy: ResumePolicy::Reset,
            ..FilterParams::default()
        };
        let mut role = AggregatorRole::new(&config(0), &params, 0).unwrap();
        let mut tasks = TaskQueue::default();
        let mut counters = RateCounters::default();
        feed(&mut role, &[particle(1.0, 1.0)], &mut tasks, &mut counters);
        assert_eq!(role.collector().received(), 6);
        role.on_resume();
        assert_eq!(role.collector().received(), 0);
    }
}
