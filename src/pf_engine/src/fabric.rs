//! In-process broadcast fabric and fleet runtime.
//!
//! Stands in for the multicast router of the target hardware: a key/mask
//! routing table, one bounded outbound queue per node, and a deterministic
//! cooperative scheduler. Every fabric tick delivers in-flight packets
//! (highest priority), ticks every node's timer, then runs deferred tasks in
//! rounds until the fleet is idle or the round budget is spent.
//!
//! # Key space
//!
//! | range                      | sender          | routed to            |
//! |----------------------------|-----------------|----------------------|
//! | `RAW_EVENT_BASE + xy`      | host            | row filter for `y`   |
//! | `EVENT_BASE + xy`          | host or filters | every particle       |
//! | `FILTER_UPDATE_KEY + xy`   | main particle   | every row filter     |
//! | `PARTICLE_BASE + 8 i + f`  | particle `i`    | peers or aggregators |
//! | `AGGREGATOR_BASE + 8 i + f`| aggregator `i`  | particle `i`         |
//! | `OUTPUT_BASE + (xy << 1)`  | main node       | host                 |

use std::collections::VecDeque;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::codec::{encode_event, Packet, FIELD_MASK, RAW_EVENT_FLAG, Y_MASK, Y_SHIFT};
use crate::config::{ExchangeMode, FilterParams, InitialHypothesis, NodeConfig, NodeKeys, Role};
use crate::error::{ConfigError, EngineError};
use crate::node::NodeContext;
use crate::particle::{R_MAX, R_MIN};
use crate::recording::Recorder;
use crate::simulation::{SimulationConfig, TickOutcome};
use crate::transport::Transport;

/// Filtered sensor events, as seen by particles.
pub const EVENT_BASE: u32 = 0x0020_0000;
/// Raw sensor events, before the row filters.
pub const RAW_EVENT_BASE: u32 = EVENT_BASE | RAW_EVENT_FLAG;
/// Region-of-interest broadcasts.
pub const FILTER_UPDATE_KEY: u32 = 0x0040_0000;
/// First particle's state key.
pub const PARTICLE_BASE: u32 = 0x0100_0000;
/// First aggregator's target key.
pub const AGGREGATOR_BASE: u32 = 0x0200_0000;
/// Position output to the host.
pub const OUTPUT_BASE: u32 = 0x0300_0000;

const CLASS_MASK: u32 = 0xFFF0_0000;
const SENDER_MASK: u32 = !FIELD_MASK;
const FILTER_UPDATE_MASK: u32 = 0xFFFE_0000;
const OUTPUT_MASK: u32 = 0xFFFC_0000;
const ROW_MASK: u32 = CLASS_MASK | (Y_MASK << Y_SHIFT);

/// State key of particle `i`.
pub fn particle_key(i: usize) -> u32 {
    PARTICLE_BASE + i as u32 * (FIELD_MASK + 1)
}

/// Target key of aggregator `i`.
pub fn aggregator_key(i: usize) -> u32 {
    AGGREGATOR_BASE + i as u32 * (FIELD_MASK + 1)
}

/// Where a packet can go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Node(usize),
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Route {
    key: u32,
    mask: u32,
    dest: Endpoint,
}

/// Key/mask multicast table. A packet goes to every matching destination
/// except its sender.
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: u32, mask: u32, dest: Endpoint) {
        self.routes.push(Route {
            key: key & mask,
            mask,
            dest,
        });
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn destinations(
        &self,
        key: u32,
        sender: Endpoint,
    ) -> impl Iterator<Item = Endpoint> + '_ {
        self.routes
            .iter()
            .filter(move |r| key & r.mask == r.key && r.dest != sender)
            .map(|r| r.dest)
    }
}

/// Bounded outbound queue of one node. Waiting moves one packet onto the
/// wire, so a full queue drains while the sender backs off.
#[derive(Debug)]
pub struct Outbound {
    queue: VecDeque<Packet>,
    capacity: usize,
    wire: Vec<Packet>,
}

impl Outbound {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            wire: Vec::new(),
        }
    }

    /// Hand everything queued to the wire.
    pub fn flush(&mut self) {
        self.wire.extend(self.queue.drain(..));
    }

    fn take_wire(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.wire)
    }

    pub fn in_flight(&self) -> usize {
        self.queue.len() + self.wire.len()
    }
}

impl Transport for Outbound {
    fn try_send(&mut self, packet: Packet) -> bool {
        if self.queue.len() >= self.capacity {
            return false;
        }
        self.queue.push_back(packet);
        true
    }

    fn wait(&mut self, _delay: Duration) {
        if let Some(packet) = self.queue.pop_front() {
            self.wire.push(packet);
        }
    }
}

/// Everything needed to bring up a fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSpec {
    pub topology: ExchangeMode,
    pub n_particles: usize,
    /// Common starting hypothesis; `None` scatters particles at random
    pub initial: Option<InitialHypothesis>,
    /// One row filter per sensor row, gated by the main particle's region
    pub filters: bool,
    /// Record the tracked target once per tick
    pub record: bool,
    /// Ticks between position outputs to the host (0 disables)
    pub output_period_ticks: u32,
    pub seed: u64,
    /// Outbound queue depth per node
    pub outbound_capacity: usize,
    /// Task rounds per fabric tick
    pub task_budget: usize,
    pub params: FilterParams,
    pub sim: SimulationConfig,
}

impl Default for FleetSpec {
    fn default() -> Self {
        Self {
            topology: ExchangeMode::PeerToPeer,
            n_particles: 8,
            initial: None,
            filters: false,
            record: true,
            output_period_ticks: 0,
            seed: 0,
            outbound_capacity: 16,
            task_budget: 64,
            params: FilterParams::default(),
            sim: SimulationConfig::default(),
        }
    }
}

/// A running fleet of nodes on one fabric.
pub struct Fleet {
    nodes: Vec<NodeContext>,
    links: Vec<Outbound>,
    router: Router,
    host_wire: Vec<Packet>,
    host_packets: Vec<Packet>,
    recording_node: usize,
    filters: bool,
    task_budget: usize,
}

impl Fleet {
    /// Build and validate every node. The recorder, if any, is attached to
    /// the node that publishes the target: the main particle in peer-to-peer
    /// mode, the first aggregator otherwise.
    pub fn build(
        spec: &FleetSpec,
        recorder: Option<Box<dyn Recorder>>,
    ) -> Result<Self, EngineError> {
        let n = spec.n_particles;
        if n == 0 {
            return Err(ConfigError::NoParticles(0).into());
        }
        let geometry = spec.params.geometry;
        let mut rng = StdRng::seed_from_u64(spec.seed);
        let peers: Vec<u32> = (0..n).map(particle_key).collect();
        let aggregated = spec.topology == ExchangeMode::Aggregated;
        let recording_node = if aggregated { n } else { 0 };

        let mut configs = Vec::new();
        let xs = Uniform::new(0.0, geometry.width as f32);
        let ys = Uniform::new(0.0, geometry.height as f32);
        let rs = Uniform::new_inclusive(R_MIN, R_MAX);
        for i in 0..n {
            let initial = spec.initial.unwrap_or_else(|| InitialHypothesis {
                x: xs.sample(&mut rng),
                y: ys.sample(&mut rng),
                r: rs.sample(&mut rng),
            });
            configs.push(NodeConfig {
                ordinal: i,
                role: Role::Particle,
                mode: spec.topology,
                main: i == 0,
                n_particles: n,
                initial,
                keys: NodeKeys {
                    own: Some(peers[i]),
                    peers: peers.clone(),
                    partner: aggregated.then_some(aggregator_key(i)),
                    filter_update: (i == 0 && spec.filters).then_some(FILTER_UPDATE_KEY),
                    output: (!aggregated && i == 0).then_some(OUTPUT_BASE),
                },
                record: !aggregated && i == 0 && spec.record,
                filter_row: 0,
                output_period_ticks: if !aggregated && i == 0 {
                    spec.output_period_ticks
                } else {
                    0
                },
            });
        }
        if aggregated {
            for i in 0..n {
                configs.push(NodeConfig {
                    ordinal: i,
                    role: Role::Aggregator,
                    mode: spec.topology,
                    main: i == 0,
                    n_particles: n,
                    initial: spec.initial.unwrap_or_default(),
                    keys: NodeKeys {
                        own: Some(aggregator_key(i)),
                        peers: peers.clone(),
                        partner: Some(peers[i]),
                        filter_update: None,
                        output: (i == 0).then_some(OUTPUT_BASE),
                    },
                    record: i == 0 && spec.record,
                    filter_row: 0,
                    output_period_ticks: if i == 0 { spec.output_period_ticks } else { 0 },
                });
            }
        }
        if spec.filters {
            for row in 0..geometry.height {
                configs.push(NodeConfig {
                    ordinal: row as usize,
                    role: Role::RoiFilter,
                    filter_row: row,
                    keys: NodeKeys {
                        filter_update: Some(FILTER_UPDATE_KEY),
                        ..NodeKeys::default()
                    },
                    ..NodeConfig::default()
                });
            }
        }

        let mut router = Router::new();
        let mut nodes = Vec::with_capacity(configs.len());
        let mut recorder = recorder;
        for (id, config) in configs.into_iter().enumerate() {
            match config.role {
                Role::Particle => {
                    router.add(EVENT_BASE, CLASS_MASK, Endpoint::Node(id));
                }
                Role::Aggregator => {
                    // every particle reports to every aggregator
                    router.add(PARTICLE_BASE, CLASS_MASK, Endpoint::Node(id));
                }
                Role::RoiFilter => {
                    let row_key = RAW_EVENT_BASE | (config.filter_row << Y_SHIFT);
                    router.add(row_key, ROW_MASK, Endpoint::Node(id));
                    router.add(FILTER_UPDATE_KEY, FILTER_UPDATE_MASK, Endpoint::Node(id));
                }
            }
            if config.role == Role::Particle {
                if aggregated {
                    router.add(aggregator_key(config.ordinal), SENDER_MASK, Endpoint::Node(id));
                } else {
                    router.add(PARTICLE_BASE, CLASS_MASK, Endpoint::Node(id));
                }
            }

            let seed: u64 = rng.gen();
            let mut node = NodeContext::new(id, config, spec.params.clone(), spec.sim, seed)?;
            if id == recording_node {
                if let Some(r) = recorder.take() {
                    node = node.with_recorder(r);
                }
            }
            nodes.push(node);
        }
        router.add(OUTPUT_BASE, OUTPUT_MASK, Endpoint::Host);

        info!(
            nodes = nodes.len(),
            particles = n,
            topology = ?spec.topology,
            filters = spec.filters,
            routes = router.len(),
            "fleet built"
        );

        let links = (0..nodes.len())
            .map(|_| Outbound::new(spec.outbound_capacity.max(1)))
            .collect();
        Ok(Self {
            nodes,
            links,
            router,
            host_wire: Vec::new(),
            host_packets: Vec::new(),
            recording_node,
            filters: spec.filters,
            task_budget: spec.task_budget.max(1),
        })
    }

    pub fn nodes(&self) -> &[NodeContext] {
        &self.nodes
    }

    pub fn node(&self, id: usize) -> Option<&NodeContext> {
        self.nodes.get(id)
    }

    /// The node publishing the tracked target.
    pub fn recording_node(&self) -> &NodeContext {
        &self.nodes[self.recording_node]
    }

    pub fn target(&self) -> Option<[f32; 3]> {
        self.recording_node().target()
    }

    pub fn is_paused(&self) -> bool {
        self.nodes.iter().all(NodeContext::is_paused)
    }

    /// Queue a sensor event from the host. It goes through the row filters
    /// when they are present.
    pub fn inject_event(&mut self, x: u32, y: u32) {
        let base = if self.filters { RAW_EVENT_BASE } else { EVENT_BASE };
        self.host_wire.push(Packet::no_payload(encode_event(base, x, y)));
    }

    /// Packets routed to the host since the last call.
    pub fn take_host_packets(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.host_packets)
    }

    /// One timer period for the whole fleet. Returns the main node's outcome.
    pub fn tick(&mut self) -> TickOutcome {
        self.deliver();
        let mut outcome = TickOutcome::Paused;
        for node in &mut self.nodes {
            let o = node.on_tick();
            if node.id() == self.recording_node {
                outcome = o;
            }
        }

        for round in 0..self.task_budget {
            self.deliver();
            let mut ran = false;
            for (node, link) in self.nodes.iter_mut().zip(self.links.iter_mut()) {
                ran |= node.run_next_task(&mut *link);
                link.flush();
            }
            if !ran && self.links.iter().all(|l| l.in_flight() == 0) {
                debug!(round, "fleet idle");
                break;
            }
        }
        self.deliver();
        outcome
    }

    /// Restart every node at tick 0.
    pub fn resume(&mut self, ticks: Option<u32>) {
        for node in &mut self.nodes {
            node.resume(ticks);
        }
    }

    fn deliver(&mut self) {
        let mut in_flight: Vec<(Endpoint, Packet)> = self
            .host_wire
            .drain(..)
            .map(|p| (Endpoint::Host, p))
            .collect();
        for (id, link) in self.links.iter_mut().enumerate() {
            in_flight.extend(link.take_wire().into_iter().map(|p| (Endpoint::Node(id), p)));
        }

        for (sender, packet) in in_flight {
            for dest in self.router.destinations(packet.key, sender) {
                match dest {
                    Endpoint::Node(id) => self.nodes[id].on_packet(&packet),
                    Endpoint::Host => self.host_packets.push(packet),
                }
            }
        }
    }
}
