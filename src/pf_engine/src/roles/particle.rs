//! Particle role: one weighted circle hypothesis.
//!
//! In peer-to-peer mode the particle exchanges its full state with every
//! other particle in turn order and resamples from the whole population
//! itself. In aggregated mode it reports its state to the aggregators after
//! every update and resamples from the five-field target its partner
//! aggregator sends back.

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info};

use super::roi_filter::clamp_roi_centre;
use super::NodeServices;
use crate::codec::{encode_position, encode_roi, Field, FieldSet, Packet, FIELD_MASK};
use crate::config::{ExchangeMode, FilterParams, NodeConfig, ResumePolicy};
use crate::error::{ConfigError, EngineError};
use crate::event_queue::EventQueue;
use crate::exchange::{state_packets, TurnExchange};
use crate::likelihood::{LikelihoodEngine, ANG_BUCKETS};
use crate::particle::ParticleState;
use crate::resample::{normalize, predict, resample};
use crate::scheduler::Task;
use crate::timing::{Timer, TimingStats, UpdateTiming};
use crate::transport::{Burst, Transport};

/// Reassembles the partner aggregator's five-field resample target.
#[derive(Debug, Clone)]
pub struct TargetLink {
    partner_key: u32,
    fields: [Option<f32>; 5],
}

/// A complete resample target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Target {
    pub x: f32,
    pub y: f32,
    pub r: f32,
    pub l: f32,
    pub w: f32,
}

impl TargetLink {
    pub fn new(partner_key: u32) -> Self {
        Self {
            partner_key,
            fields: [None; 5],
        }
    }

    /// Store one field. `Some(true)` once all five fields are present,
    /// `None` if the packet is not a target field from the partner.
    pub fn on_packet(&mut self, packet: &Packet) -> Option<bool> {
        if packet.key & !FIELD_MASK != self.partner_key {
            return None;
        }
        let payload = packet.payload?;
        let offset = (packet.key & FIELD_MASK) as usize;
        if offset >= FieldSet::NoSupport.len() {
            return None;
        }
        self.fields[offset] = Some(f32::from_bits(payload));
        Some(self.fields.iter().all(Option::is_some))
    }

    /// Take a complete target and start collecting the next one.
    pub fn take(&mut self) -> Option<Target> {
        let [Some(x), Some(y), Some(r), Some(l), Some(w)] = self.fields else {
            return None;
        };
        self.fields = [None; 5];
        Some(Target { x, y, r, l, w })
    }

    pub fn clear(&mut self) {
        self.fields = [None; 5];
    }
}

#[derive(Debug)]
pub enum ParticleMode {
    PeerToPeer(TurnExchange),
    Aggregated(TargetLink),
}

pub struct ParticleRole {
    ordinal: usize,
    main: bool,
    own_key: u32,
    filter_update_key: Option<u32>,
    output_key: Option<u32>,
    state: ParticleState,
    engine: LikelihoodEngine,
    queue: EventQueue,
    scratch: Vec<u32>,
    mode: ParticleMode,
    rng: StdRng,
    params: FilterParams,
    /// Weighted mean of the last normalized population
    target: Vector3<f32>,
    timing: TimingStats,
    /// Field packets not yet on the wire
    pending: Burst,
    /// `pending` ends with a turn broadcast the exchange has not seen go out
    sending_turn: bool,
}

impl ParticleRole {
    pub fn new(config: &NodeConfig, params: &FilterParams, seed: u64) -> Result<Self, EngineError> {
        let own_key = config.keys.own.ok_or(ConfigError::MissingOwnKey)?;
        let mut state = ParticleState::new(config.initial.x, config.initial.y, config.initial.r);
        state.l = params.min_like;

        let mode = match config.mode {
            ExchangeMode::PeerToPeer => {
                let mut exchange =
                    TurnExchange::new(config.ordinal, own_key, config.keys.peers.clone())?;
                exchange.load_own(&state);
                ParticleMode::PeerToPeer(exchange)
            }
            ExchangeMode::Aggregated => {
                let partner = config.keys.partner.ok_or(ConfigError::MissingPartner)?;
                ParticleMode::Aggregated(TargetLink::new(partner))
            }
        };

        if let ParticleMode::PeerToPeer(exchange) = &mode {
            info!(
                node = config.ordinal,
                main = config.main,
                my_turn = exchange.my_turn(),
                full_buffer = exchange.full_buffer(),
                key = %format_args!("{own_key:#010x}"),
                "particle ready: x={} y={} r={}",
                state.x,
                state.y,
                state.r
            );
        } else {
            info!(
                node = config.ordinal,
                main = config.main,
                key = %format_args!("{own_key:#010x}"),
                "aggregated particle ready: x={} y={} r={}",
                state.x,
                state.y,
                state.r
            );
        }

        Ok(Self {
            ordinal: config.ordinal,
            main: config.main,
            own_key,
            filter_update_key: config.keys.filter_update,
            output_key: config.keys.output,
            target: Vector3::new(state.x, state.y, state.r),
            state,
            engine: LikelihoodEngine::new(params),
            queue: EventQueue::new(params.queue_capacity),
            scratch: Vec::with_capacity(params.queue_capacity),
            mode,
            rng: StdRng::seed_from_u64(seed),
            params: params.clone(),
            timing: TimingStats::default(),
            pending: Burst::new(),
            sending_turn: false,
        })
    }

    pub fn state(&self) -> &ParticleState {
        &self.state
    }

    pub fn is_main(&self) -> bool {
        self.main
    }

    /// Last `[x, y, r]` target computed from the population.
    pub fn target(&self) -> [f32; 3] {
        [self.target.x, self.target.y, self.target.z]
    }

    pub fn mode(&self) -> &ParticleMode {
        &self.mode
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn engine(&self) -> &LikelihoodEngine {
        &self.engine
    }

    pub fn timing(&self) -> &TimingStats {
        &self.timing
    }

    /// Field packets waiting for outbound capacity.
    pub fn pending(&self) -> &Burst {
        &self.pending
    }

    /// Packet handler. Events are queued; state packets go to the exchange.
    pub fn on_packet(&mut self, packet: &Packet, svc: &mut NodeServices<'_>) {
        if !packet.has_payload() {
            svc.counters.events_received += 1;
            if !self.queue.push(packet.key) {
                svc.counters.dropped += 1;
            }
            return;
        }

        match &mut self.mode {
            ParticleMode::PeerToPeer(exchange) => {
                let actions = exchange.on_packet(packet);
                if actions.rejected {
                    svc.counters.protocol_errors += 1;
                }
                if actions.turn_reached {
                    svc.schedule(Task::ReadyToSend {
                        proc_done: false,
                        turn: true,
                    });
                }
                if actions.update {
                    svc.schedule(Task::Update);
                }
            }
            ParticleMode::Aggregated(link) => match link.on_packet(packet) {
                Some(true) => {
                    svc.schedule(Task::ApplyTarget);
                }
                Some(false) => {}
                None => {
                    svc.counters.protocol_errors += 1;
                    error!(
                        node = self.ordinal,
                        key = %format_args!("{:#010x}", packet.key),
                        "packet is not from the partner aggregator"
                    );
                }
            },
        }
    }

    /// First tick after start or resume.
    pub fn on_start(&mut self, svc: &mut NodeServices<'_>) {
        match &self.mode {
            ParticleMode::PeerToPeer(exchange) => {
                if exchange.leads() {
                    svc.schedule(Task::ReadyToSend {
                        proc_done: false,
                        turn: true,
                    });
                }
            }
            ParticleMode::Aggregated(_) => {
                svc.schedule(Task::SendState);
            }
        }
    }

    /// Apply the resume policy to in-flight exchange state.
    pub fn on_resume(&mut self) {
        if self.params.resume_policy == ResumePolicy::Reset {
            self.pending.clear();
            self.sending_turn = false;
        }
        match &mut self.mode {
            ParticleMode::PeerToPeer(exchange) => {
                exchange.resume(self.params.resume_policy, &self.state)
            }
            ParticleMode::Aggregated(link) => {
                if self.params.resume_policy == ResumePolicy::Reset {
                    link.clear();
                }
            }
        }
    }

    pub fn run(&mut self, task: Task, svc: &mut NodeServices<'_>, out: &mut dyn Transport) {
        match task {
            Task::ReadyToSend { proc_done, turn } => self.ready_to_send(proc_done, turn, svc, out),
            Task::Update => self.update(svc, out),
            Task::ApplyTarget => self.apply_target(svc, out),
            Task::SendState => {
                self.pending.extend(state_packets(self.own_key, &self.state));
                self.flush_pending(svc, out);
            }
            Task::Output => self.send_position(svc, out),
            Task::Flush => self.flush_pending(svc, out),
            other => debug!(node = self.ordinal, task = ?other, "task not handled by particle"),
        }
    }

    fn ready_to_send(
        &mut self,
        proc_done: bool,
        turn: bool,
        svc: &mut NodeServices<'_>,
        out: &mut dyn Transport,
    ) {
        let ParticleMode::PeerToPeer(exchange) = &mut self.mode else {
            return;
        };
        let Some(packets) = exchange.ready_to_send(proc_done, turn, &self.state) else {
            return;
        };
        self.pending.extend(packets);
        self.sending_turn = true;
        self.flush_pending(svc, out);
    }

    /// Push pending field packets out. A turn broadcast only counts as sent
    /// once its last packet is on the wire.
    fn flush_pending(&mut self, svc: &mut NodeServices<'_>, out: &mut dyn Transport) {
        if !svc.flush(out, &mut self.pending, &self.params.retry) || !self.sending_turn {
            return;
        }
        self.sending_turn = false;
        let ParticleMode::PeerToPeer(exchange) = &mut self.mode else {
            return;
        };
        svc.counters.updates += 1;
        if exchange.sent() {
            svc.schedule(Task::Update);
        }
    }

    /// Peer-to-peer update on the freshly swapped table.
    fn update(&mut self, svc: &mut NodeServices<'_>, out: &mut dyn Transport) {
        let ParticleMode::PeerToPeer(exchange) = &mut self.mode else {
            return;
        };
        let total = Timer::start();
        let mut timing = UpdateTiming::default();

        let step = Timer::start();
        let rows = exchange.collector_mut().proc_mut();
        let stats = normalize(rows);
        self.target = stats.target;
        self.engine.adapt_window(stats.mean_support);
        if let Some(drawn) = resample(rows, &mut self.rng) {
            self.state = drawn;
        }
        let sigma = self.params.sigma;
        predict(
            &mut self.state,
            sigma,
            sigma * self.params.radius_sigma_scale,
            &self.params.geometry,
            &mut self.rng,
        );
        timing.resample_ms = step.elapsed_ms();

        self.score(svc, &mut timing);
        self.send_roi(svc, out);

        let ParticleMode::PeerToPeer(exchange) = &mut self.mode else {
            return;
        };
        exchange.load_own(&self.state);
        let leads = exchange.leads();
        svc.schedule(Task::ReadyToSend {
            proc_done: true,
            turn: leads,
        });

        timing.total_ms = total.elapsed_ms();
        self.timing.add(&timing);
    }

    /// Aggregated update: adopt the partner's target, walk, score, report.
    fn apply_target(&mut self, svc: &mut NodeServices<'_>, out: &mut dyn Transport) {
        let ParticleMode::Aggregated(link) = &mut self.mode else {
            return;
        };
        let Some(target) = link.take() else {
            return;
        };
        let total = Timer::start();
        let mut timing = UpdateTiming::default();

        self.state.w = target.w;
        if target.l > 0.0 {
            self.state.x = target.x;
            self.state.y = target.y;
            self.state.r = target.r;
            self.state.l = target.l;
        }
        let sigma = self.params.sigma_scaler * self.state.n / ANG_BUCKETS as f32;
        predict(
            &mut self.state,
            sigma,
            sigma * self.params.radius_sigma_scale,
            &self.params.geometry,
            &mut self.rng,
        );

        self.score(svc, &mut timing);
        self.send_roi(svc, out);

        self.pending.extend(state_packets(self.own_key, &self.state));
        self.flush_pending(svc, out);
        svc.counters.updates += 1;

        timing.total_ms = total.elapsed_ms();
        self.timing.add(&timing);
    }

    /// Pull new events into the window and score the current hypothesis.
    fn score(&mut self, svc: &mut NodeServices<'_>, timing: &mut UpdateTiming) {
        let step = Timer::start();
        self.scratch.clear();
        let fresh = self.queue.drain_into(&mut self.scratch);
        self.engine.ingest(&self.scratch);
        svc.counters.events_processed += fresh as u64;
        timing.drain_ms = step.elapsed_ms();

        let step = Timer::start();
        let pass = self.engine.evaluate(&mut self.state);
        timing.likelihood_ms = step.elapsed_ms();
        debug!(
            node = self.ordinal,
            l = pass.l,
            n = pass.n,
            scored = pass.scored,
            "likelihood pass"
        );
    }

    fn send_roi(&mut self, svc: &mut NodeServices<'_>, out: &mut dyn Transport) {
        if !self.main {
            return;
        }
        if let Some(key) = self.filter_update_key {
            let (x, y) = clamp_roi_centre(self.state.x, self.state.y, &self.params.geometry);
            let roi = encode_roi(key, x, y, self.state.r);
            svc.send(out, [roi], &self.params.retry);
        }
    }

    fn send_position(&mut self, svc: &mut NodeServices<'_>, out: &mut dyn Transport) {
        if !self.main {
            return;
        }
        if let Some(key) = self.output_key {
            let position = encode_position(key, self.target.x, self.target.y);
            svc.send(out, [position], &self.params.retry);
        }
    }

    /// Field value of the current state.
    pub fn field(&self, field: Field) -> f32 {
        self.state.get(field)
    }
}
