//! Class A end device as an explicit state machine.
//!
//! The simulation drives a [`Node`] by calling [`Node::step`] with the event that is due.
//! The node answers with its new [`NodeState`] and the [`NodeEffect`]s the simulation
//! must carry out: timers to schedule and frames to put on air.
//!
//! ```text
//! Sleep -> Process -> Transmit -> Rx1Wait -> Rx1Listen -> [Rx1Receive] -> Rx2Wait -> Rx2Listen -> [Rx2Receive] -> Sleep
//! ```
//!
//! A node owns exactly one pending timer. Every transition replaces it, so a timer event
//! that no longer matches is stale and ignored.

use std::collections::VecDeque;

use rand::Rng;
use rand_chacha::ChaCha12Rng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    calculate_air_time,
    energy::{EnergyProfile, RadioPhase},
    location::Location,
    radio::{ProtocolTiming, RadioConfig},
    simulation::data_structs::{
        Downlink, Frame, LogContent, LogItem, LogLevel, LogSource, ReceiveWindow,
    },
    units::*,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Sleep,
    Process,
    Transmit,
    Rx1Wait,
    Rx1Listen,
    Rx1Receive,
    Rx2Wait,
    Rx2Listen,
    Rx2Receive,
    /// Transmission held back until the channel's duty cycle budget allows it.
    DutyCycleWait,
}

impl NodeState {
    fn phase(self, tx_power: i32) -> RadioPhase {
        match self {
            NodeState::Sleep => RadioPhase::Sleep,
            NodeState::Process => RadioPhase::Process,
            NodeState::Transmit => RadioPhase::Transmit { tx_power },
            NodeState::Rx1Wait | NodeState::Rx2Wait | NodeState::DutyCycleWait => RadioPhase::Wait,
            NodeState::Rx1Listen | NodeState::Rx2Listen => RadioPhase::Listen,
            NodeState::Rx1Receive | NodeState::Rx2Receive => RadioPhase::Receive,
        }
    }

    /// States that are charged up to the horizon when a replica ends.
    pub fn is_passive(self) -> bool {
        matches!(
            self,
            NodeState::Sleep | NodeState::Rx1Wait | NodeState::Rx2Wait | NodeState::DutyCycleWait
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub state: NodeState,
    pub start: Time,
    pub duration: Time,
    pub energy: Energy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeCounters {
    pub unique_packets_sent: u32,
    pub retransmissions: u32,
    pub packets_lost: u32,
    /// Completed transmissions, first attempts and retries alike.
    pub transmissions: u32,
    pub acks_received: u32,
    pub adr_commands_applied: u32,
    pub duty_cycle_deferrals: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyBreakdown {
    pub sleep: Energy,
    pub process: Energy,
    pub transmit: Energy,
    pub wait: Energy,
    pub listen: Energy,
    pub receive: Energy,
}

impl EnergyBreakdown {
    fn add(&mut self, phase: RadioPhase, energy: Energy) {
        let bucket = match phase {
            RadioPhase::Sleep => &mut self.sleep,
            RadioPhase::Process => &mut self.process,
            RadioPhase::Transmit { .. } => &mut self.transmit,
            RadioPhase::Wait => &mut self.wait,
            RadioPhase::Listen => &mut self.listen,
            RadioPhase::Receive => &mut self.receive,
        };

        *bucket += energy;
    }

    pub fn total(&self) -> Energy {
        self.sleep + self.process + self.transmit + self.wait + self.listen + self.receive
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InterArrival {
    Fixed(Time),
    /// Poisson traffic.
    Exponential { mean: Time },
}

impl InterArrival {
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Time {
        match self {
            InterArrival::Fixed(time) => *time,
            InterArrival::Exponential { mean } => match Exp::new(1.0 / mean.seconds()) {
                Ok(exp) => Time::from_seconds(exp.sample(rng)),
                Err(_) => *mean,
            },
        }
    }

    pub fn mean(&self) -> Time {
        match self {
            InterArrival::Fixed(time) => *time,
            InterArrival::Exponential { mean } => *mean,
        }
    }
}

/// Behaviour shared by every device in a replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    pub energy: EnergyProfile,
    pub timing: ProtocolTiming,
    pub inter_arrival: InterArrival,
    pub process_time: Time,

    /// PHY payload in bytes.
    pub payload_size: u32,
    pub confirmed: bool,
    pub adr_enabled: bool,

    /// Retries of a confirmed payload before it is counted lost.
    pub max_retransmissions: u32,
    pub snr_history_length: usize,
    pub do_phase_logs: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            energy: EnergyProfile::default(),
            timing: ProtocolTiming::default(),
            inter_arrival: InterArrival::Exponential { mean: HOURS },
            process_time: Time::from_milis(5.0),
            payload_size: 12,
            confirmed: true,
            adr_enabled: true,
            max_retransmissions: 8,
            snr_history_length: 20,
            do_phase_logs: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NodeError {
    #[error("payload lost after {attempts} attempts")]
    RetryExhausted { attempts: u32 },
    #[error("duty cycle budget exhausted until {retry_at}s")]
    DutyCycleViolation { retry_at: Time },
}

#[derive(Debug, Clone)]
pub enum NodeEvent {
    Timer(u64),
    Downlink(Downlink),
    /// The last frame was refused by the air interface.
    Rejected(NodeError),
    /// The replica ended.
    Horizon,
}

#[derive(Debug, Clone)]
pub enum NodeEffect {
    Schedule { at: Time, timer: u64 },
    Transmit(Frame),
}

/// What a node can see of the simulation while it steps.
pub struct NodeContext<'a> {
    pub(crate) now: Time,
    pub(crate) rng: &'a mut ChaCha12Rng,
    pub(crate) settings: &'a NodeSettings,
    pub(crate) next_frame_id: &'a mut u32,
    pub(crate) logs: &'a mut Vec<LogItem>,
    pub(crate) do_logs: bool,
}

impl NodeContext<'_> {
    pub fn now(&self) -> Time {
        self.now
    }

    fn take_frame_id(&mut self) -> u32 {
        let id = *self.next_frame_id;
        *self.next_frame_id += 1;
        id
    }

    fn log(&mut self, node_id: usize, content: impl FnOnce() -> LogContent, level: LogLevel) {
        if self.do_logs {
            self.logs.push(LogItem {
                time: self.now,
                log_level: level,
                source: LogSource::Node(node_id),
                content: content(),
            });
        }
    }
}

/// The payload currently being delivered.
#[derive(Debug, Clone)]
struct Packet {
    retransmissions: u32,
    tx_end: Time,
}

#[derive(Debug, Clone)]
pub struct Node {
    id: usize,
    location: Location,
    radio: RadioConfig,

    state: NodeState,
    state_since: Time,
    timer: u64,

    packet: Option<Packet>,
    receiving: Option<Downlink>,

    counters: NodeCounters,
    energy: EnergyBreakdown,
    total_energy: Energy,

    /// Link margins reported back by the gateway.
    snr_history: VecDeque<Dbf>,
    phase_log: Vec<PhaseRecord>,
}

impl Node {
    pub fn new(id: usize, location: Location, radio: RadioConfig) -> Node {
        Node {
            id,
            location,
            radio,
            state: NodeState::Sleep,
            state_since: Time::ZERO,
            timer: 0,
            packet: None,
            receiving: None,
            counters: NodeCounters::default(),
            energy: EnergyBreakdown::default(),
            total_energy: Energy::ZERO,
            snr_history: VecDeque::new(),
            phase_log: Vec::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn radio(&self) -> &RadioConfig {
        &self.radio
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn counters(&self) -> &NodeCounters {
        &self.counters
    }

    pub fn energy(&self) -> &EnergyBreakdown {
        &self.energy
    }

    pub fn total_energy(&self) -> Energy {
        self.total_energy
    }

    pub fn snr_history(&self) -> &VecDeque<Dbf> {
        &self.snr_history
    }

    pub fn phase_log(&self) -> &[PhaseRecord] {
        &self.phase_log
    }

    pub fn take_phase_log(&mut self) -> Vec<PhaseRecord> {
        std::mem::take(&mut self.phase_log)
    }

    /// Energy spent per delivered payload bit, `None` before anything was delivered.
    pub fn energy_per_bit(&self, payload_size: u32) -> Option<Energy> {
        let bits = 8 * payload_size as u64 * self.counters.unique_packets_sent as u64;
        (bits > 0).then(|| self.total_energy / bits as f64)
    }

    /// True when a downlink in `window` would be heard right now.
    pub fn accepts_downlink(&self, window: ReceiveWindow) -> bool {
        matches!(
            (self.state, window),
            (NodeState::Rx1Listen, ReceiveWindow::Rx1) | (NodeState::Rx2Listen, ReceiveWindow::Rx2)
        )
    }

    /// Puts the node to sleep until its first wake up at `start_delay`.
    pub fn initialise(&mut self, ctx: &mut NodeContext, start_delay: Time) -> Vec<NodeEffect> {
        let mut effects = Vec::new();
        self.enter(ctx, NodeState::Sleep, start_delay, &mut effects);
        effects
    }

    pub fn step(&mut self, ctx: &mut NodeContext, event: NodeEvent) -> (NodeState, Vec<NodeEffect>) {
        let mut effects = Vec::new();

        match event {
            NodeEvent::Timer(timer) => {
                if timer == self.timer {
                    self.on_timer(ctx, &mut effects);
                }
            }
            NodeEvent::Downlink(downlink) => self.on_downlink(ctx, downlink, &mut effects),
            NodeEvent::Rejected(error) => self.on_rejected(ctx, error, &mut effects),
            NodeEvent::Horizon => {
                if self.state.is_passive() {
                    self.finish_phase(ctx);
                }
                // Nothing pending may fire after the horizon.
                self.timer += 1;
            }
        }

        (self.state, effects)
    }

    fn on_timer(&mut self, ctx: &mut NodeContext, effects: &mut Vec<NodeEffect>) {
        let settings = ctx.settings;
        let timing = &settings.timing;

        match self.state {
            NodeState::Sleep => {
                self.finish_phase(ctx);
                self.enter(ctx, NodeState::Process, settings.process_time, effects);
            }
            NodeState::Process => {
                self.finish_phase(ctx);
                self.packet = Some(Packet {
                    retransmissions: 0,
                    tx_end: ctx.now,
                });
                self.transmit(ctx, effects);
            }
            NodeState::DutyCycleWait => {
                self.finish_phase(ctx);
                self.transmit(ctx, effects);
            }
            NodeState::Transmit => {
                let rx1_open_delay = timing.rx1_open_delay();
                self.finish_phase(ctx);
                self.counters.transmissions += 1;
                if let Some(packet) = &mut self.packet {
                    packet.tx_end = ctx.now;
                }
                self.enter(ctx, NodeState::Rx1Wait, rx1_open_delay, effects);
            }
            NodeState::Rx1Wait => {
                let window = timing.rx_window_length(&self.radio);
                self.finish_phase(ctx);
                self.enter(ctx, NodeState::Rx1Listen, window, effects);
            }
            NodeState::Rx1Listen => {
                let tx_end = self.packet.as_ref().map(|x| x.tx_end).unwrap_or(ctx.now);
                let rx2_open = tx_end + timing.rx2_open_delay();
                self.finish_phase(ctx);
                let wait = (rx2_open - ctx.now).max(Time::ZERO);
                self.enter(ctx, NodeState::Rx2Wait, wait, effects);
            }
            NodeState::Rx2Wait => {
                let window = timing.rx_window_length(&self.radio.rx2());
                self.finish_phase(ctx);
                self.enter(ctx, NodeState::Rx2Listen, window, effects);
            }
            NodeState::Rx2Listen => {
                self.finish_phase(ctx);
                self.on_no_ack(ctx, effects);
            }
            NodeState::Rx1Receive | NodeState::Rx2Receive => {
                self.finish_phase(ctx);
                if let Some(downlink) = self.receiving.take() {
                    self.on_ack(ctx, downlink, effects);
                } else {
                    self.on_no_ack(ctx, effects);
                }
            }
        }
    }

    fn on_downlink(&mut self, ctx: &mut NodeContext, downlink: Downlink, effects: &mut Vec<NodeEffect>) {
        if !self.accepts_downlink(downlink.window) {
            return;
        }

        let next = match downlink.window {
            ReceiveWindow::Rx1 => NodeState::Rx1Receive,
            ReceiveWindow::Rx2 => NodeState::Rx2Receive,
        };

        self.finish_phase(ctx);
        let receive_time = (downlink.end_time() - ctx.now).max(Time::ZERO);
        self.receiving = Some(downlink);
        self.enter(ctx, next, receive_time, effects);
    }

    fn on_rejected(&mut self, ctx: &mut NodeContext, error: NodeError, effects: &mut Vec<NodeEffect>) {
        let NodeError::DutyCycleViolation { retry_at } = error else {
            return;
        };
        if self.state != NodeState::Transmit {
            return;
        }

        // Nothing went on air, so the transmit phase is dropped rather than charged.
        self.counters.duty_cycle_deferrals += 1;
        ctx.log(self.id, || LogContent::DutyCycleDeferral { retry_at }, LogLevel::Debug);

        let wait = (retry_at - ctx.now).max(Time::ZERO);
        self.enter(ctx, NodeState::DutyCycleWait, wait, effects);
    }

    fn on_ack(&mut self, ctx: &mut NodeContext, downlink: Downlink, effects: &mut Vec<NodeEffect>) {
        let ack = downlink.ack;

        self.counters.acks_received += 1;
        self.snr_history.push_back(ack.uplink_snr);
        while self.snr_history.len() > ctx.settings.snr_history_length {
            self.snr_history.pop_front();
        }

        ctx.log(
            self.id,
            || LogContent::AckDelivered {
                frame_id: ack.frame_id,
                window: downlink.window,
            },
            LogLevel::Info,
        );

        if let Some(command) = ack.adr {
            self.apply_adr(ctx, command.spreading_factor, command.tx_power);
        }

        self.counters.unique_packets_sent += 1;
        self.packet = None;
        self.sleep(ctx, effects);
    }

    /// Both windows closed empty.
    fn on_no_ack(&mut self, ctx: &mut NodeContext, effects: &mut Vec<NodeEffect>) {
        if !ctx.settings.confirmed {
            self.counters.unique_packets_sent += 1;
            self.packet = None;
            self.sleep(ctx, effects);
            return;
        }

        let max_retransmissions = ctx.settings.max_retransmissions;
        let can_retry = self
            .packet
            .as_ref()
            .is_some_and(|x| x.retransmissions < max_retransmissions);

        if can_retry {
            if let Some(packet) = &mut self.packet {
                packet.retransmissions += 1;
            }
            self.counters.retransmissions += 1;
            self.transmit(ctx, effects);
            return;
        }

        let attempts = self.packet.take().map(|x| x.retransmissions + 1).unwrap_or(1);
        self.counters.packets_lost += 1;

        let error = NodeError::RetryExhausted { attempts };
        tracing::trace!(node = self.id, %error);
        ctx.log(self.id, || LogContent::RetryExhausted { attempts }, LogLevel::Info);

        self.sleep(ctx, effects);
    }

    fn apply_adr(&mut self, ctx: &mut NodeContext, spreading_factor: u8, tx_power: i32) {
        let mut updated = self.radio.clone();

        let result = updated
            .change_spreading_factor(spreading_factor)
            .and_then(|_| updated.change_tx_power(tx_power));

        match result {
            Ok(()) => {
                self.radio = updated;
                self.counters.adr_commands_applied += 1;
                ctx.log(
                    self.id,
                    || LogContent::AdrApplied {
                        spreading_factor,
                        tx_power,
                    },
                    LogLevel::Info,
                );
            }
            Err(err) => ctx.log(
                self.id,
                || LogContent::Text(format!("Ignored ADR command: {err}")),
                LogLevel::Error,
            ),
        }
    }

    fn transmit(&mut self, ctx: &mut NodeContext, effects: &mut Vec<NodeEffect>) {
        let settings = ctx.settings;
        let air_time = calculate_air_time(settings.payload_size, &self.radio);
        let attempt = self.packet.as_ref().map(|x| x.retransmissions).unwrap_or(0);

        let frame = Frame {
            id: ctx.take_frame_id(),
            device_id: self.id,
            radio: self.radio.clone(),
            payload_size: settings.payload_size,
            start_time: ctx.now,
            air_time,
            confirmed: settings.confirmed,
            adr_enabled: settings.adr_enabled,
            attempt,
        };

        self.enter(ctx, NodeState::Transmit, air_time, effects);
        effects.push(NodeEffect::Transmit(frame));
    }

    fn sleep(&mut self, ctx: &mut NodeContext, effects: &mut Vec<NodeEffect>) {
        let sleep_time = ctx.settings.inter_arrival.sample(ctx.rng);
        self.enter(ctx, NodeState::Sleep, sleep_time, effects);
    }

    fn enter(&mut self, ctx: &NodeContext, state: NodeState, duration: Time, effects: &mut Vec<NodeEffect>) {
        self.state = state;
        self.state_since = ctx.now;
        self.timer += 1;

        effects.push(NodeEffect::Schedule {
            at: ctx.now + duration,
            timer: self.timer,
        });
    }

    /// Charges the current state from when it was entered until now.
    fn finish_phase(&mut self, ctx: &NodeContext) {
        let duration = ctx.now - self.state_since;
        let phase = self.state.phase(self.radio.tx_power());
        let energy = ctx.settings.energy.energy_for(phase, duration);

        self.energy.add(phase, energy);
        self.total_energy += energy;

        if ctx.settings.do_phase_logs {
            self.phase_log.push(PhaseRecord {
                state: self.state,
                start: self.state_since,
                duration,
                energy,
            });
        }

        self.state_since = ctx.now;
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::{
        assert_close,
        radio::RadioSettings,
        simulation::data_structs::{Acknowledgement, AdrCommand},
    };

    /// Drives a single node by hand, standing in for the simulation.
    struct Harness {
        now: Time,
        rng: ChaCha12Rng,
        settings: NodeSettings,
        next_frame_id: u32,
        logs: Vec<LogItem>,
        pending: Option<(Time, u64)>,
        sent: Vec<Frame>,
    }

    impl Harness {
        fn new(confirmed: bool) -> Harness {
            Harness {
                now: Time::ZERO,
                rng: ChaCha12Rng::seed_from_u64(1),
                settings: NodeSettings {
                    energy: EnergyProfile::default(),
                    timing: ProtocolTiming::default(),
                    inter_arrival: InterArrival::Fixed(HOURS),
                    process_time: Time::from_milis(5.0),
                    payload_size: 12,
                    confirmed,
                    adr_enabled: true,
                    max_retransmissions: 3,
                    snr_history_length: 4,
                    do_phase_logs: true,
                },
                next_frame_id: 0,
                logs: Vec::new(),
                pending: None,
                sent: Vec::new(),
            }
        }

        fn node(&mut self) -> Node {
            let radio = RadioConfig::try_from(RadioSettings::default()).unwrap();
            let mut node = Node::new(0, Location::outdoor(0.0 * KM, 1.0 * KM), radio);

            let effects = node.initialise(&mut self.ctx(), Time::ZERO);
            self.apply(effects);
            node
        }

        fn ctx(&mut self) -> NodeContext<'_> {
            NodeContext {
                now: self.now,
                rng: &mut self.rng,
                settings: &self.settings,
                next_frame_id: &mut self.next_frame_id,
                logs: &mut self.logs,
                do_logs: true,
            }
        }

        fn apply(&mut self, effects: Vec<NodeEffect>) {
            for effect in effects {
                match effect {
                    NodeEffect::Schedule { at, timer } => self.pending = Some((at, timer)),
                    NodeEffect::Transmit(frame) => self.sent.push(frame),
                }
            }
        }

        fn send(&mut self, node: &mut Node, event: NodeEvent) -> NodeState {
            let (state, effects) = node.step(&mut self.ctx(), event);
            self.apply(effects);
            state
        }

        /// Fires the node's pending timer.
        fn fire(&mut self, node: &mut Node) -> NodeState {
            let (at, timer) = self.pending.take().unwrap();
            self.now = at;
            self.send(node, NodeEvent::Timer(timer))
        }

        fn fire_until(&mut self, node: &mut Node, state: NodeState) {
            for _ in 0..100 {
                if self.fire(node) == state {
                    return;
                }
            }
            panic!("never reached {state:?}");
        }
    }

    fn assert_energy_consistent(node: &Node) {
        let logged: Energy = node.phase_log().iter().map(|x| x.energy).sum();
        assert_close(logged.joules(), node.total_energy().joules());
        assert_close(node.energy().total().joules(), node.total_energy().joules());
        assert!(node.phase_log().iter().all(|x| x.energy >= Energy::ZERO));
    }

    fn ack_for(frame: &Frame, window: ReceiveWindow, adr: Option<AdrCommand>, start: Time) -> Downlink {
        Downlink {
            ack: Acknowledgement {
                device_id: frame.device_id,
                frame_id: frame.id,
                adr,
                uplink_snr: Dbf::from_db_value(3.0),
                payload_size: 13,
            },
            window,
            frequency: frame.frequency(),
            spreading_factor: frame.spreading_factor(),
            start_time: start,
            air_time: Time::from_milis(40.0),
        }
    }

    #[test]
    fn unconfirmed_cycle_visits_every_state() {
        let mut harness = Harness::new(false);
        let mut node = harness.node();

        let expected = [
            NodeState::Process,
            NodeState::Transmit,
            NodeState::Rx1Wait,
            NodeState::Rx1Listen,
            NodeState::Rx2Wait,
            NodeState::Rx2Listen,
            NodeState::Sleep,
        ];

        for state in expected {
            assert_eq!(harness.fire(&mut node), state);
        }

        assert_eq!(harness.sent.len(), 1);
        assert_eq!(node.counters().unique_packets_sent, 1);
        assert_eq!(node.counters().transmissions, 1);
        assert_eq!(node.counters().retransmissions, 0);
        assert_eq!(node.phase_log().len(), 7);
        assert_energy_consistent(&node);

        // RX2 opens relative to the end of the uplink.
        let rx2 = node
            .phase_log()
            .iter()
            .find(|x| x.state == NodeState::Rx2Listen)
            .unwrap();
        let frame = &harness.sent[0];
        assert_close(
            (rx2.start - frame.end_time()).milis(),
            ProtocolTiming::default().rx2_open_delay().milis(),
        );
    }

    #[test]
    fn withheld_acks_exhaust_retries() {
        let mut harness = Harness::new(true);
        let mut node = harness.node();

        harness.fire_until(&mut node, NodeState::Sleep);

        assert_eq!(harness.sent.len(), 4);
        assert_eq!(node.counters().retransmissions, 3);
        assert_eq!(node.counters().packets_lost, 1);
        assert_eq!(node.counters().unique_packets_sent, 0);
        assert_eq!(
            harness.sent.iter().map(|x| x.attempt).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert!(harness.logs.iter().any(|x| matches!(
            x.content,
            LogContent::RetryExhausted { attempts: 4 }
        )));

        // The next payload starts afresh.
        harness.fire_until(&mut node, NodeState::Transmit);
        assert_eq!(harness.sent.last().unwrap().attempt, 0);
        assert_eq!(node.counters().retransmissions, 3);
        assert_energy_consistent(&node);
    }

    #[test]
    fn ack_in_rx1_applies_adr() {
        let mut harness = Harness::new(true);
        let mut node = harness.node();

        harness.fire_until(&mut node, NodeState::Rx1Listen);
        let frame = harness.sent[0].clone();
        let arrival = frame.end_time() + harness.settings.timing.receive_delay1;
        harness.now = arrival;

        let command = AdrCommand {
            spreading_factor: 9,
            tx_power: 11,
        };
        let downlink = ack_for(&frame, ReceiveWindow::Rx1, Some(command), arrival);
        assert_eq!(
            harness.send(&mut node, NodeEvent::Downlink(downlink)),
            NodeState::Rx1Receive
        );
        assert_eq!(harness.fire(&mut node), NodeState::Sleep);

        assert_eq!(node.counters().unique_packets_sent, 1);
        assert_eq!(node.counters().acks_received, 1);
        assert_eq!(node.counters().adr_commands_applied, 1);
        assert_eq!(node.radio().spreading_factor(), 9);
        assert_eq!(node.radio().data_rate(), 3);
        assert_eq!(node.radio().tx_power(), 11);
        assert_eq!(node.snr_history().len(), 1);
        assert!(
            !node
                .phase_log()
                .iter()
                .any(|x| x.state == NodeState::Rx2Listen)
        );
        assert_energy_consistent(&node);
    }

    #[test]
    fn downlink_outside_window_is_ignored() {
        let mut harness = Harness::new(true);
        let mut node = harness.node();

        harness.fire_until(&mut node, NodeState::Rx1Wait);
        let frame = harness.sent[0].clone();
        let downlink = ack_for(&frame, ReceiveWindow::Rx1, None, harness.now);

        assert!(!node.accepts_downlink(ReceiveWindow::Rx1));
        assert_eq!(
            harness.send(&mut node, NodeEvent::Downlink(downlink)),
            NodeState::Rx1Wait
        );
    }

    #[test]
    fn stale_timer_is_ignored() {
        let mut harness = Harness::new(false);
        let mut node = harness.node();

        let (at, stale) = harness.pending.unwrap();
        harness.fire(&mut node);
        harness.now = at;

        assert_eq!(harness.send(&mut node, NodeEvent::Timer(stale)), NodeState::Process);
        assert_eq!(node.phase_log().len(), 1);
    }

    #[test]
    fn duty_cycle_rejection_defers_transmission() {
        let mut harness = Harness::new(false);
        let mut node = harness.node();

        harness.fire_until(&mut node, NodeState::Transmit);
        let retry_at = harness.now + Time::from_seconds(30.0);

        let state = harness.send(
            &mut node,
            NodeEvent::Rejected(NodeError::DutyCycleViolation { retry_at }),
        );
        assert_eq!(state, NodeState::DutyCycleWait);
        assert_eq!(node.counters().duty_cycle_deferrals, 1);

        assert_eq!(harness.fire(&mut node), NodeState::Transmit);
        assert_eq!(harness.now, retry_at);
        assert_eq!(harness.sent.len(), 2);
        assert_eq!(harness.sent[1].start_time, retry_at);
        assert_eq!(node.counters().transmissions, 0);
        assert_energy_consistent(&node);
    }

    #[test]
    fn horizon_charges_passive_state() {
        let mut harness = Harness::new(false);
        let mut node = harness.node();

        harness.fire_until(&mut node, NodeState::Sleep);
        let before = node.total_energy();
        let slept_from = harness.now;

        harness.now = slept_from + Time::from_seconds(100.0);
        harness.send(&mut node, NodeEvent::Horizon);

        let sleep = harness.settings.energy.energy_for(RadioPhase::Sleep, Time::from_seconds(100.0));
        assert_close((node.total_energy() - before).joules(), sleep.joules());
        assert_energy_consistent(&node);

        // The pending wake up is now stale.
        let (at, timer) = harness.pending.unwrap();
        harness.now = at;
        assert_eq!(harness.send(&mut node, NodeEvent::Timer(timer)), NodeState::Sleep);
    }

    #[test]
    fn breakdown_starts_empty_and_buckets_by_phase() {
        let mut breakdown = EnergyBreakdown::default();
        assert_eq!(breakdown.total(), Energy::ZERO);

        breakdown.add(RadioPhase::Transmit { tx_power: 14 }, Energy::from_millijoules(3.0));
        breakdown.add(RadioPhase::Listen, Energy::from_millijoules(1.0));

        assert_eq!(breakdown.transmit, Energy::from_millijoules(3.0));
        assert_eq!(breakdown.sleep, Energy::ZERO);
        assert_close(breakdown.total().millijoules(), 4.0);
    }

    #[test]
    fn energy_per_bit_counts_delivered_payloads() {
        let mut harness = Harness::new(false);
        let mut node = harness.node();
        assert_eq!(node.energy_per_bit(12), None);

        harness.fire_until(&mut node, NodeState::Sleep);
        let per_bit = node.energy_per_bit(12).unwrap();
        assert_close(per_bit.joules(), node.total_energy().joules() / 96.0);
    }
}
