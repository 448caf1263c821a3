use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{radio::RadioConfig, units::*};

/// An uplink frame on air.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: u32,
    pub device_id: usize,

    /// Settings of the device when the frame was sent.
    pub radio: RadioConfig,
    pub payload_size: u32,

    // Timing
    pub start_time: Time,
    pub air_time: Time,

    // MAC
    pub confirmed: bool,
    pub adr_enabled: bool,
    /// Zero for the first transmission of a payload.
    pub attempt: u32,
}

impl Frame {
    pub fn end_time(&self) -> Time {
        self.start_time + self.air_time
    }

    pub fn frequency(&self) -> Frequency {
        self.radio.frequency()
    }

    pub fn spreading_factor(&self) -> u8 {
        self.radio.spreading_factor()
    }

    pub fn bandwidth(&self) -> Frequency {
        self.radio.bandwidth()
    }

    /// dBm
    pub fn tx_power(&self) -> i32 {
        self.radio.tx_power()
    }

    /// Intervals are half open, a frame ending exactly as another starts does not overlap it.
    pub fn overlaps(&self, other: &Frame) -> bool {
        self.start_time < other.end_time() && other.start_time < self.end_time()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdrCommand {
    pub spreading_factor: u8,
    /// dBm
    pub tx_power: i32,
}

/// Built by the gateway in reply to an uplink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub device_id: usize,
    pub frame_id: u32,
    pub adr: Option<AdrCommand>,

    /// SNR the uplink was received with, reported back as link margin.
    pub uplink_snr: Dbf,
    pub payload_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiveWindow {
    Rx1,
    Rx2,
}

/// An acknowledgement placed in one of the device's receive windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Downlink {
    pub ack: Acknowledgement,
    pub window: ReceiveWindow,
    pub frequency: Frequency,
    pub spreading_factor: u8,
    pub start_time: Time,
    pub air_time: Time,
}

impl Downlink {
    pub fn end_time(&self) -> Time {
        self.start_time + self.air_time
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameOutcome {
    Collided,
    Weak,
    Received,
}

/// Final record of a frame, kept in the replica output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRecord {
    pub id: u32,
    pub device_id: usize,
    pub frequency: Frequency,
    pub spreading_factor: u8,
    pub tx_power: i32,
    pub start_time: Time,
    pub air_time: Time,
    pub attempt: u32,
    pub rss: Dbm,
    pub snr: Dbf,

    /// `None` when the horizon was reached before the frame ended.
    pub outcome: Option<FrameOutcome>,
}

impl FrameRecord {
    pub fn end_time(&self) -> Time {
        self.start_time + self.air_time
    }
}

#[derive(Debug, Clone)]
pub struct SimEvent {
    pub time: Time,
    /// Submission order, breaks ties between events at the same time.
    pub seq: u64,
    pub action: SimAction,
}

impl PartialEq for SimEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time.eq(&other.time) && self.seq == other.seq
    }
}
impl Eq for SimEvent {}

impl PartialOrd for SimEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the max heap pops the earliest event first.
impl Ord for SimEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone)]
pub enum SimAction {
    NodeTimer { node_id: usize, timer: u64 },
    ResolveFrame { frame_id: u32 },
    DeliverDownlink(Downlink),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogItem {
    pub time: Time,
    pub log_level: LogLevel,
    pub source: LogSource,
    pub content: LogContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogSource {
    Simulation,
    Gateway,
    Node(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogContent {
    Text(String),
    FrameSent {
        frame_id: u32,
        attempt: u32,
    },
    FrameReceived {
        frame_id: u32,
        snr: Dbf,
    },
    FrameCollided {
        frame_id: u32,
        interferer_id: u32,
    },
    FrameWeak {
        frame_id: u32,
        snr: Dbf,
    },
    AckScheduled {
        frame_id: u32,
        window: ReceiveWindow,
    },
    AckDelivered {
        frame_id: u32,
        window: ReceiveWindow,
    },
    AckDropped {
        frame_id: u32,
    },
    AdrApplied {
        spreading_factor: u8,
        tx_power: i32,
    },
    DutyCycleDeferral {
        retry_at: Time,
    },
    RetryExhausted {
        attempts: u32,
    },
}

impl Display for LogContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogContent::Text(text) => text.fmt(f),
            LogContent::FrameSent { frame_id, attempt } => {
                write!(f, "Frame {} sent (attempt {})", frame_id, attempt)
            }
            LogContent::FrameReceived { frame_id, snr } => {
                write!(f, "Frame {} received with SNR {}", frame_id, snr)
            }
            LogContent::FrameCollided {
                frame_id,
                interferer_id,
            } => write!(
                f,
                "Frame {} collided with at least {}",
                frame_id, interferer_id
            ),
            LogContent::FrameWeak { frame_id, snr } => {
                write!(f, "Frame {} too weak, SNR {}", frame_id, snr)
            }
            LogContent::AckScheduled { frame_id, window } => {
                write!(f, "Ack for frame {} scheduled in {:?}", frame_id, window)
            }
            LogContent::AckDelivered { frame_id, window } => {
                write!(f, "Ack for frame {} delivered in {:?}", frame_id, window)
            }
            LogContent::AckDropped { frame_id } => write!(f, "Ack for frame {} dropped", frame_id),
            LogContent::AdrApplied {
                spreading_factor,
                tx_power,
            } => write!(
                f,
                "ADR applied, now SF{} at {} dBm",
                spreading_factor, tx_power
            ),
            LogContent::DutyCycleDeferral { retry_at } => {
                write!(f, "Duty cycle exhausted, deferred until {}", retry_at)
            }
            LogContent::RetryExhausted { attempts } => {
                write!(f, "Gave up after {} attempts", attempts)
            }
        }
    }
}
