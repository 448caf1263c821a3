//! The single gateway: counts what it hears and steers devices with ADR.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::{
    location::Location,
    radio::{
        ConfigurationError, MAX_SPREADING_FACTOR, MAX_TX_POWER, MIN_SPREADING_FACTOR,
        MIN_TX_POWER, TX_POWER_STEP,
    },
    simulation::data_structs::{Acknowledgement, AdrCommand, Frame},
    snr::sensitivity,
    units::*,
};

/// How the SNR history of a device is summarised before choosing its data rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdrPolicy {
    /// Worst sample in the window.
    MaxSnr,
    /// Mean of the window.
    AvgSnr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub adr_policy: AdrPolicy,
    pub adr_margin: Dbf,
    pub history_length: usize,
    /// Samples a device must have in its history before a command is sent.
    /// The history restarts after every command.
    pub adr_min_samples: usize,

    /// Bytes of an acknowledgement without and with an ADR command.
    pub ack_payload_size: u32,
    pub adr_command_size: u32,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            adr_policy: AdrPolicy::MaxSnr,
            adr_margin: Dbf::from_db_value(10.0),
            history_length: 20,
            adr_min_samples: 20,
            ack_payload_size: 13,
            adr_command_size: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayCounters {
    pub packets_received: u32,
    pub weak_signal_packets: u32,
    pub acks_sent: u32,
    pub adr_commands: u32,
}

#[derive(Debug, Clone)]
pub struct Gateway {
    location: Location,
    settings: GatewaySettings,
    histories: HashMap<usize, VecDeque<Dbf>>,
    counters: GatewayCounters,
}

impl Gateway {
    pub fn new(location: Location, settings: GatewaySettings) -> Gateway {
        Gateway {
            location,
            settings,
            histories: HashMap::new(),
            counters: GatewayCounters::default(),
        }
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn counters(&self) -> &GatewayCounters {
        &self.counters
    }

    pub fn history(&self, device_id: usize) -> Option<&VecDeque<Dbf>> {
        self.histories.get(&device_id)
    }

    /// Handles a frame the air interface delivered. Returns the acknowledgement
    /// to send back, if any.
    pub fn receive(
        &mut self,
        frame: &Frame,
        snr: Dbf,
    ) -> Result<Option<Acknowledgement>, ConfigurationError> {
        self.counters.packets_received += 1;

        let threshold = sensitivity(frame.spreading_factor(), frame.bandwidth())?;

        if snr < threshold {
            self.counters.weak_signal_packets += 1;

            return Ok(frame.confirmed.then(|| self.acknowledge(frame, snr, None)));
        }

        let history = self.histories.entry(frame.device_id).or_default();
        history.push_back(snr);
        while history.len() > self.settings.history_length {
            history.pop_front();
        }
        let history_full = history.len() >= self.settings.adr_min_samples;

        let command = if frame.adr_enabled && history_full {
            self.evaluate_adr(frame)?
        } else {
            None
        };

        if command.is_some() {
            self.counters.adr_commands += 1;
            // Samples taken under the old settings no longer describe the link.
            self.histories.remove(&frame.device_id);
        }

        if frame.confirmed || command.is_some() {
            Ok(Some(self.acknowledge(frame, snr, command)))
        } else {
            Ok(None)
        }
    }

    fn acknowledge(
        &mut self,
        frame: &Frame,
        snr: Dbf,
        adr: Option<AdrCommand>,
    ) -> Acknowledgement {
        self.counters.acks_sent += 1;

        let payload_size = match adr {
            Some(_) => self.settings.ack_payload_size + self.settings.adr_command_size,
            None => self.settings.ack_payload_size,
        };

        Acknowledgement {
            device_id: frame.device_id,
            frame_id: frame.id,
            adr,
            uplink_snr: snr,
            payload_size,
        }
    }

    /// Picks the spreading factor and transmit power the device should use next.
    /// Returns `None` when the frame was already sent with them.
    fn evaluate_adr(&self, frame: &Frame) -> Result<Option<AdrCommand>, ConfigurationError> {
        let Some(history) = self.histories.get(&frame.device_id) else {
            return Ok(None);
        };
        let Some(metric) = summarise(history, self.settings.adr_policy) else {
            return Ok(None);
        };

        let bandwidth = frame.bandwidth();
        let margin = self.settings.adr_margin;

        let mut target_sf = None;
        for sf in MIN_SPREADING_FACTOR..=MAX_SPREADING_FACTOR {
            if metric >= sensitivity(sf, bandwidth)? + margin {
                target_sf = Some(sf);
                break;
            }
        }

        let mut tx_power = frame.tx_power();

        let spreading_factor = match target_sf {
            Some(sf) => {
                if sf == MIN_SPREADING_FACTOR {
                    let mut excess =
                        (metric - (sensitivity(sf, bandwidth)? + margin)).as_db_float();
                    while excess >= TX_POWER_STEP as f64
                        && tx_power - TX_POWER_STEP >= MIN_TX_POWER
                    {
                        tx_power -= TX_POWER_STEP;
                        excess -= TX_POWER_STEP as f64;
                    }
                }
                sf
            }
            None => {
                let mut deficit =
                    (sensitivity(MAX_SPREADING_FACTOR, bandwidth)? + margin - metric).as_db_float();
                while deficit > 0.0 && tx_power < MAX_TX_POWER {
                    tx_power = (tx_power + TX_POWER_STEP).min(MAX_TX_POWER);
                    deficit -= TX_POWER_STEP as f64;
                }
                MAX_SPREADING_FACTOR
            }
        };

        if spreading_factor == frame.spreading_factor() && tx_power == frame.tx_power() {
            return Ok(None);
        }

        Ok(Some(AdrCommand {
            spreading_factor,
            tx_power,
        }))
    }
}

fn summarise(history: &VecDeque<Dbf>, policy: AdrPolicy) -> Option<Dbf> {
    if history.is_empty() {
        return None;
    }

    let value = match policy {
        AdrPolicy::MaxSnr => history
            .iter()
            .map(|x| x.as_db_float())
            .fold(f64::INFINITY, f64::min),
        AdrPolicy::AvgSnr => {
            history.iter().map(|x| x.as_db_float()).sum::<f64>() / history.len() as f64
        }
    };

    Some(Dbf::from_db_value(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{RadioConfig, RadioSettings};

    fn frame(spreading_factor: u8, tx_power: i32, confirmed: bool) -> Frame {
        let radio = RadioConfig::try_from(RadioSettings {
            spreading_factor,
            tx_power,
            ..Default::default()
        })
        .unwrap();

        Frame {
            id: 0,
            device_id: 3,
            radio,
            payload_size: 12,
            start_time: Time::ZERO,
            air_time: Time::from_milis(50.0),
            confirmed,
            adr_enabled: true,
            attempt: 0,
        }
    }

    fn gateway(policy: AdrPolicy) -> Gateway {
        Gateway::new(
            Location::outdoor(0.0 * KM, 0.0 * KM),
            GatewaySettings {
                adr_policy: policy,
                adr_min_samples: 1,
                ..Default::default()
            },
        )
    }

    fn db(x: f64) -> Dbf {
        Dbf::from_db_value(x)
    }

    #[test]
    fn comfortable_margin_speeds_up() {
        let mut gateway = gateway(AdrPolicy::MaxSnr);

        // SF10 needs -15 + 10 = -5 dB, SF7 needs 2.5 dB.
        let ack = gateway.receive(&frame(10, 14, false), db(4.0)).unwrap().unwrap();
        let command = ack.adr.unwrap();

        assert!(command.spreading_factor < 10);
        assert_eq!(command.spreading_factor, 7);
        assert_eq!(command.tx_power, 14);
        assert_eq!(ack.payload_size, 18);
        assert!(gateway.history(3).is_none());
    }

    #[test]
    fn exactly_at_margin_keeps_settings() {
        let mut gateway = gateway(AdrPolicy::MaxSnr);

        // SF9 needs exactly -12.5 + 10 dB.
        let ack = gateway.receive(&frame(9, 14, false), db(-2.5)).unwrap();

        assert_eq!(ack, None);
        assert_eq!(gateway.counters().adr_commands, 0);
        assert_eq!(gateway.history(3).unwrap().len(), 1);
    }

    #[test]
    fn excess_at_sf7_lowers_power() {
        let mut gateway = gateway(AdrPolicy::MaxSnr);

        // 2.5 dB needed, 9.6 dB excess allows three 3 dB steps.
        let ack = gateway.receive(&frame(7, 14, false), db(12.1)).unwrap().unwrap();
        assert_eq!(
            ack.adr,
            Some(AdrCommand {
                spreading_factor: 7,
                tx_power: 5
            })
        );
    }

    #[test]
    fn poor_link_slows_down_and_raises_power() {
        let mut gateway = gateway(AdrPolicy::MaxSnr);

        // Heard at SF11 (-17.5 dB needed), but SF12 needs -10 dB and
        // the 6 dB deficit takes two power steps.
        let ack = gateway.receive(&frame(11, 8, false), db(-16.0)).unwrap().unwrap();
        assert_eq!(
            ack.adr,
            Some(AdrCommand {
                spreading_factor: 12,
                tx_power: 14
            })
        );
    }

    #[test]
    fn commands_wait_for_a_full_history() {
        let mut gateway = Gateway::new(
            Location::outdoor(0.0 * KM, 0.0 * KM),
            GatewaySettings::default(),
        );
        let sent = frame(10, 14, false);

        for _ in 0..19 {
            assert_eq!(gateway.receive(&sent, db(4.0)).unwrap(), None);
        }
        assert_eq!(gateway.counters().adr_commands, 0);

        let ack = gateway.receive(&sent, db(4.0)).unwrap().unwrap();
        assert_eq!(ack.adr.unwrap().spreading_factor, 7);
        assert!(gateway.history(3).is_none());

        // The device has not switched yet, so the next frame starts a new window.
        assert_eq!(gateway.receive(&sent, db(4.0)).unwrap(), None);
        assert_eq!(gateway.history(3).unwrap().len(), 1);
        assert_eq!(gateway.counters().adr_commands, 1);
    }

    #[test]
    fn policies_summarise_differently() {
        let mut max = gateway(AdrPolicy::MaxSnr);
        let mut avg = gateway(AdrPolicy::AvgSnr);

        // Device at SF8 sending without ADR, so the histories fill up.
        let mut sent = frame(8, 14, false);
        sent.adr_enabled = false;

        for snr in [6.0, 6.0, -1.0] {
            max.receive(&sent, db(snr)).unwrap();
            avg.receive(&sent, db(snr)).unwrap();
        }

        sent.adr_enabled = true;
        let worst = max.receive(&sent, db(6.0)).unwrap();
        let mean = avg.receive(&sent, db(6.0)).unwrap();

        // Worst sample -1 dB misses SF8 (0 dB needed) and settles on SF9.
        assert_eq!(worst.unwrap().adr.unwrap().spreading_factor, 9);
        // Mean 4.25 dB clears SF7.
        assert_eq!(mean.unwrap().adr.unwrap().spreading_factor, 7);
    }

    #[test]
    fn confirmed_frames_are_always_acknowledged() {
        let mut gateway = gateway(AdrPolicy::MaxSnr);

        let mut sent = frame(9, 14, true);
        sent.adr_enabled = false;

        let ack = gateway.receive(&sent, db(0.0)).unwrap().unwrap();
        assert_eq!(ack.adr, None);
        assert_eq!(ack.payload_size, 13);

        // Below sensitivity the frame still counts and is still acknowledged.
        let weak = gateway.receive(&sent, db(-20.0)).unwrap();
        assert!(weak.is_some());
        assert_eq!(gateway.counters().packets_received, 2);
        assert_eq!(gateway.counters().weak_signal_packets, 1);
        assert_eq!(gateway.history(3).unwrap().len(), 1);

        let mut unconfirmed = sent.clone();
        unconfirmed.confirmed = false;
        assert_eq!(gateway.receive(&unconfirmed, db(-20.0)).unwrap(), None);
    }

    #[test]
    fn history_is_bounded() {
        let mut gateway = gateway(AdrPolicy::AvgSnr);
        let mut sent = frame(7, 14, false);
        sent.adr_enabled = false;

        for _ in 0..50 {
            gateway.receive(&sent, db(1.0)).unwrap();
        }

        assert_eq!(gateway.history(3).unwrap().len(), 20);
    }
}
