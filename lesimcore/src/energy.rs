//! Power draw of an end device in each phase of its duty cycle.
//!
//! Default figures are measurements of an SX1276 based end device:
//! sleep and MCU processing draw, transmit draw per output power and the
//! receive chain split into a fixed start up, listening and shut down part.

use serde::{Deserialize, Serialize};

use crate::{radio::ConfigurationError, units::*};

/// The phases energy is charged for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioPhase {
    Sleep,
    Process,
    Transmit { tx_power: i32 },
    /// Receiver open in a receive window, waiting for a preamble.
    Listen,
    /// Demodulating a downlink. Continues an open window, so carries no start up
    /// or shut down cost of its own.
    Receive,
    /// Idle between the end of a transmission and a receive window.
    Wait,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiveProfile {
    pub pre_power: Power,
    pub pre_duration: Time,
    pub lna_on_power: Power,
    pub lna_off_power: Power,
    pub post_power: Power,
    pub post_duration: Time,
    pub lna_enabled: bool,
}

impl Default for ReceiveProfile {
    fn default() -> Self {
        Self {
            pre_power: Power::from_milliwatts(8.2),
            pre_duration: Time::from_milis(3.4),
            lna_on_power: Power::from_milliwatts(39.0),
            lna_off_power: Power::from_milliwatts(34.0),
            post_power: Power::from_milliwatts(8.3),
            post_duration: Time::from_milis(10.7),
            lna_enabled: true,
        }
    }
}

impl ReceiveProfile {
    fn listening_power(&self) -> Power {
        if self.lna_enabled {
            self.lna_on_power
        } else {
            self.lna_off_power
        }
    }

    fn overhead(&self) -> Energy {
        self.pre_power * self.pre_duration + self.post_power * self.post_duration
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyProfile {
    pub sleep_power: Power,
    pub process_power: Power,

    /// Supply draw while transmitting at a given output power (dBm).
    /// Must be sorted by output power.
    pub tx_power_table: Vec<(i32, Power)>,
    pub rx: ReceiveProfile,

    /// Radio preparation before every transmission.
    pub tx_prep_energy: Energy,
}

impl Default for EnergyProfile {
    fn default() -> Self {
        Self {
            sleep_power: Power::from_milliwatts(5.7e-3),
            process_power: Power::from_milliwatts(15.0),
            tx_power_table: [(2, 91.8), (5, 95.9), (8, 101.6), (11, 120.8), (14, 146.5)]
                .into_iter()
                .map(|(level, mw)| (level, Power::from_milliwatts(mw)))
                .collect(),
            rx: ReceiveProfile::default(),
            tx_prep_energy: Energy::from_millijoules(0.5),
        }
    }
}

impl EnergyProfile {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |msg: &str| Err(ConfigurationError::EnergyProfile(msg.to_owned()));

        if self.tx_power_table.is_empty() {
            return invalid("transmit power table is empty");
        }
        if !self.tx_power_table.windows(2).all(|x| x[0].0 < x[1].0) {
            return invalid("transmit power table must be strictly sorted by output power");
        }

        let powers = [
            self.sleep_power,
            self.process_power,
            self.rx.pre_power,
            self.rx.lna_on_power,
            self.rx.lna_off_power,
            self.rx.post_power,
        ];
        let all_powers = powers
            .into_iter()
            .chain(self.tx_power_table.iter().map(|x| x.1));

        for power in all_powers {
            if !power.is_finite() || power < Power::ZERO {
                return invalid("power draws must be finite and non-negative");
            }
        }

        if self.rx.pre_duration < Time::ZERO
            || self.rx.post_duration < Time::ZERO
            || self.tx_prep_energy < Energy::ZERO
        {
            return invalid("fixed overheads must be non-negative");
        }

        Ok(())
    }

    /// Supply draw while transmitting at `tx_power` dBm.
    /// Levels between measured points are linearly interpolated,
    /// levels outside the table use the nearest measurement.
    pub fn tx_draw(&self, tx_power: i32) -> Power {
        let table = &self.tx_power_table;

        let Some(upper) = table.iter().position(|x| x.0 >= tx_power) else {
            return table.last().map(|x| x.1).unwrap_or(Power::ZERO);
        };

        let (high_level, high_power) = table[upper];
        if high_level == tx_power || upper == 0 {
            return high_power;
        }

        let (low_level, low_power) = table[upper - 1];
        let lerp = (tx_power - low_level) as f64 / (high_level - low_level) as f64;

        low_power * (1.0 - lerp) + high_power * lerp
    }

    /// Energy used by spending `duration` in `phase`.
    /// Fixed per activation overheads are included.
    pub fn energy_for(&self, phase: RadioPhase, duration: Time) -> Energy {
        let duration = duration.max(Time::ZERO);

        match phase {
            RadioPhase::Sleep | RadioPhase::Wait => self.sleep_power * duration,
            RadioPhase::Process => self.process_power * duration,
            RadioPhase::Transmit { tx_power } => {
                self.tx_prep_energy + self.tx_draw(tx_power) * duration
            }
            RadioPhase::Listen => self.rx.overhead() + self.rx.listening_power() * duration,
            RadioPhase::Receive => self.rx.listening_power() * duration,
        }
    }
}
