use serde::{Deserialize, Serialize};

use crate::{
    radio::{is_supported_bandwidth, ConfigurationError, MAX_SPREADING_FACTOR, MIN_SPREADING_FACTOR},
    units::*,
};

/// Minimum SNR required for demodulation at a spreading factor.
/// Same across the 125, 250 and 500 kHz bandwidths.
///
/// Semtech Corporation. 2020. SX1276/77/78/79 - 137 MHz to 1020 MHz Low Power Long Range Transceiver,
/// table 13.
pub fn sensitivity(spreading_factor: u8, bandwidth: Frequency) -> Result<Dbf, ConfigurationError> {
    if !(MIN_SPREADING_FACTOR..=MAX_SPREADING_FACTOR).contains(&spreading_factor) {
        return Err(ConfigurationError::SpreadingFactor(spreading_factor));
    }
    if !is_supported_bandwidth(bandwidth) {
        return Err(ConfigurationError::Bandwidth(bandwidth.kHz()));
    }

    Ok(Dbf::from_db_value(-2.5 * spreading_factor as f64 + 10.0))
}

/// Turns a received signal strength into a signal to noise ratio
/// against thermal noise over the channel bandwidth plus the receiver noise figure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnrModel {
    pub noise_temp: Temperature,
    pub noise_figure: Dbf,
}

impl Default for SnrModel {
    fn default() -> Self {
        Self {
            noise_temp: Temperature::REFERENCE,
            noise_figure: Dbf::from_db_value(6.0),
        }
    }
}

impl SnrModel {
    pub fn noise_power(&self, bandwidth: Frequency) -> Dbm {
        let noise_energy: Db<Energy> = Db::from_unit(BOLTZMANN * self.noise_temp);
        let thermal: Dbm = noise_energy + Db::from_unit(bandwidth);

        thermal + self.noise_figure
    }

    pub fn snr(&self, rss: Dbm, bandwidth: Frequency) -> Dbf {
        rss - self.noise_power(bandwidth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_close;

    #[test]
    fn sensitivity_table() {
        // sf 7 to 12
        let expected = [-7.5, -10.0, -12.5, -15.0, -17.5, -20.0].map(Dbf::from_db_value);

        for sf in 7..=12 {
            for bw in [125.0, 250.0, 500.0] {
                assert_eq!(
                    sensitivity(sf, Frequency::from_kHz(bw)),
                    Ok(expected[(sf - 7) as usize])
                );
            }
        }
    }

    #[test]
    fn sensitivity_rejects_bad_input() {
        let bw = Frequency::from_kHz(125.0);
        assert_eq!(sensitivity(6, bw), Err(ConfigurationError::SpreadingFactor(6)));
        assert!(matches!(
            sensitivity(7, Frequency::from_kHz(62.5)),
            Err(ConfigurationError::Bandwidth(_))
        ));
    }

    #[test]
    fn noise_floor_at_125_khz() {
        let model = SnrModel::default();
        // -174 + 10log10(125000) + 6
        assert_close(model.noise_power(Frequency::from_kHz(125.0)).dbm(), -117.00609);
    }

    #[test]
    fn snr_is_rss_above_noise() {
        let model = SnrModel::default();
        let bw = Frequency::from_kHz(125.0);
        let rss = Dbm::from_dbm(-110.0);

        assert_close(model.snr(rss, bw).as_db_float(), 7.00609);
        assert!(model.snr(Dbm::from_dbm(-130.0), bw) < model.snr(rss, bw));
    }
}
