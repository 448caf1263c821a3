//! Path loss models mapping a device's transmit power to the signal strength seen at the gateway.

use std::f64::consts::PI;

use rand::{Rng, seq::IndexedRandom};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::units::*;

pub mod regressor;

pub use regressor::PretrainedRegressor;

/// Penetration loss of a building, picked at random for each indoor frame.
/// Rep. ITU-R P.2346-0.
const BUILDING_LOSSES: [f64; 4] = [17.0, 27.0, 21.0, 30.0];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error(
        "{model} gave a non-finite signal strength (tx power {tx_power_dbm} dBm, distance {distance_m} m, altitude {altitude_m} m)"
    )]
    NonFinite {
        model: String,
        tx_power_dbm: f64,
        distance_m: f64,
        altitude_m: f64,
    },
    #[error("{model} can not be used for indoor devices")]
    IndoorUnsupported { model: String },
    #[error("regressor {model} is malformed: {reason}")]
    MalformedRegressor { model: String, reason: String },
}

macro_rules! propagation_model {
    ($($variant:ident),+) => {

        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
        pub enum PropagationModel {
            $(
                $variant($variant),
            )*
        }

        impl PropagationModel {
            /// Received signal strength at the gateway.
            /// Random effects are drawn from `rng`, so a seeded rng gives reproducible results.
            pub fn tp_to_rss<R: Rng + ?Sized>(
                &self,
                rng: &mut R,
                indoor: bool,
                tx_power: Dbm,
                distance: Length,
                altitude: Length,
            ) -> Result<Dbm, ModelError> {
                let rss = match self {
                    $(
                        PropagationModel::$variant(inner) => inner.tp_to_rss(rng, indoor, tx_power, distance, altitude)?,
                    )*
                };

                if !rss.is_finite() {
                    return Err(ModelError::NonFinite {
                        model: self.name().to_owned(),
                        tx_power_dbm: tx_power.dbm(),
                        distance_m: distance.metres(),
                        altitude_m: altitude.metres(),
                    });
                }

                Ok(rss)
            }

            pub fn name(&self) -> &str {
                match self {
                    $(
                        PropagationModel::$variant(inner) => inner.name(),
                    )*
                }
            }
        }

        $(
        impl From<$variant> for PropagationModel {
            fn from(value: $variant) -> Self {
                PropagationModel::$variant(value)
            }
        }
        )*
    };
}

propagation_model!(
    LogShadow,
    FreeSpace,
    Egli,
    OkumuraHata,
    Cost231Hata,
    WalfischIkegami,
    PretrainedRegressor
);

trait ImplPropagationModel {
    fn tp_to_rss<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        indoor: bool,
        tx_power: Dbm,
        distance: Length,
        altitude: Length,
    ) -> Result<Dbm, ModelError>;

    fn name(&self) -> &str;
}

fn building_loss<R: Rng + ?Sized>(rng: &mut R, indoor: bool) -> Dbf {
    if !indoor {
        return Dbf::from_db_value(0.0);
    }

    let loss = BUILDING_LOSSES.choose(rng).copied().unwrap_or(0.0);
    Dbf::from_db_value(loss)
}

/// Log distance path loss with normal shadowing.
/// Fitted to LoRa measurements by Petäjäjärvi, J. et al. (2015)
/// 'On the coverage of LPWANs: range evaluation and channel attenuation model for LoRa technology',
/// https://doi.org/10.1109/ITST.2015.7377400.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogShadow {
    pub exponent: f64,
    pub reference_distance: Length,
    pub reference_loss: Dbf,

    /// Standard deviation of the shadowing in dB. Zero gives a deterministic model.
    pub shadowing_std: f64,

    /// Combined antenna gains.
    pub gain: Dbf,
}

impl Default for LogShadow {
    fn default() -> Self {
        Self {
            exponent: 2.32,
            reference_distance: Length::from_metres(1000.0),
            reference_loss: Dbf::from_db_value(128.95),
            shadowing_std: 7.8,
            gain: Dbf::from_db_value(0.0),
        }
    }
}

impl LogShadow {
    pub fn without_shadowing(self) -> Self {
        Self {
            shadowing_std: 0.0,
            ..self
        }
    }
}

impl ImplPropagationModel for LogShadow {
    fn tp_to_rss<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        indoor: bool,
        tx_power: Dbm,
        distance: Length,
        _altitude: Length,
    ) -> Result<Dbm, ModelError> {
        let building = building_loss(rng, indoor);

        let shadowing = match Normal::new(0.0, self.shadowing_std.max(0.0)) {
            Ok(dist) if self.shadowing_std > 0.0 => dist.sample(rng),
            _ => 0.0,
        };

        let distance_loss = self.exponent * Dbf::from_unit(distance / self.reference_distance);
        let loss = distance_loss + self.reference_loss + Dbf::from_db_value(shadowing) + building;

        // Path loss never turns into gain.
        let loss = loss.as_db_float().max(0.0);

        Ok(tx_power + self.gain - Dbf::from_db_value(loss))
    }

    fn name(&self) -> &str {
        "LogShadow"
    }
}

/// <https://en.wikipedia.org/wiki/Free-space_path_loss>
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FreeSpace {
    pub carrier: Frequency,
}

impl Default for FreeSpace {
    fn default() -> Self {
        Self {
            carrier: Frequency::from_MHz(868.0),
        }
    }
}

impl ImplPropagationModel for FreeSpace {
    fn tp_to_rss<R: Rng + ?Sized>(
        &self,
        _rng: &mut R,
        indoor: bool,
        tx_power: Dbm,
        distance: Length,
        _altitude: Length,
    ) -> Result<Dbm, ModelError> {
        if indoor {
            return Err(ModelError::IndoorUnsupported {
                model: self.name().to_owned(),
            });
        }

        let wave_length = Length::from_metres(299.792458 / self.carrier.MHz());
        let loss = 2.0 * Dbf::from_unit(4.0 * PI * (distance / wave_length));

        Ok(tx_power - loss)
    }

    fn name(&self) -> &str {
        "FreeSpace"
    }
}

/// Egli, J.J. (1957) 'Radio propagation above 40 MC over irregular terrain'.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Egli {
    pub carrier: Frequency,
    pub base_height: Length,
    pub mobile_height: Length,
}

impl Default for Egli {
    fn default() -> Self {
        Self {
            carrier: Frequency::from_MHz(868.0),
            base_height: Length::from_metres(10.0),
            mobile_height: Length::from_metres(2.0),
        }
    }
}

impl ImplPropagationModel for Egli {
    fn tp_to_rss<R: Rng + ?Sized>(
        &self,
        _rng: &mut R,
        indoor: bool,
        tx_power: Dbm,
        distance: Length,
        _altitude: Length,
    ) -> Result<Dbm, ModelError> {
        if indoor {
            return Err(ModelError::IndoorUnsupported {
                model: self.name().to_owned(),
            });
        }

        let beta = (40.0 / self.carrier.MHz()).powi(2);
        let heights = self.base_height.metres() * self.mobile_height.metres();
        let gain = beta * (heights / distance.metres().powi(2)).powi(2);

        Ok(tx_power + Dbf::from_unit(gain))
    }

    fn name(&self) -> &str {
        "Egli"
    }
}

/// Mobile antenna correction shared by the Hata family, small or medium city.
fn hata_mobile_correction(carrier: Frequency, mobile_height: Length) -> f64 {
    let log_fc = carrier.MHz().log10();
    (1.1 * log_fc - 0.7) * mobile_height.metres() - (1.56 * log_fc - 0.8)
}

/// Hata, M. (1980) 'Empirical formula for propagation loss in land mobile radio services'.
/// Urban area.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OkumuraHata {
    pub carrier: Frequency,
    pub base_height: Length,
    pub mobile_height: Length,
}

impl Default for OkumuraHata {
    fn default() -> Self {
        Self {
            carrier: Frequency::from_MHz(868.0),
            base_height: Length::from_metres(10.0),
            mobile_height: Length::from_metres(2.0),
        }
    }
}

impl ImplPropagationModel for OkumuraHata {
    fn tp_to_rss<R: Rng + ?Sized>(
        &self,
        _rng: &mut R,
        _indoor: bool,
        tx_power: Dbm,
        distance: Length,
        _altitude: Length,
    ) -> Result<Dbm, ModelError> {
        let log_fc = self.carrier.MHz().log10();
        let log_hb = self.base_height.metres().log10();
        let ahr = hata_mobile_correction(self.carrier, self.mobile_height);

        let loss = 69.55 + 26.16 * log_fc - 13.82 * log_hb - ahr
            + (44.9 - 6.55 * log_hb) * distance.km().log10();

        Ok(tx_power - Dbf::from_db_value(loss))
    }

    fn name(&self) -> &str {
        "OkumuraHata"
    }
}

/// COST 231 extension of the Hata model, medium city.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cost231Hata {
    pub carrier: Frequency,
    pub base_height: Length,
    pub mobile_height: Length,
}

impl Default for Cost231Hata {
    fn default() -> Self {
        Self {
            carrier: Frequency::from_MHz(868.0),
            base_height: Length::from_metres(10.0),
            mobile_height: Length::from_metres(2.0),
        }
    }
}

impl ImplPropagationModel for Cost231Hata {
    fn tp_to_rss<R: Rng + ?Sized>(
        &self,
        _rng: &mut R,
        _indoor: bool,
        tx_power: Dbm,
        distance: Length,
        _altitude: Length,
    ) -> Result<Dbm, ModelError> {
        let log_fc = self.carrier.MHz().log10();
        let ahr = hata_mobile_correction(self.carrier, self.mobile_height);

        let a = 46.3 + 33.9 * log_fc - 13.28 * self.base_height.metres().log10() - ahr;
        let b = 44.9 - 6.55 * self.mobile_height.metres().log10();
        let loss = a + b * distance.km().log10();

        Ok(tx_power - Dbf::from_db_value(loss))
    }

    fn name(&self) -> &str {
        "Cost231Hata"
    }
}

/// COST 231 Walfisch-Ikegami model for urban streets, non line of sight.
/// Damosso, E. (1999) 'COST Action 231: Digital mobile radio towards future generation systems', ch. 4.4,
/// and Rec. ITU-R P.1411.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalfischIkegami {
    pub carrier: Frequency,
    pub base_height: Length,
    pub mobile_height: Length,
    pub roof_height: Length,
    pub street_width: Length,
    pub building_spacing: Length,
    /// Angle between the street and the incoming path, 0 to 90 degrees.
    pub street_angle: f64,
    /// Metropolitan centre rather than a medium sized city.
    pub metropolitan: bool,
}

impl Default for WalfischIkegami {
    fn default() -> Self {
        Self {
            carrier: Frequency::from_MHz(868.0),
            base_height: Length::from_metres(15.0),
            mobile_height: Length::from_metres(2.0),
            roof_height: Length::from_metres(12.0),
            street_width: Length::from_metres(17.5),
            building_spacing: Length::from_metres(35.0),
            street_angle: 90.0,
            metropolitan: true,
        }
    }
}

impl WalfischIkegami {
    fn orientation_loss(&self) -> f64 {
        let phi = self.street_angle.clamp(0.0, 90.0);
        let loss = if phi < 35.0 {
            -10.0 + 0.354 * phi
        } else if phi < 55.0 {
            2.5 + 0.075 * (phi - 35.0)
        } else {
            4.0 - 0.114 * (phi - 55.0)
        };

        loss.max(0.0)
    }

    /// Diffraction from the last rooftop down into the receiver's street.
    fn rooftop_to_street(&self) -> f64 {
        let above_mobile = self.roof_height.metres() - self.mobile_height.metres();

        let loss = -8.2 - 10.0 * self.street_width.metres().log10()
            + 10.0 * self.carrier.MHz().log10()
            + 20.0 * above_mobile.log10()
            + self.orientation_loss();

        loss.max(0.0)
    }

    /// Diffraction over the rows of buildings between the two antennas.
    fn multi_screen(&self, distance_km: f64) -> f64 {
        let fc = self.carrier.MHz();
        let roof = self.roof_height.metres();
        let above_roof = self.base_height.metres() - roof;

        let (shadow, ka, kd) = if above_roof > 0.0 {
            (-18.0 * (1.0 + above_roof).log10(), 54.0, 18.0)
        } else {
            let ka = if distance_km >= 0.5 {
                54.0 - 0.8 * above_roof
            } else {
                54.0 - 0.8 * above_roof * distance_km / 0.5
            };
            (0.0, ka, 18.0 - 15.0 * above_roof / roof)
        };

        let kf = if self.metropolitan {
            4.0 + 1.5 * (fc / 925.0 - 1.0)
        } else {
            4.0 + 0.7 * (fc / 925.0 - 1.0)
        };

        let loss = shadow + ka + kd * distance_km.log10() + kf * fc.log10()
            - 9.0 * self.building_spacing.metres().log10();

        loss.max(0.0)
    }
}

impl ImplPropagationModel for WalfischIkegami {
    fn tp_to_rss<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        indoor: bool,
        tx_power: Dbm,
        distance: Length,
        _altitude: Length,
    ) -> Result<Dbm, ModelError> {
        let building = building_loss(rng, indoor);
        let distance_km = distance.km();

        let free_space = 32.4 + 20.0 * distance_km.log10() + 20.0 * self.carrier.MHz().log10();
        let loss = free_space + self.rooftop_to_street() + self.multi_screen(distance_km);

        Ok(tx_power - Dbf::from_db_value(loss) - building)
    }

    fn name(&self) -> &str {
        "WalfischIkegami"
    }
}

pub const CLOSED_FORM_MODELS: [&str; 6] = [
    "LogShadow",
    "FreeSpace",
    "Egli",
    "OkumuraHata",
    "Cost231Hata",
    "WalfischIkegami",
];

/// Parses a model name as used on the command line. Pretrained regressors are
/// loaded from file instead, see [`PretrainedRegressor::load`].
pub fn closed_form_by_name(name: &str) -> Option<PropagationModel> {
    let model = match name.to_lowercase().as_str() {
        "logshadow" => LogShadow::default().into(),
        "logshadow-deterministic" => LogShadow::default().without_shadowing().into(),
        "freespace" => FreeSpace::default().into(),
        "egli" => Egli::default().into(),
        "okumurahata" => OkumuraHata::default().into(),
        "cost231hata" => Cost231Hata::default().into(),
        "walfischikegami" | "cost231" => WalfischIkegami::default().into(),
        _ => return None,
    };

    Some(model)
}
