use serde::{Deserialize, Serialize};

use crate::units::{Length, METRES};

/// Where a device or the gateway sits. Coordinates are in the plane of the cell,
/// altitude is height above ground.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub x: Length,
    pub y: Length,
    pub altitude: Length,
    pub indoor: bool,
}

impl Location {
    pub fn new(x: Length, y: Length, altitude: Length, indoor: bool) -> Location {
        Location {
            x,
            y,
            altitude,
            indoor,
        }
    }

    /// Outdoor location at ground level.
    pub fn outdoor(x: Length, y: Length) -> Location {
        Location::new(x, y, 0.0 * METRES, false)
    }

    /// Horizontal distance, the propagation models take altitude separately.
    pub fn distance_to(&self, other: &Location) -> Length {
        let dx = (self.x - other.x).metres();
        let dy = (self.y - other.y).metres();
        Length::from_metres(dx.hypot(dy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assert_close, units::KM};

    #[test]
    fn distance_is_symmetric() {
        let a = Location::outdoor(0.0 * KM, 0.0 * KM);
        let b = Location::new(3.0 * KM, 4.0 * KM, 40.0 * METRES, true);

        assert_close(a.distance_to(&b), 5.0 * KM);
        assert_close(b.distance_to(&a), 5.0 * KM);
    }
}
