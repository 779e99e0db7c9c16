use std::fmt::{Display, Formatter};
use std::time::Instant;

use starship_battery::units::Ratio;
use starship_battery::{Battery, Manager, State};
use strum_macros::{Display as StrumDisplay, EnumString};
use thiserror::Error;

use crate::BackendError;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, StrumDisplay, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum Supply {
    #[strum(to_string = "AC Power", serialize = "ac")]
    Ac,
    #[strum(to_string = "Battery", serialize = "battery")]
    Battery,
}

/// One sampled power reading. A new value is produced on every poll.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reading {
    pub supply: Supply,
    pub percent: Option<u8>,
    pub taken_at: Instant,
}

impl Reading {
    pub fn now(supply: Supply, percent: Option<u8>) -> Reading {
        Reading {
            supply,
            percent,
            taken_at: Instant::now(),
        }
    }
}

impl Display for Reading {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.percent {
            Some(percent) => write!(f, "{}, {}%", self.supply, percent),
            None => write!(f, "{}", self.supply),
        }
    }
}

#[derive(Error, Clone, Debug)]
pub enum ProbeError {
    #[error("Could not initialize power status backend")]
    Initialization(#[source] BackendError),
    #[error("No battery or external power supply reported by this platform")]
    NoBattery,
    #[error("Could not refresh power supply information")]
    Refresh(#[source] BackendError),
    #[error("Power supply state could not be determined")]
    Indeterminate,
}

pub type ProbeResult<T> = std::result::Result<T, ProbeError>;

pub trait PowerProbe: Send + 'static {
    fn read(&mut self) -> ProbeResult<Reading>;
}

/// Platform probe backed by the OS battery interface. Construction fails when
/// the platform reports no power supply at all.
pub struct BatteryProbe {
    manager: Manager,
    battery: Battery,
}

impl BatteryProbe {
    pub fn new() -> ProbeResult<BatteryProbe> {
        let manager = Manager::new().map_err(|e| ProbeError::Initialization(e.into()))?;
        let battery = manager
            .batteries()
            .map_err(|e| ProbeError::Initialization(e.into()))?
            .next()
            .ok_or(ProbeError::NoBattery)?
            .map_err(|e| ProbeError::Initialization(e.into()))?;
        Ok(BatteryProbe { manager, battery })
    }
}

impl PowerProbe for BatteryProbe {
    fn read(&mut self) -> ProbeResult<Reading> {
        self.manager
            .refresh(&mut self.battery)
            .map_err(|e| ProbeError::Refresh(e.into()))?;
        let percent = percent_of(self.battery.state_of_charge());
        let supply = match self.battery.state() {
            State::Charging | State::Full => Supply::Ac,
            State::Discharging | State::Empty => Supply::Battery,
            // some firmwares report an unknown state while topped up on mains
            _ if percent == Some(100) => Supply::Ac,
            _ => return Err(ProbeError::Indeterminate),
        };
        Ok(Reading::now(supply, percent))
    }
}

fn percent_of(charge: Ratio) -> Option<u8> {
    let value = charge.value * 100.0;
    value
        .is_finite()
        .then(|| value.round().clamp(0.0, 100.0) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use starship_battery::units::ratio::ratio;

    #[test]
    fn supply_parses_case_insensitively() {
        assert_eq!("ac".parse::<Supply>().unwrap(), Supply::Ac);
        assert_eq!("AC Power".parse::<Supply>().unwrap(), Supply::Ac);
        assert_eq!("battery".parse::<Supply>().unwrap(), Supply::Battery);
        assert_eq!("BATTERY".parse::<Supply>().unwrap(), Supply::Battery);
        assert!("mains".parse::<Supply>().is_err());
    }

    #[test]
    fn reading_display_includes_percent_when_known() {
        assert_eq!(
            Reading::now(Supply::Ac, Some(76)).to_string(),
            "AC Power, 76%"
        );
        assert_eq!(Reading::now(Supply::Battery, None).to_string(), "Battery");
    }

    #[test]
    fn percent_rounds_and_clamps() {
        assert_eq!(percent_of(Ratio::new::<ratio>(0.87654)), Some(88));
        assert_eq!(percent_of(Ratio::new::<ratio>(0.0)), Some(0));
        assert_eq!(percent_of(Ratio::new::<ratio>(1.2)), Some(100));
        assert_eq!(percent_of(Ratio::new::<ratio>(f32::NAN)), None);
    }
}
