// Periodic controller health snapshot
//
// The error register is authoritative: if it cannot be read the snapshot is
// skipped rather than reporting a false OK. Once it is known, battery and
// temperature readings are best effort and missing ones are left out.

use std::fmt::Display;

use tracing::{debug, warn};

use crate::catalog::{ErrorCatalog, summarize};
use crate::error::Result;
use crate::messages::DiagnosticSnapshot;
use crate::motor::{MotorLink, TempSensor};

#[derive(Debug, Default)]
pub struct DiagnosticAggregator {
    catalog: ErrorCatalog,
    latest: Option<DiagnosticSnapshot>,
}

impl DiagnosticAggregator {
    /// Take a new snapshot. Returns `None` (keeping the previous snapshot) when
    /// the error register could not be read.
    pub fn refresh<L: MotorLink + ?Sized>(&mut self, link: &mut L) -> Option<&DiagnosticSnapshot> {
        let bitmask = match link.read_error() {
            Ok(bitmask) => bitmask,
            Err(e) => {
                warn!("Diagnostics skipped, error register unreadable: {}", e);
                return None;
            }
        };

        let errors = self.catalog.decode(bitmask);
        let summary = summarize(&errors);
        debug!("Error register 0x{:04X}: {:?}", bitmask, summary);

        let snapshot = DiagnosticSnapshot {
            summary,
            errors,
            battery_voltage: optional("main battery", link.read_main_battery()),
            logic_voltage: optional("logic battery", link.read_logic_battery()),
            temp1: optional("temperature 1", link.read_temperature(TempSensor::Temp1)),
            temp2: optional("temperature 2", link.read_temperature(TempSensor::Temp2)),
        };

        self.latest = Some(snapshot);
        self.latest.as_ref()
    }

    pub fn latest(&self) -> Option<&DiagnosticSnapshot> {
        self.latest.as_ref()
    }
}

fn optional<T, E: Display>(field: &str, reading: std::result::Result<T, E>) -> Option<T> {
    match reading {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Diagnostics: {} unavailable: {}", field, e);
            None
        }
    }
}

/// One-shot snapshot with the default catalog
pub fn snapshot<L: MotorLink + ?Sized>(link: &mut L) -> Result<DiagnosticSnapshot> {
    let bitmask = link.read_error()?;
    let errors = ErrorCatalog::default().decode(bitmask);
    Ok(DiagnosticSnapshot {
        summary: summarize(&errors),
        errors,
        battery_voltage: link.read_main_battery().ok(),
        logic_voltage: link.read_logic_battery().ok(),
        temp1: link.read_temperature(TempSensor::Temp1).ok(),
        temp2: link.read_temperature(TempSensor::Temp2).ok(),
    })
}
