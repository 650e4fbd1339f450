//! Per-device aggregation of decoded telemetry.

use crate::registry::{
    AlarmVoltages, BalanceSettings, CellVoltageRange, DifferenceAlarms, ErrorCode,
    LoadChargeAlarms, MosfetStatus, RatedNominals, ShortCircuitShutdown, Soc, Status,
    TelemetryUpdate, TemperatureRange, VersionKind,
};
use crate::transport::DeviceAddress;
use std::collections::{BTreeSet, HashMap};

#[cfg(feature = "serde")]
use serde::Serialize;

/// Latest known state of one BMS.
///
/// Values that have not been received yet are `None`. The indexed vectors
/// are clipped to the cell and sensor counts once a status is known.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct TelemetrySnapshot {
    pub device: String,
    pub status: Option<Status>,
    pub soc: Option<Soc>,
    pub cell_voltage_range: Option<CellVoltageRange>,
    pub temperature_range: Option<TemperatureRange>,
    pub mosfet: Option<MosfetStatus>,
    pub cell_voltages: Vec<Option<f32>>,
    pub cell_temperatures: Vec<Option<i32>>,
    pub balancing: Vec<bool>,
    pub errors: Option<BTreeSet<ErrorCode>>,
    pub rated_nominals: Option<RatedNominals>,
    pub cell_alarm_voltages: Option<AlarmVoltages>,
    pub pack_alarm_voltages: Option<AlarmVoltages>,
    pub load_charge_alarms: Option<LoadChargeAlarms>,
    pub difference_alarms: Option<DifferenceAlarms>,
    pub balance_settings: Option<BalanceSettings>,
    pub short_circuit: Option<ShortCircuitShutdown>,
    pub software_version: Option<String>,
    pub hardware_version: Option<String>,
}

impl TelemetrySnapshot {
    fn new(device: &DeviceAddress) -> Self {
        Self {
            device: device.to_string(),
            ..Default::default()
        }
    }

    pub fn pack_voltage(&self) -> Option<f32> {
        self.soc.as_ref().map(|soc| soc.total_voltage)
    }

    pub fn pack_current(&self) -> Option<f32> {
        self.soc.as_ref().map(|soc| soc.current)
    }

    pub fn soc_percent(&self) -> Option<f32> {
        self.soc.as_ref().map(|soc| soc.soc_percent)
    }

    fn clip_to_status(&mut self) {
        if let Some(status) = &self.status {
            self.cell_voltages.truncate(status.cells.into());
            self.balancing.truncate(status.cells.into());
            self.cell_temperatures
                .truncate(status.temperature_sensors.into());
        }
    }
}

fn merge_range<T: Clone>(target: &mut Vec<Option<T>>, first: usize, values: &[T]) {
    let end = first + values.len();
    if target.len() < end {
        target.resize(end, None);
    }
    for (slot, value) in target[first..end].iter_mut().zip(values) {
        *slot = Some(value.clone());
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    snapshot: TelemetrySnapshot,
    software_version: Vec<u8>,
    hardware_version: Vec<u8>,
}

fn render_version(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

/// Holds one snapshot per monitored device and merges updates into it.
#[derive(Debug, Default)]
pub struct Aggregator {
    devices: HashMap<DeviceAddress, DeviceState>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one decoded update. Scalars are replaced, indexed values only
    /// at the positions the update carries.
    pub fn apply(&mut self, device: &DeviceAddress, update: TelemetryUpdate) {
        let state = self.devices.entry(*device).or_insert_with(|| {
            log::debug!("First telemetry for {device}");
            DeviceState {
                snapshot: TelemetrySnapshot::new(device),
                ..Default::default()
            }
        });
        let snapshot = &mut state.snapshot;
        match update {
            TelemetryUpdate::Soc(soc) => snapshot.soc = Some(soc),
            TelemetryUpdate::CellVoltageRange(range) => snapshot.cell_voltage_range = Some(range),
            TelemetryUpdate::TemperatureRange(range) => snapshot.temperature_range = Some(range),
            TelemetryUpdate::MosfetStatus(mosfet) => snapshot.mosfet = Some(mosfet),
            TelemetryUpdate::Status(status) => snapshot.status = Some(status),
            TelemetryUpdate::CellVoltages {
                first_cell,
                voltages,
            } => merge_range(&mut snapshot.cell_voltages, first_cell, &voltages),
            TelemetryUpdate::CellTemperatures {
                first_sensor,
                temperatures,
            } => merge_range(&mut snapshot.cell_temperatures, first_sensor, &temperatures),
            TelemetryUpdate::Balancing(cells) => snapshot.balancing = cells,
            TelemetryUpdate::Errors(errors) => snapshot.errors = Some(errors),
            TelemetryUpdate::RatedNominals(rated) => snapshot.rated_nominals = Some(rated),
            TelemetryUpdate::CellAlarmVoltages(alarms) => {
                snapshot.cell_alarm_voltages = Some(alarms)
            }
            TelemetryUpdate::PackAlarmVoltages(alarms) => {
                snapshot.pack_alarm_voltages = Some(alarms)
            }
            TelemetryUpdate::LoadChargeAlarms(alarms) => snapshot.load_charge_alarms = Some(alarms),
            TelemetryUpdate::DifferenceAlarms(alarms) => snapshot.difference_alarms = Some(alarms),
            TelemetryUpdate::BalanceSettings(settings) => {
                snapshot.balance_settings = Some(settings)
            }
            TelemetryUpdate::ShortCircuitShutdown(short) => snapshot.short_circuit = Some(short),
            TelemetryUpdate::Version {
                kind,
                offset,
                bytes,
            } => {
                let (buffer, target) = match kind {
                    VersionKind::Software => {
                        (&mut state.software_version, &mut snapshot.software_version)
                    }
                    VersionKind::Hardware => {
                        (&mut state.hardware_version, &mut snapshot.hardware_version)
                    }
                };
                let end = offset + bytes.len();
                if buffer.len() < end {
                    buffer.resize(end, 0);
                }
                buffer[offset..end].copy_from_slice(&bytes);
                *target = Some(render_version(buffer));
            }
        }
        snapshot.clip_to_status();
    }

    /// A copy of the current snapshot of `device`.
    pub fn snapshot(&self, device: &DeviceAddress) -> Option<TelemetrySnapshot> {
        self.devices
            .get(device)
            .map(|state| state.snapshot.clone())
    }

    /// Stops tracking `device`, returning its last snapshot.
    pub fn remove(&mut self, device: &DeviceAddress) -> Option<TelemetrySnapshot> {
        self.devices.remove(device).map(|state| state.snapshot)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceAddress> {
        self.devices.keys()
    }
}
