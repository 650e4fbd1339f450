//! Catalogue of the read commands understood by the Daly BMS and the
//! decoders turning their reply payloads into typed telemetry.

use crate::error::{Error, Result};
use crate::protocol::{self, Address, Frame, DATA_LENGTH};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

macro_rules! read_bit {
    ($byte:expr,$position:expr) => {
        ($byte >> $position) & 1 != 0
    };
}

fn u16_at(data: &[u8], index: usize) -> u16 {
    u16::from_be_bytes([data[index], data[index + 1]])
}

fn i16_at(data: &[u8], index: usize) -> i16 {
    i16::from_be_bytes([data[index], data[index + 1]])
}

fn frame_number(data: &[u8], max: u8) -> Result<usize> {
    match data[0] {
        n if (1..=max).contains(&n) => Ok(usize::from(n)),
        n => {
            log::warn!("Frame number {n} out of range 1..={max}");
            Err(Error::MalformedFrame(format!("frame number {n}")))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Command {
    RatedNominals = 0x50,
    CellAlarmVoltages = 0x59,
    PackAlarmVoltages = 0x5a,
    LoadChargeAlarms = 0x5b,
    DifferenceAlarms = 0x5e,
    BalanceSettings = 0x5f,
    ShortCircuitShutdown = 0x60,
    SoftwareVersion = 0x62,
    HardwareVersion = 0x63,
    Soc = 0x90,
    CellVoltageRange = 0x91,
    TemperatureRange = 0x92,
    MosfetStatus = 0x93,
    Status = 0x94,
    CellVoltages = 0x95,
    CellTemperatures = 0x96,
    CellBalanceState = 0x97,
    ErrorCode = 0x98,
}

const CELLS_PER_FRAME: usize = 3;
const SENSORS_PER_FRAME: usize = 7;
const VERSION_BYTES_PER_FRAME: usize = 7;
const VERSION_FRAMES: usize = 2;

impl Command {
    pub const ALL: [Command; 18] = [
        Command::Status,
        Command::Soc,
        Command::CellVoltageRange,
        Command::TemperatureRange,
        Command::MosfetStatus,
        Command::CellVoltages,
        Command::CellTemperatures,
        Command::CellBalanceState,
        Command::ErrorCode,
        Command::RatedNominals,
        Command::CellAlarmVoltages,
        Command::PackAlarmVoltages,
        Command::LoadChargeAlarms,
        Command::DifferenceAlarms,
        Command::BalanceSettings,
        Command::ShortCircuitShutdown,
        Command::SoftwareVersion,
        Command::HardwareVersion,
    ];

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::RatedNominals => "rated-nominals",
            Command::CellAlarmVoltages => "cell-alarm-voltages",
            Command::PackAlarmVoltages => "pack-alarm-voltages",
            Command::LoadChargeAlarms => "load-charge-alarms",
            Command::DifferenceAlarms => "difference-alarms",
            Command::BalanceSettings => "balance-settings",
            Command::ShortCircuitShutdown => "short-circuit",
            Command::SoftwareVersion => "software-version",
            Command::HardwareVersion => "hardware-version",
            Command::Soc => "soc",
            Command::CellVoltageRange => "voltage-range",
            Command::TemperatureRange => "temperature-range",
            Command::MosfetStatus => "mosfet",
            Command::Status => "status",
            Command::CellVoltages => "cell-voltages",
            Command::CellTemperatures => "cell-temperatures",
            Command::CellBalanceState => "balancing",
            Command::ErrorCode => "errors",
        }
    }

    /// Request frame: the command header followed by eight zero bytes.
    pub fn request(self, address: Address) -> Result<Vec<u8>> {
        protocol::encode(address, self.id(), &[0; DATA_LENGTH as usize])
    }

    /// Whether the number of reply frames depends on the cell or sensor count.
    pub fn needs_status(self) -> bool {
        matches!(self, Command::CellVoltages | Command::CellTemperatures)
    }

    /// Whether reply frames carry their 1-based frame number in data byte 0.
    pub fn numbered_frames(self) -> bool {
        matches!(
            self,
            Command::CellVoltages
                | Command::CellTemperatures
                | Command::SoftwareVersion
                | Command::HardwareVersion
        )
    }

    /// Number of frames the BMS sends in reply, `None` while the count
    /// depends on a status that has not been read yet.
    pub fn expected_frames(self, status: Option<&Status>) -> Option<usize> {
        match self {
            Command::CellVoltages => {
                status.map(|s| usize::from(s.cells).div_ceil(CELLS_PER_FRAME))
            }
            Command::CellTemperatures => {
                status.map(|s| usize::from(s.temperature_sensors).div_ceil(SENSORS_PER_FRAME))
            }
            Command::SoftwareVersion | Command::HardwareVersion => Some(VERSION_FRAMES),
            _ => Some(1),
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        Command::ALL
            .into_iter()
            .find(|command| command.id() == id)
            .ok_or(Error::UnknownCommand(id))
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        Command::ALL
            .into_iter()
            .find(|command| command.name() == name)
            .ok_or_else(|| Error::Config(format!("unknown metric name '{name}'")))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({:02X})", self.name(), self.id())
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Soc {
    pub total_voltage: f32,
    pub current: f32, // negative=charging, positive=discharging
    pub soc_percent: f32,
}

impl Soc {
    fn decode(data: &[u8]) -> Self {
        Self {
            total_voltage: u16_at(data, 0) as f32 / 10.0,
            // The current measurement is given with a 30000 unit offset
            current: ((u16_at(data, 4) as i32) - 30000) as f32 / 10.0,
            soc_percent: u16_at(data, 6) as f32 / 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CellVoltageRange {
    pub highest_voltage: f32,
    pub highest_cell: u8,
    pub lowest_voltage: f32,
    pub lowest_cell: u8,
}

impl CellVoltageRange {
    fn decode(data: &[u8]) -> Self {
        Self {
            highest_voltage: u16_at(data, 0) as f32 / 1000.0,
            highest_cell: data[2],
            lowest_voltage: u16_at(data, 3) as f32 / 1000.0,
            lowest_cell: data[5],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TemperatureRange {
    pub highest_temperature: i16,
    pub highest_sensor: u8,
    pub lowest_temperature: i16,
    pub lowest_sensor: u8,
}

impl TemperatureRange {
    fn decode(data: &[u8]) -> Self {
        // An offset of 40 is added by the BMS to avoid having to deal with negative numbers
        Self {
            highest_temperature: i16::from(data[0]) - 40,
            highest_sensor: data[1],
            lowest_temperature: i16::from(data[2]) - 40,
            lowest_sensor: data[3],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MosfetMode {
    Stationary,
    Charging,
    Discharging,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MosfetStatus {
    pub mode: MosfetMode,
    pub charging_mosfet: bool,
    pub discharging_mosfet: bool,
    pub bms_cycles: u8,
    pub capacity_ah: f32,
}

impl MosfetStatus {
    fn decode(data: &[u8]) -> Result<Self> {
        let mode = match data[0] {
            0 => MosfetMode::Stationary,
            1 => MosfetMode::Charging,
            2 => MosfetMode::Discharging,
            mode => return Err(Error::MalformedFrame(format!("mosfet mode {mode}"))),
        };
        Ok(Self {
            mode,
            charging_mosfet: data[1] != 0,
            discharging_mosfet: data[2] != 0,
            bms_cycles: data[3],
            capacity_ah: u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as f32
                / 1000.0,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IOState {
    pub di1: bool,
    pub di2: bool,
    pub di3: bool,
    pub di4: bool,
    pub do1: bool,
    pub do2: bool,
    pub do3: bool,
    pub do4: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Status {
    pub cells: u8,
    pub temperature_sensors: u8,
    pub charger_running: bool,
    pub load_running: bool,
    pub states: IOState,
    pub cycles: u16,
}

impl Status {
    fn decode(data: &[u8]) -> Self {
        Self {
            cells: data[0],
            temperature_sensors: data[1],
            charger_running: data[2] != 0,
            load_running: data[3] != 0,
            states: IOState {
                di1: read_bit!(data[4], 0),
                di2: read_bit!(data[4], 1),
                di3: read_bit!(data[4], 2),
                di4: read_bit!(data[4], 3),
                do1: read_bit!(data[4], 4),
                do2: read_bit!(data[4], 5),
                do3: read_bit!(data[4], 6),
                do4: read_bit!(data[4], 7),
            },
            cycles: u16_at(data, 5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ErrorCode {
    CellVoltHighLevel1,
    CellVoltHighLevel2,
    CellVoltLowLevel1,
    CellVoltLowLevel2,
    SumVoltHighLevel1,
    SumVoltHighLevel2,
    SumVoltLowLevel1,
    SumVoltLowLevel2,
    ChargeTempHighLevel1,
    ChargeTempHighLevel2,
    ChargeTempLowLevel1,
    ChargeTempLowLevel2,
    DischargeTempHighLevel1,
    DischargeTempHighLevel2,
    DischargeTempLowLevel1,
    DischargeTempLowLevel2,
    ChargeOvercurrentLevel1,
    ChargeOvercurrentLevel2,
    DischargeOvercurrentLevel1,
    DischargeOvercurrentLevel2,
    SocHighLevel1,
    SocHighLevel2,
    SocLowLevel1,
    SocLowLevel2,
    DiffVoltLevel1,
    DiffVoltLevel2,
    DiffTempLevel1,
    DiffTempLevel2,
    ChargeMosTempHighAlarm,
    DischargeMosTempHighAlarm,
    ChargeMosTempSensorErr,
    DischargeMosTempSensorErr,
    ChargeMosAdhesionErr,
    DischargeMosAdhesionErr,
    ChargeMosOpenCircuitErr,
    DischargeMosOpenCircuitErr,
    AfeCollectChipErr,
    VoltageCollectDropped,
    CellTempSensorErr,
    EepromErr,
    RtcErr,
    PrechangeFailure,
    CommunicationFailure,
    InternalCommunicationFailure,
    CurrentModuleFault,
    SumVoltageDetectFault,
    ShortCircuitProtectFault,
    LowVoltForbiddenChargeFault,
}

impl ErrorCode {
    fn decode(data: &[u8]) -> BTreeSet<Self> {
        let mut result = BTreeSet::new();

        macro_rules! ck_and_add {
            ($byte:expr,$position:expr,$enum_type:expr) => {
                if read_bit!(data[$byte], $position) {
                    result.insert($enum_type);
                }
            };
        }

        ck_and_add!(0, 0, ErrorCode::CellVoltHighLevel1);
        ck_and_add!(0, 1, ErrorCode::CellVoltHighLevel2);
        ck_and_add!(0, 2, ErrorCode::CellVoltLowLevel1);
        ck_and_add!(0, 3, ErrorCode::CellVoltLowLevel2);
        ck_and_add!(0, 4, ErrorCode::SumVoltHighLevel1);
        ck_and_add!(0, 5, ErrorCode::SumVoltHighLevel2);
        ck_and_add!(0, 6, ErrorCode::SumVoltLowLevel1);
        ck_and_add!(0, 7, ErrorCode::SumVoltLowLevel2);

        ck_and_add!(1, 0, ErrorCode::ChargeTempHighLevel1);
        ck_and_add!(1, 1, ErrorCode::ChargeTempHighLevel2);
        ck_and_add!(1, 2, ErrorCode::ChargeTempLowLevel1);
        ck_and_add!(1, 3, ErrorCode::ChargeTempLowLevel2);
        ck_and_add!(1, 4, ErrorCode::DischargeTempHighLevel1);
        ck_and_add!(1, 5, ErrorCode::DischargeTempHighLevel2);
        ck_and_add!(1, 6, ErrorCode::DischargeTempLowLevel1);
        ck_and_add!(1, 7, ErrorCode::DischargeTempLowLevel2);

        ck_and_add!(2, 0, ErrorCode::ChargeOvercurrentLevel1);
        ck_and_add!(2, 1, ErrorCode::ChargeOvercurrentLevel2);
        ck_and_add!(2, 2, ErrorCode::DischargeOvercurrentLevel1);
        ck_and_add!(2, 3, ErrorCode::DischargeOvercurrentLevel2);
        ck_and_add!(2, 4, ErrorCode::SocHighLevel1);
        ck_and_add!(2, 5, ErrorCode::SocHighLevel2);
        ck_and_add!(2, 6, ErrorCode::SocLowLevel1);
        ck_and_add!(2, 7, ErrorCode::SocLowLevel2);

        ck_and_add!(3, 0, ErrorCode::DiffVoltLevel1);
        ck_and_add!(3, 1, ErrorCode::DiffVoltLevel2);
        ck_and_add!(3, 2, ErrorCode::DiffTempLevel1);
        ck_and_add!(3, 3, ErrorCode::DiffTempLevel2);

        ck_and_add!(4, 0, ErrorCode::ChargeMosTempHighAlarm);
        ck_and_add!(4, 1, ErrorCode::DischargeMosTempHighAlarm);
        ck_and_add!(4, 2, ErrorCode::ChargeMosTempSensorErr);
        ck_and_add!(4, 3, ErrorCode::DischargeMosTempSensorErr);
        ck_and_add!(4, 4, ErrorCode::ChargeMosAdhesionErr);
        ck_and_add!(4, 5, ErrorCode::DischargeMosAdhesionErr);
        ck_and_add!(4, 6, ErrorCode::ChargeMosOpenCircuitErr);
        ck_and_add!(4, 7, ErrorCode::DischargeMosOpenCircuitErr);

        ck_and_add!(5, 0, ErrorCode::AfeCollectChipErr);
        ck_and_add!(5, 1, ErrorCode::VoltageCollectDropped);
        ck_and_add!(5, 2, ErrorCode::CellTempSensorErr);
        ck_and_add!(5, 3, ErrorCode::EepromErr);
        ck_and_add!(5, 4, ErrorCode::RtcErr);
        ck_and_add!(5, 5, ErrorCode::PrechangeFailure);
        ck_and_add!(5, 6, ErrorCode::CommunicationFailure);
        ck_and_add!(5, 7, ErrorCode::InternalCommunicationFailure);

        ck_and_add!(6, 0, ErrorCode::CurrentModuleFault);
        ck_and_add!(6, 1, ErrorCode::SumVoltageDetectFault);
        ck_and_add!(6, 2, ErrorCode::ShortCircuitProtectFault);
        ck_and_add!(6, 3, ErrorCode::LowVoltForbiddenChargeFault);

        result
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorCode::CellVoltHighLevel1 => write!(f, "Cell voltage is too high level one alarm"),
            ErrorCode::CellVoltHighLevel2 => write!(f, "Cell voltage is too high level two alarm"),
            ErrorCode::CellVoltLowLevel1 => write!(f, "Cell voltage is too low level one alarm"),
            ErrorCode::CellVoltLowLevel2 => write!(f, "Cell voltage is too low level two alarm"),
            ErrorCode::SumVoltHighLevel1 => write!(f, "Total voltage is too high level one alarm"),
            ErrorCode::SumVoltHighLevel2 => write!(f, "Total voltage is too high level two alarm"),
            ErrorCode::SumVoltLowLevel1 => write!(f, "Total voltage is too low level one alarm"),
            ErrorCode::SumVoltLowLevel2 => write!(f, "Total voltage is too low level two alarm"),
            ErrorCode::ChargeTempHighLevel1 => {
                write!(f, "Charging temperature too high level one alarm")
            }
            ErrorCode::ChargeTempHighLevel2 => {
                write!(f, "Charging temperature too high level two alarm")
            }
            ErrorCode::ChargeTempLowLevel1 => {
                write!(f, "Charging temperature too low level one alarm")
            }
            ErrorCode::ChargeTempLowLevel2 => {
                write!(f, "Charging temperature too low level two alarm")
            }
            ErrorCode::DischargeTempHighLevel1 => {
                write!(f, "Discharging temperature too high level one alarm")
            }
            ErrorCode::DischargeTempHighLevel2 => {
                write!(f, "Discharging temperature too high level two alarm")
            }
            ErrorCode::DischargeTempLowLevel1 => {
                write!(f, "Discharging temperature too low level one alarm")
            }
            ErrorCode::DischargeTempLowLevel2 => {
                write!(f, "Discharging temperature too low level two alarm")
            }
            ErrorCode::ChargeOvercurrentLevel1 => write!(f, "Charge over current level one alarm"),
            ErrorCode::ChargeOvercurrentLevel2 => write!(f, "Charge over current level two alarm"),
            ErrorCode::DischargeOvercurrentLevel1 => {
                write!(f, "Discharge over current level one alarm")
            }
            ErrorCode::DischargeOvercurrentLevel2 => {
                write!(f, "Discharge over current level two alarm")
            }
            ErrorCode::SocHighLevel1 => write!(f, "SOC is too high level one alarm"),
            ErrorCode::SocHighLevel2 => write!(f, "SOC is too high level two alarm"),
            ErrorCode::SocLowLevel1 => write!(f, "SOC is too low level one alarm"),
            ErrorCode::SocLowLevel2 => write!(f, "SOC is too low level two alarm"),
            ErrorCode::DiffVoltLevel1 => write!(f, "Excessive cell voltage difference level one alarm"),
            ErrorCode::DiffVoltLevel2 => write!(f, "Excessive cell voltage difference level two alarm"),
            ErrorCode::DiffTempLevel1 => {
                write!(f, "Excessive temperature difference level one alarm")
            }
            ErrorCode::DiffTempLevel2 => {
                write!(f, "Excessive temperature difference level two alarm")
            }
            ErrorCode::ChargeMosTempHighAlarm => write!(f, "Charging MOS overtemperature alarm"),
            ErrorCode::DischargeMosTempHighAlarm => {
                write!(f, "Discharging MOS overtemperature alarm")
            }
            ErrorCode::ChargeMosTempSensorErr => {
                write!(f, "Charging MOS temperature detection sensor failure")
            }
            ErrorCode::DischargeMosTempSensorErr => {
                write!(f, "Discharging MOS temperature detection sensor failure")
            }
            ErrorCode::ChargeMosAdhesionErr => write!(f, "Charging MOS adhesion failure"),
            ErrorCode::DischargeMosAdhesionErr => write!(f, "Discharging MOS adhesion failure"),
            ErrorCode::ChargeMosOpenCircuitErr => write!(f, "Charging MOS breaker failure"),
            ErrorCode::DischargeMosOpenCircuitErr => write!(f, "Discharging MOS breaker failure"),
            ErrorCode::AfeCollectChipErr => write!(f, "AFE acquisition chip malfunction"),
            ErrorCode::VoltageCollectDropped => write!(f, "Cell voltage collection dropped"),
            ErrorCode::CellTempSensorErr => write!(f, "Single temperature sensor fault"),
            ErrorCode::EepromErr => write!(f, "EEPROM storage failure"),
            ErrorCode::RtcErr => write!(f, "RTC clock malfunction"),
            ErrorCode::PrechangeFailure => write!(f, "Precharge failure"),
            ErrorCode::CommunicationFailure => write!(f, "Vehicle communication malfunction"),
            ErrorCode::InternalCommunicationFailure => {
                write!(f, "Intranet communication module malfunction")
            }
            ErrorCode::CurrentModuleFault => write!(f, "Current module failure"),
            ErrorCode::SumVoltageDetectFault => write!(f, "Total voltage detection failure"),
            ErrorCode::ShortCircuitProtectFault => write!(f, "Short circuit protection failure"),
            ErrorCode::LowVoltForbiddenChargeFault => write!(f, "Low voltage no charging"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RatedNominals {
    pub capacity_ah: f32,
    pub cell_voltage: f32,
}

impl RatedNominals {
    fn decode(data: &[u8]) -> Self {
        Self {
            capacity_ah: i32::from_be_bytes([data[0], data[1], data[2], data[3]]) as f32 / 1000.0,
            cell_voltage: u16_at(data, 6) as f32 / 1000.0,
        }
    }
}

/// Alarm thresholds, either for a single cell or for the whole pack.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AlarmVoltages {
    pub max_voltage_level1: f32,
    pub max_voltage_level2: f32,
    pub min_voltage_level1: f32,
    pub min_voltage_level2: f32,
}

impl AlarmVoltages {
    fn decode(data: &[u8], divider: f32) -> Self {
        Self {
            max_voltage_level1: i16_at(data, 0) as f32 / divider,
            max_voltage_level2: i16_at(data, 2) as f32 / divider,
            min_voltage_level1: i16_at(data, 4) as f32 / divider,
            min_voltage_level2: i16_at(data, 6) as f32 / divider,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LoadChargeAlarms {
    pub charge_current_level1: f32,
    pub charge_current_level2: f32,
    pub discharge_current_level1: f32,
    pub discharge_current_level2: f32,
}

impl LoadChargeAlarms {
    fn decode(data: &[u8]) -> Self {
        // same 30000 offset as the pack current, charging counts downwards
        let charge = |index| (30000 - u16_at(data, index) as i32) as f32 / 10.0;
        let discharge = |index| (u16_at(data, index) as i32 - 30000) as f32 / 10.0;
        Self {
            charge_current_level1: charge(0),
            charge_current_level2: charge(2),
            discharge_current_level1: discharge(4),
            discharge_current_level2: discharge(6),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DifferenceAlarms {
    pub cell_voltage_level1: f32,
    pub cell_voltage_level2: f32,
    pub temperature_level1: u8,
    pub temperature_level2: u8,
}

impl DifferenceAlarms {
    fn decode(data: &[u8]) -> Self {
        Self {
            cell_voltage_level1: i16_at(data, 0) as f32 / 1000.0,
            cell_voltage_level2: i16_at(data, 2) as f32 / 1000.0,
            temperature_level1: data[4],
            temperature_level2: data[5],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BalanceSettings {
    pub start_voltage: f32,
    pub acceptable_difference: f32,
}

impl BalanceSettings {
    fn decode(data: &[u8]) -> Self {
        Self {
            start_voltage: i16_at(data, 0) as f32 / 1000.0,
            acceptable_difference: i16_at(data, 2) as f32 / 1000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ShortCircuitShutdown {
    pub shutdown_current: i16,
    pub sampling_resistance_ohm: f32,
}

impl ShortCircuitShutdown {
    fn decode(data: &[u8]) -> Self {
        Self {
            shutdown_current: i16_at(data, 0),
            sampling_resistance_ohm: i16_at(data, 2) as f32 / 1000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum VersionKind {
    Software,
    Hardware,
}

/// Decoded content of one reply frame.
///
/// Indexed variants carry the zero based position of their first value;
/// a multi-frame reply yields one update per frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryUpdate {
    Soc(Soc),
    CellVoltageRange(CellVoltageRange),
    TemperatureRange(TemperatureRange),
    MosfetStatus(MosfetStatus),
    Status(Status),
    CellVoltages { first_cell: usize, voltages: Vec<f32> },
    CellTemperatures { first_sensor: usize, temperatures: Vec<i32> },
    Balancing(Vec<bool>),
    Errors(BTreeSet<ErrorCode>),
    RatedNominals(RatedNominals),
    CellAlarmVoltages(AlarmVoltages),
    PackAlarmVoltages(AlarmVoltages),
    LoadChargeAlarms(LoadChargeAlarms),
    DifferenceAlarms(DifferenceAlarms),
    BalanceSettings(BalanceSettings),
    ShortCircuitShutdown(ShortCircuitShutdown),
    Version { kind: VersionKind, offset: usize, bytes: Vec<u8> },
}

fn decode_cell_voltages(data: &[u8]) -> Result<TelemetryUpdate> {
    let n_frame = frame_number(data, 16)?;
    let voltages = (0..CELLS_PER_FRAME)
        .map(|i| {
            let volt = u16_at(data, 1 + 2 * i) as f32 / 1000.0;
            log::trace!(
                "Frame #{} cell #{} volt={}",
                n_frame,
                (n_frame - 1) * CELLS_PER_FRAME + i + 1,
                volt
            );
            volt
        })
        .collect();
    Ok(TelemetryUpdate::CellVoltages {
        first_cell: (n_frame - 1) * CELLS_PER_FRAME,
        voltages,
    })
}

fn decode_cell_temperatures(data: &[u8]) -> Result<TelemetryUpdate> {
    let n_frame = frame_number(data, 16)?;
    let temperatures = data[1..=SENSORS_PER_FRAME]
        .iter()
        .map(|raw| *raw as i32 - 40)
        .collect();
    Ok(TelemetryUpdate::CellTemperatures {
        first_sensor: (n_frame - 1) * SENSORS_PER_FRAME,
        temperatures,
    })
}

fn decode_balancing(data: &[u8]) -> TelemetryUpdate {
    // six bytes, bit 0 of the first byte is cell 1
    let mut result = Vec::with_capacity(48);
    for byte in &data[..6] {
        for j in 0..8 {
            result.push(read_bit!(*byte, j));
        }
    }
    TelemetryUpdate::Balancing(result)
}

fn decode_version(data: &[u8], kind: VersionKind) -> Result<TelemetryUpdate> {
    let n_frame = frame_number(data, VERSION_FRAMES as u8)?;
    Ok(TelemetryUpdate::Version {
        kind,
        offset: (n_frame - 1) * VERSION_BYTES_PER_FRAME,
        bytes: data[1..=VERSION_BYTES_PER_FRAME].to_vec(),
    })
}

/// Decodes a validated reply frame of any known command.
pub fn decode_frame(frame: &Frame) -> Result<TelemetryUpdate> {
    let command = Command::try_from(frame.command)?;
    let data = frame.data.as_slice();
    if data.len() != DATA_LENGTH as usize {
        log::warn!(
            "Invalid payload size for {command} - required={} received={}",
            DATA_LENGTH,
            data.len()
        );
        return Err(Error::MalformedFrame(format!(
            "{} data bytes for {command}",
            data.len()
        )));
    }
    Ok(match command {
        Command::RatedNominals => TelemetryUpdate::RatedNominals(RatedNominals::decode(data)),
        Command::CellAlarmVoltages => {
            TelemetryUpdate::CellAlarmVoltages(AlarmVoltages::decode(data, 1000.0))
        }
        Command::PackAlarmVoltages => {
            TelemetryUpdate::PackAlarmVoltages(AlarmVoltages::decode(data, 10.0))
        }
        Command::LoadChargeAlarms => {
            TelemetryUpdate::LoadChargeAlarms(LoadChargeAlarms::decode(data))
        }
        Command::DifferenceAlarms => {
            TelemetryUpdate::DifferenceAlarms(DifferenceAlarms::decode(data))
        }
        Command::BalanceSettings => TelemetryUpdate::BalanceSettings(BalanceSettings::decode(data)),
        Command::ShortCircuitShutdown => {
            TelemetryUpdate::ShortCircuitShutdown(ShortCircuitShutdown::decode(data))
        }
        Command::SoftwareVersion => decode_version(data, VersionKind::Software)?,
        Command::HardwareVersion => decode_version(data, VersionKind::Hardware)?,
        Command::Soc => TelemetryUpdate::Soc(Soc::decode(data)),
        Command::CellVoltageRange => {
            TelemetryUpdate::CellVoltageRange(CellVoltageRange::decode(data))
        }
        Command::TemperatureRange => {
            TelemetryUpdate::TemperatureRange(TemperatureRange::decode(data))
        }
        Command::MosfetStatus => TelemetryUpdate::MosfetStatus(MosfetStatus::decode(data)?),
        Command::Status => TelemetryUpdate::Status(Status::decode(data)),
        Command::CellVoltages => decode_cell_voltages(data)?,
        Command::CellTemperatures => decode_cell_temperatures(data)?,
        Command::CellBalanceState => decode_balancing(data),
        Command::ErrorCode => TelemetryUpdate::Errors(ErrorCode::decode(data)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode;

    fn reply(command: Command, data: [u8; 8]) -> Frame {
        protocol::decode(&encode(Address::Bms, command.id(), &data).unwrap()).unwrap()
    }

    #[test]
    fn command_ids_and_names_round_trip() {
        for command in Command::ALL {
            assert_eq!(Command::try_from(command.id()).unwrap(), command);
            assert_eq!(command.name().parse::<Command>().unwrap(), command);
        }
        assert!(matches!(
            Command::try_from(0x42),
            Err(Error::UnknownCommand(0x42))
        ));
        assert!("nonsense".parse::<Command>().is_err());
    }

    #[test]
    fn unknown_command_in_reply() {
        let frame = protocol::decode(&encode(Address::Bms, 0x42, &[0; 8]).unwrap()).unwrap();
        assert!(matches!(decode_frame(&frame), Err(Error::UnknownCommand(0x42))));
    }

    #[test]
    fn request_frames() {
        let request = Command::CellVoltages.request(Address::UartHost).unwrap();
        assert_eq!(
            request,
            [0xa5, 0x80, 0x95, 0x08, 0, 0, 0, 0, 0, 0, 0, 0, 0xc2]
        );
    }

    #[test]
    fn expected_frames_follow_status() {
        let status = Status::decode(&[16, 3, 0, 0, 0, 0, 0, 0]);
        assert_eq!(Command::CellVoltages.expected_frames(None), None);
        assert_eq!(Command::CellVoltages.expected_frames(Some(&status)), Some(6));
        assert_eq!(Command::CellTemperatures.expected_frames(Some(&status)), Some(1));
        assert_eq!(Command::SoftwareVersion.expected_frames(None), Some(2));
        assert_eq!(Command::Soc.expected_frames(None), Some(1));
    }

    #[test]
    fn decode_temperature_range_over_full_raw_span() {
        let frame = reply(Command::TemperatureRange, [0xc8, 0x02, 0x00, 0x01, 0, 0, 0, 0]);
        assert_eq!(
            decode_frame(&frame).unwrap(),
            TelemetryUpdate::TemperatureRange(TemperatureRange {
                highest_temperature: 160,
                highest_sensor: 2,
                lowest_temperature: -40,
                lowest_sensor: 1,
            })
        );
    }

    #[test]
    fn decode_difference_alarms_above_127() {
        let frame = reply(Command::DifferenceAlarms, [0x00, 0x64, 0x00, 0xc8, 0x05, 0xc8, 0, 0]);
        assert_eq!(
            decode_frame(&frame).unwrap(),
            TelemetryUpdate::DifferenceAlarms(DifferenceAlarms {
                cell_voltage_level1: 0.1,
                cell_voltage_level2: 0.2,
                temperature_level1: 5,
                temperature_level2: 200,
            })
        );
    }

    #[test]
    fn numbered_replies() {
        assert!(Command::CellVoltages.numbered_frames());
        assert!(Command::CellTemperatures.numbered_frames());
        assert!(Command::SoftwareVersion.numbered_frames());
        assert!(!Command::Soc.numbered_frames());
        assert!(!Command::CellBalanceState.numbered_frames());
    }

    #[test]
    fn decode_soc() {
        let frame = reply(Command::Soc, [0x02, 0x14, 0x00, 0x00, 0x75, 0x62, 0x03, 0x52]);
        assert_eq!(
            decode_frame(&frame).unwrap(),
            TelemetryUpdate::Soc(Soc {
                total_voltage: 53.2,
                current: 5.0,
                soc_percent: 85.0,
            })
        );
    }

    #[test]
    fn decode_status() {
        let frame = reply(Command::Status, [0x10, 0x02, 0x01, 0x00, 0b0001_0010, 0x00, 0x2a, 0x00]);
        let TelemetryUpdate::Status(status) = decode_frame(&frame).unwrap() else {
            panic!("not a status");
        };
        assert_eq!(status.cells, 16);
        assert_eq!(status.temperature_sensors, 2);
        assert!(status.charger_running);
        assert!(!status.load_running);
        assert!(status.states.di2);
        assert!(status.states.do1);
        assert!(!status.states.di1);
        assert_eq!(status.cycles, 42);
    }

    #[test]
    fn decode_cell_voltage_frames() {
        let frame = reply(
            Command::CellVoltages,
            [0x02, 0x0c, 0xe4, 0x0c, 0xe5, 0x0c, 0xe6, 0x00],
        );
        assert_eq!(
            decode_frame(&frame).unwrap(),
            TelemetryUpdate::CellVoltages {
                first_cell: 3,
                voltages: vec![3.3, 3.301, 3.302],
            }
        );

        let frame = reply(Command::CellVoltages, [0x00, 0x0c, 0xe4, 0, 0, 0, 0, 0]);
        assert!(matches!(decode_frame(&frame), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn decode_temperatures_with_offset() {
        let frame = reply(Command::CellTemperatures, [0x01, 40, 65, 30, 0, 0, 0, 0]);
        assert_eq!(
            decode_frame(&frame).unwrap(),
            TelemetryUpdate::CellTemperatures {
                first_sensor: 0,
                temperatures: vec![0, 25, -10, -40, -40, -40, -40],
            }
        );
    }

    #[test]
    fn decode_balancing_bits() {
        let frame = reply(Command::CellBalanceState, [0b0000_0101, 0x80, 0, 0, 0, 0, 0, 0]);
        let TelemetryUpdate::Balancing(cells) = decode_frame(&frame).unwrap() else {
            panic!("not a balancing update");
        };
        assert_eq!(cells.len(), 48);
        assert!(cells[0]);
        assert!(!cells[1]);
        assert!(cells[2]);
        assert!(cells[15]);
        assert_eq!(cells.iter().filter(|b| **b).count(), 3);
    }

    #[test]
    fn decode_error_flags() {
        let frame = reply(Command::ErrorCode, [0x01, 0, 0x40, 0, 0, 0, 0x04, 0]);
        let TelemetryUpdate::Errors(errors) = decode_frame(&frame).unwrap() else {
            panic!("not an error update");
        };
        assert_eq!(
            errors.into_iter().collect::<Vec<_>>(),
            vec![
                ErrorCode::CellVoltHighLevel1,
                ErrorCode::SocLowLevel1,
                ErrorCode::ShortCircuitProtectFault
            ]
        );
    }

    #[test]
    fn undefined_mosfet_mode_is_rejected() {
        let frame = reply(Command::MosfetStatus, [0x07, 1, 1, 0, 0, 0, 0, 0]);
        assert!(matches!(decode_frame(&frame), Err(Error::MalformedFrame(_))));

        let frame = reply(Command::MosfetStatus, [0x01, 1, 0, 12, 0x00, 0x01, 0x86, 0xa0]);
        assert_eq!(
            decode_frame(&frame).unwrap(),
            TelemetryUpdate::MosfetStatus(MosfetStatus {
                mode: MosfetMode::Charging,
                charging_mosfet: true,
                discharging_mosfet: false,
                bms_cycles: 12,
                capacity_ah: 100.0,
            })
        );
    }

    #[test]
    fn decode_threshold_commands() {
        // 3.65 V / 3.8 V / 2.8 V / 2.5 V
        let frame = reply(
            Command::CellAlarmVoltages,
            [0x0e, 0x42, 0x0e, 0xd8, 0x0a, 0xf0, 0x09, 0xc4],
        );
        assert_eq!(
            decode_frame(&frame).unwrap(),
            TelemetryUpdate::CellAlarmVoltages(AlarmVoltages {
                max_voltage_level1: 3.65,
                max_voltage_level2: 3.8,
                min_voltage_level1: 2.8,
                min_voltage_level2: 2.5,
            })
        );

        // 100 A charge / 150 A discharge
        let frame = reply(
            Command::LoadChargeAlarms,
            [0x71, 0x48, 0x71, 0x48, 0x7b, 0x0c, 0x7b, 0x0c],
        );
        let TelemetryUpdate::LoadChargeAlarms(alarms) = decode_frame(&frame).unwrap() else {
            panic!("not a load/charge alarm update");
        };
        assert_eq!(alarms.charge_current_level1, 100.0);
        assert_eq!(alarms.discharge_current_level2, 150.0);

        let frame = reply(
            Command::RatedNominals,
            [0x00, 0x04, 0x93, 0xe0, 0x00, 0x00, 0x0c, 0xe4],
        );
        assert_eq!(
            decode_frame(&frame).unwrap(),
            TelemetryUpdate::RatedNominals(RatedNominals {
                capacity_ah: 300.0,
                cell_voltage: 3.3,
            })
        );
    }

    #[test]
    fn decode_version_parts() {
        let frame = reply(Command::SoftwareVersion, [0x02, b'2', b'0', b'2', b'1', 0, 0, 0]);
        assert_eq!(
            decode_frame(&frame).unwrap(),
            TelemetryUpdate::Version {
                kind: VersionKind::Software,
                offset: 7,
                bytes: vec![b'2', b'0', b'2', b'1', 0, 0, 0],
            }
        );
        let frame = reply(Command::HardwareVersion, [0x03, 0, 0, 0, 0, 0, 0, 0]);
        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn short_payload_is_malformed() {
        let frame = protocol::decode(&encode(Address::Bms, 0x90, &[0; 4]).unwrap()).unwrap();
        assert!(matches!(decode_frame(&frame), Err(Error::MalformedFrame(_))));
    }
}
