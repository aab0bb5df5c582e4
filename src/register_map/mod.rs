//! Static register layouts for every supported gripper model.
//!
//! A [`DeviceDescriptor`] is pure data: which registers hold the command,
//! status and feedback words, which bits mean what, and the ranges a command
//! parameter may take. The handshake engine is parameterized by a descriptor
//! instead of branching on the model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{DeviceFault, RegisterMapError};

pub mod koras;
pub mod zimmer;

/// Supported gripper models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Model {
    /// Zimmer GEH60xxIL, 2 jaws.
    Zimmer2Finger,
    /// Zimmer GED60xxIL, 3 jaws.
    Zimmer3Finger,
    Koras,
}

impl Model {
    pub fn descriptor(&self) -> DeviceDescriptor {
        match self {
            Model::Zimmer2Finger => zimmer::descriptor(FingerCount::Two),
            Model::Zimmer3Finger => zimmer::descriptor(FingerCount::Three),
            Model::Koras => koras::descriptor(),
        }
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerCount {
    Two,
    Three,
}

/// Modbus register bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bank {
    Holding,
    Input,
}

/// Logical register of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// First word of the command block, written by every handshake step.
    Command,
    /// Status block polled by the handshake engine.
    Status,
    /// Jaw position feedback.
    Position,
    Force,
    Velocity,
    Diagnosis,
    /// Motor current in mA.
    Current,
    /// Motor speed in rpm.
    MotorVelocity,
    /// Supply voltage in V.
    BusVoltage,
}

/// Logical command bit (Zimmer control word) or order code (KORAS).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandFlag {
    Transfer,
    ResetDirection,
    Teach,
    Grip,
    Release,
    JogToGrip,
    JogToRelease,
    MoveTo,
    Home,
    /// Homing toward the inner end stop.
    HomeInside,
    Stop,
    Enable,
    Disable,
    SetForce,
    SetVelocity,
    ClearFault,
    Operate,
    VacuumOn,
    VacuumOff,
}

/// How a command is laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandLayout {
    /// Zimmer: a full process-data block with a bit-coded control word.
    ProcessData,
    /// KORAS: an order code followed by its value.
    OrderValue,
}

/// Location and scaling of one logical register.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegisterSpec {
    pub bank: Bank,
    pub address: u16,
    pub count: u16,
    pub mask: u16,
    pub shift: u8,
    /// Physical units per raw count.
    pub scale: f64,
}

impl RegisterSpec {
    pub const fn word(bank: Bank, address: u16) -> Self {
        Self {
            bank,
            address,
            count: 1,
            mask: 0xFFFF,
            shift: 0,
            scale: 1.0,
        }
    }

    pub const fn block(bank: Bank, address: u16, count: u16) -> Self {
        Self {
            count,
            ..Self::word(bank, address)
        }
    }

    pub const fn masked(mut self, mask: u16, shift: u8) -> Self {
        self.mask = mask;
        self.shift = shift;
        self
    }

    pub const fn scaled(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Raw field value of a register word.
    pub fn raw(&self, word: u16) -> u16 {
        (word & self.mask) >> self.shift
    }

    /// Field value of a register word in physical units.
    pub fn decode(&self, word: u16) -> f64 {
        self.raw(word) as f64 * self.scale
    }

    /// Raw count for a physical value, saturating at the field width.
    pub fn encode(&self, value: f64) -> u16 {
        let max = (self.mask >> self.shift) as f64;
        (value / self.scale).round().clamp(0.0, max) as u16
    }
}

/// Inclusive range of a command parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds<T> {
    pub min: T,
    pub max: T,
}

impl<T: PartialOrd + Copy> Bounds<T> {
    pub const fn new(min: T, max: T) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: T) -> bool {
        self.min <= value && value <= self.max
    }
}

/// Where a device reports its faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultSource {
    /// A status bit flags the fault; the raw status word is the fault code.
    StatusBit(u16),
    /// A diagnosis word at `offset` in the status block; codes at or above
    /// `threshold` are faults.
    DiagnosisWord { offset: usize, threshold: u16 },
}

/// Status bits shared by every handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBits {
    pub busy: u16,
    pub gripped: u16,
    pub released: u16,
}

/// Static description of one gripper model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub model: Model,
    pub unit_id: u8,
    pub finger_count: FingerCount,
    pub layout: CommandLayout,
    pub registers: BTreeMap<Field, RegisterSpec>,
    /// Control word bits (process data) or order codes (order/value).
    pub commands: BTreeMap<CommandFlag, u16>,
    /// Device mode byte per operation; only used by the process data layout.
    #[serde(default)]
    pub modes: BTreeMap<CommandFlag, u8>,
    /// Groups of bits of which at most one may be asserted.
    #[serde(default)]
    pub exclusive_groups: Vec<u16>,
    pub status_bits: StatusBits,
    pub fault: FaultSource,
    /// Offset of the jaw position word within the status block.
    pub position_offset: usize,
    /// Position tolerance for position-based acknowledgment, raw counts.
    pub position_tolerance: u16,
    pub force_range: Bounds<u16>,
    pub velocity_range: Bounds<u16>,
    /// Jaw travel in millimetres.
    pub travel: Bounds<f64>,
}

impl DeviceDescriptor {
    pub fn lookup(&self, field: Field) -> Result<&RegisterSpec, RegisterMapError> {
        self.registers
            .get(&field)
            .ok_or_else(|| RegisterMapError::UnknownField {
                model: self.model.to_string(),
                field,
            })
    }

    pub fn code(&self, flag: CommandFlag) -> Result<u16, RegisterMapError> {
        self.commands
            .get(&flag)
            .copied()
            .ok_or_else(|| RegisterMapError::UnknownCommand {
                model: self.model.to_string(),
                flag,
            })
    }

    pub fn mode(&self, flag: CommandFlag) -> Result<u8, RegisterMapError> {
        self.modes
            .get(&flag)
            .copied()
            .ok_or_else(|| RegisterMapError::UnknownCommand {
                model: self.model.to_string(),
                flag,
            })
    }

    /// Value of `field` taken from a status block, when the field lies inside
    /// the block.
    pub fn field_in(&self, field: Field, block: &[u16]) -> Option<f64> {
        let status = self.registers.get(&Field::Status)?;
        let spec = self.registers.get(&field)?;
        if spec.bank != status.bank {
            return None;
        }
        let offset = spec.address.checked_sub(status.address)?;
        if offset >= status.count {
            return None;
        }
        block.get(usize::from(offset)).map(|word| spec.decode(*word))
    }

    /// Assert `flag` on top of `current`, clearing every bit that is mutually
    /// exclusive with it. Order codes replace the word outright.
    pub fn compose_command_word(&self, current: u16, flag: CommandFlag) -> Result<u16, RegisterMapError> {
        let code = self.code(flag)?;
        let word = match self.layout {
            CommandLayout::ProcessData => {
                let conflicting = self
                    .exclusive_groups
                    .iter()
                    .filter(|group| *group & code != 0)
                    .fold(0, |acc, group| acc | group);
                (current & !conflicting) | code
            }
            CommandLayout::OrderValue => code,
        };
        self.validate_command_word(word)?;
        Ok(word)
    }

    /// Check a command word before it goes on the wire.
    pub fn validate_command_word(&self, word: u16) -> Result<(), RegisterMapError> {
        match self.layout {
            CommandLayout::ProcessData => {
                let supported = self.commands.values().fold(0, |acc, bits| acc | bits);
                if word & !supported != 0 {
                    return Err(RegisterMapError::UnsupportedCode {
                        model: self.model.to_string(),
                        word,
                    });
                }
                if self
                    .exclusive_groups
                    .iter()
                    .any(|group| (word & group).count_ones() > 1)
                {
                    return Err(RegisterMapError::ConflictingBits { word });
                }
            }
            CommandLayout::OrderValue => {
                if !self.commands.values().any(|code| *code == word) {
                    return Err(RegisterMapError::UnsupportedCode {
                        model: self.model.to_string(),
                        word,
                    });
                }
            }
        }
        Ok(())
    }

    /// Fault reported by a status block, if any.
    pub fn fault_in(&self, block: &[u16]) -> Option<DeviceFault> {
        match self.fault {
            FaultSource::StatusBit(bit) => {
                let status = block.first().copied().unwrap_or_default();
                (status & bit != 0).then(|| DeviceFault {
                    code: status,
                    description: self.describe_fault(status),
                })
            }
            FaultSource::DiagnosisWord { offset, threshold } => {
                let code = block.get(offset).copied().unwrap_or_default();
                (code >= threshold).then(|| DeviceFault {
                    code,
                    description: self.describe_fault(code),
                })
            }
        }
    }

    pub fn describe_fault(&self, code: u16) -> String {
        match self.model {
            Model::Zimmer2Finger | Model::Zimmer3Finger => zimmer::describe_diagnosis(code),
            Model::Koras => koras::describe_fault(code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_field_is_reported() {
        let koras = Model::Koras.descriptor();
        assert!(matches!(
            koras.lookup(Field::Diagnosis),
            Err(RegisterMapError::UnknownField { field: Field::Diagnosis, .. })
        ));
        assert!(koras.lookup(Field::Status).is_ok());
    }

    #[test]
    fn composing_clears_exclusive_bits() {
        let zimmer = Model::Zimmer2Finger.descriptor();
        let transfer = zimmer.compose_command_word(0, CommandFlag::Transfer).unwrap();
        assert_eq!(transfer, zimmer::control::DATA_TRANSFER);

        let grip = zimmer
            .compose_command_word(transfer, CommandFlag::Grip)
            .unwrap();
        assert_eq!(grip, zimmer::control::MOVE_TO_WORK);
    }

    #[test]
    fn conflicting_words_are_rejected() {
        let zimmer = Model::Zimmer2Finger.descriptor();
        let both = zimmer::control::MOVE_TO_WORK | zimmer::control::MOVE_TO_BASE;
        assert_eq!(
            zimmer.validate_command_word(both),
            Err(RegisterMapError::ConflictingBits { word: both })
        );
        assert!(zimmer.validate_command_word(0).is_ok());
    }

    #[test]
    fn three_finger_variant_drops_jog_and_teach() {
        let three = Model::Zimmer3Finger.descriptor();
        assert!(matches!(
            three.validate_command_word(zimmer::control::JOG_TO_WORK),
            Err(RegisterMapError::UnsupportedCode { .. })
        ));
        assert!(three.code(CommandFlag::Teach).is_err());

        let two = Model::Zimmer2Finger.descriptor();
        assert!(two.validate_command_word(zimmer::control::JOG_TO_WORK).is_ok());
    }

    #[test]
    fn order_codes_must_be_known() {
        let koras = Model::Koras.descriptor();
        assert!(koras.validate_command_word(koras::KorasOrder::Close as u16).is_ok());
        assert!(koras.validate_command_word(999).is_err());
    }

    #[test]
    fn register_spec_scaling() {
        let force = RegisterSpec::word(Bank::Holding, 0x0814).masked(0xFF00, 8);
        assert_eq!(force.raw(0x3250), 0x32);
        assert_eq!(force.decode(0x3250), 50.0);

        let position = RegisterSpec::word(Bank::Input, 0x0013).scaled(0.01);
        assert_eq!(position.encode(41.75), 4175);
        assert!((position.decode(4175) - 41.75).abs() < 1e-9);
        assert_eq!(position.encode(-3.0), 0);
    }

    #[test]
    fn faults_from_status_block() {
        let zimmer = Model::Zimmer2Finger.descriptor();
        assert_eq!(zimmer.fault_in(&[0x0042, 0x0001, 0]), None);
        let jam = zimmer.fault_in(&[0x0042, 0x0402, 0]).unwrap();
        assert_eq!(jam.code, 0x0402);
        assert_eq!(jam.description, "Jam");

        let koras = Model::Koras.descriptor();
        let fault = koras.fault_in(&[koras::status::MOTOR_FAULT | 1]).unwrap();
        assert_eq!(fault.code, koras::status::MOTOR_FAULT | 1);
    }

    #[test]
    fn telemetry_read_from_status_block() {
        let koras = Model::Koras.descriptor();
        let block = [1, 0, 350, 1200, 425, 0, 0, 24];
        assert_eq!(koras.field_in(Field::Current, &block), Some(350.0));
        assert_eq!(koras.field_in(Field::MotorVelocity, &block), Some(1200.0));
        assert_eq!(koras.field_in(Field::BusVoltage, &block), Some(24.0));
        // holding bank, not part of the polled block
        assert_eq!(koras.field_in(Field::Force, &block), None);

        let zimmer = Model::Zimmer2Finger.descriptor();
        assert_eq!(zimmer.field_in(Field::Diagnosis, &[0x0042, 0x0001, 0]), Some(1.0));
        assert_eq!(zimmer.field_in(Field::Current, &[0x0042, 0x0001, 0]), None);
    }

    #[test]
    fn descriptor_survives_json() {
        let zimmer = Model::Zimmer3Finger.descriptor();
        let json = serde_json::to_string(&zimmer).unwrap();
        let back: DeviceDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, zimmer);
    }
}
