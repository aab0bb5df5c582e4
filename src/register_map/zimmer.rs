//! Zimmer GEH/GED 60xxIL grippers behind a Turck IO-Link master.
//!
//! Output process data (holding registers starting at `0x0811`, 8 words):
//!
//! | word | content                                   |
//! |------|-------------------------------------------|
//! | 0    | `ControlWord`, one bit at a time          |
//! | 1    | `DeviceMode` (high) / `WorkpieceNo` (low) |
//! | 2    | `PositionTolerance` \[0.01 mm\]           |
//! | 3    | `GripForce` (high) / `DriveVelocity` (low), 1~100 % |
//! | 4    | `BasePosition` \[0.01 mm\]                |
//! | 5    | `ShiftPosition` \[0.01 mm\]               |
//! | 6    | `TeachPosition` \[0.01 mm\]               |
//! | 7    | `WorkPosition` \[0.01 mm\]                |
//!
//! Input process data (input registers starting at `0x0011`, 3 words):
//! `StatusWord`, `Diagnosis`, `ActualPosition` \[0.01 mm\].

use std::collections::BTreeMap;

use num::FromPrimitive;
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

use super::{
    Bank, Bounds, CommandFlag, CommandLayout, DeviceDescriptor, FaultSource, Field, FingerCount,
    Model, RegisterSpec, StatusBits,
};

/// Default Modbus unit id of the IO-Link master channel.
pub const DEFAULT_UNIT_ID: u8 = 16;
/// First output process data register.
pub const ADDR_SEND: u16 = 0x0811;
/// First input process data register.
pub const ADDR_RECV: u16 = 0x0011;
pub const NUM_SEND_REG: u16 = 8;
pub const NUM_RECV_REG: u16 = 3;

/// `ControlWord` bits.
pub mod control {
    /// Apply process data / workpiece data.
    pub const DATA_TRANSFER: u16 = 0x0001;
    /// Write the current dataset to the tool recipe.
    pub const WRITE_PDU: u16 = 0x0002;
    pub const RESET_DIRECTION_FLAG: u16 = 0x0004;
    /// Save the current position as `TeachPosition`.
    pub const TEACH: u16 = 0x0008;
    pub const MOVE_TO_BASE: u16 = 0x0100;
    pub const MOVE_TO_WORK: u16 = 0x0200;
    pub const JOG_TO_WORK: u16 = 0x0400;
    pub const JOG_TO_BASE: u16 = 0x0800;
}

/// `StatusWord` bits.
pub mod status {
    pub const MOVE_WORKPOSITION_FLAG: u16 = 0x4000;
    pub const MOVE_BASEPOSITION_FLAG: u16 = 0x2000;
    pub const DATA_TRANSFER_OK: u16 = 0x1000;
    pub const AT_WORKPOSITION: u16 = 0x0400;
    pub const AT_BASEPOSITION: u16 = 0x0100;
    pub const PLC_ACTIVE: u16 = 0x0040;
    pub const MOVEMENT_COMPLETE: u16 = 0x0008;
    pub const IN_MOTION: u16 = 0x0004;
    pub const MOTOR_ON: u16 = 0x0002;
    pub const HOMING_POSITION_OK: u16 = 0x0001;
}

/// Value of the `DeviceMode` byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceMode {
    NotSend = 0,
    Idle = 1,
    GripperReset = 2,
    MotorControlOn = 3,
    MotorControlOff = 5,
    OutsideHoming = 10,
    JogOperation = 11,
    InsideHoming = 14,
}

/// `Diagnosis` word values documented by the device manual.
#[repr(u16)]
#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZimmerDiagnosis {
    Ready = 0x0000,
    MotorControllerOff = 0x0001,
    ActuatorSupplyLow = 0x0100,
    OverTemperature = 0x0101,
    UnderTemperature = 0x0102,
    MotionTaskCrc = 0x0206,
    ControlWordImplausible = 0x0300,
    PositionsImplausible = 0x0301,
    GripForceImplausible = 0x0302,
    DriveVelocityImplausible = 0x0303,
    PositionToleranceImplausible = 0x0304,
    NotReferenced = 0x0305,
    DeviceModeImplausible = 0x0306,
    MotionTaskRejected = 0x0307,
    WorkpieceNotSelectable = 0x0308,
    ShiftPositionExceeded = 0x0313,
    Jam = 0x0402,
    PositionSensor = 0x0404,
}

impl std::fmt::Display for ZimmerDiagnosis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            ZimmerDiagnosis::Ready => "Device is ready for operation",
            ZimmerDiagnosis::MotorControllerOff => "Motor controller is switched off",
            ZimmerDiagnosis::ActuatorSupplyLow => {
                "Actuator power supply is not present or is too low"
            }
            ZimmerDiagnosis::OverTemperature => "Temperature above maximum permitted temperature",
            ZimmerDiagnosis::UnderTemperature => "Max. permitted temperature undershot",
            ZimmerDiagnosis::MotionTaskCrc => "Motion task cannot be executed (CRC error)",
            ZimmerDiagnosis::ControlWordImplausible => "ControlWord is not plausible",
            ZimmerDiagnosis::PositionsImplausible => "Positions implausible",
            ZimmerDiagnosis::GripForceImplausible => "GripForce is not plausible",
            ZimmerDiagnosis::DriveVelocityImplausible => "DriveVelocity not plausible",
            ZimmerDiagnosis::PositionToleranceImplausible => "PositionTolerance is not plausible",
            ZimmerDiagnosis::NotReferenced => "Position measuring system not referenced",
            ZimmerDiagnosis::DeviceModeImplausible => "DeviceMode is not plausible",
            ZimmerDiagnosis::MotionTaskRejected => "Motion task cannot be executed",
            ZimmerDiagnosis::WorkpieceNotSelectable => "WorkpieceNo cannot be selected",
            ZimmerDiagnosis::ShiftPositionExceeded => "Calculated ShiftPosition exceeded",
            ZimmerDiagnosis::Jam => "Jam",
            ZimmerDiagnosis::PositionSensor => "Position sensor error",
        };
        f.write_str(message)
    }
}

pub fn describe_diagnosis(code: u16) -> String {
    match ZimmerDiagnosis::from_u16(code) {
        Some(diagnosis) => diagnosis.to_string(),
        None if matches!(code, 0x0406 | 0x040B..=0x040F) => "Internal error".to_string(),
        None => format!("Unknown error code ({code:#06x})"),
    }
}

/// Output process data block.
///
/// Positions are raw counts of 0.01 mm. Every handshake step rewrites the
/// whole block, only the control word changes between steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessData {
    pub control: u16,
    pub mode: u8,
    pub workpiece: u8,
    pub tolerance: u16,
    pub force: u8,
    pub velocity: u8,
    pub base: u16,
    pub shift: u16,
    pub teach: u16,
    pub work: u16,
}

impl ProcessData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn control(mut self, word: u16) -> Self {
        self.control = word;
        self
    }

    pub fn mode(mut self, mode: u8) -> Self {
        self.mode = mode;
        self
    }

    pub fn tolerance(mut self, counts: u16) -> Self {
        self.tolerance = counts;
        self
    }

    /// Grip force and drive velocity, both in percent.
    pub fn force_velocity(mut self, force: u8, velocity: u8) -> Self {
        self.force = force;
        self.velocity = velocity;
        self
    }

    /// Base, shift and work positions in raw counts.
    pub fn positions(mut self, base: u16, shift: u16, work: u16) -> Self {
        self.base = base;
        self.shift = shift;
        self.work = work;
        self
    }

    /// make array for writing to register.
    pub fn to_array(&self) -> [u16; NUM_SEND_REG as usize] {
        [
            self.control,
            u16::from_be_bytes([self.mode, self.workpiece]),
            self.tolerance,
            u16::from_be_bytes([self.force, self.velocity]),
            self.base,
            self.shift,
            self.teach,
            self.work,
        ]
    }
}

pub fn descriptor(finger_count: FingerCount) -> DeviceDescriptor {
    let (model, travel) = match finger_count {
        FingerCount::Two => (Model::Zimmer2Finger, Bounds::new(1.0, 41.75)),
        FingerCount::Three => (Model::Zimmer3Finger, Bounds::new(1.0, 30.0)),
    };

    let setpoints = ADDR_SEND + 3;
    let registers = BTreeMap::from([
        (
            Field::Command,
            RegisterSpec::block(Bank::Holding, ADDR_SEND, NUM_SEND_REG),
        ),
        (
            Field::Status,
            RegisterSpec::block(Bank::Input, ADDR_RECV, NUM_RECV_REG),
        ),
        (Field::Diagnosis, RegisterSpec::word(Bank::Input, ADDR_RECV + 1)),
        (
            Field::Position,
            RegisterSpec::word(Bank::Input, ADDR_RECV + 2).scaled(0.01),
        ),
        (
            Field::Force,
            RegisterSpec::word(Bank::Holding, setpoints).masked(0xFF00, 8),
        ),
        (
            Field::Velocity,
            RegisterSpec::word(Bank::Holding, setpoints).masked(0x00FF, 0),
        ),
    ]);

    let mut commands = BTreeMap::from([
        (CommandFlag::Transfer, control::DATA_TRANSFER),
        (CommandFlag::ResetDirection, control::RESET_DIRECTION_FLAG),
        (CommandFlag::Grip, control::MOVE_TO_WORK),
        (CommandFlag::Release, control::MOVE_TO_BASE),
    ]);
    // jog and teach are wired on the 2-jaw variant only
    if finger_count == FingerCount::Two {
        commands.insert(CommandFlag::Teach, control::TEACH);
        commands.insert(CommandFlag::JogToGrip, control::JOG_TO_WORK);
        commands.insert(CommandFlag::JogToRelease, control::JOG_TO_BASE);
    }

    let modes = BTreeMap::from([
        (CommandFlag::Operate, DeviceMode::MotorControlOn as u8),
        (CommandFlag::Stop, DeviceMode::MotorControlOff as u8),
        (CommandFlag::Home, DeviceMode::OutsideHoming as u8),
        (CommandFlag::HomeInside, DeviceMode::InsideHoming as u8),
        (CommandFlag::ClearFault, DeviceMode::GripperReset as u8),
    ]);

    DeviceDescriptor {
        model,
        unit_id: DEFAULT_UNIT_ID,
        finger_count,
        layout: CommandLayout::ProcessData,
        registers,
        commands,
        modes,
        exclusive_groups: vec![
            control::DATA_TRANSFER
                | control::WRITE_PDU
                | control::RESET_DIRECTION_FLAG
                | control::TEACH
                | control::MOVE_TO_BASE
                | control::MOVE_TO_WORK
                | control::JOG_TO_WORK
                | control::JOG_TO_BASE,
        ],
        status_bits: StatusBits {
            busy: status::IN_MOTION,
            gripped: status::AT_WORKPOSITION,
            released: status::AT_BASEPOSITION,
        },
        fault: FaultSource::DiagnosisWord {
            offset: 1,
            threshold: 0x0100,
        },
        position_offset: 2,
        position_tolerance: 50,
        force_range: Bounds::new(1, 100),
        velocity_range: Bounds::new(1, 100),
        travel,
    }
}
