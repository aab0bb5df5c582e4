//! KORAS gripper.
//!
//! Holding register `0` takes an order code, register `1` its value.
//! Input registers `10..=17` report status, motor position, current,
//! velocity, finger position (0 ~ 1000), two reserved words and bus voltage.

use std::collections::BTreeMap;

use num::FromPrimitive;
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

use super::{
    Bank, Bounds, CommandFlag, CommandLayout, DeviceDescriptor, FaultSource, Field, FingerCount,
    Model, RegisterSpec, StatusBits,
};

pub const DEFAULT_UNIT_ID: u8 = 1;
/// Baud rate of the RS-485 interface.
pub const DEFAULT_BAUD_RATE: u32 = 38_400;
pub const ADDR_ORDER: u16 = 0;
pub const ADDR_VALUE: u16 = 1;
pub const ADDR_STATUS: u16 = 10;
pub const NUM_STATUS_REG: u16 = 8;

/// Order codes written to register `0`.
#[repr(u16)]
#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq, Eq, Serialize, Deserialize)]
pub enum KorasOrder {
    MotorEnable = 1,
    MotorStop = 2,
    MotorDisable = 4,
    MotorPosCtrl = 5,
    MotorVelCtrl = 6,
    MotorCurCtrl = 7,
    ChangeSlaveAddr = 50,
    Initialize = 101,
    Open = 102,
    Close = 103,
    /// Finger position, 0 ~ 1000.
    FingerPosition = 104,
    VacuumOn = 106,
    VacuumOff = 107,
    /// Motor torque, 50 ~ 100 %.
    SetMotorTorque = 212,
    /// Motor speed, 1 ~ 100 %.
    SetMotorSpeed = 213,
}

impl KorasOrder {
    /// Name of an order code for logging.
    pub fn name(code: u16) -> String {
        match KorasOrder::from_u16(code) {
            Some(order) => format!("{order:?}"),
            None => format!("order {code}"),
        }
    }
}

/// Bits of the status word (register `10`).
pub mod status {
    pub const MOTOR_ENABLE: u16 = 1 << 0;
    pub const INITIALIZE: u16 = 1 << 1;
    pub const POS_CONTROL: u16 = 1 << 2;
    pub const VEL_CONTROL: u16 = 1 << 3;
    pub const CUR_CONTROL: u16 = 1 << 4;
    pub const OPEN_ACTIVE: u16 = 1 << 5;
    pub const CLOSE_ACTIVE: u16 = 1 << 6;
    pub const MOTOR_FAULT: u16 = 1 << 9;
}

pub fn describe_fault(status_word: u16) -> String {
    format!("Motor fault (status {status_word:#06x})")
}

pub fn descriptor() -> DeviceDescriptor {
    let registers = BTreeMap::from([
        (Field::Command, RegisterSpec::block(Bank::Holding, ADDR_ORDER, 2)),
        (
            Field::Status,
            RegisterSpec::block(Bank::Input, ADDR_STATUS, NUM_STATUS_REG),
        ),
        (
            Field::Position,
            RegisterSpec::word(Bank::Input, ADDR_STATUS + 4).scaled(0.1),
        ),
        (Field::Current, RegisterSpec::word(Bank::Input, ADDR_STATUS + 2)),
        (Field::MotorVelocity, RegisterSpec::word(Bank::Input, ADDR_STATUS + 3)),
        (Field::BusVoltage, RegisterSpec::word(Bank::Input, ADDR_STATUS + 7)),
        // torque and speed set-points echo through the value register
        (Field::Force, RegisterSpec::word(Bank::Holding, ADDR_VALUE)),
        (Field::Velocity, RegisterSpec::word(Bank::Holding, ADDR_VALUE)),
    ]);

    let commands = BTreeMap::from([
        (CommandFlag::Enable, KorasOrder::MotorEnable as u16),
        (CommandFlag::Stop, KorasOrder::MotorStop as u16),
        (CommandFlag::Disable, KorasOrder::MotorDisable as u16),
        (CommandFlag::Home, KorasOrder::Initialize as u16),
        (CommandFlag::Release, KorasOrder::Open as u16),
        (CommandFlag::Grip, KorasOrder::Close as u16),
        (CommandFlag::MoveTo, KorasOrder::FingerPosition as u16),
        (CommandFlag::SetForce, KorasOrder::SetMotorTorque as u16),
        (CommandFlag::SetVelocity, KorasOrder::SetMotorSpeed as u16),
        (CommandFlag::VacuumOn, KorasOrder::VacuumOn as u16),
        (CommandFlag::VacuumOff, KorasOrder::VacuumOff as u16),
    ]);

    DeviceDescriptor {
        model: Model::Koras,
        unit_id: DEFAULT_UNIT_ID,
        finger_count: FingerCount::Two,
        layout: CommandLayout::OrderValue,
        registers,
        commands,
        modes: BTreeMap::new(),
        exclusive_groups: Vec::new(),
        status_bits: StatusBits {
            busy: 0,
            gripped: status::CLOSE_ACTIVE,
            released: status::OPEN_ACTIVE,
        },
        fault: FaultSource::StatusBit(status::MOTOR_FAULT),
        position_offset: 4,
        position_tolerance: 10,
        force_range: Bounds::new(50, 100),
        velocity_range: Bounds::new(1, 100),
        travel: Bounds::new(0.0, 100.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_names() {
        assert_eq!(KorasOrder::name(103), "Close");
        assert_eq!(KorasOrder::name(3), "order 3");
    }

    #[test]
    fn finger_position_scale() {
        let koras = descriptor();
        let position = koras.lookup(Field::Position).unwrap();
        assert_eq!(position.encode(42.5), 425);
        assert_eq!(position.encode(100.0), 1000);
    }
}
