//! Observable gripper state.
//!
//! The controller publishes a fresh [`GripperState`] after every concluded
//! handshake or status poll. Readers get a cheap clone and never trigger I/O.

use serde::{Deserialize, Serialize};

use crate::error::DeviceFault;
use crate::register_map::{DeviceDescriptor, Field, StatusBits};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// A transport failure ended the session; an explicit reconnect is needed.
    Faulted,
}

/// Jaw status decoded from the status word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum JawStatus {
    #[default]
    Unknown,
    Moving,
    Gripped,
    Released,
}

impl JawStatus {
    pub fn from_status(bits: &StatusBits, status: u16) -> Self {
        if bits.busy != 0 && status & bits.busy != 0 {
            JawStatus::Moving
        } else if status & bits.gripped != 0 {
            JawStatus::Gripped
        } else if status & bits.released != 0 {
            JawStatus::Released
        } else {
            JawStatus::Unknown
        }
    }
}

/// Logical command kinds, as reported in the state snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    Initialize,
    Grip,
    Release,
    Home,
    HomeInside,
    MoveTo,
    SetForce,
    SetVelocity,
    Vacuum,
    Stop,
    ClearFault,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    Acknowledged,
    TimedOut,
    DeviceFault,
    Aborted,
    TransportFailure,
}

/// Diagnosis word as last reported, faulting or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub code: u16,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GripperState {
    pub connection: ConnectionState,
    /// Jaw position in millimetres.
    pub position: Option<f64>,
    pub jaw: JawStatus,
    pub status_word: u16,
    /// Grip force set-point as read back from the device.
    pub force: Option<f64>,
    /// Drive velocity set-point as read back from the device.
    pub velocity: Option<f64>,
    pub last_command: Option<CommandKind>,
    pub last_outcome: Option<CommandOutcome>,
    /// Latched until `clear_fault()` succeeds.
    pub fault: Option<DeviceFault>,
    /// Zimmer only.
    pub diagnosis: Option<Diagnosis>,
    /// Motor current in mA (KORAS).
    pub current: Option<f64>,
    /// Motor velocity in rpm (KORAS).
    pub motor_velocity: Option<f64>,
    /// Bus voltage in V (KORAS).
    pub bus_voltage: Option<f64>,
}

impl GripperState {
    /// Apply a freshly read status block.
    pub fn observe(&mut self, descriptor: &DeviceDescriptor, block: &[u16]) {
        let Some(&status) = block.first() else {
            return;
        };
        self.status_word = status;
        self.jaw = JawStatus::from_status(&descriptor.status_bits, status);
        if let Some(fault) = descriptor.fault_in(block) {
            self.fault = Some(fault);
        }
        if let Some(code) = descriptor.field_in(Field::Diagnosis, block) {
            let code = code as u16;
            self.diagnosis = Some(Diagnosis {
                code,
                description: descriptor.describe_fault(code),
            });
        }
        self.current = descriptor.field_in(Field::Current, block).or(self.current);
        self.motor_velocity = descriptor.field_in(Field::MotorVelocity, block).or(self.motor_velocity);
        self.bus_voltage = descriptor.field_in(Field::BusVoltage, block).or(self.bus_voltage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register_map::{koras, zimmer, Model};

    #[test]
    fn jaw_status_from_zimmer_bits() {
        let bits = Model::Zimmer2Finger.descriptor().status_bits;
        assert_eq!(
            JawStatus::from_status(&bits, zimmer::status::AT_WORKPOSITION),
            JawStatus::Gripped
        );
        assert_eq!(
            JawStatus::from_status(
                &bits,
                zimmer::status::AT_BASEPOSITION | zimmer::status::IN_MOTION
            ),
            JawStatus::Moving
        );
        assert_eq!(JawStatus::from_status(&bits, 0), JawStatus::Unknown);
    }

    #[test]
    fn observing_a_fault_latches_it() {
        let descriptor = Model::Zimmer2Finger.descriptor();
        let mut state = GripperState::default();
        state.observe(&descriptor, &[zimmer::status::MOTOR_ON, 0x0402, 1200]);
        assert_eq!(state.fault.as_ref().map(|f| f.code), Some(0x0402));

        state.observe(&descriptor, &[zimmer::status::MOTOR_ON, 0, 1200]);
        assert!(state.fault.is_some());
    }

    #[test]
    fn informational_diagnosis_is_reported_without_a_fault() {
        let descriptor = Model::Zimmer2Finger.descriptor();
        let mut state = GripperState::default();
        state.observe(&descriptor, &[zimmer::status::PLC_ACTIVE, 0x0001, 0]);

        assert_eq!(state.fault, None);
        let diagnosis = state.diagnosis.unwrap();
        assert_eq!(diagnosis.code, 0x0001);
        assert_eq!(diagnosis.description, "Motor controller is switched off");
    }

    #[test]
    fn koras_telemetry_follows_the_status_block() {
        let descriptor = Model::Koras.descriptor();
        let mut state = GripperState::default();
        state.observe(&descriptor, &[koras::status::MOTOR_ENABLE, 0, 350, 1200, 425, 0, 0, 24]);

        assert_eq!(state.current, Some(350.0));
        assert_eq!(state.motor_velocity, Some(1200.0));
        assert_eq!(state.bus_voltage, Some(24.0));
        assert_eq!(state.diagnosis, None);
    }
}
