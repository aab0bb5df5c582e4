//! Turning a [`Command`] into the handshake steps a device expects.

use serde::{Deserialize, Serialize};

use crate::error::{GripperError, Result};
use crate::register_map::koras::status as koras_status;
use crate::register_map::zimmer::{status as zimmer_status, ProcessData};
use crate::register_map::{CommandFlag, CommandLayout, DeviceDescriptor, Field};
use crate::state::CommandKind;

/// A logical request to the gripper.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Initialize,
    Grip,
    Release,
    Home,
    /// Reference run toward the inside stop (Zimmer).
    HomeInside,
    /// Target jaw position in millimetres.
    MoveTo(f64),
    /// Grip force in percent.
    SetForce(u16),
    /// Drive velocity in percent.
    SetVelocity(u16),
    /// Suction on or off (KORAS vacuum variant).
    Vacuum(bool),
    Stop,
    ClearFault,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Initialize => CommandKind::Initialize,
            Command::Grip => CommandKind::Grip,
            Command::Release => CommandKind::Release,
            Command::Home => CommandKind::Home,
            Command::HomeInside => CommandKind::HomeInside,
            Command::MoveTo(_) => CommandKind::MoveTo,
            Command::SetForce(_) => CommandKind::SetForce,
            Command::SetVelocity(_) => CommandKind::SetVelocity,
            Command::Vacuum(_) => CommandKind::Vacuum,
            Command::Stop => CommandKind::Stop,
            Command::ClearFault => CommandKind::ClearFault,
        }
    }

    /// Range checks against the descriptor. Performs no I/O.
    pub fn validate(&self, descriptor: &DeviceDescriptor) -> Result<()> {
        match *self {
            Command::MoveTo(position) => {
                let travel = descriptor.travel;
                if !position.is_finite() {
                    return Err(GripperError::validation("position", "must be a finite number"));
                }
                if !travel.contains(position) {
                    return Err(GripperError::validation(
                        "position",
                        format!(
                            "{position} mm is outside {} ~ {} mm",
                            travel.min, travel.max
                        ),
                    ));
                }
            }
            Command::SetForce(force) => {
                let range = descriptor.force_range;
                if !range.contains(force) {
                    return Err(GripperError::validation(
                        "force",
                        format!("{force} is outside {} ~ {}", range.min, range.max),
                    ));
                }
            }
            Command::SetVelocity(velocity) => {
                let range = descriptor.velocity_range;
                if !range.contains(velocity) {
                    return Err(GripperError::validation(
                        "velocity",
                        format!("{velocity} is outside {} ~ {}", range.min, range.max),
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Force and velocity applied with every process data transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setpoints {
    pub force: u16,
    pub velocity: u16,
}

impl Setpoints {
    pub fn defaults(descriptor: &DeviceDescriptor) -> Self {
        let force = descriptor.force_range;
        let velocity = descriptor.velocity_range;
        Self {
            force: 50.clamp(force.min, force.max),
            velocity: 50.clamp(velocity.min, velocity.max),
        }
    }

    /// The set-points in effect once `command` is acknowledged.
    pub fn after(mut self, command: &Command) -> Self {
        match *command {
            Command::SetForce(force) => self.force = force,
            Command::SetVelocity(velocity) => self.velocity = velocity,
            _ => {}
        }
        self
    }
}

/// Status condition that acknowledges a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Expect {
    /// Bits that must all be set.
    pub set: u16,
    /// Bits that must all be clear.
    pub clear: u16,
    /// Raw jaw position the device must report, within the descriptor's tolerance.
    pub position: Option<u16>,
}

impl Expect {
    pub fn set(bits: u16) -> Self {
        Self {
            set: bits,
            ..Self::default()
        }
    }

    pub fn clear(bits: u16) -> Self {
        Self {
            clear: bits,
            ..Self::default()
        }
    }

    pub fn and_clear(mut self, bits: u16) -> Self {
        self.clear |= bits;
        self
    }

    pub fn met(&self, descriptor: &DeviceDescriptor, block: &[u16]) -> bool {
        let Some(&status) = block.first() else {
            return false;
        };
        let bits_ok = status & self.set == self.set && status & self.clear == 0;
        let position_ok = self.position.map_or(true, |target| {
            block
                .get(descriptor.position_offset)
                .is_some_and(|actual| actual.abs_diff(target) <= descriptor.position_tolerance)
        });
        bits_ok && position_ok
    }
}

/// One write-then-poll exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub label: &'static str,
    /// Words written to the command block; `None` only waits.
    pub write: Option<Vec<u16>>,
    pub expect: Expect,
    /// Fault bits count as "still in progress" instead of ending the handshake.
    pub tolerate_fault: bool,
}

impl Step {
    fn new(label: &'static str, write: Vec<u16>, expect: Expect) -> Self {
        Self {
            label,
            write: Some(write),
            expect,
            tolerate_fault: false,
        }
    }

    fn wait(label: &'static str, expect: Expect) -> Self {
        Self {
            label,
            write: None,
            expect,
            tolerate_fault: false,
        }
    }

    fn tolerating_fault(mut self) -> Self {
        self.tolerate_fault = true;
        self
    }
}

/// The full handshake for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub command: CommandKind,
    /// Address of the command block.
    pub address: u16,
    pub steps: Vec<Step>,
}

/// Build the plan for `command`.
///
/// `actual` is the last known jaw position, used to pick the direction of a
/// Zimmer `MoveTo`.
pub fn compose(
    descriptor: &DeviceDescriptor,
    command: &Command,
    setpoints: Setpoints,
    actual: Option<f64>,
) -> Result<Plan> {
    let address = descriptor.lookup(Field::Command)?.address;
    let steps = match descriptor.layout {
        CommandLayout::ProcessData => process_data_steps(descriptor, command, setpoints, actual)?,
        CommandLayout::OrderValue => order_value_steps(descriptor, command)?,
    };
    Ok(Plan {
        command: command.kind(),
        address,
        steps,
    })
}

fn process_data_steps(
    descriptor: &DeviceDescriptor,
    command: &Command,
    setpoints: Setpoints,
    actual: Option<f64>,
) -> Result<Vec<Step>> {
    let position = descriptor.lookup(Field::Position)?;
    let min = position.encode(descriptor.travel.min);
    let max = position.encode(descriptor.travel.max);
    let operate = descriptor.mode(CommandFlag::Operate)?;
    let force = byte_setpoint("force", setpoints.force)?;
    let velocity = byte_setpoint("velocity", setpoints.velocity)?;

    let frame = |mode: u8| {
        ProcessData::new()
            .mode(mode)
            .tolerance(descriptor.position_tolerance)
            .force_velocity(force, velocity)
    };
    let toward_work = |work: u16| {
        frame(operate).positions(min, work.saturating_sub(100).max(min), work)
    };
    let toward_base = |base: u16| frame(operate).positions(base, base.saturating_add(100).min(max), max);

    let steps = match *command {
        Command::Initialize | Command::SetForce(_) | Command::SetVelocity(_) => {
            let data = frame(operate).positions(min, min.saturating_add(1900).min(max), max);
            transfer(descriptor, data, zimmer_status::MOTOR_ON)?
        }
        Command::Grip => motion(descriptor, CommandFlag::Grip, toward_work(max))?,
        Command::Release => motion(descriptor, CommandFlag::Release, toward_base(min))?,
        Command::MoveTo(target) => {
            let target = position.encode(target);
            let closing = actual.map_or(true, |actual| target >= position.encode(actual));
            if closing {
                motion(descriptor, CommandFlag::Grip, toward_work(target))?
            } else {
                motion(descriptor, CommandFlag::Release, toward_base(target))?
            }
        }
        Command::Home | Command::HomeInside => {
            let flag = match *command {
                Command::HomeInside => CommandFlag::HomeInside,
                _ => CommandFlag::Home,
            };
            let data = frame(descriptor.mode(flag)?).positions(min, min, max);
            let mut steps = transfer(descriptor, data, 0)?;
            // a homing bit left over from the last reference run must not count
            steps.push(Step::wait(
                "homing started",
                Expect::set(zimmer_status::IN_MOTION).and_clear(zimmer_status::MOVEMENT_COMPLETE),
            ));
            steps.push(Step::wait(
                "homing",
                Expect::set(zimmer_status::MOVEMENT_COMPLETE | zimmer_status::HOMING_POSITION_OK)
                    .and_clear(zimmer_status::IN_MOTION),
            ));
            steps
        }
        Command::Vacuum(on) => {
            let data = frame(descriptor.mode(vacuum_flag(on))?).positions(min, min, max);
            transfer(descriptor, data, 0)?
        }
        Command::Stop => {
            let data = frame(descriptor.mode(CommandFlag::Stop)?).positions(min, min, max);
            let mut steps = transfer(descriptor, data, 0)?;
            if let Some(step) = steps.iter_mut().find(|step| step.label == TRANSFER) {
                step.expect = step.expect.and_clear(zimmer_status::MOTOR_ON);
            }
            steps
        }
        Command::ClearFault => {
            let data = frame(descriptor.mode(CommandFlag::ClearFault)?).positions(min, min, max);
            let mut steps = transfer(descriptor, data, 0)?;
            let last = steps.pop();
            steps = steps.into_iter().map(Step::tolerating_fault).collect();
            steps.extend(last);
            steps
        }
    };
    Ok(steps)
}

const TRANSFER: &str = "data transfer";

/// Force and velocity travel as one byte each in the process data.
fn byte_setpoint(field: &'static str, value: u16) -> Result<u8> {
    u8::try_from(value)
        .map_err(|_| GripperError::validation(field, format!("{value} does not fit in one byte")))
}

fn vacuum_flag(on: bool) -> CommandFlag {
    if on {
        CommandFlag::VacuumOn
    } else {
        CommandFlag::VacuumOff
    }
}

/// Apply process data: wait for the PLC, raise `DataTransfer` until the
/// device confirms, then drop it again so the next transfer sees a fresh edge.
fn transfer(descriptor: &DeviceDescriptor, data: ProcessData, confirm: u16) -> Result<Vec<Step>> {
    let control = descriptor.compose_command_word(0, CommandFlag::Transfer)?;
    Ok(vec![
        Step::wait("plc active", Expect::set(zimmer_status::PLC_ACTIVE)),
        Step::new(
            TRANSFER,
            data.control(control).to_array().to_vec(),
            Expect::set(zimmer_status::DATA_TRANSFER_OK | confirm),
        ),
        Step::new(
            "handshake",
            data.control(0).to_array().to_vec(),
            Expect::clear(zimmer_status::DATA_TRANSFER_OK),
        ),
    ])
}

fn motion(descriptor: &DeviceDescriptor, flag: CommandFlag, data: ProcessData) -> Result<Vec<Step>> {
    let direction = match flag {
        CommandFlag::Grip => zimmer_status::MOVE_WORKPOSITION_FLAG,
        _ => zimmer_status::MOVE_BASEPOSITION_FLAG,
    };
    let mut steps = transfer(descriptor, data, zimmer_status::MOTOR_ON)?;
    let moving = descriptor.compose_command_word(0, flag)?;
    let reset = descriptor.compose_command_word(moving, CommandFlag::ResetDirection)?;
    steps.push(Step::new(
        "move",
        data.control(moving).to_array().to_vec(),
        Expect::set(zimmer_status::MOVEMENT_COMPLETE | direction).and_clear(zimmer_status::IN_MOTION),
    ));
    steps.push(Step::new(
        "reset direction",
        data.control(reset).to_array().to_vec(),
        Expect::clear(zimmer_status::MOVE_WORKPOSITION_FLAG | zimmer_status::MOVE_BASEPOSITION_FLAG),
    ));
    Ok(steps)
}

fn order_value_steps(descriptor: &DeviceDescriptor, command: &Command) -> Result<Vec<Step>> {
    let order = |label, flag, value: u16, expect| -> Result<Step> {
        let code = descriptor.compose_command_word(0, flag)?;
        Ok(Step::new(label, vec![code, value], expect))
    };
    // INITIALIZE stays set after the first reference run, so it has to drop
    // and come back before a new one counts
    let initialize = || -> Result<Vec<Step>> {
        Ok(vec![
            order("initialize", CommandFlag::Home, 0, Expect::clear(koras_status::INITIALIZE))?,
            Step::wait("initialized", Expect::set(koras_status::INITIALIZE)),
        ])
    };

    let steps = match *command {
        Command::Initialize => {
            let mut steps = vec![order(
                "motor enable",
                CommandFlag::Enable,
                0,
                Expect::set(koras_status::MOTOR_ENABLE),
            )?];
            steps.extend(initialize()?);
            steps
        }
        Command::Grip => vec![order(
            "close",
            CommandFlag::Grip,
            0,
            Expect::set(koras_status::CLOSE_ACTIVE).and_clear(koras_status::OPEN_ACTIVE),
        )?],
        Command::Release => vec![order(
            "open",
            CommandFlag::Release,
            0,
            Expect::set(koras_status::OPEN_ACTIVE).and_clear(koras_status::CLOSE_ACTIVE),
        )?],
        Command::Home => initialize()?,
        Command::HomeInside => vec![order("home inside", CommandFlag::HomeInside, 0, Expect::default())?],
        Command::MoveTo(target) => {
            let raw = descriptor.lookup(Field::Position)?.encode(target);
            let expect = Expect {
                position: Some(raw),
                ..Expect::default()
            };
            vec![order("finger position", CommandFlag::MoveTo, raw, expect)?]
        }
        Command::SetForce(force) => {
            vec![order("motor torque", CommandFlag::SetForce, force, Expect::default())?]
        }
        Command::SetVelocity(velocity) => vec![order(
            "motor speed",
            CommandFlag::SetVelocity,
            velocity,
            Expect::default(),
        )?],
        Command::Vacuum(on) => {
            let label = if on { "vacuum on" } else { "vacuum off" };
            vec![order(label, vacuum_flag(on), 0, Expect::default())?]
        }
        // the jaw bits persist after a finished motion, so nothing is waited for
        Command::Stop => vec![order("motor stop", CommandFlag::Stop, 0, Expect::default())?],
        Command::ClearFault => vec![
            order("motor disable", CommandFlag::Disable, 0, Expect::clear(koras_status::MOTOR_ENABLE))?
                .tolerating_fault(),
            order("motor enable", CommandFlag::Enable, 0, Expect::set(koras_status::MOTOR_ENABLE))?,
        ],
    };
    Ok(steps)
}
