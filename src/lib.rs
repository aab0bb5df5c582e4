//! # zimmer-koras-rs
//!
//! `zimmer-koras-rs` is a library for driving industrial grippers over Modbus.
//! ### Compatible product
//! - [x] Zimmer 2-finger GEH6040IL / GEH6060IL (IO-Link behind a Turck Modbus TCP gateway)
//! - [x] Zimmer 3-finger GED6040IL / GED6060IL
//! - [x] KORAS gripper (Modbus RTU, or Modbus TCP through a gateway)
//!
//! Every command is a handshake: the command words are written, the status
//! block is polled until the device acknowledges, faults or the step times
//! out, and a timed out step is re-issued a bounded number of times. Calls
//! resolve with [`Acknowledged`] or a [`GripperError`].
//!
//! ## Example
//! ```no_run
//! use zimmer_koras_rs::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), GripperError> {
//!     let gripper = GripperController::new(
//!         Model::Zimmer2Finger.descriptor(),
//!         TimingConfig::default(),
//!     );
//!     gripper.connect("192.168.3.112", 502).await?;
//!
//!     // switch the motor controller on
//!     gripper.initialize().await?;
//!
//!     // force and velocity in percent, used by every following motion
//!     gripper.set_force(80).await?;
//!     gripper.set_velocity(50).await?;
//!
//!     let ack = gripper.grip().await?;
//!     println!("gripped at {:.2} mm", ack.position);
//!
//!     gripper.move_to(20.0).await?;
//!     gripper.release().await?;
//!
//!     // cached, no bus traffic
//!     println!("{:?}", gripper.status());
//!
//!     gripper.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//! ```no_run
//! use zimmer_koras_rs::*;
//!
//! # async fn run() -> Result<(), GripperError> {
//! let config = GripperConfig::load("gripper.json")?;
//! let gripper = GripperController::open(&config).await?;
//! gripper.initialize().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod handshake;
pub mod mock;
pub mod plan;
pub mod register_map;
pub mod state;
pub mod transport;

pub use config::{Endpoint, GripperConfig, TimingConfig};
pub use controller::{Acknowledged, GripperController};
pub use error::{
    ConfigError, ConnectError, DeviceFault, GripperError, RegisterMapError, Result, TransportError,
};
pub use handshake::{HandshakeEngine, HandshakeOutcome, StopGuard, Timing};
pub use mock::MockTransport;
pub use plan::Command;
pub use register_map::{Bank, DeviceDescriptor, FingerCount, Model};
pub use state::{CommandKind, CommandOutcome, ConnectionState, Diagnosis, GripperState, JawStatus};
pub use transport::{ModbusTransport, RegisterTransport, TransportAdapter};
