//! The public gripper API.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::{Endpoint, GripperConfig, TimingConfig};
use crate::error::{GripperError, Result, TransportError};
use crate::handshake::{HandshakeEngine, HandshakeOutcome, Session, StopGuard};
use crate::plan::{compose, Command, Setpoints};
use crate::register_map::{DeviceDescriptor, Field};
use crate::state::{CommandKind, CommandOutcome, ConnectionState, GripperState};
use crate::transport::{Connection, RegisterTransport, TransportAdapter};

/// Result of an acknowledged command.
#[derive(Debug, Clone, PartialEq)]
pub struct Acknowledged {
    pub command: CommandKind,
    /// Status word of the final poll.
    pub status_word: u16,
    /// Status polls issued over the whole handshake.
    pub polls: u32,
    /// Jaw position in millimetres, read right after the handshake.
    pub position: f64,
}

struct Inner {
    descriptor: Arc<DeviceDescriptor>,
    timing: TimingConfig,
    engine: HandshakeEngine,
    connection: Connection,
    setpoints: Mutex<Setpoints>,
    state: watch::Sender<GripperState>,
}

/// What a handshake runs under.
enum Lane<'a, 'e> {
    Session(&'a mut Session<'e>),
    Stop(&'a StopGuard<'e>),
}

/// Handle to one gripper.
///
/// Clones share the same connection, so a GUI can keep one for
/// [`status`](Self::status) and [`stop`](Self::stop) while another task waits
/// on a command. Commands on one gripper are never interleaved: a second
/// command while one is in flight fails with [`GripperError::Busy`].
#[derive(Clone)]
pub struct GripperController {
    inner: Arc<Inner>,
}

impl GripperController {
    pub fn new(descriptor: DeviceDescriptor, timing: TimingConfig) -> Self {
        let descriptor = Arc::new(descriptor);
        let (state, _) = watch::channel(GripperState::default());
        Self {
            inner: Arc::new(Inner {
                engine: HandshakeEngine::new(descriptor.clone(), timing.handshake()),
                setpoints: Mutex::new(Setpoints::defaults(&descriptor)),
                descriptor,
                timing,
                connection: Connection::new(),
                state,
            }),
        }
    }

    pub fn from_config(config: &GripperConfig) -> Self {
        Self::new(config.descriptor(), config.timing)
    }

    /// Build a controller and connect it to the configured endpoint.
    pub async fn open(config: &GripperConfig) -> Result<Self> {
        let controller = Self::from_config(config);
        match config.endpoint() {
            Endpoint::Tcp { host, port } => controller.connect(&host, port).await?,
            Endpoint::Serial { path, baud_rate } => controller.connect_serial(&path, baud_rate).await?,
        }
        Ok(controller)
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.inner.descriptor
    }

    /// Open a Modbus TCP session. Does nothing if already connected.
    pub async fn connect(&self, host: &str, port: u16) -> Result<()> {
        if self.connection_state() == ConnectionState::Connected {
            return Ok(());
        }
        self.publish(|state| state.connection = ConnectionState::Connecting);
        let adapter = TransportAdapter::connect_tcp(
            host,
            port,
            self.inner.descriptor.unit_id,
            self.inner.timing.connect_timeout(),
            self.inner.timing.io_timeout(),
        )
        .await;
        self.install(adapter.map_err(GripperError::from)).await
    }

    /// Open a Modbus RTU session on a serial port.
    pub async fn connect_serial(&self, path: &str, baud_rate: u32) -> Result<()> {
        if self.connection_state() == ConnectionState::Connected {
            return Ok(());
        }
        self.publish(|state| state.connection = ConnectionState::Connecting);
        let adapter = TransportAdapter::connect_rtu(
            path,
            baud_rate,
            self.inner.descriptor.unit_id,
            self.inner.timing.io_timeout(),
        );
        self.install(adapter.map_err(GripperError::from)).await
    }

    /// Use an already open transport, replacing any current session.
    pub async fn attach(&self, transport: Box<dyn RegisterTransport>) {
        let adapter = TransportAdapter::new(transport, self.inner.timing.io_timeout());
        self.install_adapter(adapter).await;
    }

    async fn install(&self, adapter: Result<TransportAdapter>) -> Result<()> {
        match adapter {
            Ok(adapter) => {
                self.install_adapter(adapter).await;
                Ok(())
            }
            Err(err) => {
                self.publish(|state| state.connection = ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    async fn install_adapter(&self, adapter: TransportAdapter) {
        self.inner.connection.install(adapter).await;
        self.publish(|state| state.connection = ConnectionState::Connected);
        info!("{} connected", self.inner.descriptor.model);
    }

    /// Abort any in-flight handshake and release the session. Idempotent.
    pub async fn disconnect(&self) {
        self.inner.engine.abort();
        self.inner.connection.close().await;
        self.publish(|state| state.connection = ConnectionState::Disconnected);
    }

    /// Startup sequence: switch the motor controller on (Zimmer) or enable
    /// and initialize the gripper (KORAS).
    pub async fn initialize(&self) -> Result<Acknowledged> {
        self.dispatch(Command::Initialize).await
    }

    pub async fn grip(&self) -> Result<Acknowledged> {
        self.dispatch(Command::Grip).await
    }

    pub async fn release(&self) -> Result<Acknowledged> {
        self.dispatch(Command::Release).await
    }

    pub async fn home(&self) -> Result<Acknowledged> {
        self.dispatch(Command::Home).await
    }

    /// Reference run toward the inside stop. Zimmer only.
    pub async fn home_inside(&self) -> Result<Acknowledged> {
        self.dispatch(Command::HomeInside).await
    }

    /// Switch the suction of a KORAS vacuum gripper on or off.
    pub async fn vacuum(&self, on: bool) -> Result<Acknowledged> {
        self.dispatch(Command::Vacuum(on)).await
    }

    /// Move the jaws to `position` millimetres.
    pub async fn move_to(&self, position: f64) -> Result<Acknowledged> {
        self.dispatch(Command::MoveTo(position)).await
    }

    /// Grip force in percent; applied to every following motion.
    pub async fn set_force(&self, force: u16) -> Result<Acknowledged> {
        self.dispatch(Command::SetForce(force)).await
    }

    /// Drive velocity in percent; applied to every following motion.
    pub async fn set_velocity(&self, velocity: u16) -> Result<Acknowledged> {
        self.dispatch(Command::SetVelocity(velocity)).await
    }

    /// Clear a latched device fault.
    pub async fn clear_fault(&self) -> Result<Acknowledged> {
        self.dispatch(Command::ClearFault).await
    }

    /// Emergency halt.
    ///
    /// Not subject to the one-command-at-a-time rule: any running handshake
    /// is aborted and the stop sequence is written right away. Commands
    /// issued while the stop is in flight fail with [`GripperError::Busy`].
    pub async fn stop(&self) -> Result<Acknowledged> {
        let command = Command::Stop;
        self.ready_for(&command)?;
        let guard = self.inner.engine.preempt().await?;
        let result = self.execute(command, Lane::Stop(&guard)).await;
        drop(guard);
        self.settle(command, result).await
    }

    /// Last known jaw position in millimetres. No I/O.
    pub fn position(&self) -> Option<f64> {
        self.inner.state.borrow().position
    }

    /// Snapshot of the cached state. No I/O.
    pub fn status(&self) -> GripperState {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<GripperState> {
        self.inner.state.subscribe()
    }

    /// Poll status and position once and update the cached state.
    pub async fn refresh(&self) -> Result<GripperState> {
        self.ensure_connected()?;
        let polled = async {
            let block = self.inner.engine.read_status(&self.inner.connection).await?;
            let position = self.read_field(Field::Position).await?;
            Ok::<_, GripperError>((block, position))
        }
        .await;

        match polled {
            Ok((block, position)) => {
                let descriptor = &self.inner.descriptor;
                self.publish(|state| {
                    state.observe(descriptor, &block);
                    state.position = Some(position);
                });
                Ok(self.status())
            }
            Err(err) => {
                self.sync_connection().await;
                Err(err)
            }
        }
    }

    async fn dispatch(&self, command: Command) -> Result<Acknowledged> {
        command.validate(&self.inner.descriptor)?;
        self.ready_for(&command)?;
        let mut session = self.inner.engine.begin()?;
        let result = self.execute(command, Lane::Session(&mut session)).await;
        drop(session);
        self.settle(command, result).await
    }

    async fn execute(&self, command: Command, lane: Lane<'_, '_>) -> Result<Acknowledged> {
        let inner = &self.inner;
        let setpoints = self.setpoints().after(&command);
        let actual = self.position();
        let plan = compose(&inner.descriptor, &command, setpoints, actual)?;
        debug!("{:?}: {} step(s)", plan.command, plan.steps.len());

        let outcome = match lane {
            Lane::Session(session) => inner.engine.run(session, &inner.connection, &plan).await?,
            Lane::Stop(guard) => inner.engine.run_priority(guard, &inner.connection, &plan).await?,
        };
        let (status, polls) = match outcome {
            HandshakeOutcome::Acknowledged { status, polls } => (status, polls),
            HandshakeOutcome::TimedOut { attempts, .. } => {
                return Err(GripperError::TimeoutExceeded { attempts })
            }
            HandshakeOutcome::DeviceFault(fault) => return Err(fault.into()),
            HandshakeOutcome::Aborted => return Err(GripperError::Aborted),
        };

        let position = self.read_field(Field::Position).await?;
        let readback = match command {
            Command::SetForce(_) => Some((Field::Force, self.read_field(Field::Force).await?)),
            Command::SetVelocity(_) => Some((Field::Velocity, self.read_field(Field::Velocity).await?)),
            _ => None,
        };
        *inner.setpoints.lock().unwrap_or_else(PoisonError::into_inner) = setpoints;

        let descriptor = &inner.descriptor;
        self.publish(|state| {
            // a fault still present in the final block latches again
            if command == Command::ClearFault {
                state.fault = None;
            }
            state.observe(descriptor, &status);
            state.position = Some(position);
            match readback {
                Some((Field::Force, force)) => state.force = Some(force),
                Some((Field::Velocity, velocity)) => state.velocity = Some(velocity),
                _ => {}
            }
            state.last_command = Some(command.kind());
            state.last_outcome = Some(CommandOutcome::Acknowledged);
        });

        Ok(Acknowledged {
            command: command.kind(),
            status_word: status.first().copied().unwrap_or_default(),
            polls,
            position,
        })
    }

    /// Record how a failed command ended. Rejections that never reached the
    /// wire leave the state untouched.
    async fn settle(&self, command: Command, result: Result<Acknowledged>) -> Result<Acknowledged> {
        let Err(err) = &result else {
            return result;
        };
        let outcome = match err {
            GripperError::TimeoutExceeded { .. } => CommandOutcome::TimedOut,
            GripperError::DeviceFault(_) => CommandOutcome::DeviceFault,
            GripperError::Aborted => CommandOutcome::Aborted,
            GripperError::Transport(_) => CommandOutcome::TransportFailure,
            _ => return result,
        };
        self.sync_connection().await;
        self.publish(|state| {
            if let GripperError::DeviceFault(fault) = err {
                state.fault = Some(fault.clone());
            }
            state.last_command = Some(command.kind());
            state.last_outcome = Some(outcome);
        });
        result
    }

    fn ready_for(&self, command: &Command) -> Result<()> {
        self.ensure_connected()?;
        let state = self.inner.state.borrow();
        match &state.fault {
            Some(fault) if !matches!(command, Command::Stop | Command::ClearFault) => {
                Err(fault.clone().into())
            }
            _ => Ok(()),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.connection_state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Faulted => Err(TransportError::Disconnected(
                "connection faulted, reconnect required".into(),
            )
            .into()),
            _ => Err(GripperError::NotConnected),
        }
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.state.borrow().connection
    }

    async fn sync_connection(&self) {
        let connection = self.inner.connection.state().await;
        self.publish(|state| state.connection = connection);
    }

    async fn read_field(&self, field: Field) -> Result<f64> {
        let spec = *self.inner.descriptor.lookup(field)?;
        let words = self.inner.connection.read(spec.bank, spec.address, 1).await?;
        Ok(spec.decode(words.first().copied().unwrap_or_default()))
    }

    fn setpoints(&self) -> Setpoints {
        *self.inner.setpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, update: impl FnOnce(&mut GripperState)) {
        self.inner.state.send_modify(update);
    }
}
