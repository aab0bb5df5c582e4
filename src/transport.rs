//! Register I/O with timeouts and the single-retry policy.
//!
//! [`RegisterTransport`] is the raw capability (a tokio-modbus client, or
//! [`MockTransport`](crate::mock::MockTransport) in tests). The
//! [`TransportAdapter`] bounds every call by a timeout, retries a single
//! transient timeout and marks the connection `Faulted` on anything worse.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::prelude::*;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::error::{ConnectError, GripperError, TransportError};
use crate::register_map::Bank;
use crate::state::ConnectionState;

/// Raw register access bound to one unit id.
#[async_trait]
pub trait RegisterTransport: Send {
    async fn read_registers(
        &mut self,
        bank: Bank,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// [`RegisterTransport`] over a tokio-modbus client context.
pub struct ModbusTransport {
    ctx: client::Context,
}

impl ModbusTransport {
    pub fn new(ctx: client::Context) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl RegisterTransport for ModbusTransport {
    async fn read_registers(
        &mut self,
        bank: Bank,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let words = match bank {
            Bank::Holding => self.ctx.read_holding_registers(address, count).await??,
            Bank::Input => self.ctx.read_input_registers(address, count).await??,
        };
        Ok(words)
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), TransportError> {
        Ok(self.ctx.write_multiple_registers(address, values).await??)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        Ok(self.ctx.disconnect().await??)
    }
}

/// One Modbus session with its connection state.
pub struct TransportAdapter {
    inner: Box<dyn RegisterTransport>,
    state: ConnectionState,
    io_timeout: Duration,
}

impl TransportAdapter {
    /// Wrap an already open transport.
    pub fn new(inner: Box<dyn RegisterTransport>, io_timeout: Duration) -> Self {
        Self {
            inner,
            state: ConnectionState::Connected,
            io_timeout,
        }
    }

    /// Open a Modbus TCP session.
    pub async fn connect_tcp(
        host: &str,
        port: u16,
        unit_id: u8,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let addr = resolve(host, port, connect_timeout).await?;
        let ctx = establish(tcp::connect_slave(addr, Slave(unit_id)), connect_timeout).await?;
        info!("connected to {addr} (unit {unit_id})");
        Ok(Self::new(Box::new(ModbusTransport::new(ctx)), io_timeout))
    }

    /// Open a Modbus RTU session on a serial RS-485 port.
    pub fn connect_rtu(
        path: &str,
        baud_rate: u32,
        unit_id: u8,
        io_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .timeout(io_timeout)
            .open_native_async()
            .map_err(|err| match err.kind {
                tokio_serial::ErrorKind::NoDevice => ConnectError::InvalidAddress(err.to_string()),
                tokio_serial::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                    ConnectError::InvalidAddress(err.to_string())
                }
                _ => ConnectError::Refused(err.to_string()),
            })?;

        let ctx = rtu::attach_slave(port, Slave(unit_id));
        info!("opened {path} at {baud_rate} baud (unit {unit_id})");
        Ok(Self::new(Box::new(ModbusTransport::new(ctx)), io_timeout))
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub async fn read_registers(
        &mut self,
        bank: Bank,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.ensure_usable()?;
        let mut retried = false;
        loop {
            let result = timeout(self.io_timeout, self.inner.read_registers(bank, address, count))
                .await
                .unwrap_or(Err(TransportError::Timeout));
            match result {
                Ok(words) if words.len() == count as usize => return Ok(words),
                Ok(words) => {
                    return Err(self.fault(TransportError::MalformedResponse(format!(
                        "expected {count} registers at {address:#06x}, got {}",
                        words.len()
                    ))))
                }
                Err(TransportError::Timeout) if !retried => {
                    warn!("read at {address:#06x} timed out, retrying once");
                    retried = true;
                }
                Err(err) => return Err(self.fault(err)),
            }
        }
    }

    pub async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), TransportError> {
        self.ensure_usable()?;
        let mut retried = false;
        loop {
            let result = timeout(self.io_timeout, self.inner.write_registers(address, values))
                .await
                .unwrap_or(Err(TransportError::Timeout));
            match result {
                Ok(()) => return Ok(()),
                Err(TransportError::Timeout) if !retried => {
                    warn!("write at {address:#06x} timed out, retrying once");
                    retried = true;
                }
                Err(err) => return Err(self.fault(err)),
            }
        }
    }

    /// Release the session. Safe to call more than once.
    pub async fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Disconnected;
        match timeout(self.io_timeout, self.inner.disconnect()).await {
            Ok(Ok(())) => info!("disconnected"),
            Ok(Err(err)) => debug!("disconnect: {err}"),
            Err(_) => debug!("disconnect timed out"),
        }
    }

    fn ensure_usable(&self) -> Result<(), TransportError> {
        match self.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Faulted => Err(TransportError::Disconnected(
                "connection faulted, reconnect required".into(),
            )),
            _ => Err(TransportError::Disconnected("not connected".into())),
        }
    }

    fn fault(&mut self, err: TransportError) -> TransportError {
        warn!("transport fault: {err}");
        self.state = ConnectionState::Faulted;
        err
    }
}

/// Bound a connection attempt by `within`.
async fn establish<T>(
    connect: impl Future<Output = std::io::Result<T>>,
    within: Duration,
) -> Result<T, ConnectError> {
    match timeout(within, connect).await {
        Err(_) => Err(ConnectError::Timeout),
        Ok(Err(err)) if err.kind() == std::io::ErrorKind::TimedOut => Err(ConnectError::Timeout),
        Ok(Err(err)) => Err(ConnectError::Refused(err.to_string())),
        Ok(Ok(ctx)) => Ok(ctx),
    }
}

async fn resolve(host: &str, port: u16, within: Duration) -> Result<SocketAddr, ConnectError> {
    if host.is_empty() {
        return Err(ConnectError::InvalidAddress("empty host".into()));
    }
    let mut addrs = timeout(within, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| ConnectError::Timeout)?
        .map_err(|err| ConnectError::InvalidAddress(format!("{host}:{port}: {err}")))?;
    addrs
        .next()
        .ok_or_else(|| ConnectError::InvalidAddress(format!("{host}:{port} did not resolve")))
}

/// The controller's slot for its exclusively owned transport.
///
/// The lock is held for a single register call only, so a priority write can
/// slip in between two polls of a running handshake.
#[derive(Default)]
pub struct Connection {
    adapter: Mutex<Option<TransportAdapter>>,
}

impl Connection {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn install(&self, adapter: TransportAdapter) {
        let previous = self.adapter.lock().await.replace(adapter);
        if let Some(mut previous) = previous {
            previous.disconnect().await;
        }
    }

    pub async fn close(&self) {
        if let Some(mut adapter) = self.adapter.lock().await.take() {
            adapter.disconnect().await;
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.adapter
            .lock()
            .await
            .as_ref()
            .map(TransportAdapter::state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub async fn read(&self, bank: Bank, address: u16, count: u16) -> Result<Vec<u16>, GripperError> {
        let mut guard = self.adapter.lock().await;
        let adapter = guard.as_mut().ok_or(GripperError::NotConnected)?;
        Ok(adapter.read_registers(bank, address, count).await?)
    }

    pub async fn write(&self, address: u16, values: &[u16]) -> Result<(), GripperError> {
        let mut guard = self.adapter.lock().await;
        let adapter = guard.as_mut().ok_or(GripperError::NotConnected)?;
        Ok(adapter.write_registers(address, values).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Call, MockTransport};

    fn adapter(mock: &MockTransport) -> TransportAdapter {
        TransportAdapter::new(Box::new(mock.clone()), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn single_timeout_is_retried() {
        let mock = MockTransport::new();
        mock.set_register(Bank::Holding, 5, 42);
        mock.fail_next(TransportError::Timeout);
        let mut adapter = adapter(&mock);

        assert_eq!(adapter.read_registers(Bank::Holding, 5, 1).await, Ok(vec![42]));
        assert_eq!(adapter.state(), ConnectionState::Connected);
        assert_eq!(mock.calls().len(), 2);
    }

    #[tokio::test]
    async fn second_timeout_faults_the_connection() {
        let mock = MockTransport::new();
        mock.fail_next(TransportError::Timeout);
        mock.fail_next(TransportError::Timeout);
        let mut adapter = adapter(&mock);

        assert_eq!(
            adapter.write_registers(0, &[1]).await,
            Err(TransportError::Timeout)
        );
        assert_eq!(adapter.state(), ConnectionState::Faulted);
    }

    #[tokio::test]
    async fn disconnect_faults_without_retry_and_fails_fast_after() {
        let mock = MockTransport::new();
        mock.fail_next(TransportError::Disconnected("reset".into()));
        let mut adapter = adapter(&mock);

        assert!(adapter.read_registers(Bank::Input, 0, 1).await.is_err());
        assert_eq!(adapter.state(), ConnectionState::Faulted);
        assert_eq!(mock.calls().len(), 1);

        assert!(matches!(
            adapter.read_registers(Bank::Input, 0, 1).await,
            Err(TransportError::Disconnected(_))
        ));
        assert_eq!(mock.calls().len(), 1);
    }

    #[tokio::test]
    async fn short_reads_are_malformed() {
        let mock = MockTransport::new();
        mock.respond_short(Bank::Input, 10);
        let mut adapter = adapter(&mock);

        assert!(matches!(
            adapter.read_registers(Bank::Input, 10, 8).await,
            Err(TransportError::MalformedResponse(_))
        ));
        assert_eq!(adapter.state(), ConnectionState::Faulted);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_call_is_bounded_by_io_timeout() {
        let mock = MockTransport::new();
        mock.stall(true);
        let mut adapter = adapter(&mock);

        let started = tokio::time::Instant::now();
        assert_eq!(
            adapter.read_registers(Bank::Input, 0, 1).await,
            Err(TransportError::Timeout)
        );
        // one retry, two timeouts
        assert_eq!(started.elapsed(), Duration::from_millis(200));
        assert_eq!(adapter.state(), ConnectionState::Faulted);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let mock = MockTransport::new();
        let mut adapter = adapter(&mock);
        adapter.disconnect().await;
        adapter.disconnect().await;
        assert_eq!(adapter.state(), ConnectionState::Disconnected);
        assert_eq!(mock.calls(), vec![Call::Disconnect]);
    }

    #[tokio::test]
    async fn refused_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TransportAdapter::connect_tcp(
            "127.0.0.1",
            port,
            1,
            Duration::from_secs(2),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(ConnectError::Refused(_))));
    }

    #[tokio::test]
    async fn tcp_session_opens_and_closes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut adapter = TransportAdapter::connect_tcp(
            "127.0.0.1",
            port,
            16,
            Duration::from_secs(2),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(adapter.state(), ConnectionState::Connected);

        adapter.disconnect().await;
        assert_eq!(adapter.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let started = tokio::time::Instant::now();
        let result = establish(
            std::future::pending::<std::io::Result<()>>(),
            Duration::from_millis(500),
        )
        .await;
        assert_eq!(result, Err(ConnectError::Timeout));
        assert_eq!(started.elapsed(), Duration::from_millis(500));

        let result = establish(
            async { Err::<(), _>(std::io::Error::from(std::io::ErrorKind::TimedOut)) },
            Duration::from_millis(500),
        )
        .await;
        assert_eq!(result, Err(ConnectError::Timeout));

        let result = establish(
            async { Err::<(), _>(std::io::Error::from(std::io::ErrorKind::ConnectionRefused)) },
            Duration::from_millis(500),
        )
        .await;
        assert!(matches!(result, Err(ConnectError::Refused(_))));
    }

    #[tokio::test]
    async fn invalid_address() {
        let result = TransportAdapter::connect_tcp(
            "",
            502,
            1,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(ConnectError::InvalidAddress(_))));
    }
}
