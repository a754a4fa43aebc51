use std::cmp::min;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::lookup_host;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_modbus::client::tcp;
use tokio_modbus::client::{Context, Reader};
use tokio_modbus::prelude::{Slave, SlaveContext};
use tracing::{debug, info, warn};

use types::RegisterKind;

/// Modbus exception 0x0A: gateway path unavailable.
pub const EXCEPTION_GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;
/// Modbus exception 0x0B: gateway target device failed to respond.
pub const EXCEPTION_GATEWAY_TARGET_FAILED: u8 = 0x0B;

/// Configuration options for connecting and polling a Modbus TCP device.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Maximum number of registers to read in a single request; devices with quirks may require lower batch sizes.
    pub max_batch_size: Option<u16>,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Number of retries per request after the initial attempt.
    pub retry_count: usize,
    /// Base delay between retries in milliseconds (exponential backoff).
    pub retry_backoff_ms: u64,
    /// Upper bound for retry backoff delay in milliseconds.
    pub retry_max_backoff_ms: u64,
    /// Optional delay between split reads to placate slower devices.
    pub inter_read_delay_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 502,
            max_batch_size: None,
            connect_timeout_ms: 5_000,
            timeout_ms: 1_000,
            retry_count: 2,
            retry_backoff_ms: 100,
            retry_max_backoff_ms: 2_000,
            inter_read_delay_ms: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid socket address {0}:{1}")]
    InvalidAddress(String, u16),
    #[error("modbus transport error: {0}")]
    Transport(#[from] tokio_modbus::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unit {unit_id} answered register {start} with exception 0x{code:02X}")]
    Exception { unit_id: u8, start: u16, code: u8 },
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("register address overflow")]
    AddressOverflow,
}

impl ClientError {
    pub fn exception_code(&self) -> Option<u8> {
        match self {
            ClientError::Exception { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The gateway was reachable but could not reach the addressed unit.
    pub fn is_gateway_failure(&self) -> bool {
        matches!(
            self.exception_code(),
            Some(EXCEPTION_GATEWAY_PATH_UNAVAILABLE | EXCEPTION_GATEWAY_TARGET_FAILED)
        )
    }

    /// The TCP link itself is suspect and a reconnect may help.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_) | ClientError::Io(_) | ClientError::Timeout { .. }
        )
    }
}

/// Anything registers can be read from. Implemented by [`ModbusClient`] and by
/// in-memory fakes in tests.
pub trait RegisterSource {
    fn read_registers(
        &self,
        unit_id: u8,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, ClientError>> + Send;

    fn reconnect(&self) -> impl Future<Output = Result<(), ClientError>> + Send;
}

impl<T> RegisterSource for Arc<T>
where
    T: RegisterSource + Send + Sync,
{
    fn read_registers(
        &self,
        unit_id: u8,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, ClientError>> + Send {
        (**self).read_registers(unit_id, kind, start, count)
    }

    fn reconnect(&self) -> impl Future<Output = Result<(), ClientError>> + Send {
        (**self).reconnect()
    }
}

#[derive(Debug)]
pub struct ModbusClient {
    config: ClientConfig,
    addr: SocketAddr,
    context: Mutex<Context>,
}

impl ModbusClient {
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let addr = resolve(&config.host, config.port).await?;
        let context = open(addr, config.connect_timeout_ms).await?;
        info!(%addr, "modbus connected");
        Ok(Self {
            config,
            addr,
            context: Mutex::new(context),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Replaces the TCP context with a freshly connected one.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        let mut ctx = self.context.lock().await;
        let fresh = open(self.addr, self.config.connect_timeout_ms).await?;
        *ctx = fresh;
        info!(addr = %self.addr, "modbus reconnected");
        Ok(())
    }

    pub async fn read_range(
        &self,
        unit_id: u8,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ClientError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut ctx = self.context.lock().await;
        let batch_size = self
            .config
            .max_batch_size
            .unwrap_or(count)
            .max(1u16);
        let mut remaining = count;
        let mut offset = 0u16;
        let mut out = Vec::with_capacity(count as usize);

        while remaining > 0 {
            let chunk = min(remaining, batch_size);
            let chunk_start = u16::try_from(u32::from(start) + u32::from(offset))
                .map_err(|_| ClientError::AddressOverflow)?;
            let values = self
                .read_chunk(&mut ctx, unit_id, kind, chunk_start, chunk)
                .await?;
            out.extend(values);
            remaining -= chunk;
            offset += chunk;

            if remaining > 0 {
                if let Some(delay_ms) = self.config.inter_read_delay_ms {
                    sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }

        Ok(out)
    }

    async fn read_chunk(
        &self,
        ctx: &mut Context,
        unit_id: u8,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ClientError> {
        if u32::from(start) + u32::from(count) > u32::from(u16::MAX) + 1 {
            return Err(ClientError::AddressOverflow);
        }
        let mut attempts = 0usize;

        loop {
            ctx.set_slave(Slave(unit_id));
            let deadline = Duration::from_millis(self.config.timeout_ms);
            let result = match kind {
                RegisterKind::Input => timeout(deadline, ctx.read_input_registers(start, count)).await,
                RegisterKind::Holding => {
                    timeout(deadline, ctx.read_holding_registers(start, count)).await
                }
            };
            let last_error = match result {
                Ok(Ok(Ok(values))) => {
                    debug!(unit_id, %kind, start, count, "modbus read ok");
                    return Ok(values);
                }
                Ok(Ok(Err(exception))) => {
                    // The device answered; asking again yields the same exception.
                    let code = u8::from(exception);
                    debug!(unit_id, %kind, start, count, code, "modbus exception response");
                    return Err(ClientError::Exception {
                        unit_id,
                        start,
                        code,
                    });
                }
                Ok(Err(err)) => {
                    warn!(unit_id, %kind, start, count, error = %err, "modbus read error");
                    ClientError::Transport(err)
                }
                Err(_) => {
                    warn!(unit_id, %kind, start, count, "modbus read timeout");
                    ClientError::Timeout {
                        timeout_ms: self.config.timeout_ms,
                    }
                }
            };

            // The abandoned request may still be answered; that reply would
            // be taken as the answer to the next request on this link.
            match open(self.addr, self.config.connect_timeout_ms).await {
                Ok(fresh) => {
                    *ctx = fresh;
                    debug!(addr = %self.addr, "modbus context replaced after failed read");
                }
                Err(err) => {
                    warn!(addr = %self.addr, error = %err, "modbus reopen after failed read failed");
                    return Err(err);
                }
            }

            if attempts >= self.config.retry_count {
                return Err(last_error);
            }

            let delay_ms = retry_delay_ms(&self.config, attempts);
            attempts += 1;
            sleep(Duration::from_millis(delay_ms)).await;
        }
    }
}

impl RegisterSource for ModbusClient {
    async fn read_registers(
        &self,
        unit_id: u8,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ClientError> {
        self.read_range(unit_id, kind, start, count).await
    }

    async fn reconnect(&self) -> Result<(), ClientError> {
        ModbusClient::reconnect(self).await
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ClientError> {
    if let Ok(addr) = format!("{host}:{port}").parse::<SocketAddr>() {
        return Ok(addr);
    }
    lookup_host((host, port))
        .await
        .map_err(|_| ClientError::InvalidAddress(host.to_string(), port))?
        .next()
        .ok_or_else(|| ClientError::InvalidAddress(host.to_string(), port))
}

async fn open(addr: SocketAddr, connect_timeout_ms: u64) -> Result<Context, ClientError> {
    match timeout(Duration::from_millis(connect_timeout_ms), tcp::connect(addr)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ClientError::Timeout {
            timeout_ms: connect_timeout_ms,
        }),
    }
}

fn retry_delay_ms(config: &ClientConfig, attempt: usize) -> u64 {
    let base = config.retry_backoff_ms.max(1);
    let shift = u32::try_from(attempt).unwrap_or(u32::MAX);
    let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
    let delay = base.saturating_mul(factor);
    let max = config.retry_max_backoff_ms.max(base);
    min(delay, max)
}
