use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use baratron_core::protocol::{self, Operation};
use baratron_core::{Field, LedColor, PressureUnit, SystemStatus, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Misbehaviour applied to the next request the device receives. Queued
/// faults are consumed one per request.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Reply after a pause.
    Delay(Duration),
    /// Write the reply in two halves with a pause between them.
    Split(Duration),
    /// Reply with another field's tag and value.
    WrongTag(Field),
    /// Reply with an in-band fault code.
    Code(u16),
    /// Never reply.
    Silence,
    /// Reply with a line that is not a valid reply.
    Garbage,
    /// Close the connection instead of replying.
    HangUp,
    /// Stay silent for a while, then close the connection.
    HangUpAfter(Duration),
}

/// Values the simulator starts with: a healthy 1000 torr head at ambient
/// pressure.
pub fn default_values() -> BTreeMap<Field, Value> {
    BTreeMap::from([
        (Field::Pressure, Value::Float(746.07)),
        (Field::FullScalePressure, Value::Float(1000.0)),
        (Field::PressureUnits, Value::Units(PressureUnit::Torr)),
        (Field::LedColor, Value::Led(LedColor::Green)),
        (Field::RunHours, Value::Hours(29.66)),
        (Field::WaitHours, Value::Hours(0.0)),
        (Field::SystemStatus, Value::Status(SystemStatus::OK)),
        (Field::Drift, Value::Float(0.0)),
    ])
}

/// Shared view of a running simulator, for inspecting and steering it.
#[derive(Clone, Default)]
pub struct DeviceHandle {
    values: Arc<Mutex<BTreeMap<Field, Value>>>,
    faults: Arc<Mutex<VecDeque<Fault>>>,
    connections: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
}

impl DeviceHandle {
    pub async fn set(&self, field: Field, value: Value) {
        self.values.lock().await.insert(field, value);
    }

    pub async fn value(&self, field: Field) -> Option<Value> {
        self.values.lock().await.get(&field).copied()
    }

    /// Queues `fault` behind any faults already queued.
    pub async fn inject(&self, fault: Fault) {
        self.faults.lock().await.push_back(fault);
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Command lines received so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

pub struct SimulatedDevice {
    listener: TcpListener,
    handle: DeviceHandle,
}

impl SimulatedDevice {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let handle = DeviceHandle {
            values: Arc::new(Mutex::new(default_values())),
            ..Default::default()
        };
        Ok(Self { listener, handle })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle.clone()
    }

    /// Accepts connections until `cancel` fires.
    pub async fn serve(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("simulated device stopping");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.handle.connections.fetch_add(1, Ordering::SeqCst);
                        debug!(%peer, "client connected");
                        let handle = self.handle.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, handle, cancel).await {
                                debug!(%peer, error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        break;
                    }
                },
            }
        }
    }

    /// Binds on `addr` and serves in a background task. Returns the bound
    /// address and a handle; cancel the token to stop.
    pub async fn spawn(addr: &str, cancel: CancellationToken) -> io::Result<(SocketAddr, DeviceHandle)> {
        let device = Self::bind(addr).await?;
        let local = device.local_addr()?;
        let handle = device.handle();
        tokio::spawn(device.serve(cancel));
        info!(addr = %local, "simulated device listening");
        Ok((local, handle))
    }
}

async fn handle_connection(
    stream: TcpStream,
    handle: DeviceHandle,
    cancel: CancellationToken,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => return Ok(()),
            },
        };
        handle.requests.fetch_add(1, Ordering::SeqCst);

        let command = match protocol::parse_command(line.as_bytes()) {
            Ok(command) => command,
            Err(e) => {
                warn!(%line, error = %e, "rejecting command");
                writer.write_all(b"ERR\r\n").await?;
                continue;
            }
        };

        let field = command.field;
        let reply = {
            let mut values = handle.values.lock().await;
            if let Operation::Set(value) = command.operation {
                values.insert(field, value);
            }
            match values.get(&field) {
                Some(value) => protocol::encode_reply(field, value),
                None => protocol::encode_fault(field, 2),
            }
        };

        let fault = handle.faults.lock().await.pop_front();
        match fault {
            None => writer.write_all(&reply).await?,
            Some(Fault::Delay(pause)) => {
                sleep(pause).await;
                writer.write_all(&reply).await?;
            }
            Some(Fault::Split(pause)) => write_split(&mut writer, &reply, pause).await?,
            Some(Fault::WrongTag(other)) => {
                let value = handle.values.lock().await.get(&other).copied();
                let reply = match value {
                    Some(value) => protocol::encode_reply(other, &value),
                    None => protocol::encode_fault(other, 2),
                };
                writer.write_all(&reply).await?;
            }
            Some(Fault::Code(code)) => writer.write_all(&protocol::encode_fault(field, code)).await?,
            Some(Fault::Silence) => {}
            Some(Fault::Garbage) => {
                let mut reply = format!("{} ~~~", field.tag()).into_bytes();
                reply.extend_from_slice(protocol::LINE_ENDING);
                writer.write_all(&reply).await?;
            }
            Some(Fault::HangUp) => return Ok(()),
            Some(Fault::HangUpAfter(pause)) => {
                sleep(pause).await;
                return Ok(());
            }
        }
    }
}

async fn write_split(writer: &mut OwnedWriteHalf, reply: &[u8], pause: Duration) -> io::Result<()> {
    let (head, tail) = reply.split_at(reply.len() / 2);
    writer.write_all(head).await?;
    writer.flush().await?;
    sleep(pause).await;
    writer.write_all(tail).await
}
