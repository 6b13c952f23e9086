use std::collections::BTreeMap;

use baratron_core::protocol::Command;
use baratron_core::{BoxStr, Field, LedColor, PressureUnit, Snapshot, SystemStatus, Value};
use tracing::{debug, instrument};

use crate::{ClientConfig, Completion, Connection, Dispatcher, Error};

/// One capacitance manometer.
///
/// The connection opens lazily on the first request and reopens on the next
/// request after any failure.
pub struct DeviceClient {
    host: BoxStr,
    dispatcher: Dispatcher,
}

impl DeviceClient {
    /// Client on the default port with default timeouts. Must be called from
    /// within a Tokio runtime.
    pub fn new(host: &str) -> Self {
        Self::with_config(host, ClientConfig::default())
    }

    pub fn with_config(host: &str, config: ClientConfig) -> Self {
        let connection = Connection::new(host, config.port, config.connect_timeout());
        Self {
            host: host.into(),
            dispatcher: Dispatcher::new(connection, &config),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_connected(&self) -> bool {
        self.dispatcher.is_connected()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn get(&self, field: Field) -> Result<Value, Error> {
        self.dispatcher.submit(Command::get(field))?.await
    }

    /// Writes `value` and returns the value the device acknowledged.
    pub async fn set(&self, field: Field, value: Value) -> Result<Value, Error> {
        self.dispatcher.submit(Command::set(field, value))?.await
    }

    /// Like [`DeviceClient::get`], with the field given by name or tag.
    pub async fn get_named(&self, name: &str) -> Result<Value, Error> {
        let field: Field = name.parse()?;
        self.get(field).await
    }

    /// Like [`DeviceClient::set`], with field and value given as text.
    pub async fn set_named(&self, name: &str, value: &str) -> Result<Value, Error> {
        let field: Field = name.parse()?;
        let value = Value::parse(field, value)?;
        self.set(field, value).await
    }

    pub async fn pressure(&self) -> Result<f64, Error> {
        self.get_float(Field::Pressure).await
    }

    pub async fn full_scale(&self) -> Result<f64, Error> {
        self.get_float(Field::FullScalePressure).await
    }

    pub async fn drift(&self) -> Result<f64, Error> {
        self.get_float(Field::Drift).await
    }

    pub async fn run_hours(&self) -> Result<f64, Error> {
        self.get_float(Field::RunHours).await
    }

    pub async fn wait_hours(&self) -> Result<f64, Error> {
        self.get_float(Field::WaitHours).await
    }

    pub async fn pressure_units(&self) -> Result<PressureUnit, Error> {
        match self.get(Field::PressureUnits).await? {
            Value::Units(unit) => Ok(unit),
            other => Err(unexpected(Field::PressureUnits, other)),
        }
    }

    pub async fn led_color(&self) -> Result<LedColor, Error> {
        match self.get(Field::LedColor).await? {
            Value::Led(color) => Ok(color),
            other => Err(unexpected(Field::LedColor, other)),
        }
    }

    pub async fn system_status(&self) -> Result<SystemStatus, Error> {
        match self.get(Field::SystemStatus).await? {
            Value::Status(status) => Ok(status),
            other => Err(unexpected(Field::SystemStatus, other)),
        }
    }

    /// Sets the full-scale pressure, in torr.
    pub async fn set_full_scale(&self, torr: f64) -> Result<f64, Error> {
        match self.set(Field::FullScalePressure, Value::Float(torr)).await? {
            Value::Float(v) => Ok(v),
            other => Err(unexpected(Field::FullScalePressure, other)),
        }
    }

    pub async fn set_pressure_units(&self, unit: PressureUnit) -> Result<PressureUnit, Error> {
        match self.set(Field::PressureUnits, Value::Units(unit)).await? {
            Value::Units(unit) => Ok(unit),
            other => Err(unexpected(Field::PressureUnits, other)),
        }
    }

    /// Reads every snapshot field.
    ///
    /// All reads are queued at once and go out back to back on the one
    /// connection. If the device cannot be reached the snapshot says
    /// `connected: false` instead of failing; any other error is returned.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn get_state(&self) -> Result<Snapshot, Error> {
        let pending = Field::SNAPSHOT
            .into_iter()
            .map(|field| self.dispatcher.submit(Command::get(field)))
            .collect::<Result<Vec<Completion>, Error>>()?;

        let mut fields = BTreeMap::new();
        for completion in pending {
            let field = completion.field();
            match completion.await {
                Ok(value) => {
                    fields.insert(field, value);
                }
                Err(Error::Connection(e)) => {
                    debug!(error = %e, "device unreachable");
                    return Ok(Snapshot::disconnected(self.host.clone()));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Snapshot::connected(self.host.clone(), fields))
    }

    /// Closes the connection and stops the dispatcher.
    pub fn close(&self) {
        self.dispatcher.shutdown();
    }

    async fn get_float(&self, field: Field) -> Result<f64, Error> {
        let value = self.get(field).await?;
        value.as_f64().ok_or_else(|| unexpected(field, value))
    }
}

fn unexpected(field: Field, value: Value) -> Error {
    Error::MalformedResponse {
        field,
        raw: value.to_string().into(),
    }
}
