use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

pub mod protocol;

use protocol::ProtocolError;

// Snapshots and errors hold text that never grows after construction.
pub type BoxStr = Box<str>;

/// A readable (and sometimes writable) attribute of the manometer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Field {
    /// Current pressure, normalized to torr.
    #[serde(rename = "pressure")]
    Pressure,
    /// Full-scale pressure of the sensor head, normalized to torr.
    #[serde(rename = "full-scale pressure")]
    FullScalePressure,
    /// Native units the device reports pressure in.
    #[serde(rename = "pressure units")]
    PressureUnits,
    /// Front panel LED state.
    #[serde(rename = "led color")]
    LedColor,
    /// Hours the sensor has been running.
    #[serde(rename = "run hours")]
    RunHours,
    /// Hours left in the warm-up wait.
    #[serde(rename = "wait hours")]
    WaitHours,
    /// Fault bit mask, rendered as `ok` or a list of faults.
    #[serde(rename = "system status")]
    SystemStatus,
    /// Zero drift since the last adjustment.
    #[serde(rename = "drift")]
    Drift,
}

/// How a field's value is carried on the wire and typed once decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Decimal with an optional unit token, converted to torr.
    Pressure,
    /// Plain decimal.
    Float,
    /// Integer seconds on the wire, hours once decoded.
    Hours,
    /// Unit index or unit name.
    Units,
    /// LED color word.
    Led,
    /// Integer fault bit mask.
    Status,
}

impl Field {
    pub const ALL: [Field; 8] = [
        Field::Pressure,
        Field::FullScalePressure,
        Field::PressureUnits,
        Field::LedColor,
        Field::RunHours,
        Field::WaitHours,
        Field::SystemStatus,
        Field::Drift,
    ];

    /// Fields collected into a [`Snapshot`].
    pub const SNAPSHOT: [Field; 7] = [
        Field::Pressure,
        Field::FullScalePressure,
        Field::PressureUnits,
        Field::LedColor,
        Field::RunHours,
        Field::WaitHours,
        Field::SystemStatus,
    ];

    /// Human readable name, also used as the snapshot key.
    pub const fn name(self) -> &'static str {
        match self {
            Field::Pressure => "pressure",
            Field::FullScalePressure => "full-scale pressure",
            Field::PressureUnits => "pressure units",
            Field::LedColor => "led color",
            Field::RunHours => "run hours",
            Field::WaitHours => "wait hours",
            Field::SystemStatus => "system status",
            Field::Drift => "drift",
        }
    }

    /// Device variable id used on the wire.
    pub const fn tag(self) -> &'static str {
        match self {
            Field::Pressure => "EVID_100",
            Field::RunHours => "EVID_102",
            Field::PressureUnits => "EVID_105",
            Field::LedColor => "EVID_106",
            Field::WaitHours => "EVID_107",
            Field::Drift => "EVID_114",
            Field::SystemStatus => "EVID_208",
            Field::FullScalePressure => "EVID_1103",
        }
    }

    pub const fn kind(self) -> FieldKind {
        match self {
            Field::Pressure | Field::FullScalePressure => FieldKind::Pressure,
            Field::Drift => FieldKind::Float,
            Field::RunHours | Field::WaitHours => FieldKind::Hours,
            Field::PressureUnits => FieldKind::Units,
            Field::LedColor => FieldKind::Led,
            Field::SystemStatus => FieldKind::Status,
        }
    }

    pub const fn is_writable(self) -> bool {
        matches!(self, Field::FullScalePressure | Field::PressureUnits)
    }

    pub fn from_tag(tag: &str) -> Option<Field> {
        Field::ALL.into_iter().find(|f| f.tag() == tag)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Field {
    type Err = ProtocolError;

    /// Accepts the display name, the wire tag, or the name with `-`/`_`
    /// standing in for spaces (`full-scale-pressure`, `run_hours`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalize_name(s);
        Field::ALL
            .into_iter()
            .find(|f| f.tag().eq_ignore_ascii_case(s) || normalize_name(f.name()) == wanted)
            .ok_or_else(|| ProtocolError::UnsupportedField(s.into()))
    }
}

fn normalize_name(s: &str) -> String {
    s.trim()
        .chars()
        .map(|c| match c {
            '-' | '_' => ' ',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Pressure units the device can be configured to report in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PressureUnit {
    #[serde(rename = "full-scale ratio")]
    FullScaleRatio,
    #[serde(rename = "psi")]
    Psi,
    #[serde(rename = "torr")]
    Torr,
    #[serde(rename = "mtorr")]
    Millitorr,
    #[serde(rename = "inHg")]
    InHg,
    #[serde(rename = "mbar")]
    Millibar,
    #[serde(rename = "kPa")]
    Kilopascal,
}

impl PressureUnit {
    pub const ALL: [PressureUnit; 7] = [
        PressureUnit::FullScaleRatio,
        PressureUnit::Psi,
        PressureUnit::Torr,
        PressureUnit::Millitorr,
        PressureUnit::InHg,
        PressureUnit::Millibar,
        PressureUnit::Kilopascal,
    ];

    /// Index the device uses for this unit.
    pub const fn index(self) -> u8 {
        match self {
            PressureUnit::FullScaleRatio => 0,
            PressureUnit::Psi => 1,
            PressureUnit::Torr => 2,
            PressureUnit::Millitorr => 3,
            PressureUnit::InHg => 5,
            PressureUnit::Millibar => 8,
            PressureUnit::Kilopascal => 10,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        PressureUnit::ALL.into_iter().find(|u| u.index() == index)
    }

    pub const fn name(self) -> &'static str {
        match self {
            PressureUnit::FullScaleRatio => "full-scale ratio",
            PressureUnit::Psi => "psi",
            PressureUnit::Torr => "torr",
            PressureUnit::Millitorr => "mtorr",
            PressureUnit::InHg => "inHg",
            PressureUnit::Millibar => "mbar",
            PressureUnit::Kilopascal => "kPa",
        }
    }

    /// Multiplier converting a reading in this unit to torr.
    ///
    /// A full-scale ratio has no absolute meaning without the head's range,
    /// so it has no factor.
    pub const fn torr_factor(self) -> Option<f64> {
        match self {
            PressureUnit::FullScaleRatio => None,
            PressureUnit::Psi => Some(51.71493),
            PressureUnit::Torr => Some(1.0),
            PressureUnit::Millitorr => Some(0.001),
            PressureUnit::InHg => Some(25.4),
            PressureUnit::Millibar => Some(0.750062),
            PressureUnit::Kilopascal => Some(7.50062),
        }
    }
}

impl fmt::Display for PressureUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PressureUnit {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PressureUnit::ALL
            .into_iter()
            .find(|u| u.name().eq_ignore_ascii_case(s))
            .ok_or(())
    }
}

/// Front panel LED state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedColor {
    Red,
    Green,
    Yellow,
    Blinking,
}

impl LedColor {
    pub const ALL: [LedColor; 4] = [
        LedColor::Red,
        LedColor::Green,
        LedColor::Yellow,
        LedColor::Blinking,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            LedColor::Red => "red",
            LedColor::Green => "green",
            LedColor::Yellow => "yellow",
            LedColor::Blinking => "blinking",
        }
    }
}

impl fmt::Display for LedColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LedColor {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LedColor::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or(())
    }
}

/// Fault bit mask reported by the device. Zero means healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SystemStatus(pub u32);

const STATUS_BITS: [(u32, &str); 3] = [
    (1, "Signal Error (ADC1)"),
    (5, "Zero Adjusted"),
    (11, "Diaphragm Shorted"),
];

impl SystemStatus {
    pub const OK: SystemStatus = SystemStatus(0);

    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Names of every set bit, lowest bit first.
    pub fn faults(self) -> Vec<String> {
        (0..u32::BITS)
            .filter(|bit| self.0 & (1 << bit) != 0)
            .map(|bit| match STATUS_BITS.iter().find(|(b, _)| *b == bit) {
                Some((_, name)) => (*name).to_owned(),
                None => format!("Fault (bit {bit})"),
            })
            .collect()
    }
}

impl fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            f.write_str("ok")
        } else {
            f.write_str(&self.faults().join(", "))
        }
    }
}

impl Serialize for SystemStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A decoded field value. Pressures are always in torr.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Float(f64),
    Hours(f64),
    Units(PressureUnit),
    Led(LedColor),
    Status(SystemStatus),
}

impl Value {
    /// Parses user supplied text for `field`.
    ///
    /// Pressures accept an optional unit (`760`, `1 kPa`), units accept a name
    /// or device index, hours are taken as hours.
    pub fn parse(field: Field, text: &str) -> Result<Value, ProtocolError> {
        let invalid = |reason: String| ProtocolError::InvalidValue {
            field,
            reason: reason.into(),
        };
        match field.kind() {
            FieldKind::Hours => text
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|h| h.is_finite() && *h >= 0.0)
                .map(Value::Hours)
                .ok_or_else(|| invalid(format!("`{text}` is not a number of hours"))),
            _ => {
                let tokens: Vec<&str> = text.split_ascii_whitespace().collect();
                protocol::parse_value(field, &tokens).map_err(invalid)
            }
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) | Value::Hours(v) => Some(*v),
            _ => None,
        }
    }

    pub fn fits(&self, kind: FieldKind) -> bool {
        matches!(
            (kind, self),
            (FieldKind::Pressure | FieldKind::Float, Value::Float(_))
                | (FieldKind::Hours, Value::Hours(_))
                | (FieldKind::Units, Value::Units(_))
                | (FieldKind::Led, Value::Led(_))
                | (FieldKind::Status, Value::Status(_))
        )
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Float(v) | Value::Hours(v) => write!(f, "{v}"),
            Value::Units(u) => fmt::Display::fmt(u, f),
            Value::Led(c) => fmt::Display::fmt(c, f),
            Value::Status(s) => fmt::Display::fmt(s, f),
        }
    }
}

/// One complete read of a device.
///
/// Snapshots are values: each `get_state` call builds a fresh one and nothing
/// mutates it afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    ip: BoxStr,
    connected: bool,
    fields: BTreeMap<Field, Value>,
}

impl Snapshot {
    pub fn connected(ip: impl Into<BoxStr>, fields: BTreeMap<Field, Value>) -> Self {
        Self {
            ip: ip.into(),
            connected: true,
            fields,
        }
    }

    /// Snapshot of a device that could not be reached. Carries no fields.
    pub fn disconnected(ip: impl Into<BoxStr>) -> Self {
        Self {
            ip: ip.into(),
            connected: false,
            fields: BTreeMap::new(),
        }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn get(&self, field: Field) -> Option<&Value> {
        self.fields.get(&field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (Field, &Value)> {
        self.fields.iter().map(|(f, v)| (*f, v))
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum Entry<'a> {
    Flag(bool),
    Text(&'a str),
    Value(&'a Value),
}

impl Serialize for Snapshot {
    /// Flat object keyed by field name, plus `connected` and `ip`, in
    /// lexicographic key order.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map: BTreeMap<&str, Entry<'_>> = self
            .fields
            .iter()
            .map(|(field, value)| (field.name(), Entry::Value(value)))
            .collect();
        map.insert("connected", Entry::Flag(self.connected));
        map.insert("ip", Entry::Text(&self.ip));
        map.serialize(serializer)
    }
}
