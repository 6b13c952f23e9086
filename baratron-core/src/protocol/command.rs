use super::{LINE_ENDING, ParseResult, ProtocolError, reply, trim_frame};
use crate::{Field, FieldKind, Value};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operation {
    Get,
    Set(Value),
}

/// A logical request for one field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command {
    pub field: Field,
    pub operation: Operation,
}

impl Command {
    pub fn get(field: Field) -> Self {
        Self {
            field,
            operation: Operation::Get,
        }
    }

    pub fn set(field: Field, value: Value) -> Self {
        Self {
            field,
            operation: Operation::Set(value),
        }
    }

    pub fn is_set(&self) -> bool {
        matches!(self.operation, Operation::Set(_))
    }
}

/// Encodes `command` into the line the device expects.
///
/// Sets are validated first; nothing is produced for a value the device
/// would have to reject.
pub fn encode(command: &Command) -> ParseResult<Vec<u8>> {
    let field = command.field;
    let line = match command.operation {
        Operation::Get => format!("GET {}", field.tag()),
        Operation::Set(value) => {
            validate_set(field, &value)?;
            format!("SET {} {}", field.tag(), reply::wire_value(field, &value))
        }
    };

    let mut bytes = line.into_bytes();
    bytes.extend_from_slice(LINE_ENDING);
    Ok(bytes)
}

fn validate_set(field: Field, value: &Value) -> ParseResult<()> {
    if !field.is_writable() {
        return Err(ProtocolError::ReadOnlyField(field));
    }

    if !value.fits(field.kind()) {
        return Err(ProtocolError::InvalidValue {
            field,
            reason: format!("`{value}` has the wrong type").into(),
        });
    }

    if let (FieldKind::Pressure, Value::Float(torr)) = (field.kind(), value) {
        if !torr.is_finite() || *torr <= 0.0 {
            return Err(ProtocolError::InvalidValue {
                field,
                reason: format!("pressure must be positive and finite, got {torr}").into(),
            });
        }
    }

    Ok(())
}

/// Parses a command line as the device sees it.
pub fn parse_command(raw: &[u8]) -> ParseResult<Command> {
    let malformed = || ProtocolError::MalformedCommand(String::from_utf8_lossy(raw).into());

    let text = std::str::from_utf8(trim_frame(raw)).map_err(|_| malformed())?;
    let mut tokens = text.split_ascii_whitespace();
    let verb = tokens.next().ok_or_else(malformed)?;
    let tag = tokens.next().ok_or_else(malformed)?;
    let field = Field::from_tag(tag).ok_or_else(|| ProtocolError::UnsupportedField(tag.into()))?;
    let rest: Vec<&str> = tokens.collect();

    match (verb, rest.as_slice()) {
        ("GET", []) => Ok(Command::get(field)),
        ("SET", values) if !values.is_empty() => {
            let value = reply::parse_value(field, values).map_err(|reason| {
                ProtocolError::InvalidValue {
                    field,
                    reason: reason.into(),
                }
            })?;
            Ok(Command::set(field, value))
        }
        _ => Err(malformed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_FRAME_LEN;
    use crate::{LedColor, PressureUnit};

    #[test]
    fn encodes_get() {
        let bytes = encode(&Command::get(Field::Pressure)).unwrap();
        assert_eq!(bytes, b"GET EVID_100\r\n");
    }

    #[test]
    fn encodes_set_with_unit() {
        let bytes = encode(&Command::set(Field::FullScalePressure, Value::Float(1000.0))).unwrap();
        assert_eq!(bytes, b"SET EVID_1103 1000 torr\r\n");

        let bytes = encode(&Command::set(
            Field::PressureUnits,
            Value::Units(PressureUnit::Millibar),
        ))
        .unwrap();
        assert_eq!(bytes, b"SET EVID_105 8\r\n");
    }

    #[test]
    fn rejects_out_of_range_pressure() {
        for bad in [-1.0, 0.0, f64::NAN, f64::INFINITY] {
            let err = encode(&Command::set(Field::FullScalePressure, Value::Float(bad)));
            assert!(
                matches!(err, Err(ProtocolError::InvalidValue { field: Field::FullScalePressure, .. })),
                "{bad} accepted"
            );
        }

        for extreme in [f64::MAX, f64::MIN_POSITIVE] {
            let command = Command::set(Field::FullScalePressure, Value::Float(extreme));
            let bytes = encode(&command).unwrap();
            assert!(bytes.len() <= MAX_FRAME_LEN, "{extreme} encoded too long");
            assert_eq!(parse_command(&bytes), Ok(command));
        }
    }

    #[test]
    fn rejects_wrong_type_and_read_only() {
        let err = encode(&Command::set(
            Field::FullScalePressure,
            Value::Led(LedColor::Green),
        ));
        assert!(matches!(err, Err(ProtocolError::InvalidValue { .. })));

        let err = encode(&Command::set(Field::Pressure, Value::Float(10.0)));
        assert_eq!(err, Err(ProtocolError::ReadOnlyField(Field::Pressure)));
    }

    #[test]
    fn device_parses_what_client_encodes() {
        let commands = [
            Command::get(Field::SystemStatus),
            Command::set(Field::FullScalePressure, Value::Float(10.0)),
            Command::set(Field::PressureUnits, Value::Units(PressureUnit::Kilopascal)),
        ];
        for command in commands {
            let bytes = encode(&command).unwrap();
            assert_eq!(parse_command(&bytes), Ok(command));
        }
    }

    #[test]
    fn device_rejects_garbage() {
        assert!(matches!(
            parse_command(b"HELLO\r\n"),
            Err(ProtocolError::MalformedCommand(_))
        ));
        assert!(matches!(
            parse_command(b"GET EVID_999\r\n"),
            Err(ProtocolError::UnsupportedField(_))
        ));
        assert!(matches!(
            parse_command(b"GET EVID_100 extra\r\n"),
            Err(ProtocolError::MalformedCommand(_))
        ));
    }
}
