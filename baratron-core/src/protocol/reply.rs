use super::{FAULT_MARKER, LINE_ENDING, ParseResult, ProtocolError, trim_frame};
use crate::{Field, FieldKind, LedColor, PressureUnit, SystemStatus, Value};

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Decodes the device's reply for `field`.
///
/// The reply must carry `field`'s tag; any other tag means the stream is out
/// of step and yields [`ProtocolError::FieldMismatch`].
pub fn decode(field: Field, raw: &[u8]) -> ParseResult<Value> {
    let malformed = || ProtocolError::MalformedResponse {
        field,
        raw: String::from_utf8_lossy(raw).into(),
    };

    let text = std::str::from_utf8(trim_frame(raw)).map_err(|_| malformed())?;
    let mut tokens = text.split_ascii_whitespace();
    let tag = tokens.next().ok_or_else(malformed)?;
    if tag != field.tag() {
        return Err(ProtocolError::FieldMismatch {
            expected: field,
            actual: tag.into(),
        });
    }

    let rest: Vec<&str> = tokens.collect();
    match rest.as_slice() {
        [marker, code] if *marker == FAULT_MARKER => {
            let code = code.parse::<u16>().map_err(|_| malformed())?;
            Err(ProtocolError::DeviceFault { field, code })
        }
        values => parse_value(field, values).map_err(|_| malformed()),
    }
}

/// Parses the value tokens that follow a tag, in the device's encoding.
pub fn parse_value(field: Field, tokens: &[&str]) -> Result<Value, String> {
    match (field.kind(), tokens) {
        (FieldKind::Pressure, [value]) => Ok(Value::Float(number(value)?)),
        (FieldKind::Pressure, [value, unit]) => {
            let unit: PressureUnit = unit
                .parse()
                .map_err(|_| format!("unknown pressure unit `{unit}`"))?;
            let factor = unit
                .torr_factor()
                .ok_or_else(|| format!("`{unit}` cannot be converted to torr"))?;
            Ok(Value::Float(number(value)? * factor))
        }
        (FieldKind::Float, [value]) => Ok(Value::Float(number(value)?)),
        (FieldKind::Hours, [seconds]) => {
            let seconds = number(seconds)?;
            if seconds < 0.0 {
                return Err(format!("negative duration {seconds}"));
            }
            Ok(Value::Hours(seconds / SECONDS_PER_HOUR))
        }
        (FieldKind::Units, [unit]) => unit
            .parse::<u8>()
            .ok()
            .and_then(PressureUnit::from_index)
            .or_else(|| unit.parse().ok())
            .map(Value::Units)
            .ok_or_else(|| format!("unknown pressure unit `{unit}`")),
        (FieldKind::Led, [color]) => color
            .parse::<LedColor>()
            .map(Value::Led)
            .map_err(|_| format!("unknown led color `{color}`")),
        (FieldKind::Status, [mask]) => mask
            .parse::<u32>()
            .map(|mask| Value::Status(SystemStatus(mask)))
            .map_err(|_| format!("`{mask}` is not a status mask")),
        (_, tokens) => Err(format!("unexpected tokens {tokens:?}")),
    }
}

fn number(s: &str) -> Result<f64, String> {
    s.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("`{s}` is not a number"))
}

// Longest plain decimal written before switching to exponent form.
const MAX_DECIMAL_LEN: usize = 24;

/// Shortest round-tripping text for `v`. Very large or very small values use
/// exponent form so any value fits in a frame.
fn decimal(v: f64) -> String {
    let plain = v.to_string();
    if plain.len() <= MAX_DECIMAL_LEN {
        plain
    } else {
        format!("{v:e}")
    }
}

/// Device-side encoding of a value, shared by commands and replies.
pub(crate) fn wire_value(field: Field, value: &Value) -> String {
    match (field.kind(), value) {
        (FieldKind::Pressure, Value::Float(torr)) => format!("{} torr", decimal(*torr)),
        (_, Value::Float(v)) => decimal(*v),
        (_, Value::Hours(hours)) => ((hours * SECONDS_PER_HOUR).round() as u64).to_string(),
        (_, Value::Units(unit)) => unit.index().to_string(),
        (_, Value::Led(color)) => color.name().to_owned(),
        (_, Value::Status(status)) => status.0.to_string(),
    }
}

/// Builds the reply a device sends for `field` holding `value`.
pub fn encode_reply(field: Field, value: &Value) -> Vec<u8> {
    let mut bytes = format!("{} {}", field.tag(), wire_value(field, value)).into_bytes();
    bytes.extend_from_slice(LINE_ENDING);
    bytes
}

/// Builds the in-band fault reply for `field`.
pub fn encode_fault(field: Field, code: u16) -> Vec<u8> {
    let mut bytes = format!("{} {FAULT_MARKER} {code}", field.tag()).into_bytes();
    bytes.extend_from_slice(LINE_ENDING);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_values() -> Vec<(Field, Value)> {
        vec![
            (Field::Pressure, Value::Float(746.07)),
            (Field::FullScalePressure, Value::Float(1000.0)),
            (Field::PressureUnits, Value::Units(PressureUnit::Torr)),
            (Field::LedColor, Value::Led(LedColor::Green)),
            (Field::RunHours, Value::Hours(29.66)),
            (Field::WaitHours, Value::Hours(0.0)),
            (Field::SystemStatus, Value::Status(SystemStatus(34))),
            (Field::Drift, Value::Float(0.05)),
        ]
    }

    #[test]
    fn replies_decode_to_the_value_they_encode() {
        for (field, value) in sample_values() {
            let reply = encode_reply(field, &value);
            assert_eq!(decode(field, &reply), Ok(value), "{field}");
        }
    }

    #[test]
    fn every_unit_round_trips() {
        for unit in PressureUnit::ALL {
            let reply = encode_reply(Field::PressureUnits, &Value::Units(unit));
            assert_eq!(decode(Field::PressureUnits, &reply), Ok(Value::Units(unit)));
        }
    }

    #[test]
    fn extreme_values_fit_in_a_frame() {
        for v in [f64::MAX, f64::MIN_POSITIVE, 1e250, -1e-250, 123456789.123456789] {
            for field in [Field::Pressure, Field::Drift] {
                let reply = encode_reply(field, &Value::Float(v));
                assert!(reply.len() <= crate::protocol::MAX_FRAME_LEN, "{v} encoded too long");
                assert_eq!(decode(field, &reply), Ok(Value::Float(v)));
            }
        }
        assert_eq!(decimal(1000.0), "1000");
        assert_eq!(decimal(1e250), "1e250");
    }

    #[test]
    fn hours_come_from_seconds() {
        assert_eq!(decode(Field::RunHours, b"EVID_102 36000"), Ok(Value::Hours(10.0)));
        assert_eq!(decode(Field::WaitHours, b"EVID_107 7200"), Ok(Value::Hours(2.0)));
    }

    #[test]
    fn tolerates_trailing_noise() {
        assert_eq!(
            decode(Field::Pressure, b"EVID_100 750.5 \r\n\0\0"),
            Ok(Value::Float(750.5))
        );
        assert_eq!(
            decode(Field::LedColor, b"  EVID_106\tyellow\r"),
            Ok(Value::Led(LedColor::Yellow))
        );
    }

    #[test]
    fn pressure_is_normalized_to_torr() {
        let Ok(Value::Float(torr)) = decode(Field::Pressure, b"EVID_100 1000 mbar\r\n") else {
            panic!("expected a pressure");
        };
        assert!((torr - 750.062).abs() < 1e-9);

        let Ok(Value::Float(torr)) = decode(Field::FullScalePressure, b"EVID_1103 1 kPa") else {
            panic!("expected a pressure");
        };
        assert!((torr - 7.50062).abs() < 1e-9);

        assert_eq!(decode(Field::Pressure, b"EVID_100 12.5 torr"), Ok(Value::Float(12.5)));
    }

    #[test]
    fn ratio_pressure_is_malformed() {
        assert!(matches!(
            decode(Field::Pressure, b"EVID_100 0.75 full-scale ratio"),
            Err(ProtocolError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn fault_code_is_a_device_error() {
        let reply = encode_fault(Field::Drift, 17);
        assert_eq!(
            decode(Field::Drift, &reply),
            Err(ProtocolError::DeviceFault {
                field: Field::Drift,
                code: 17
            })
        );
        assert!(matches!(
            decode(Field::Drift, b"EVID_114 ERR banana"),
            Err(ProtocolError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn wrong_tag_is_a_mismatch() {
        assert_eq!(
            decode(Field::Pressure, b"EVID_1103 1000 torr\r\n"),
            Err(ProtocolError::FieldMismatch {
                expected: Field::Pressure,
                actual: "EVID_1103".into()
            })
        );
    }

    #[test]
    fn bad_grammar_is_malformed() {
        let cases: [(Field, &[u8]); 6] = [
            (Field::Pressure, b""),
            (Field::Pressure, b"EVID_100"),
            (Field::Pressure, b"EVID_100 abc"),
            (Field::LedColor, b"EVID_106 purple"),
            (Field::PressureUnits, b"EVID_105 4"),
            (Field::RunHours, b"EVID_102 -5"),
        ];
        for (field, raw) in cases {
            assert!(
                matches!(decode(field, raw), Err(ProtocolError::MalformedResponse { .. })),
                "{:?} decoded",
                String::from_utf8_lossy(raw)
            );
        }
    }
}
