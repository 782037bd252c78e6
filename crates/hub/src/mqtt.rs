use serde_json::Value;

// ---------------------------------------------------------------------------
// Control messages
// ---------------------------------------------------------------------------

/// What an inbound control payload asks the controller to do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ControlCommand {
    /// Mist for this many seconds out of every minute.
    Start(f64),
    Stop,
    /// Stop, power off and close the bus.  Issued by the process on exit;
    /// never parsed from a payload.
    Shutdown,
}

/// Parse a decimal control payload: `>0` starts a cycle, `<=0` stops it.
///
/// Fractional values are accepted ("12.5").  Anything that is not a finite
/// number is rejected so the caller can log and ignore it.
pub(crate) fn parse_control_payload(payload: &[u8]) -> Result<ControlCommand, String> {
    let s = String::from_utf8_lossy(payload);
    let s = s.trim();
    let seconds: f64 = s
        .parse()
        .map_err(|_| format!("invalid duration value '{s}'"))?;
    if !seconds.is_finite() {
        return Err(format!("invalid duration value '{s}'"));
    }
    if seconds > 0.0 {
        Ok(ControlCommand::Start(seconds))
    } else {
        Ok(ControlCommand::Stop)
    }
}

// ---------------------------------------------------------------------------
// Status replies
// ---------------------------------------------------------------------------

/// Pull `key` out of a JSON object reply and read it as an integer.
///
/// Tasmota reports memory slots as strings (`{"Mem1":"1"}`) while other
/// firmware uses numbers, so integer strings, integers and integral floats
/// are all accepted.  Everything else is an error.
pub(crate) fn parse_status_value(payload: &[u8], key: &str) -> Result<i64, String> {
    let json: Value =
        serde_json::from_slice(payload).map_err(|e| format!("reply is not valid JSON: {e}"))?;
    let obj = json
        .as_object()
        .ok_or_else(|| "reply is not a JSON object".to_string())?;
    let value = obj
        .get(key)
        .ok_or_else(|| format!("reply has no '{key}' field"))?;

    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
                    _ => Err(format!("'{key}' value {n} is not an integer")),
                }
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("'{key}' value '{s}' is not an integer")),
        other => Err(format!("'{key}' value {other} is not numeric")),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
