//! Telemetry datagrams coming from the robot and the link abstraction the tuner talks through.

use crate::gains::GainVector;
use std::net::SocketAddr;
use std::time::Duration;

/// One angle-error observation in degrees.
pub type Reading = f64;

/// A decoded telemetry frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryFrame {
    pub angle: f64,
    /// Motor output (PWM), only sent by firmware that reports it
    pub motor: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Datagram {
    /// Firmware acknowledged a gain update ("KACK...")
    Ack(String),
    Frame(TelemetryFrame),
}

/// Decode one inbound datagram.
///
/// Accepted payloads: `angle`, `angle,motor`, or the legacy `x,y,z` triple where
/// `z` is the balance angle. Returns `None` for anything else.
pub fn parse_datagram(payload: &str) -> Option<Datagram> {
    let text = payload.trim();
    if text.starts_with("KACK") {
        return Some(Datagram::Ack(text.to_string()));
    }

    let values: Vec<f64> = text
        .split(',')
        .map(|s| s.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .ok()?;
    if values.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let frame = match values.as_slice() {
        [angle] => TelemetryFrame { angle: *angle, motor: None },
        [angle, motor] => TelemetryFrame { angle: *angle, motor: Some(*motor) },
        [_, _, z] => TelemetryFrame { angle: *z, motor: None },
        _ => return None,
    };
    Some(Datagram::Frame(frame))
}

/// Best-effort datagram channel to the robot.
///
/// Sends are fire-and-forget. Readings are handed over through a bounded queue owned by
/// the link; the trial sampler is the only consumer that drains it.
pub trait TelemetryLink: Send + Sync {
    /// Push a gain update to the device. No-op (with a warning) while the device is unknown.
    fn send_gains(&self, gains: &GainVector);

    /// Next queued reading, waiting at most `timeout`.
    fn receive_latest(&self, timeout: Duration) -> Option<Reading>;

    /// Drop every buffered reading, returning how many were discarded.
    fn discard_pending(&self) -> usize;

    /// Address gain updates go to, once known.
    fn device(&self) -> Option<SocketAddr>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_angle() {
        assert_eq!(
            parse_datagram("3.25\n"),
            Some(Datagram::Frame(TelemetryFrame { angle: 3.25, motor: None }))
        );
    }

    #[test]
    fn test_parse_angle_and_motor() {
        assert_eq!(
            parse_datagram("-1.5, 120"),
            Some(Datagram::Frame(TelemetryFrame { angle: -1.5, motor: Some(120.0) }))
        );
    }

    #[test]
    fn test_parse_xyz_uses_z() {
        assert_eq!(
            parse_datagram("0.1,0.2,-4.0"),
            Some(Datagram::Frame(TelemetryFrame { angle: -4.0, motor: None }))
        );
    }

    #[test]
    fn test_parse_ack() {
        assert_eq!(
            parse_datagram("KACK K1=76.00"),
            Some(Datagram::Ack("KACK K1=76.00".to_string()))
        );
    }

    #[test]
    fn test_malformed_is_dropped() {
        assert_eq!(parse_datagram(""), None);
        assert_eq!(parse_datagram("abc"), None);
        assert_eq!(parse_datagram("1.0,oops"), None);
        assert_eq!(parse_datagram("1,2,3,4"), None);
        assert_eq!(parse_datagram("NaN"), None);
    }
}
