//! Text control messages.
//!
//! Control messages travel as whole UTF-8 datagrams without a header. They are
//! only interpreted outside the data phase of a session; while frames are
//! streaming every datagram is treated as a fragment.

use bytes::Bytes;
use std::fmt;

use crate::WireError;

/// Default port for the camera session
pub const DEFAULT_SESSION_PORT: u16 = 6969;

/// Default port for subnet-wide alert broadcasts
pub const ALERT_PORT: u16 = 5005;

const DISCOVERY: &str = "I_AM_THE_CAMERA";
const HELLO: &str = "HELLO";
const ACK: &str = "ACK";
const LED_PREFIX: &str = "LED_";
const CAMERA_ON: &str = "CAM_ON";
const CAMERA_OFF: &str = "CAM_OFF";
const SLEEP_ALERT: &str = "GUY_DEAD";

/// A control datagram
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ControlMessage {
    /// Camera announcing itself on the broadcast address
    Discovery,
    /// Receiver opening a session
    Hello,
    /// Acknowledgment, also used as the keepalive signal
    Ack,
    /// LED brightness directive
    Led(u8),
    /// Turn the camera on
    CameraOn,
    /// Turn the camera off
    CameraOff,
    /// Sleepiness alert broadcast
    SleepAlert,
    /// Any other text (telemetry, debug output)
    Text(String),
}

impl ControlMessage {
    /// Parse a datagram as a control message
    pub fn parse(datagram: &[u8]) -> Result<Self, WireError> {
        let text = std::str::from_utf8(datagram).map_err(|_| WireError::NotText)?;
        text.parse()
    }

    /// Encode as a datagram
    pub fn encode(&self) -> Bytes {
        Bytes::from(self.to_string())
    }

    /// Whether this message is the acknowledgment token
    pub fn is_ack(&self) -> bool {
        matches!(self, ControlMessage::Ack)
    }
}

impl std::str::FromStr for ControlMessage {
    type Err = WireError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let message = match text {
            DISCOVERY => ControlMessage::Discovery,
            HELLO => ControlMessage::Hello,
            ACK => ControlMessage::Ack,
            CAMERA_ON => ControlMessage::CameraOn,
            CAMERA_OFF => ControlMessage::CameraOff,
            SLEEP_ALERT => ControlMessage::SleepAlert,
            other => match other.strip_prefix(LED_PREFIX) {
                Some(level) => level
                    .parse::<u8>()
                    .map(ControlMessage::Led)
                    .map_err(|_| WireError::LedLevel(level.to_string()))?,
                None => ControlMessage::Text(other.to_string()),
            },
        };
        Ok(message)
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::Discovery => f.write_str(DISCOVERY),
            ControlMessage::Hello => f.write_str(HELLO),
            ControlMessage::Ack => f.write_str(ACK),
            ControlMessage::Led(level) => write!(f, "{}{}", LED_PREFIX, level),
            ControlMessage::CameraOn => f.write_str(CAMERA_ON),
            ControlMessage::CameraOff => f.write_str(CAMERA_OFF),
            ControlMessage::SleepAlert => f.write_str(SLEEP_ALERT),
            ControlMessage::Text(text) => f.write_str(text),
        }
    }
}
