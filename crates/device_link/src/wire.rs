//! Line protocol spoken with the controller firmware.
//!
//! Outgoing commands are `NAMESPACE.OBJECT.ACTION[:arg[|arg...]]`, one per
//! line. Incoming lines are only classified by prefix.

use std::fmt;

use shared::domain::{Direction, PWM_MAX};

const PEDAL_PRESSED: &str = "EVT:PEDAL:1";
const PEDAL_RELEASED: &str = "EVT:PEDAL:0";
const PONG: &str = "PONG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    SetPwm(u8),
    SetDirection(Direction),
    Stop,
    StartOscillation { pwm: u8, sweep_ms: u32 },
    StartPulse { pwm: u8, on_ms: u32, off_ms: u32 },
    StartVibration { intensity: u8, frequency_hz: u32 },
    TimedRun { pwm: u8, duration_ms: u32 },
    Beep { duration_ms: u32, frequency_hz: u32 },
    Ping,
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCommand::SetPwm(pwm) => write!(f, "DEV.MOTOR.SET_PWM:{pwm}"),
            DeviceCommand::SetDirection(direction) => {
                write!(f, "DEV.MOTOR.SET_DIR:{}", direction.as_wire())
            }
            DeviceCommand::Stop => f.write_str("DEV.MOTOR.STOP"),
            DeviceCommand::StartOscillation { pwm, sweep_ms } => {
                write!(f, "DEV.MOTOR.START_OSC:{pwm}|{sweep_ms}")
            }
            DeviceCommand::StartPulse { pwm, on_ms, off_ms } => {
                write!(f, "DEV.MOTOR.START_PULSE:{pwm}|{on_ms}|{off_ms}")
            }
            DeviceCommand::StartVibration {
                intensity,
                frequency_hz,
            } => write!(f, "DEV.MOTOR.START_VIB:{intensity}|{frequency_hz}"),
            DeviceCommand::TimedRun { pwm, duration_ms } => {
                write!(f, "DEV.MOTOR.EXEC_TIMED_RUN:{pwm}|{duration_ms}")
            }
            DeviceCommand::Beep {
                duration_ms,
                frequency_hz,
            } => write!(f, "DEV.BUZZER.BEEP:{duration_ms}|{frequency_hz}"),
            DeviceCommand::Ping => f.write_str("SYS.PING"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundLine<'a> {
    PedalPressed,
    PedalReleased,
    Pong,
    Other(&'a str),
}

pub fn classify(line: &str) -> InboundLine<'_> {
    let line = line.trim();
    if line.starts_with(PEDAL_PRESSED) {
        InboundLine::PedalPressed
    } else if line.starts_with(PEDAL_RELEASED) {
        InboundLine::PedalReleased
    } else if line.starts_with(PONG) {
        InboundLine::Pong
    } else {
        InboundLine::Other(line)
    }
}

/// Operator input is clamped, never rejected.
pub fn clamp_pwm(value: i64) -> u8 {
    value.clamp(0, i64::from(PWM_MAX)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_commands_in_namespace_object_action_form() {
        assert_eq!(DeviceCommand::SetPwm(180).to_string(), "DEV.MOTOR.SET_PWM:180");
        assert_eq!(
            DeviceCommand::SetDirection(Direction::Reverse).to_string(),
            "DEV.MOTOR.SET_DIR:1"
        );
        assert_eq!(DeviceCommand::Stop.to_string(), "DEV.MOTOR.STOP");
        assert_eq!(
            DeviceCommand::TimedRun {
                pwm: 120,
                duration_ms: 2500
            }
            .to_string(),
            "DEV.MOTOR.EXEC_TIMED_RUN:120|2500"
        );
        assert_eq!(
            DeviceCommand::Beep {
                duration_ms: 200,
                frequency_hz: 2000
            }
            .to_string(),
            "DEV.BUZZER.BEEP:200|2000"
        );
        assert_eq!(DeviceCommand::Ping.to_string(), "SYS.PING");
    }

    #[test]
    fn classifies_lines_by_prefix() {
        assert_eq!(classify("EVT:PEDAL:1\r"), InboundLine::PedalPressed);
        assert_eq!(classify("EVT:PEDAL:0"), InboundLine::PedalReleased);
        assert_eq!(classify("PONG"), InboundLine::Pong);
        assert_eq!(classify("BOOT v1.4"), InboundLine::Other("BOOT v1.4"));
        assert_eq!(classify("EVT:PEDAL"), InboundLine::Other("EVT:PEDAL"));
    }

    #[test]
    fn clamps_pwm_into_byte_range() {
        assert_eq!(clamp_pwm(400), 255);
        assert_eq!(clamp_pwm(-10), 0);
        assert_eq!(clamp_pwm(128), 128);
    }
}
