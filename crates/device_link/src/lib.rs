//! Serial link to the motor controller.
//!
//! One actor task owns the port, the keep-alive and reconnect timers and the
//! in-memory motor state. Everything else talks to it through a
//! [`LinkHandle`].

use std::time::Duration;

use shared::domain::StepSettings;

mod backend;
mod manager;
pub mod wire;

pub use backend::{select_port, LinkError, PortInfo, SerialBackend, SerialConnection, TokioSerialBackend};
pub use manager::{spawn_link_manager, LinkHandle};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_millis(3_000);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(5_000);
/// Sent on pedal press when no PWM has been chosen yet.
pub const DEFAULT_PEDAL_PWM: u8 = 180;

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Fixed port; `None` means discover by identifier.
    pub port_path: Option<String>,
    pub baud_rate: u32,
    pub reconnect_backoff: Duration,
    pub keepalive_interval: Duration,
    pub log_pings: bool,
    pub port_identifiers: Vec<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port_path: None,
            baud_rate: DEFAULT_BAUD_RATE,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            log_pings: false,
            port_identifiers: default_port_identifiers(),
        }
    }
}

pub fn default_port_identifiers() -> Vec<String> {
    ["arduino", "wch", "1a86", "ftdi", "silicon labs"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// What the recipe sequencer needs from the motor side.
pub trait MotorDriver: Send + Sync {
    fn apply_mode(&self, settings: StepSettings);
    fn stop_motor(&self);
}
