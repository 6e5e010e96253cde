use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{SerialPortType, SerialStream};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortInfo {
    pub path: String,
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
}

/// An open port split into its two directions.
pub struct SerialConnection {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to list serial ports: {0}")]
    ListPorts(String),
    #[error("failed to open serial port {path}: {reason}")]
    Open { path: String, reason: String },
}

#[async_trait]
pub trait SerialBackend: Send + Sync {
    async fn list_ports(&self) -> Result<Vec<PortInfo>, LinkError>;
    async fn open(&self, path: &str, baud_rate: u32) -> Result<SerialConnection, LinkError>;
}

pub struct TokioSerialBackend;

#[async_trait]
impl SerialBackend for TokioSerialBackend {
    async fn list_ports(&self) -> Result<Vec<PortInfo>, LinkError> {
        let ports = tokio::task::spawn_blocking(tokio_serial::available_ports)
            .await
            .map_err(|e| LinkError::ListPorts(e.to_string()))?
            .map_err(|e| LinkError::ListPorts(e.to_string()))?;
        Ok(ports.into_iter().map(port_info).collect())
    }

    async fn open(&self, path: &str, baud_rate: u32) -> Result<SerialConnection, LinkError> {
        let builder = tokio_serial::new(path, baud_rate);
        let stream = SerialStream::open(&builder).map_err(|e| LinkError::Open {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(SerialConnection {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}

fn port_info(port: tokio_serial::SerialPortInfo) -> PortInfo {
    match port.port_type {
        SerialPortType::UsbPort(usb) => PortInfo {
            path: port.port_name,
            manufacturer: usb.manufacturer,
            serial_number: usb.serial_number,
        },
        _ => PortInfo {
            path: port.port_name,
            ..PortInfo::default()
        },
    }
}

/// First port, in the order given, whose manufacturer or serial number
/// contains any identifier (case-insensitive).
pub fn select_port(ports: &[PortInfo], identifiers: &[String]) -> Option<String> {
    let needles: Vec<String> = identifiers
        .iter()
        .map(|id| id.trim().to_lowercase())
        .filter(|id| !id.is_empty())
        .collect();

    ports
        .iter()
        .find(|port| {
            [&port.manufacturer, &port.serial_number]
                .into_iter()
                .flatten()
                .any(|field| {
                    let field = field.to_lowercase();
                    needles.iter().any(|needle| field.contains(needle))
                })
        })
        .map(|port| port.path.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(path: &str, manufacturer: Option<&str>, serial: Option<&str>) -> PortInfo {
        PortInfo {
            path: path.into(),
            manufacturer: manufacturer.map(Into::into),
            serial_number: serial.map(Into::into),
        }
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn matches_manufacturer_case_insensitively() {
        let ports = [
            port("/dev/ttyS0", None, None),
            port("/dev/ttyACM0", Some("Arduino LLC (www.arduino.cc)"), None),
        ];
        assert_eq!(
            select_port(&ports, &ids(&["arduino"])),
            Some("/dev/ttyACM0".into())
        );
    }

    #[test]
    fn matches_serial_number() {
        let ports = [port("COM4", Some("Microsoft"), Some("HANDPIECE-0042"))];
        assert_eq!(select_port(&ports, &ids(&["handpiece"])), Some("COM4".into()));
    }

    #[test]
    fn port_order_breaks_ties() {
        let ports = [
            port("/dev/ttyUSB1", Some("wch.cn"), None),
            port("/dev/ttyACM0", Some("Arduino"), None),
        ];
        assert_eq!(
            select_port(&ports, &ids(&["arduino", "wch"])),
            Some("/dev/ttyUSB1".into())
        );
    }

    #[test]
    fn no_match_and_blank_identifiers() {
        let ports = [port("/dev/ttyS0", Some("Intel"), None)];
        assert_eq!(select_port(&ports, &ids(&["arduino"])), None);
        assert_eq!(select_port(&ports, &ids(&["", "  "])), None);
        assert_eq!(select_port(&[], &ids(&["arduino"])), None);
    }
}
