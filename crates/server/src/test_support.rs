use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use device_link::{
    spawn_link_manager, LinkConfig, LinkError, PortInfo, SerialBackend, SerialConnection,
};
use sequencer::spawn_sequencer;
use shared::protocol::ServerEvent;
use storage::Storage;
use tokio::{
    io::{duplex, split, AsyncBufReadExt, BufReader, DuplexStream, Lines, ReadHalf},
    sync::{broadcast, mpsc},
    time::timeout,
};

use crate::api::ApiContext;

pub(crate) const FAKE_PORT: &str = "/dev/ttyFAKE0";

/// Serial backend whose ports are in-memory pipes handed to the test.
pub(crate) struct PipeBackend {
    pub(crate) ports: Vec<PortInfo>,
    devices: mpsc::UnboundedSender<DuplexStream>,
}

#[async_trait]
impl SerialBackend for PipeBackend {
    async fn list_ports(&self) -> Result<Vec<PortInfo>, LinkError> {
        Ok(self.ports.clone())
    }

    async fn open(&self, _path: &str, _baud_rate: u32) -> Result<SerialConnection, LinkError> {
        let (host, device) = duplex(4096);
        let (reader, writer) = split(host);
        let _ = self.devices.send(device);
        Ok(SerialConnection {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}

pub(crate) struct TestRig {
    pub(crate) ctx: ApiContext,
    pub(crate) backend: Arc<PipeBackend>,
    pub(crate) events: broadcast::Sender<ServerEvent>,
    devices: mpsc::UnboundedReceiver<DuplexStream>,
    // Keeps the device side open so the link stays connected.
    _device_write: Option<tokio::io::WriteHalf<DuplexStream>>,
}

impl TestRig {
    pub(crate) async fn new() -> Self {
        let (devices_tx, devices) = mpsc::unbounded_channel();
        let backend = Arc::new(PipeBackend {
            ports: vec![
                PortInfo {
                    path: "/dev/ttyS0".into(),
                    ..PortInfo::default()
                },
                PortInfo {
                    path: FAKE_PORT.into(),
                    manufacturer: Some("Arduino LLC".into()),
                    serial_number: Some("8573531".into()),
                },
            ],
            devices: devices_tx,
        });
        let (events, _) = broadcast::channel(256);
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let link = spawn_link_manager(
            LinkConfig {
                port_path: Some(FAKE_PORT.into()),
                ..LinkConfig::default()
            },
            backend.clone(),
            Some(events.clone()),
        );
        let sequencer = spawn_sequencer(Arc::new(link.clone()), Some(events.clone()));
        Self {
            ctx: ApiContext {
                storage,
                link,
                sequencer,
            },
            backend,
            events,
            devices,
            _device_write: None,
        }
    }

    /// Waits for the link to open the fake port and returns its command lines.
    pub(crate) async fn device(&mut self) -> Lines<BufReader<ReadHalf<DuplexStream>>> {
        let stream = timeout(Duration::from_secs(5), self.devices.recv())
            .await
            .expect("port opened in time")
            .expect("backend alive");
        let (reader, writer) = split(stream);
        self._device_write = Some(writer);
        BufReader::new(reader).lines()
    }
}

/// Next line written to the device, skipping keep-alive pings.
pub(crate) async fn next_command(lines: &mut Lines<BufReader<ReadHalf<DuplexStream>>>) -> String {
    timeout(Duration::from_secs(5), async {
        loop {
            let line = lines.next_line().await.expect("read").expect("port open");
            if line != "SYS.PING" {
                return line;
            }
        }
    })
    .await
    .expect("command in time")
}
