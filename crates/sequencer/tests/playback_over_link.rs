use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use device_link::{
    spawn_link_manager, LinkConfig, LinkError, PortInfo, SerialBackend, SerialConnection,
};
use sequencer::spawn_sequencer;
use shared::domain::{
    ConnectionState, PulseSettings, Recipe, RecipeStep, StepSettings, VibrationSettings,
};
use tokio::{
    io::{duplex, split, AsyncBufReadExt, BufReader, DuplexStream},
    sync::mpsc,
    time::{sleep, timeout},
};

struct LoopbackBackend {
    opens: AtomicUsize,
    devices: mpsc::UnboundedSender<DuplexStream>,
}

#[async_trait]
impl SerialBackend for LoopbackBackend {
    async fn list_ports(&self) -> Result<Vec<PortInfo>, LinkError> {
        Ok(Vec::new())
    }

    async fn open(&self, _path: &str, _baud_rate: u32) -> Result<SerialConnection, LinkError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (host, device) = duplex(4096);
        let (reader, writer) = split(host);
        let _ = self.devices.send(device);
        Ok(SerialConnection {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}

async fn next_command(
    lines: &mut tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
) -> String {
    timeout(Duration::from_secs(30), async {
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

fn two_step_recipe() -> Recipe {
    Recipe {
        id: "warmup".into(),
        name: "Warm-up".into(),
        steps: vec![
            RecipeStep {
                id: "pulse".into(),
                duration_ms: 2_000,
                settings: StepSettings::Pulse(PulseSettings {
                    rpm: 2000,
                    on_ms: 200,
                    off_ms: 300,
                }),
            },
            RecipeStep {
                id: "vibrate".into(),
                duration_ms: 20_000,
                settings: StepSettings::Vibration(VibrationSettings {
                    intensity: 120,
                    frequency_hz: 20,
                }),
            },
        ],
    }
}

#[tokio::test(start_paused = true)]
async fn playback_survives_a_dropped_port_and_resumes_on_reconnect() {
    let (devices_tx, mut devices) = mpsc::unbounded_channel();
    let backend = Arc::new(LoopbackBackend {
        opens: AtomicUsize::new(0),
        devices: devices_tx,
    });
    let config = LinkConfig {
        port_path: Some("/dev/ttyACM0".into()),
        reconnect_backoff: Duration::from_millis(1_000),
        ..LinkConfig::default()
    };
    let link = spawn_link_manager(config, backend.clone(), None);
    let sequencer = spawn_sequencer(Arc::new(link.clone()), None);

    let first = devices.recv().await.expect("first port");
    let (reader, writer) = split(first);
    let mut lines = BufReader::new(reader).lines();

    sequencer.start_recipe(two_step_recipe());
    assert_eq!(next_command(&mut lines).await, "DEV.MOTOR.START_PULSE:55|200|300");

    drop(lines);
    drop(writer);
    sleep(Duration::from_millis(100)).await;

    assert_eq!(
        link.status().link.connection_state,
        ConnectionState::Disconnected
    );
    let playback = sequencer.status();
    assert!(playback.is_running);
    assert_eq!(playback.current_step_index, 0);

    let second = timeout(Duration::from_secs(5), devices.recv())
        .await
        .expect("reconnected in time")
        .expect("second port");
    assert_eq!(backend.opens.load(Ordering::SeqCst), 2);
    assert!(link.status().link.is_connected());

    let (reader, _writer) = split(second);
    let mut lines = BufReader::new(reader).lines();
    assert_eq!(next_command(&mut lines).await, "DEV.MOTOR.START_VIB:120|20");
    assert_eq!(sequencer.status().current_step_index, 1);

    sequencer.stop_recipe();
    assert_eq!(next_command(&mut lines).await, "DEV.MOTOR.STOP");
    sleep(Duration::from_millis(10)).await;
    assert!(!sequencer.status().is_running);
}
