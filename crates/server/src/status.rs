//! Folds the link and playback snapshots into one `status_update` event.

use shared::{
    domain::{DeviceStatus, PlaybackState, SystemStatus},
    protocol::ServerEvent,
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tracing::debug;

enum StatusChange {
    Device(DeviceStatus),
    Playback(PlaybackState),
}

pub fn spawn_status_broadcaster(
    device: watch::Receiver<DeviceStatus>,
    playback: watch::Receiver<PlaybackState>,
    events: broadcast::Sender<ServerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut status = SystemStatus {
            device: device.borrow().clone(),
            playback: playback.borrow().clone(),
        };
        let mut changes = WatchStream::from_changes(device)
            .map(StatusChange::Device)
            .merge(WatchStream::from_changes(playback).map(StatusChange::Playback));

        while let Some(change) = changes.next().await {
            match change {
                StatusChange::Device(device) => status.device = device,
                StatusChange::Playback(playback) => status.playback = playback,
            }
            // Errors only when no session is subscribed.
            let _ = events.send(ServerEvent::StatusUpdate {
                status: status.clone(),
            });
        }
        debug!("status: sources closed, broadcaster stopping");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use shared::domain::{ConnectionState, LinkState};
    use tokio::time::timeout;

    async fn next_status(events: &mut broadcast::Receiver<ServerEvent>) -> SystemStatus {
        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event in time")
            .expect("event");
        match event {
            ServerEvent::StatusUpdate { status } => status,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn pushes_a_combined_snapshot_on_every_change() {
        let (device_tx, device_rx) = watch::channel(DeviceStatus::default());
        let (playback_tx, playback_rx) = watch::channel(PlaybackState::idle());
        let (events, mut events_rx) = broadcast::channel(16);
        let task = spawn_status_broadcaster(device_rx, playback_rx, events);

        let mut connected = DeviceStatus::default();
        connected.link = LinkState {
            connection_state: ConnectionState::Connected,
            port_path: Some("/dev/ttyACM0".into()),
        };
        device_tx.send_replace(connected.clone());
        let status = next_status(&mut events_rx).await;
        assert_eq!(status.device, connected);
        assert_eq!(status.playback, PlaybackState::idle());

        let mut running = PlaybackState::idle();
        running.is_running = true;
        running.current_step_index = 0;
        playback_tx.send_replace(running.clone());
        let status = next_status(&mut events_rx).await;
        assert_eq!(status.device, connected);
        assert_eq!(status.playback, running);

        drop(device_tx);
        drop(playback_tx);
        timeout(Duration::from_secs(1), task)
            .await
            .expect("broadcaster stops")
            .expect("join");
    }
}
