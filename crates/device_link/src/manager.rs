use std::{io, pin::Pin, sync::Arc};

use calibration::{ms_for_calibration_or_zero, nearest_pwm_for_rpm, nearest_rpm_for_pwm};
use shared::{
    domain::{
        ConnectionState, DeviceStatus, Direction, LinkState, OperatingMode, OscillationSettings,
        StepSettings,
    },
    protocol::{DeviceEventKind, ServerEvent},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines},
    sync::{broadcast, mpsc, watch},
    time::{interval_at, Instant, Interval, MissedTickBehavior, Sleep},
};
use tracing::{debug, info, warn};

use crate::{
    backend::{select_port, SerialBackend},
    wire::{clamp_pwm, classify, DeviceCommand, InboundLine},
    LinkConfig, MotorDriver, DEFAULT_PEDAL_PWM,
};

type PortLines = Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;
type PortWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug)]
enum LinkCommand {
    Reconnect,
    SendRaw(String),
    SetPwm(i64),
    SetRpm(i64),
    SetDirection(Direction),
    StartMotor,
    StopMotor,
    SetMode(OperatingMode),
    SetSettings(StepSettings),
    StartOscillation(OscillationSettings),
    ApplyMode(StepSettings),
    RunTimed { pwm: i64, duration_ms: u32 },
    Beep { duration_ms: u32, frequency_hz: u32 },
}

/// Cloneable front of the link actor. Every method is fire-and-forget.
#[derive(Clone)]
pub struct LinkHandle {
    commands: mpsc::UnboundedSender<LinkCommand>,
    status: watch::Receiver<DeviceStatus>,
}

impl LinkHandle {
    fn submit(&self, command: LinkCommand) {
        if let Err(err) = self.commands.send(command) {
            warn!(command = ?err.0, "serial: link manager is gone, dropping request");
        }
    }

    pub fn reconnect(&self) {
        self.submit(LinkCommand::Reconnect);
    }

    /// Raw line for the controller, without the trailing newline.
    pub fn send_command(&self, command: impl Into<String>) {
        self.submit(LinkCommand::SendRaw(command.into()));
    }

    pub fn set_motor_pwm(&self, pwm: i64) {
        self.submit(LinkCommand::SetPwm(pwm));
    }

    pub fn set_motor_rpm(&self, rpm: i64) {
        self.submit(LinkCommand::SetRpm(rpm));
    }

    pub fn set_motor_direction(&self, direction: Direction) {
        self.submit(LinkCommand::SetDirection(direction));
    }

    pub fn start_motor(&self) {
        self.submit(LinkCommand::StartMotor);
    }

    pub fn stop_motor(&self) {
        self.submit(LinkCommand::StopMotor);
    }

    pub fn set_operating_mode(&self, mode: OperatingMode) {
        self.submit(LinkCommand::SetMode(mode));
    }

    pub fn set_mode_settings(&self, settings: StepSettings) {
        self.submit(LinkCommand::SetSettings(settings));
    }

    pub fn start_oscillation(&self, settings: OscillationSettings) {
        self.submit(LinkCommand::StartOscillation(settings));
    }

    /// Switch to the given mode with these parameters and run the motor.
    pub fn apply_mode(&self, settings: StepSettings) {
        self.submit(LinkCommand::ApplyMode(settings));
    }

    pub fn run_timed(&self, pwm: i64, duration_ms: u32) {
        self.submit(LinkCommand::RunTimed { pwm, duration_ms });
    }

    pub fn beep(&self, duration_ms: u32, frequency_hz: u32) {
        self.submit(LinkCommand::Beep {
            duration_ms,
            frequency_hz,
        });
    }

    pub fn status(&self) -> DeviceStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceStatus> {
        self.status.clone()
    }
}

impl MotorDriver for LinkHandle {
    fn apply_mode(&self, settings: StepSettings) {
        LinkHandle::apply_mode(self, settings);
    }

    fn stop_motor(&self) {
        LinkHandle::stop_motor(self);
    }
}

/// Starts the link actor on the current runtime and immediately tries to
/// connect.
pub fn spawn_link_manager(
    config: LinkConfig,
    backend: Arc<dyn SerialBackend>,
    events: Option<broadcast::Sender<ServerEvent>>,
) -> LinkHandle {
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let (status_tx, status) = watch::channel(DeviceStatus::default());
    let actor = LinkActor {
        config,
        backend,
        events,
        status: status_tx,
        device: DeviceStatus::default(),
        continuous_pwm: 0,
        writer: None,
        lines: None,
        reconnect_at: None,
        keepalive: None,
    };
    tokio::spawn(actor.run(commands_rx));
    LinkHandle { commands, status }
}

struct LinkActor {
    config: LinkConfig,
    backend: Arc<dyn SerialBackend>,
    events: Option<broadcast::Sender<ServerEvent>>,
    status: watch::Sender<DeviceStatus>,
    device: DeviceStatus,
    /// Speed of the continuous program. Other programs overwrite `motor.pwm`.
    continuous_pwm: u8,
    writer: Option<PortWriter>,
    lines: Option<PortLines>,
    reconnect_at: Option<Pin<Box<Sleep>>>,
    keepalive: Option<Interval>,
}

impl LinkActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<LinkCommand>) {
        self.connect().await;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = fire(&mut self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.connect().await;
                }
                _ = tick(&mut self.keepalive) => {
                    self.send(DeviceCommand::Ping).await;
                }
                line = next_line(&mut self.lines) => match line {
                    Ok(Some(line)) => self.handle_line(&line).await,
                    Ok(None) => self.port_lost("port closed"),
                    Err(err) => self.port_lost(&err.to_string()),
                },
            }
        }
        debug!("serial: all handles dropped, link manager stopping");
    }

    async fn connect(&mut self) {
        self.close_port();
        self.reconnect_at = None;
        self.device.link = LinkState {
            connection_state: ConnectionState::Connecting,
            port_path: None,
        };
        self.publish();

        let path = match self.configured_port() {
            Some(path) => Some(path),
            // Owned copies: no shared borrow of the actor lives across the listing.
            None => {
                discover_port(
                    Arc::clone(&self.backend),
                    self.config.port_identifiers.clone(),
                )
                .await
            }
        };
        let Some(path) = path else {
            warn!(
                identifiers = ?self.config.port_identifiers,
                "serial: no matching controller port found"
            );
            self.mark_disconnected();
            self.schedule_reconnect();
            return;
        };

        match self.backend.open(&path, self.config.baud_rate).await {
            Ok(connection) => {
                self.writer = Some(connection.writer);
                self.lines = Some(BufReader::new(connection.reader).lines());
                let period = self.config.keepalive_interval;
                let mut keepalive = interval_at(Instant::now() + period, period);
                keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.keepalive = Some(keepalive);
                self.device.link = LinkState {
                    connection_state: ConnectionState::Connected,
                    port_path: Some(path.clone()),
                };
                info!(port = %path, baud = self.config.baud_rate, "serial: connected");
                self.publish();
                self.emit(ServerEvent::ArduinoConnected { port_path: path });
            }
            Err(err) => {
                warn!(port = %path, %err, "serial: open failed");
                self.mark_disconnected();
                self.schedule_reconnect();
            }
        }
    }

    fn configured_port(&self) -> Option<String> {
        self.config
            .port_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
    }

    fn schedule_reconnect(&mut self) {
        let backoff = self.config.reconnect_backoff;
        debug!(backoff_ms = backoff.as_millis() as u64, "serial: reconnect scheduled");
        self.reconnect_at = Some(Box::pin(tokio::time::sleep(backoff)));
    }

    fn close_port(&mut self) {
        self.keepalive = None;
        self.writer = None;
        self.lines = None;
    }

    fn mark_disconnected(&mut self) {
        self.device.link = LinkState::default();
        self.publish();
    }

    fn port_lost(&mut self, reason: &str) {
        self.close_port();
        let port = self.device.link.port_path.take();
        warn!(port = ?port, reason, "serial: connection lost");
        self.mark_disconnected();
        self.emit(ServerEvent::ArduinoDisconnected);
        self.schedule_reconnect();
    }

    async fn handle(&mut self, command: LinkCommand) {
        match command {
            LinkCommand::Reconnect => {
                if self.device.link.is_connected() {
                    self.emit(ServerEvent::ArduinoDisconnected);
                }
                self.connect().await;
            }
            LinkCommand::SendRaw(line) => self.send_raw(&line).await,
            LinkCommand::SetPwm(pwm) => self.set_pwm(clamp_pwm(pwm)).await,
            LinkCommand::SetRpm(rpm) => {
                let rpm = rpm.clamp(0, i64::from(u32::MAX)) as u32;
                self.set_pwm(nearest_pwm_for_rpm(rpm)).await;
            }
            LinkCommand::SetDirection(direction) => {
                self.device.motor.direction = direction;
                self.device.settings.continuous.direction = direction;
                self.send(DeviceCommand::SetDirection(direction)).await;
                self.publish_motor();
            }
            LinkCommand::StartMotor => {
                self.device.motor.is_active = true;
                let program = self.device.settings.for_mode(self.device.mode);
                self.run_program(program).await;
                self.publish_motor();
            }
            LinkCommand::StopMotor => {
                self.device.motor.is_active = false;
                self.send(DeviceCommand::Stop).await;
                self.publish_motor();
            }
            LinkCommand::SetMode(mode) => {
                self.device.mode = mode;
                if self.device.motor.is_active {
                    let program = self.device.settings.for_mode(mode);
                    self.run_program(program).await;
                }
                self.publish_motor();
            }
            LinkCommand::SetSettings(settings) => {
                self.store_settings(settings);
                if self.device.motor.is_active && self.device.mode == settings.mode() {
                    self.run_program(settings).await;
                }
                self.publish_motor();
            }
            LinkCommand::StartOscillation(settings) => {
                self.activate(StepSettings::Oscillation(settings)).await;
            }
            LinkCommand::ApplyMode(settings) => self.activate(settings).await,
            LinkCommand::RunTimed { pwm, duration_ms } => {
                self.send(DeviceCommand::TimedRun {
                    pwm: clamp_pwm(pwm),
                    duration_ms,
                })
                .await;
                self.publish_motor();
            }
            LinkCommand::Beep {
                duration_ms,
                frequency_hz,
            } => {
                self.send(DeviceCommand::Beep {
                    duration_ms,
                    frequency_hz,
                })
                .await;
                self.publish_motor();
            }
        }
    }

    async fn set_pwm(&mut self, pwm: u8) {
        self.device.motor.pwm = pwm;
        self.continuous_pwm = pwm;
        self.device.settings.continuous.rpm = nearest_rpm_for_pwm(pwm);
        if self.device.motor.is_active {
            self.send(DeviceCommand::SetPwm(pwm)).await;
        }
        self.publish_motor();
    }

    async fn activate(&mut self, settings: StepSettings) {
        self.store_settings(settings);
        self.device.mode = settings.mode();
        self.device.motor.is_active = true;
        self.run_program(settings).await;
        self.publish_motor();
    }

    fn store_settings(&mut self, settings: StepSettings) {
        self.device.settings.store(settings);
        if let StepSettings::Continuous(continuous) = settings {
            self.continuous_pwm = nearest_pwm_for_rpm(continuous.rpm);
            self.device.motor.pwm = self.continuous_pwm;
            self.device.motor.direction = continuous.direction;
        }
    }

    async fn run_program(&mut self, settings: StepSettings) {
        match settings {
            StepSettings::Continuous(_) => {
                self.device.motor.pwm = self.continuous_pwm;
                let motor = self.device.motor;
                self.send(DeviceCommand::SetDirection(motor.direction)).await;
                self.send(DeviceCommand::SetPwm(motor.pwm)).await;
            }
            StepSettings::Oscillation(osc) => {
                let pwm = nearest_pwm_for_rpm(osc.rpm);
                let sweep_ms = ms_for_calibration_or_zero(osc.rpm, osc.angle);
                self.device.motor.pwm = pwm;
                self.send(DeviceCommand::StartOscillation { pwm, sweep_ms })
                    .await;
            }
            StepSettings::Pulse(pulse) => {
                let pwm = nearest_pwm_for_rpm(pulse.rpm);
                self.device.motor.pwm = pwm;
                self.send(DeviceCommand::StartPulse {
                    pwm,
                    on_ms: pulse.on_ms,
                    off_ms: pulse.off_ms,
                })
                .await;
            }
            StepSettings::Vibration(vibration) => {
                self.device.motor.pwm = vibration.intensity;
                self.send(DeviceCommand::StartVibration {
                    intensity: vibration.intensity,
                    frequency_hz: vibration.frequency_hz,
                })
                .await;
            }
        }
    }

    async fn handle_line(&mut self, line: &str) {
        match classify(line) {
            InboundLine::PedalPressed => {
                let pwm = match self.continuous_pwm {
                    0 => DEFAULT_PEDAL_PWM,
                    pwm => pwm,
                };
                self.device.motor.is_active = true;
                self.device.motor.pwm = pwm;
                self.continuous_pwm = pwm;
                self.send(DeviceCommand::SetPwm(pwm)).await;
                self.publish_motor();
                self.emit(ServerEvent::ArduinoEvent {
                    kind: DeviceEventKind::Pedal,
                    state: 1,
                });
            }
            InboundLine::PedalReleased => {
                self.device.motor.is_active = false;
                self.send(DeviceCommand::Stop).await;
                self.publish_motor();
                self.emit(ServerEvent::ArduinoEvent {
                    kind: DeviceEventKind::Pedal,
                    state: 0,
                });
            }
            InboundLine::Pong => {
                if self.config.log_pings {
                    debug!("serial: pong");
                }
            }
            InboundLine::Other("") => {}
            InboundLine::Other(text) => info!(line = text, "serial: device"),
        }
    }

    async fn send(&mut self, command: DeviceCommand) {
        self.send_raw(&command.to_string()).await;
    }

    /// At most once: nothing is queued while the port is down.
    async fn send_raw(&mut self, command: &str) {
        let quiet = command == "SYS.PING" && !self.config.log_pings;
        if !self.device.link.is_connected() {
            if !quiet {
                warn!(command, "serial: not connected, command dropped");
            }
            return;
        }
        let Some(writer) = self.writer.as_mut() else {
            warn!(command, "serial: port handle closed, command dropped");
            return;
        };

        let line = format!("{command}\n");
        let result = match writer.write_all(line.as_bytes()).await {
            Ok(()) => writer.flush().await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                if !quiet {
                    debug!(command, "serial: sent");
                }
            }
            Err(err) => {
                warn!(command, %err, "serial: write failed");
                self.port_lost("write failed");
            }
        }
    }

    fn publish(&mut self) {
        self.device.rpm = nearest_rpm_for_pwm(self.device.motor.pwm);
        self.status.send_replace(self.device.clone());
    }

    fn publish_motor(&mut self) {
        self.publish();
        self.emit(ServerEvent::MotorStatusUpdate {
            motor: self.device.motor,
            device: self.device.clone(),
        });
    }

    fn emit(&self, event: ServerEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

async fn discover_port(
    backend: Arc<dyn SerialBackend>,
    identifiers: Vec<String>,
) -> Option<String> {
    match backend.list_ports().await {
        Ok(ports) => select_port(&ports, &identifiers),
        Err(err) => {
            warn!(%err, "serial: port discovery failed");
            None
        }
    }
}

async fn fire(sleep: &mut Option<Pin<Box<Sleep>>>) {
    match sleep {
        Some(sleep) => sleep.await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_line(lines: &mut Option<PortLines>) -> io::Result<Option<String>> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/manager_tests.rs"]
mod tests;
