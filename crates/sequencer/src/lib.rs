//! Recipe playback.
//!
//! A single task walks the active recipe step by step: it hands each step's
//! settings to the motor driver, arms a one-shot timer for the step duration
//! and republishes progress on a short ticker. Only one recipe plays at a
//! time.

use std::{pin::Pin, sync::Arc, time::Duration};

use device_link::MotorDriver;
use shared::{
    domain::{PlaybackState, Recipe},
    protocol::ServerEvent,
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior, Sleep},
};
use tracing::{debug, info, warn};

pub const PROGRESS_TICK: Duration = Duration::from_millis(100);
/// Deadline used when a step is too long to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug)]
enum SequencerCommand {
    Start(Recipe),
    Stop,
}

#[derive(Clone)]
pub struct SequencerHandle {
    commands: mpsc::UnboundedSender<SequencerCommand>,
    status: watch::Receiver<PlaybackState>,
}

impl SequencerHandle {
    fn submit(&self, command: SequencerCommand) {
        if self.commands.send(command).is_err() {
            warn!("recipe: sequencer is gone, dropping request");
        }
    }

    /// Ignored with a warning while another recipe is running.
    pub fn start_recipe(&self, recipe: Recipe) {
        self.submit(SequencerCommand::Start(recipe));
    }

    /// No-op when idle.
    pub fn stop_recipe(&self) {
        self.submit(SequencerCommand::Stop);
    }

    /// Latest published playback snapshot.
    pub fn status(&self) -> PlaybackState {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.status.clone()
    }
}

pub fn spawn_sequencer(
    driver: Arc<dyn MotorDriver>,
    events: Option<broadcast::Sender<ServerEvent>>,
) -> SequencerHandle {
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let (status_tx, status) = watch::channel(PlaybackState::idle());
    let sequencer = Sequencer {
        driver,
        events,
        status: status_tx,
        playback: PlaybackState::idle(),
        step_deadline: None,
        ticker: None,
        recipe_started: None,
        step_started: None,
    };
    tokio::spawn(sequencer.run(commands_rx));
    SequencerHandle { commands, status }
}

struct Sequencer {
    driver: Arc<dyn MotorDriver>,
    events: Option<broadcast::Sender<ServerEvent>>,
    status: watch::Sender<PlaybackState>,
    playback: PlaybackState,
    step_deadline: Option<Pin<Box<Sleep>>>,
    ticker: Option<Interval>,
    recipe_started: Option<Instant>,
    step_started: Option<Instant>,
}

impl Sequencer {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SequencerCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SequencerCommand::Start(recipe)) => self.start(recipe),
                    Some(SequencerCommand::Stop) => self.stop(),
                    None => break,
                },
                _ = fire(&mut self.step_deadline) => {
                    self.step_deadline = None;
                    self.advance();
                }
                _ = tick(&mut self.ticker) => self.refresh_progress(),
            }
        }
        debug!("recipe: all handles dropped, sequencer stopping");
    }

    fn start(&mut self, recipe: Recipe) {
        if self.playback.is_running {
            warn!(
                requested = %recipe.id,
                active = ?self.playback.active_recipe.as_ref().map(|r| r.id.as_str()),
                "recipe: already running, start ignored"
            );
            return;
        }

        info!(recipe_id = %recipe.id, name = %recipe.name, steps = recipe.steps.len(), "recipe: started");
        self.playback = PlaybackState {
            step_count: recipe.steps.len(),
            total_duration_ms: recipe.total_duration_ms(),
            active_recipe: Some(recipe),
            current_step_index: -1,
            is_running: true,
            remaining_time_in_step_ms: 0,
            elapsed_ms: 0,
        };
        self.recipe_started = Some(Instant::now());
        self.advance();
    }

    fn advance(&mut self) {
        let next_index = self.playback.current_step_index + 1;
        let next_step = self.playback.active_recipe.as_ref().and_then(|recipe| {
            usize::try_from(next_index)
                .ok()
                .and_then(|i| recipe.steps.get(i))
                .cloned()
        });
        let Some(step) = next_step else {
            if self.playback.is_running {
                info!("recipe: finished");
            }
            self.stop();
            return;
        };

        self.step_deadline = None;
        self.ticker = None;

        let duration_ms = step.duration_ms_clamped();
        self.playback.current_step_index = next_index;
        self.playback.remaining_time_in_step_ms = duration_ms;
        debug!(step = next_index, step_id = %step.id, mode = ?step.mode(), duration_ms, "recipe: step");
        self.driver.apply_mode(step.settings);

        let now = Instant::now();
        self.step_started = Some(now);
        let deadline = now
            .checked_add(Duration::from_millis(duration_ms))
            .unwrap_or_else(|| now + FAR_FUTURE);
        self.step_deadline = Some(Box::pin(sleep_until(deadline)));
        let mut ticker = interval_at(now + PROGRESS_TICK, PROGRESS_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);

        self.update_elapsed();
        self.publish();
    }

    fn refresh_progress(&mut self) {
        let Some(step_started) = self.step_started else {
            return;
        };
        let Some(duration_ms) = self
            .playback
            .current_step()
            .map(|step| step.duration_ms_clamped())
        else {
            return;
        };
        let spent = step_started.elapsed().as_millis() as u64;
        self.playback.remaining_time_in_step_ms = duration_ms.saturating_sub(spent);
        self.update_elapsed();
        self.publish();
    }

    fn update_elapsed(&mut self) {
        if let Some(started) = self.recipe_started {
            self.playback.elapsed_ms = started.elapsed().as_millis() as u64;
        }
    }

    fn stop(&mut self) {
        if !self.playback.is_running {
            warn!("recipe: stop requested while idle");
            return;
        }

        self.step_deadline = None;
        self.ticker = None;
        self.driver.stop_motor();

        let finished = self.playback.active_recipe.as_ref().map(|r| r.id.clone());
        self.playback = PlaybackState::idle();
        self.recipe_started = None;
        self.step_started = None;
        info!(recipe_id = ?finished, "recipe: stopped");
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(self.playback.clone());
        if let Some(events) = &self.events {
            let _ = events.send(ServerEvent::RecipeStatusUpdate {
                playback: self.playback.clone(),
            });
        }
    }
}

async fn fire(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(deadline) => deadline.await,
        None => std::future::pending().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
