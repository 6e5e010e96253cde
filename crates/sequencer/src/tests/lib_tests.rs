use super::*;

use std::sync::Mutex;

use shared::domain::{
    ContinuousSettings, Direction, OscillationSettings, RecipeStep, StepSettings,
    VibrationSettings,
};
use tokio::time::sleep;

#[derive(Debug, Clone, PartialEq, Eq)]
enum DriverCall {
    Apply(StepSettings),
    Stop,
}

#[derive(Default)]
struct RecordingDriver {
    calls: Mutex<Vec<DriverCall>>,
}

impl RecordingDriver {
    fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().expect("lock").clone()
    }
}

impl MotorDriver for RecordingDriver {
    fn apply_mode(&self, settings: StepSettings) {
        self.calls
            .lock()
            .expect("lock")
            .push(DriverCall::Apply(settings));
    }

    fn stop_motor(&self) {
        self.calls.lock().expect("lock").push(DriverCall::Stop);
    }
}

fn continuous(rpm: u32) -> StepSettings {
    StepSettings::Continuous(ContinuousSettings {
        rpm,
        direction: Direction::Forward,
    })
}

fn step(id: &str, duration_ms: i64, settings: StepSettings) -> RecipeStep {
    RecipeStep {
        id: id.into(),
        duration_ms,
        settings,
    }
}

fn recipe(id: &str, steps: Vec<RecipeStep>) -> Recipe {
    Recipe {
        id: id.into(),
        name: format!("recipe {id}"),
        steps,
    }
}

fn setup() -> (Arc<RecordingDriver>, SequencerHandle, broadcast::Receiver<ServerEvent>) {
    let driver = Arc::new(RecordingDriver::default());
    let (events_tx, events) = broadcast::channel(256);
    let handle = spawn_sequencer(driver.clone(), Some(events_tx));
    (driver, handle, events)
}

/// Lets the sequencer task drain its queue without moving the clock much.
async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn single_step_recipe_stops_after_its_duration() {
    let (driver, sequencer, _events) = setup();
    sequencer.start_recipe(recipe("r1", vec![step("s1", 100, continuous(1000))]));

    sleep(Duration::from_millis(50)).await;
    let running = sequencer.status();
    assert!(running.is_running);
    assert_eq!(running.current_step_index, 0);
    assert_eq!(running.step_count, 1);
    assert_eq!(running.total_duration_ms, 100);
    assert!(running.remaining_time_in_step_ms <= 100);
    assert!(running.remaining_time_in_step_ms > 0);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(sequencer.status(), PlaybackState::idle());
    assert_eq!(
        driver.calls(),
        vec![DriverCall::Apply(continuous(1000)), DriverCall::Stop]
    );
}

#[tokio::test(start_paused = true)]
async fn steps_play_in_order_with_their_own_durations() {
    let (driver, sequencer, _events) = setup();
    let osc = StepSettings::Oscillation(OscillationSettings {
        rpm: 1500,
        angle: 60,
    });
    sequencer.start_recipe(recipe(
        "r2",
        vec![step("a", 100, continuous(500)), step("b", 200, osc)],
    ));

    sleep(Duration::from_millis(150)).await;
    let status = sequencer.status();
    assert_eq!(status.current_step_index, 1);
    assert_eq!(status.current_step().map(|s| s.id.as_str()), Some("b"));

    sleep(Duration::from_millis(100)).await;
    assert!(sequencer.status().is_running);

    sleep(Duration::from_millis(100)).await;
    assert!(!sequencer.status().is_running);
    assert_eq!(
        driver.calls(),
        vec![
            DriverCall::Apply(continuous(500)),
            DriverCall::Apply(osc),
            DriverCall::Stop
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn stop_twice_is_idempotent() {
    let (driver, sequencer, _events) = setup();
    sequencer.start_recipe(recipe("r3", vec![step("s1", 10_000, continuous(2000))]));
    settle().await;

    sequencer.stop_recipe();
    settle().await;
    let after_first = sequencer.status();
    sequencer.stop_recipe();
    settle().await;

    assert_eq!(sequencer.status(), after_first);
    assert_eq!(after_first, PlaybackState::idle());
    assert_eq!(
        driver.calls(),
        vec![DriverCall::Apply(continuous(2000)), DriverCall::Stop]
    );
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_pending_step_timer() {
    let (driver, sequencer, _events) = setup();
    sequencer.start_recipe(recipe(
        "r4",
        vec![step("a", 100, continuous(500)), step("b", 100, continuous(750))],
    ));
    sleep(Duration::from_millis(50)).await;
    sequencer.stop_recipe();

    sleep(Duration::from_millis(500)).await;
    assert_eq!(
        driver.calls(),
        vec![DriverCall::Apply(continuous(500)), DriverCall::Stop]
    );
}

#[tokio::test(start_paused = true)]
async fn start_while_running_is_ignored() {
    let (driver, sequencer, _events) = setup();
    sequencer.start_recipe(recipe("first", vec![step("a", 1_000, continuous(500))]));
    sequencer.start_recipe(recipe("second", vec![step("b", 1_000, continuous(750))]));
    settle().await;

    let status = sequencer.status();
    assert_eq!(
        status.active_recipe.as_ref().map(|r| r.id.as_str()),
        Some("first")
    );
    assert_eq!(driver.calls(), vec![DriverCall::Apply(continuous(500))]);
}

#[tokio::test(start_paused = true)]
async fn empty_recipe_stops_immediately() {
    let (driver, sequencer, _events) = setup();
    sequencer.start_recipe(recipe("empty", Vec::new()));
    settle().await;

    assert_eq!(sequencer.status(), PlaybackState::idle());
    assert_eq!(driver.calls(), vec![DriverCall::Stop]);
}

#[tokio::test(start_paused = true)]
async fn non_positive_durations_advance_immediately() {
    let (driver, sequencer, _events) = setup();
    let vib = StepSettings::Vibration(VibrationSettings {
        intensity: 90,
        frequency_hz: 30,
    });
    sequencer.start_recipe(recipe(
        "instant",
        vec![
            step("zero", 0, continuous(500)),
            step("negative", -50, vib),
            step("real", 1_000, continuous(750)),
        ],
    ));
    settle().await;

    let status = sequencer.status();
    assert_eq!(status.current_step_index, 2);
    assert_eq!(status.total_duration_ms, 1_000);
    assert_eq!(
        driver.calls(),
        vec![
            DriverCall::Apply(continuous(500)),
            DriverCall::Apply(vib),
            DriverCall::Apply(continuous(750)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn remaining_time_counts_down_and_never_goes_negative() {
    let (_driver, sequencer, _events) = setup();
    let mut status_rx = sequencer.subscribe();
    sequencer.start_recipe(recipe("long", vec![step("s", 1_000, continuous(500))]));

    let mut previous = u64::MAX;
    let mut samples = 0;
    while status_rx.changed().await.is_ok() {
        let status = status_rx.borrow_and_update().clone();
        if !status.is_running {
            break;
        }
        assert!(status.remaining_time_in_step_ms <= 1_000);
        assert!(status.remaining_time_in_step_ms <= previous);
        assert!(status.elapsed_ms <= status.total_duration_ms);
        previous = status.remaining_time_in_step_ms;
        samples += 1;
    }

    assert!(samples >= 9, "expected a progress update per tick, got {samples}");
    assert_eq!(sequencer.status().remaining_time_in_step_ms, 0);
}

#[tokio::test(start_paused = true)]
async fn progress_is_broadcast_to_subscribers() {
    let (_driver, sequencer, mut events) = setup();
    sequencer.start_recipe(recipe("r5", vec![step("s", 250, continuous(500))]));
    sleep(Duration::from_millis(400)).await;

    let mut updates = Vec::new();
    while let Ok(ServerEvent::RecipeStatusUpdate { playback }) = events.try_recv() {
        updates.push(playback);
    }
    assert!(updates.len() >= 3);
    assert!(updates.first().is_some_and(|p| p.is_running));
    assert!(updates.last().is_some_and(|p| !p.is_running));
}

#[tokio::test(start_paused = true)]
async fn huge_step_durations_keep_the_sequencer_alive() {
    let (driver, sequencer, _events) = setup();
    sequencer.start_recipe(recipe(
        "huge",
        vec![
            step("a", i64::MAX, continuous(500)),
            step("b", i64::MAX, continuous(750)),
            step("c", i64::MAX, continuous(1000)),
        ],
    ));
    sleep(Duration::from_millis(250)).await;

    let status = sequencer.status();
    assert!(status.is_running);
    assert_eq!(status.current_step_index, 0);
    assert_eq!(status.total_duration_ms, u64::MAX);

    sequencer.stop_recipe();
    settle().await;
    assert_eq!(sequencer.status(), PlaybackState::idle());
    assert_eq!(
        driver.calls(),
        vec![DriverCall::Apply(continuous(500)), DriverCall::Stop]
    );
}
