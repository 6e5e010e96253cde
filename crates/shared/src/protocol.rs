use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ContinuousSettings, DeviceStatus, Direction, MotorStatus, OperatingMode,
        OscillationSettings, PlaybackState, PulseSettings, Recipe, SystemStatus,
        VibrationSettings,
    },
    error::ApiError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    SetMotorPwm {
        pwm: i64,
    },
    SetMotorRpm {
        rpm: i64,
    },
    SetMotorDirection {
        direction: Direction,
    },
    StartMotor,
    StopMotor,
    StartOscillation {
        settings: OscillationSettings,
    },
    SetOperatingMode {
        mode: OperatingMode,
    },
    SetContinuousSettings {
        settings: ContinuousSettings,
    },
    SetOscillationSettings {
        settings: OscillationSettings,
    },
    SetPulseSettings {
        settings: PulseSettings,
    },
    SetVibrationSettings {
        settings: VibrationSettings,
    },
    RunTimed {
        pwm: i64,
        duration_ms: u32,
    },
    Beep {
        duration_ms: u32,
        frequency_hz: u32,
    },
    Reconnect,
    SaveRecipe {
        recipe: Recipe,
    },
    DeleteRecipe {
        recipe_id: String,
    },
    ActivateRecipe {
        recipe_id: String,
    },
    StopRecipe,
    ListRecipes,
    RequestStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEventKind {
    Pedal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MotorStatusUpdate {
        motor: MotorStatus,
        device: DeviceStatus,
    },
    ArduinoConnected {
        port_path: String,
    },
    ArduinoDisconnected,
    ArduinoEvent {
        #[serde(rename = "type")]
        kind: DeviceEventKind,
        state: u8,
    },
    RecipeStatusUpdate {
        playback: PlaybackState,
    },
    StatusUpdate {
        status: SystemStatus,
    },
    RecipesUpdated {
        recipes: Vec<Recipe>,
    },
    Error(ApiError),
}
