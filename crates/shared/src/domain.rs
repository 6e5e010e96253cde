use serde::{Deserialize, Serialize};

pub const PWM_MAX: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    /// Direction as the controller firmware expects it: 0 forward, 1 reverse.
    pub fn as_wire(self) -> u8 {
        match self {
            Direction::Forward => 0,
            Direction::Reverse => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LinkState {
    pub connection_state: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_path: Option<String>,
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MotorStatus {
    pub pwm: u8,
    pub direction: Direction,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    #[default]
    Continuous,
    Oscillation,
    Pulse,
    Vibration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuousSettings {
    pub rpm: u32,
    #[serde(default)]
    pub direction: Direction,
}

impl Default for ContinuousSettings {
    fn default() -> Self {
        Self {
            rpm: 500,
            direction: Direction::Forward,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OscillationSettings {
    pub rpm: u32,
    /// Sweep angle in degrees.
    pub angle: u32,
}

impl Default for OscillationSettings {
    fn default() -> Self {
        Self {
            rpm: 1000,
            angle: 90,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseSettings {
    pub rpm: u32,
    pub on_ms: u32,
    pub off_ms: u32,
}

impl Default for PulseSettings {
    fn default() -> Self {
        Self {
            rpm: 1000,
            on_ms: 500,
            off_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VibrationSettings {
    /// Raw PWM duty used while vibrating.
    pub intensity: u8,
    pub frequency_hz: u32,
}

impl Default for VibrationSettings {
    fn default() -> Self {
        Self {
            intensity: 120,
            frequency_hz: 20,
        }
    }
}

/// Last requested parameters for every operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModeSettings {
    #[serde(default)]
    pub continuous: ContinuousSettings,
    #[serde(default)]
    pub oscillation: OscillationSettings,
    #[serde(default)]
    pub pulse: PulseSettings,
    #[serde(default)]
    pub vibration: VibrationSettings,
}

impl ModeSettings {
    pub fn for_mode(&self, mode: OperatingMode) -> StepSettings {
        match mode {
            OperatingMode::Continuous => StepSettings::Continuous(self.continuous),
            OperatingMode::Oscillation => StepSettings::Oscillation(self.oscillation),
            OperatingMode::Pulse => StepSettings::Pulse(self.pulse),
            OperatingMode::Vibration => StepSettings::Vibration(self.vibration),
        }
    }

    pub fn store(&mut self, settings: StepSettings) {
        match settings {
            StepSettings::Continuous(s) => self.continuous = s,
            StepSettings::Oscillation(s) => self.oscillation = s,
            StepSettings::Pulse(s) => self.pulse = s,
            StepSettings::Vibration(s) => self.vibration = s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "params", rename_all = "snake_case")]
pub enum StepSettings {
    Continuous(ContinuousSettings),
    Oscillation(OscillationSettings),
    Pulse(PulseSettings),
    Vibration(VibrationSettings),
}

impl StepSettings {
    pub fn mode(&self) -> OperatingMode {
        match self {
            StepSettings::Continuous(_) => OperatingMode::Continuous,
            StepSettings::Oscillation(_) => OperatingMode::Oscillation,
            StepSettings::Pulse(_) => OperatingMode::Pulse,
            StepSettings::Vibration(_) => OperatingMode::Vibration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeStep {
    pub id: String,
    /// Non-positive durations are played as instantaneous steps.
    pub duration_ms: i64,
    pub settings: StepSettings,
}

impl RecipeStep {
    pub fn mode(&self) -> OperatingMode {
        self.settings.mode()
    }

    pub fn duration_ms_clamped(&self) -> u64 {
        self.duration_ms.max(0) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub steps: Vec<RecipeStep>,
}

impl Recipe {
    /// Saturates instead of overflowing on absurd step durations.
    pub fn total_duration_ms(&self) -> u64 {
        self.steps
            .iter()
            .map(RecipeStep::duration_ms_clamped)
            .fold(0, u64::saturating_add)
    }
}

/// Everything the device side knows, as pushed to front ends.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub link: LinkState,
    pub motor: MotorStatus,
    /// Nearest calibrated RPM for the current PWM.
    pub rpm: u32,
    pub mode: OperatingMode,
    pub settings: ModeSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_recipe: Option<Recipe>,
    pub current_step_index: i64,
    pub is_running: bool,
    pub remaining_time_in_step_ms: u64,
    pub step_count: usize,
    pub elapsed_ms: u64,
    pub total_duration_ms: u64,
}

impl PlaybackState {
    pub fn idle() -> Self {
        Self {
            active_recipe: None,
            current_step_index: -1,
            is_running: false,
            remaining_time_in_step_ms: 0,
            step_count: 0,
            elapsed_ms: 0,
            total_duration_ms: 0,
        }
    }

    pub fn current_step(&self) -> Option<&RecipeStep> {
        let index = usize::try_from(self.current_step_index).ok()?;
        self.active_recipe.as_ref()?.steps.get(index)
    }
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self::idle()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemStatus {
    pub device: DeviceStatus,
    pub playback: PlaybackState,
}
