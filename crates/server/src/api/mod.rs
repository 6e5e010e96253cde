use std::time::Duration;

use device_link::LinkHandle;
use sequencer::SequencerHandle;
use shared::{
    domain::{PlaybackState, Recipe, StepSettings, SystemStatus},
    error::{ApiError, ApiException, ErrorCode},
    protocol::{ClientRequest, ServerEvent},
};
use storage::Storage;
use tokio::time::timeout;
use tracing::{info, warn};

const STOP_SETTLE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub link: LinkHandle,
    pub sequencer: SequencerHandle,
}

/// Where the outcome of a request should go.
#[derive(Debug)]
pub enum Reply {
    None,
    /// Only to the session that asked.
    Direct(ServerEvent),
    /// To every attached session.
    Broadcast(ServerEvent),
}

pub fn system_status(ctx: &ApiContext) -> SystemStatus {
    SystemStatus {
        device: ctx.link.status(),
        playback: ctx.sequencer.status(),
    }
}

pub async fn list_recipes(ctx: &ApiContext) -> Result<Vec<Recipe>, ApiError> {
    ctx.storage.list_recipes().await.map_err(internal)
}

pub async fn save_recipe(ctx: &ApiContext, recipe: Recipe) -> Result<Vec<Recipe>, ApiError> {
    ctx.storage.save_recipe(recipe).await.map_err(internal)
}

pub async fn delete_recipe(ctx: &ApiContext, recipe_id: &str) -> Result<Vec<Recipe>, ApiError> {
    ctx.storage.delete_recipe(recipe_id).await.map_err(internal)
}

/// Loads a stored recipe and hands it to the sequencer. Starting while
/// another recipe plays is left to the sequencer to ignore.
pub async fn activate_recipe(ctx: &ApiContext, recipe_id: &str) -> Result<(), ApiError> {
    let recipe = ctx
        .storage
        .load_recipe(recipe_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "recipe not found"))?;
    if ctx.sequencer.status().is_running {
        warn!(recipe_id, "api: activation while another recipe is running");
    }
    info!(recipe_id, "api: activating recipe");
    ctx.sequencer.start_recipe(recipe);
    Ok(())
}

/// Waits briefly for the sequencer to settle so the returned state reflects the stop.
pub async fn stop_recipe(ctx: &ApiContext) -> PlaybackState {
    let mut playback = ctx.sequencer.subscribe();
    ctx.sequencer.stop_recipe();
    if timeout(STOP_SETTLE_TIMEOUT, playback.wait_for(|p| !p.is_running))
        .await
        .is_err()
    {
        warn!("api: sequencer did not report idle after stop");
    }
    ctx.sequencer.status()
}

pub async fn handle_request(ctx: &ApiContext, request: ClientRequest) -> Result<Reply, ApiError> {
    let link = &ctx.link;
    match request {
        ClientRequest::SetMotorPwm { pwm } => link.set_motor_pwm(pwm),
        ClientRequest::SetMotorRpm { rpm } => link.set_motor_rpm(rpm),
        ClientRequest::SetMotorDirection { direction } => link.set_motor_direction(direction),
        ClientRequest::StartMotor => link.start_motor(),
        ClientRequest::StopMotor => link.stop_motor(),
        ClientRequest::StartOscillation { settings } => link.start_oscillation(settings),
        ClientRequest::SetOperatingMode { mode } => link.set_operating_mode(mode),
        ClientRequest::SetContinuousSettings { settings } => {
            link.set_mode_settings(StepSettings::Continuous(settings))
        }
        ClientRequest::SetOscillationSettings { settings } => {
            link.set_mode_settings(StepSettings::Oscillation(settings))
        }
        ClientRequest::SetPulseSettings { settings } => {
            link.set_mode_settings(StepSettings::Pulse(settings))
        }
        ClientRequest::SetVibrationSettings { settings } => {
            link.set_mode_settings(StepSettings::Vibration(settings))
        }
        ClientRequest::RunTimed { pwm, duration_ms } => link.run_timed(pwm, duration_ms),
        ClientRequest::Beep {
            duration_ms,
            frequency_hz,
        } => link.beep(duration_ms, frequency_hz),
        ClientRequest::Reconnect => link.reconnect(),
        ClientRequest::SaveRecipe { recipe } => {
            let recipes = save_recipe(ctx, recipe).await?;
            return Ok(Reply::Broadcast(ServerEvent::RecipesUpdated { recipes }));
        }
        ClientRequest::DeleteRecipe { recipe_id } => {
            let recipes = delete_recipe(ctx, &recipe_id).await?;
            return Ok(Reply::Broadcast(ServerEvent::RecipesUpdated { recipes }));
        }
        ClientRequest::ActivateRecipe { recipe_id } => activate_recipe(ctx, &recipe_id).await?,
        ClientRequest::StopRecipe => {
            stop_recipe(ctx).await;
        }
        ClientRequest::ListRecipes => {
            let recipes = list_recipes(ctx).await?;
            return Ok(Reply::Direct(ServerEvent::RecipesUpdated { recipes }));
        }
        ClientRequest::RequestStatus => {
            return Ok(Reply::Direct(ServerEvent::StatusUpdate {
                status: system_status(ctx),
            }));
        }
    }
    Ok(Reply::None)
}

/// Validation failures raised below keep their code; anything else is internal.
pub(crate) fn internal(err: anyhow::Error) -> ApiError {
    match err.downcast::<ApiException>() {
        Ok(exception) => exception.into(),
        Err(err) => ApiError::new(ErrorCode::Internal, format!("{err:#}")),
    }
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
