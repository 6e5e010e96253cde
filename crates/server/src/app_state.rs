use std::sync::Arc;

use crate::api::ApiContext;
use device_link::SerialBackend;
use shared::protocol::ServerEvent;
use tokio::sync::broadcast;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    /// Used by `/ports` to list what the link manager would see.
    pub(crate) backend: Arc<dyn SerialBackend>,
    pub(crate) port_identifiers: Vec<String>,
    pub(crate) events: broadcast::Sender<ServerEvent>,
}
