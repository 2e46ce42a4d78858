use std::sync::Arc;

use crate::orchestrator::WebhookOrchestrator;
use crate::processor::EventProcessor;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<WebhookOrchestrator>,
    pub processor: Arc<dyn EventProcessor>,
    /// Bearer token guarding `/admin`. `None` leaves the admin API open.
    pub admin_token: Option<String>,
}
