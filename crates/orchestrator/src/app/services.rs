use std::sync::Arc;

use crate::domain::Orchestrator;

/// Application dependencies - simple struct with Arc-wrapped services
pub struct ApplicationServices {
    pub orchestrator: Arc<Orchestrator>,
}
