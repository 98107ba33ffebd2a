use std::sync::Arc;

use chrono_tz::Tz;

use crate::ledger::SessionLedger;
use crate::verify::TokenVerifier;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<SessionLedger>,
    pub verifier: Arc<dyn TokenVerifier>,
    /// Time zone used for human-readable reset times
    pub display_tz: Tz,
}
