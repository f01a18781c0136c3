use shared_types::SafeModeReport;
use tokio::sync::mpsc;

use crate::dispatch::{DispatchQueue, SessionFactory};

/// Shared handles for the REST API, built once in `main`.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionFactory,
    pub dispatch: DispatchQueue,
    /// Intake of the safe-mode tracker.
    pub safe_mode_reports: mpsc::Sender<SafeModeReport>,
}
