use crate::modules::context::BackgroundTask;
use crate::modules::credentials::TokenRefreshTask;
use crate::modules::reconciler::ReconciliationTask;
use crate::modules::settings::cli::SETTINGS;

pub mod queue;

pub struct PeriodicTasks;

impl PeriodicTasks {
    pub fn start_background_tasks() {
        TokenRefreshTask::start();
        if SETTINGS.mailsift_auto_start_reconciliation {
            ReconciliationTask::start();
        }
    }
}
