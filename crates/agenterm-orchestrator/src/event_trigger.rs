//! Event trigger loop (§4.10): watches session status transitions and
//! project timers, synthesizing chat turns instead of requiring a human to
//! notice that a worker session went idle or needs a nudge.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agenterm_core::Storage;
use agenterm_types::{Lane, SessionStatus};
use tokio::sync::Mutex;
use tokio::time::interval;

use crate::chat::Orchestrator;

const POLL_INTERVAL: Duration = Duration::from_secs(15);
const PROJECT_TIMER_DEADLINE: Duration = Duration::from_secs(45);

/// Tracks the last observed status per session so only transitions (not
/// every poll) synthesize a chat turn.
pub struct EventTrigger {
    storage: Storage,
    orchestrator: Arc<Orchestrator>,
    last_status: Mutex<HashMap<String, SessionStatus>>,
    last_project_check: Mutex<HashMap<String, chrono::DateTime<chrono::Utc>>>,
}

impl EventTrigger {
    pub fn new(storage: Storage, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            storage,
            orchestrator,
            last_status: Mutex::new(HashMap::new()),
            last_project_check: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns the background poll loop; runs until the process exits.
    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = interval(POLL_INTERVAL);
            loop {
                ticker.tick().await;
                self.poll_once().await;
            }
        });
    }

    async fn poll_once(&self) {
        let Ok(sessions) = self.storage.list_sessions().await else {
            return;
        };
        let mut last_status = self.last_status.lock().await;
        for session in &sessions {
            let transitioned = match last_status.get(&session.id) {
                Some(prev) => {
                    *prev != session.status
                        && matches!(session.status, SessionStatus::Idle | SessionStatus::WaitingReview)
                }
                None => matches!(session.status, SessionStatus::Idle | SessionStatus::WaitingReview),
            };
            last_status.insert(session.id.clone(), session.status);

            if !transitioned {
                continue;
            }
            let Some(task_id) = &session.task_id else { continue };
            let Ok(Some(task)) = self.storage.get_task(task_id).await else { continue };

            let message = match session.status {
                SessionStatus::Idle => format!(
                    "Session `{}` (role `{}`) on task `{}` has gone idle. Decide the next action.",
                    session.id, session.role, task.title
                ),
                SessionStatus::WaitingReview => format!(
                    "Session `{}` (role `{}`) on task `{}` is waiting on review.",
                    session.id, session.role, task.title
                ),
                _ => continue,
            };

            let orchestrator = self.orchestrator.clone();
            let project_id = task.project_id.clone();
            tokio::spawn(async move {
                let mut rx = orchestrator.chat(project_id, message, Lane::Execution).await;
                while rx.recv().await.is_some() {}
            });
        }
        drop(last_status);

        self.check_project_timers().await;
    }

    /// `OnTimer(project_id)`: if a project hasn't been checked within the
    /// 45s deadline, synthesize a status-check turn on its demand lane.
    async fn check_project_timers(&self) {
        let Ok(projects) = self.storage.list_projects().await else {
            return;
        };
        let now = chrono::Utc::now();
        let mut last_check = self.last_project_check.lock().await;
        for project in &projects {
            let due = match last_check.get(&project.id) {
                Some(last) => now.signed_duration_since(*last).to_std().unwrap_or_default() >= PROJECT_TIMER_DEADLINE,
                None => true,
            };
            if !due {
                continue;
            }
            last_check.insert(project.id.clone(), now);

            let orchestrator = self.orchestrator.clone();
            let project_id = project.id.clone();
            tokio::spawn(async move {
                let mut rx = orchestrator
                    .chat(project_id, "Periodic check: summarize current progress and flag any blockers.".to_string(), Lane::Demand)
                    .await;
                while rx.recv().await.is_some() {}
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_interval_and_deadline_are_sane() {
        assert!(POLL_INTERVAL.as_secs() == 15);
        assert!(PROJECT_TIMER_DEADLINE.as_secs() == 45);
    }
}
