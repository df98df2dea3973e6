//! Scheduler kept in memory, for dry runs and tests.
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::mop_errors::MopError;
use crate::scheduler::{ObservationConfig, SchedulerApi, SubmissionOutcome};

#[derive(Debug, Default)]
struct Queue {
    pending: Vec<(String, ObservationConfig)>,
    next_id: u64,
}

/// Accepts every request (or rejects every request, see [`MemoryScheduler::rejecting`])
/// and keeps the accepted ones as pending.
#[derive(Debug, Default)]
pub struct MemoryScheduler {
    queue: Mutex<Queue>,
    rejection: Option<String>,
}

impl MemoryScheduler {
    pub fn new() -> Self {
        MemoryScheduler::default()
    }

    /// A scheduler declining every request with `reason`.
    pub fn rejecting(reason: &str) -> Self {
        MemoryScheduler {
            rejection: Some(reason.to_string()),
            ..MemoryScheduler::default()
        }
    }

    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pending requests of every target.
    pub fn pending(&self) -> Vec<(String, ObservationConfig)> {
        self.queue().pending.clone()
    }

    /// Mark a request as executed.
    pub fn complete(&self, id: &str) -> bool {
        let mut queue = self.queue();
        let before = queue.pending.len();
        queue.pending.retain(|(pending_id, _)| pending_id != id);
        queue.pending.len() < before
    }
}

impl SchedulerApi for MemoryScheduler {
    fn submit(&self, configs: &[ObservationConfig]) -> Result<Vec<SubmissionOutcome>, MopError> {
        let mut queue = self.queue();
        Ok(configs
            .iter()
            .map(|config| match &self.rejection {
                Some(reason) => SubmissionOutcome::Rejected {
                    reason: reason.clone(),
                },
                None => {
                    queue.next_id += 1;
                    let id = format!("mem-{}", queue.next_id);
                    queue.pending.push((id.clone(), config.clone()));
                    SubmissionOutcome::Accepted { id }
                }
            })
            .collect())
    }

    fn list_pending(&self, target: &str) -> Result<Vec<ObservationConfig>, MopError> {
        Ok(self
            .queue()
            .pending
            .iter()
            .filter(|(_, c)| c.target == target)
            .map(|(_, c)| c.clone())
            .collect())
    }
}

#[cfg(test)]
mod memory_scheduler_test {
    use super::*;
    use crate::scheduler::scheduler_test::config;
    use crate::scheduler::submit_deduplicated;

    #[test]
    fn test_identical_submission_accepted_once() {
        let scheduler = MemoryScheduler::new();
        let c = config("ev", "ip", 10.0, 11.0);

        let first = submit_deduplicated(&scheduler, "ev", vec![c.clone()]).unwrap();
        assert_eq!(first.accepted, vec!["mem-1".to_string()]);
        let second = submit_deduplicated(&scheduler, "ev", vec![c]).unwrap();
        assert!(second.accepted.is_empty());
        assert_eq!(second.duplicates, 1);
        assert_eq!(scheduler.pending().len(), 1);

        assert!(scheduler.complete("mem-1"));
        assert!(scheduler.list_pending("ev").unwrap().is_empty());
    }

    #[test]
    fn test_rejections_reported() {
        let scheduler = MemoryScheduler::rejecting("proposal out of time");
        let report = submit_deduplicated(&scheduler, "ev", vec![config("ev", "ip", 10.0, 11.0)]).unwrap();
        assert_eq!(
            report.rejected,
            vec![MopError::SubmissionRejected {
                target: "ev".into(),
                reason: "proposal out of time".into()
            }]
        );
        assert!(scheduler.pending().is_empty());
    }
}
