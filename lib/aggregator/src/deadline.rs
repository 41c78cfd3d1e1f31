//! Cancellable one-shot deadline per correlation.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::{event::CorrelationId, service::AggregatorService};

/// Handle to a pending deadline task.
pub struct DeadlineHandle {
    fired: Arc<AtomicBool>,
    token: CancellationToken,
}

impl DeadlineHandle {
    /// Prevents a still-pending deadline from firing. Idempotent; returns
    /// whether the task had already run. A deadline that fires after the
    /// correlation was removed performs no work, so neither outcome needs
    /// handling by the caller.
    pub fn cancel(&self) -> bool {
        self.token.cancel();
        self.fired.load(Ordering::Acquire)
    }
}

/// Arms the deadline for `id`. When it fires, the service books the missing
/// slots as timeouts and terminates the correlation.
pub fn schedule(service: AggregatorService, id: CorrelationId, after: Duration) -> DeadlineHandle {
    let fired = Arc::new(AtomicBool::new(false));
    let token = CancellationToken::new();

    let task_fired = Arc::clone(&fired);
    let task_token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = task_token.cancelled() => {}
            () = tokio::time::sleep(after) => {
                task_fired.store(true, Ordering::Release);
                service.deadline_fired(id).await;
            }
        }
    });

    DeadlineHandle { fired, token }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::CallbackStatus,
        service::{AggregatorConfig, AggregatorService},
        state::CallbackOutcome,
    };

    fn test_service() -> AggregatorService {
        AggregatorService::new(AggregatorConfig {
            callback_url: "http://127.0.0.1:0/aggregate/callback".to_owned(),
            backend_urls: vec!["http://127.0.0.1:0".to_owned()],
            max_deadline: Duration::from_secs(27),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fire_books_missing_slots_and_terminates() {
        let service = test_service();
        let (id, state) = service.registry().create("p");
        state.set_expected(id, 3).unwrap();
        assert_eq!(
            state.record_callback(CallbackStatus::Ok),
            CallbackOutcome::Continue
        );
        let mut events = state.subscribe().unwrap();

        state.arm_deadline(schedule(service.clone(), id, Duration::from_millis(50)));
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(service.registry().get(&id).is_none());
        let tally = state.tally();
        assert_eq!(tally.received, 3);
        assert_eq!(tally.errors, 2);

        // Two synthetic timeouts, then the summary, then channel close.
        assert_eq!(events.recv().await.unwrap().status, CallbackStatus::Timeout);
        assert_eq!(events.recv().await.unwrap().status, CallbackStatus::Timeout);
        let summary = events.recv().await.unwrap();
        assert_eq!(summary.status, CallbackStatus::Complete);
        assert_eq!(summary.respondents, Some(1));
        assert_eq!(summary.errors, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_deadline_never_fires() {
        let service = test_service();
        let (id, state) = service.registry().create("p");
        state.set_expected(id, 3).unwrap();

        let handle = schedule(service.clone(), id, Duration::from_millis(50));
        assert!(!handle.cancel());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(service.registry().get(&id).is_some());
        assert_eq!(state.tally().errors, 0);
        // Repeated cancel stays a no-op.
        assert!(!handle.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn fire_after_removal_does_nothing() {
        let service = test_service();
        let (id, state) = service.registry().create("p");
        state.set_expected(id, 1).unwrap();

        let handle = schedule(service.clone(), id, Duration::from_millis(50));
        service.registry().remove(&id);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(handle.cancel());
        assert_eq!(state.tally().errors, 0);
        assert!(!state.is_terminated());
    }
}
