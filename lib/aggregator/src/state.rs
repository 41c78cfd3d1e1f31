//! Per-correlation aggregation state.
//!
//! Counters are plain atomics; the termination decision is serialized through
//! the single-shot `terminated` flag so that exactly one producer (callback,
//! dispatch synthetic, deadline, or `set_expected` catching up with early
//! synthetics) observes the crossing. Registry removal remains the final
//! serialization point for the termination side effects.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Mutex,
};

use tokio_util::sync::CancellationToken;

use crate::{
    channel::{self, EventRecv, EventSend},
    deadline::DeadlineHandle,
    event::{CallbackStatus, CorrelationId},
    Error, Result,
};

/// What the recording producer must do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// More responses outstanding.
    Continue,
    /// This producer observed the crossing and owns termination.
    Terminate,
    /// The correlation already terminated; the event must be discarded.
    Stale,
}

pub struct AggregationState {
    patient_id: String,
    expected: AtomicU32,
    received: AtomicU32,
    respondents: AtomicU32,
    errors: AtomicU32,
    terminated: AtomicBool,
    events: EventSend,
    /// Serializes record+emit pairs so the channel order matches the
    /// recording order and nothing can land after the summary.
    emit_order: tokio::sync::Mutex<()>,
    receiver: Mutex<Option<EventRecv>>,
    dispatch_cancel: CancellationToken,
    deadline: Mutex<Option<DeadlineHandle>>,
}

/// Snapshot of the counters, used for summaries and assertions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tally {
    pub expected: u32,
    pub received: u32,
    pub respondents: u32,
    pub errors: u32,
}

impl Tally {
    /// Responses that were neither payload-carrying nor technical failures.
    #[must_use]
    pub const fn rejections(&self) -> u32 {
        self.received - self.respondents - self.errors
    }
}

impl AggregationState {
    #[must_use]
    pub fn new(patient_id: impl Into<String>) -> Self {
        let (events, receiver) = channel::new_pair();
        Self {
            patient_id: patient_id.into(),
            expected: AtomicU32::new(0),
            received: AtomicU32::new(0),
            respondents: AtomicU32::new(0),
            errors: AtomicU32::new(0),
            terminated: AtomicBool::new(false),
            events,
            emit_order: tokio::sync::Mutex::new(()),
            receiver: Mutex::new(Some(receiver)),
            dispatch_cancel: CancellationToken::new(),
            deadline: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    /// Sets the number of responses to wait for. May only be called once,
    /// with `n >= 1`.
    ///
    /// Dispatch synthetics can land before `expected` is known; the check
    /// after the store catches a crossing those early events already caused.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidExpectedCount`] for `n < 1`,
    /// [`Error::ExpectedAlreadySet`] on a repeated call.
    pub fn set_expected(&self, id: CorrelationId, n: u32) -> Result<CallbackOutcome> {
        if n < 1 {
            return Err(Error::InvalidExpectedCount { got: n });
        }
        self.expected
            .compare_exchange(0, n, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::ExpectedAlreadySet(id))?;

        if self.received.load(Ordering::SeqCst) >= n && !self.terminated.swap(true, Ordering::SeqCst)
        {
            return Ok(CallbackOutcome::Terminate);
        }
        Ok(CallbackOutcome::Continue)
    }

    /// Records one backend outcome and returns the authoritative decision.
    /// At most one call across all producers returns
    /// [`CallbackOutcome::Terminate`].
    pub fn record_callback(&self, status: CallbackStatus) -> CallbackOutcome {
        debug_assert!(status != CallbackStatus::Complete);
        if self.terminated.load(Ordering::SeqCst) {
            return CallbackOutcome::Stale;
        }

        let received = self.received.fetch_add(1, Ordering::SeqCst) + 1;
        match status {
            CallbackStatus::Ok => {
                self.respondents.fetch_add(1, Ordering::SeqCst);
            }
            status if status.is_technical_failure() => {
                self.errors.fetch_add(1, Ordering::SeqCst);
            }
            // Business rejection: counts only towards `received`.
            _ => {}
        }

        let expected = self.expected.load(Ordering::SeqCst);
        if expected > 0
            && received >= expected
            && !self.terminated.swap(true, Ordering::SeqCst)
        {
            CallbackOutcome::Terminate
        } else {
            CallbackOutcome::Continue
        }
    }

    /// Books one slot the deadline gave up on. Only the deadline task, which
    /// already owns termination, may call this.
    pub fn record_deadline_miss(&self) {
        self.received.fetch_add(1, Ordering::SeqCst);
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    /// Claims the termination decision outside the counting paths (deadline
    /// fire, shutdown). Returns `false` if somebody else already owns it.
    pub fn claim_termination(&self) -> bool {
        !self.terminated.swap(true, Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn tally(&self) -> Tally {
        Tally {
            expected: self.expected.load(Ordering::SeqCst),
            received: self.received.load(Ordering::SeqCst),
            respondents: self.respondents.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
        }
    }

    #[must_use]
    pub fn events(&self) -> &EventSend {
        &self.events
    }

    pub(crate) fn emit_order(&self) -> &tokio::sync::Mutex<()> {
        &self.emit_order
    }

    /// Hands out the single subscriber end; `None` once taken.
    pub fn subscribe(&self) -> Option<EventRecv> {
        self.receiver
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Token guarding the in-flight dispatch group.
    #[must_use]
    pub fn dispatch_token(&self) -> CancellationToken {
        self.dispatch_cancel.clone()
    }

    pub fn arm_deadline(&self, handle: DeadlineHandle) {
        let mut slot = self
            .deadline
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(previous) = slot.replace(handle) {
            previous.cancel();
        }
    }

    /// Cancels a still-pending deadline. Idempotent.
    pub fn cancel_deadline(&self) {
        let handle = self
            .deadline
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    /// Cancels both the dispatch group and the deadline. Safe to call after
    /// either has already fired.
    pub fn cancel_all(&self) {
        self.dispatch_cancel.cancel();
        self.cancel_deadline();
    }
}
