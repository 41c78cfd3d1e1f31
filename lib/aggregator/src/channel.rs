//! Bounded event channel between the callback producers and the stream
//! subscriber.
//!
//! Many producers (dispatch tasks, callback handlers, the deadline task)
//! write into one bounded channel that at most one subscriber drains. A full
//! channel is retried for a bounded interval; a persistently slow subscriber
//! loses events rather than blocking the producers.

use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::event::CallbackEvent;

/// Channel capacity. Large enough for every slot of a fan-out plus the
/// summary without the subscriber draining at all.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

const EMIT_RETRY_ATTEMPTS: u32 = 50;
const EMIT_RETRY_DELAY: Duration = Duration::from_millis(2);

pub struct EventSend {
    inner: mpsc::Sender<CallbackEvent>,
}

pub struct EventRecv {
    inner: mpsc::Receiver<CallbackEvent>,
}

pub fn new_pair() -> (EventSend, EventRecv) {
    let (send, recv) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    (EventSend { inner: send }, EventRecv { inner: recv })
}

impl EventSend {
    /// Pushes `event` onto the channel, retrying on transient backpressure.
    ///
    /// After [`EMIT_RETRY_ATTEMPTS`] full-channel attempts the event is
    /// dropped with a warning. A closed channel (subscriber gone) drops
    /// silently; the disconnect path tears the correlation down separately.
    pub async fn emit(&self, event: CallbackEvent) {
        let mut pending = event;
        for _ in 0..EMIT_RETRY_ATTEMPTS {
            match self.inner.try_send(pending) {
                Ok(()) => return,
                Err(TrySendError::Full(event)) => {
                    pending = event;
                    tokio::time::sleep(EMIT_RETRY_DELAY).await;
                }
                Err(TrySendError::Closed(event)) => {
                    tracing::trace!(
                        correlation_id = %event.correlation_id,
                        status = %event.status,
                        "event channel closed, dropping event"
                    );
                    return;
                }
            }
        }
        tracing::warn!(
            correlation_id = %pending.correlation_id,
            status = %pending.status,
            "subscriber too slow, dropping event after {EMIT_RETRY_ATTEMPTS} attempts"
        );
    }
}

impl EventRecv {
    /// Receives the next event; `None` once all senders are gone.
    pub async fn recv(&mut self) -> Option<CallbackEvent> {
        self.inner.recv().await
    }

    pub(crate) fn into_inner(self) -> mpsc::Receiver<CallbackEvent> {
        self.inner
    }
}

impl From<EventRecv> for mpsc::Receiver<CallbackEvent> {
    fn from(recv: EventRecv) -> Self {
        recv.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CallbackStatus, CorrelationId};

    fn event(status: CallbackStatus) -> CallbackEvent {
        CallbackEvent::synthetic("resource-1", "p", CorrelationId::generate(), status)
    }

    #[tokio::test]
    async fn events_arrive_in_emit_order() {
        let (send, mut recv) = new_pair();
        send.emit(event(CallbackStatus::Ok)).await;
        send.emit(event(CallbackStatus::Rejected)).await;
        send.emit(event(CallbackStatus::Timeout)).await;

        assert_eq!(recv.recv().await.unwrap().status, CallbackStatus::Ok);
        assert_eq!(recv.recv().await.unwrap().status, CallbackStatus::Rejected);
        assert_eq!(recv.recv().await.unwrap().status, CallbackStatus::Timeout);
    }

    #[tokio::test]
    async fn full_channel_drops_after_bounded_retry() {
        let (send, mut recv) = new_pair();
        for _ in 0..EVENT_CHANNEL_CAPACITY {
            send.emit(event(CallbackStatus::Ok)).await;
        }
        // Nobody draining: this one must be dropped, not block forever.
        send.emit(event(CallbackStatus::Error)).await;

        let mut drained = 0;
        while let Ok(received) = recv.inner.try_recv() {
            assert_eq!(received.status, CallbackStatus::Ok);
            drained += 1;
        }
        assert_eq!(drained, EVENT_CHANNEL_CAPACITY);
    }

    #[tokio::test]
    async fn emit_into_closed_channel_is_a_no_op() {
        let (send, recv) = new_pair();
        drop(recv);
        send.emit(event(CallbackStatus::Ok)).await;
    }
}
