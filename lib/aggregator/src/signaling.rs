//! Ephemeral, token-protected signaling sessions.
//!
//! A session is a tiny pub/sub channel two peers use to exchange connection
//! setup messages before they move to their own data path. Sessions live in
//! memory, are guarded by a bearer token on every operation, and disappear on
//! TTL expiry or once their subscribers are gone after traffic flowed.

use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Subscribers per session: the initiator and the receiver.
const MAX_SUBSCRIBERS: usize = 2;

/// Queue depth per subscriber; signaling traffic is a handful of messages.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 16;

const TOKEN_BYTES: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
#[serde(transparent)]
#[repr(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, fmt)
    }
}

#[derive(ThisError, Debug, PartialEq, Eq)]
pub enum SignalingError {
    #[error("unknown or expired session")]
    NotFound,
    #[error("invalid session token")]
    Unauthorized,
    #[error("session already has the maximum number of subscribers")]
    Conflict,
}

#[derive(Clone, Debug)]
pub struct SignalingConfig {
    pub ttl: Duration,
    /// Opaque ICE server configuration echoed to the client verbatim.
    pub ice_servers: serde_json::Value,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            ice_servers: serde_json::json!([
                { "urls": ["stun:stun.l.google.com:19302"] }
            ]),
        }
    }
}

/// Handed to the creating client; contains everything a peer needs to join.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub session_id: SessionId,
    pub token: String,
    #[cfg_attr(feature = "utoipa", schema(value_type = Object))]
    pub ice_servers: serde_json::Value,
    pub ttl_seconds: u64,
}

struct Session {
    token: String,
    expires_at: Instant,
    expiry: CancellationToken,
    subscribers: Mutex<Vec<mpsc::Sender<serde_json::Value>>>,
    /// Set once the first subscriber attached; a session that was active and
    /// lost all its subscribers is torn down early.
    activated: Mutex<bool>,
}

/// Process-wide signaling session map.
pub struct SignalingSessions {
    config: SignalingConfig,
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
}

/// Token comparison without short-circuit: every byte is inspected
/// regardless of where the first mismatch sits.
fn tokens_match(expected: &str, presented: &str) -> bool {
    let expected = expected.as_bytes();
    let presented = presented.as_bytes();
    if expected.len() != presented.len() {
        return false;
    }
    expected
        .iter()
        .zip(presented)
        .fold(0u8, |diff, (lhs, rhs)| diff | (lhs ^ rhs))
        == 0
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl SignalingSessions {
    #[must_use]
    pub fn new(config: SignalingConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Creates a session and arms its TTL timer.
    pub fn create(&self) -> SessionDescriptor {
        let id = SessionId::generate();
        let token = generate_token();
        let ttl = self.config.ttl;
        let expiry = CancellationToken::new();

        let session = Arc::new(Session {
            token: token.clone(),
            expires_at: Instant::now() + ttl,
            expiry: expiry.clone(),
            subscribers: Mutex::new(Vec::new()),
            activated: Mutex::new(false),
        });
        self.sessions.insert(id, session);

        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            tokio::select! {
                () = expiry.cancelled() => {}
                () = tokio::time::sleep(ttl) => {
                    if sessions.remove(&id).is_some() {
                        tracing::debug!(session_id = %id, "signaling session expired");
                    }
                }
            }
        });

        tracing::info!(session_id = %id, ttl_seconds = ttl.as_secs(), "signaling session created");
        SessionDescriptor {
            session_id: id,
            token,
            ice_servers: self.config.ice_servers.clone(),
            ttl_seconds: ttl.as_secs(),
        }
    }

    fn authorized(
        &self,
        id: &SessionId,
        token: &str,
    ) -> Result<Arc<Session>, SignalingError> {
        let session = self
            .sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SignalingError::NotFound)?;
        if !tokens_match(&session.token, token) {
            return Err(SignalingError::Unauthorized);
        }
        Ok(session)
    }

    /// Attaches a subscriber; it receives every signal posted after this
    /// call.
    ///
    /// # Errors
    ///
    /// [`SignalingError::NotFound`] for unknown/expired sessions,
    /// [`SignalingError::Unauthorized`] on a bad token,
    /// [`SignalingError::Conflict`] beyond the initiator + receiver pair.
    pub fn subscribe(
        &self,
        id: &SessionId,
        token: &str,
    ) -> Result<mpsc::Receiver<serde_json::Value>, SignalingError> {
        let session = self.authorized(id, token)?;
        let mut subscribers = session
            .subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        subscribers.retain(|sender| !sender.is_closed());
        if subscribers.len() >= MAX_SUBSCRIBERS {
            return Err(SignalingError::Conflict);
        }

        let (send, recv) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        subscribers.push(send);
        *session
            .activated
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = true;
        tracing::debug!(session_id = %id, subscribers = subscribers.len(), "signaling subscriber attached");
        Ok(recv)
    }

    /// Fans `payload` out to every live subscriber. A session that was
    /// active and has lost all subscribers is closed instead.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`Self::subscribe`], minus the conflict case.
    pub fn signal(
        &self,
        id: &SessionId,
        token: &str,
        payload: serde_json::Value,
    ) -> Result<(), SignalingError> {
        let session = self.authorized(id, token)?;
        let drained = {
            let mut subscribers = session
                .subscribers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            subscribers.retain(|sender| sender.try_send(payload.clone()).is_ok());
            let activated = *session
                .activated
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            activated && subscribers.is_empty()
        };
        if drained {
            self.close(id);
            return Err(SignalingError::NotFound);
        }
        Ok(())
    }

    /// Remaining lifetime, for the liveness probe.
    ///
    /// # Errors
    ///
    /// [`SignalingError::NotFound`] / [`SignalingError::Unauthorized`] as
    /// with every session operation.
    pub fn ttl_remaining(&self, id: &SessionId, token: &str) -> Result<Duration, SignalingError> {
        let session = self.authorized(id, token)?;
        Ok(session
            .expires_at
            .saturating_duration_since(Instant::now()))
    }

    /// Removes a session, cancelling its TTL timer and dropping all
    /// subscriber channels.
    pub fn close(&self, id: &SessionId) {
        if let Some((_, session)) = self.sessions.remove(id) {
            session.expiry.cancel();
            session
                .subscribers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clear();
            tracing::debug!(session_id = %id, "signaling session closed");
        }
    }

    /// Drops every live session; part of process shutdown.
    pub fn shutdown(&self) {
        let ids: Vec<_> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.close(&id);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
