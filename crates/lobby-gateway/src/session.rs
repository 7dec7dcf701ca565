//! Per-connection lifecycle as a chain of typestates:
//! `Connecting -> Authenticating -> Authorizing -> Joined`.
//!
//! Each transition consumes the previous state, so a frame can only reach
//! the message pipeline through a `SessionContext`, which only a `Joined`
//! session hands out.

use std::fmt;
use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use lobby_db::StoreError;
use lobby_types::close::Refusal;
use lobby_types::events::ServerEvent;
use lobby_types::models::{Room, UserIdentity};

use crate::Gateway;
use crate::gate::may_join;
use crate::identity::{AuthError, IdentityVerifier, bearer_token};
use crate::pipeline::ChatMode;
use crate::registry::{EventReceiver, RoomSubscription, SessionId};

/// What the client asked to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTarget {
    Room { link: String },
    Direct { username: String },
}

impl ChatTarget {
    pub fn mode(&self) -> ChatMode {
        match self {
            Self::Room { .. } => ChatMode::Room,
            Self::Direct { .. } => ChatMode::Direct,
        }
    }
}

impl fmt::Display for ChatTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Room { link } => write!(f, "room {link}"),
            Self::Direct { username } => write!(f, "direct chat with {username}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Authenticating,
    Authorizing,
    Joined,
    Closed,
    Failed(Refusal),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Authenticating => f.write_str("authenticating"),
            Self::Authorizing => f.write_str("authorizing"),
            Self::Joined => f.write_str("joined"),
            Self::Closed => f.write_str("closed"),
            Self::Failed(refusal) => write!(f, "failed({})", refusal.as_str()),
        }
    }
}

/// A refused connection attempt and the phase it was refused in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Failure {
    pub phase: Phase,
    pub refusal: Refusal,
}

impl Failure {
    fn at(phase: Phase) -> impl FnOnce(Refusal) -> Self {
        move |refusal| Self { phase, refusal }
    }

    pub fn terminal(&self) -> Phase {
        Phase::Failed(self.refusal)
    }
}

pub struct Connecting {
    target: ChatTarget,
    token: Option<String>,
}

impl Connecting {
    /// Pick the bearer token out of the upgrade request's headers.
    pub fn new(target: ChatTarget, headers: &HeaderMap) -> Self {
        Self::with_token(target, bearer_token(headers))
    }

    pub fn with_token(target: ChatTarget, token: Option<String>) -> Self {
        Self { target, token }
    }

    pub fn target(&self) -> &ChatTarget {
        &self.target
    }

    pub fn begin(self) -> Result<Authenticating, Refusal> {
        match self.token {
            Some(token) if !token.is_empty() => Ok(Authenticating {
                target: self.target,
                token,
            }),
            _ => Err(Refusal::NoToken),
        }
    }
}

pub struct Authenticating {
    target: ChatTarget,
    token: String,
}

impl Authenticating {
    pub async fn authenticate(self, verifier: &IdentityVerifier) -> Result<Authorizing, Refusal> {
        match verifier.verify(&self.token).await {
            Ok(identity) => Ok(Authorizing {
                target: self.target,
                identity,
            }),
            Err(AuthError::Store(e)) => {
                warn!("Token subject lookup failed: {}", e);
                Err(Refusal::ProcessingError)
            }
            Err(e) => {
                debug!("Rejected token for {}: {}", self.target, e);
                Err(Refusal::InvalidToken)
            }
        }
    }
}

pub struct Authorizing {
    target: ChatTarget,
    identity: UserIdentity,
}

impl Authorizing {
    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    /// Resolve the target room, check the caller may enter it and subscribe
    /// the session. Direct chats also load the room's history, after the
    /// subscription exists so nothing sent in between is missed.
    pub async fn authorize(self, gateway: &Gateway) -> Result<Joined, Refusal> {
        let mode = self.target.mode();
        let identity = self.identity;

        let room = match &self.target {
            ChatTarget::Room { link } => resolve_room(gateway, &identity, link).await?,
            ChatTarget::Direct { username } => {
                resolve_direct_room(gateway, &identity, username).await?
            }
        };

        let (handle, receiver) = gateway.registry.open_session(identity.clone());
        let subscription = gateway.registry.subscribe(room.id, &handle);

        let mut outbound = Outbound {
            receiver,
            history: None,
            replayed_through: None,
        };

        if mode == ChatMode::Direct {
            let room_id = room.id;
            let history = gateway
                .store
                .call(move |db| db.list_messages(room_id))
                .await
                .map_err(processing_error)?;

            outbound.replayed_through = history.last().map(|m| m.created_at);
            outbound.history = ServerEvent::previous_messages(&history);
        }

        info!(
            "{} {} {} room {} (session {})",
            identity.username,
            Phase::Joined,
            room.kind,
            room.link,
            handle.id
        );

        Ok(Joined {
            context: SessionContext {
                session_id: handle.id,
                identity,
                room: Arc::new(room),
                mode,
            },
            outbound,
            subscription,
        })
    }
}

async fn resolve_room(gateway: &Gateway, identity: &UserIdentity, link: &str) -> Result<Room, Refusal> {
    let lookup = link.to_string();
    let room = gateway
        .store
        .call(move |db| db.get_room_by_link(&lookup))
        .await
        .map_err(|e| match e {
            StoreError::NotFound(_) => Refusal::NoSuchRoom,
            other => processing_error(other),
        })?;

    let allowed = may_join(&gateway.store, identity, &room)
        .await
        .map_err(processing_error)?;
    if !allowed {
        info!("{} refused from room {}: not a member", identity.username, room.link);
        return Err(Refusal::NotAMember);
    }

    Ok(room)
}

async fn resolve_direct_room(
    gateway: &Gateway,
    identity: &UserIdentity,
    username: &str,
) -> Result<Room, Refusal> {
    if username == identity.username {
        return Err(Refusal::SelfConnect);
    }

    let lookup = username.to_string();
    let other = gateway
        .store
        .call(move |db| db.get_user_by_username(&lookup))
        .await
        .map_err(processing_error)?
        .ok_or(Refusal::NoSuchUser)?
        .identity();

    if other.id == identity.id {
        return Err(Refusal::SelfConnect);
    }

    let me = identity.clone();
    gateway
        .store
        .call(move |db| db.get_or_create_direct_room(&me, &other))
        .await
        .map_err(processing_error)
}

fn processing_error(e: StoreError) -> Refusal {
    warn!("Store failure while opening session: {}", e);
    Refusal::ProcessingError
}

/// Immutable facts about a joined session, shared with the message pipeline.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub identity: UserIdentity,
    pub room: Arc<Room>,
    pub mode: ChatMode,
}

/// Everything queued for the client: a one-time history replay, then live
/// events from the registry.
pub struct Outbound {
    receiver: EventReceiver,
    history: Option<ServerEvent>,
    replayed_through: Option<DateTime<Utc>>,
}

impl Outbound {
    /// The history replay, if any. Returns `Some` at most once.
    pub fn take_history(&mut self) -> Option<ServerEvent> {
        self.history.take()
    }

    /// Next live event, skipping events already covered by the replay.
    /// Cancel safe. `None` once the registry side is gone.
    pub async fn next_live(&mut self) -> Option<Arc<ServerEvent>> {
        loop {
            let event = self.receiver.recv().await?;
            match (self.replayed_through, event.timestamp()) {
                (Some(through), Some(at)) if at <= through => continue,
                _ => return Some(event),
            }
        }
    }
}

pub struct Joined {
    context: SessionContext,
    outbound: Outbound,
    subscription: RoomSubscription,
}

impl Joined {
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn into_parts(self) -> (SessionContext, Outbound, RoomSubscription) {
        (self.context, self.outbound, self.subscription)
    }
}

/// Drive a connection attempt through every phase up to `Joined`.
pub async fn establish(gateway: &Gateway, connecting: Connecting) -> Result<Joined, Failure> {
    let authenticating = connecting.begin().map_err(Failure::at(Phase::Connecting))?;
    let authorizing = authenticating
        .authenticate(&gateway.verifier)
        .await
        .map_err(Failure::at(Phase::Authenticating))?;
    authorizing
        .authorize(gateway)
        .await
        .map_err(Failure::at(Phase::Authorizing))
}
