use tracing::{debug, error, info};

use lobby_db::{NewMessage, StoreError};
use lobby_types::close::Refusal;
use lobby_types::events::{DirectFrame, RoomFrame, ServerEvent};
use lobby_types::models::Message;

use crate::Gateway;
use crate::config::{FramePolicy, GatewayConfig};
use crate::session::SessionContext;

/// Which kind of chat a session was opened for. Decides the inbound frame
/// shape and what happens to frames that fail validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMode {
    Room,
    Direct,
}

impl ChatMode {
    pub fn frame_policy(&self, config: &GatewayConfig) -> FramePolicy {
        match self {
            Self::Room => config.room_invalid_frame,
            Self::Direct => config.direct_invalid_frame,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid message: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Validation(msg) => Self::Invalid(msg),
            other => Self::Store(other),
        }
    }
}

impl PipelineError {
    /// Problems with the frame itself, as opposed to the server failing.
    pub fn is_client_fault(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::Invalid(_))
    }
}

#[derive(Debug)]
pub enum FrameOutcome {
    /// Persisted and fanned out to `recipients` live sessions.
    Delivered { message: Message, recipients: usize },
    /// Ignored; the connection stays open.
    Dropped(String),
    /// The connection must be closed with this refusal.
    Close(Refusal),
}

/// Parse, validate, persist, then broadcast one inbound text frame.
pub async fn handle_inbound(gateway: &Gateway, ctx: &SessionContext, text: &str) -> FrameOutcome {
    match persist(gateway, ctx, text).await {
        Ok(message) => {
            let recipients = gateway
                .registry
                .broadcast(ctx.room.id, ServerEvent::chat_message(&message));
            debug!(
                "Message {} from {} in {} delivered to {} sessions",
                message.id, ctx.identity.username, ctx.room.link, recipients
            );
            FrameOutcome::Delivered { message, recipients }
        }
        Err(e) if e.is_client_fault() => match ctx.mode.frame_policy(&gateway.config) {
            FramePolicy::Drop => {
                debug!("Dropped frame from {} in {}: {}", ctx.identity.username, ctx.room.link, e);
                FrameOutcome::Dropped(e.to_string())
            }
            FramePolicy::Close => {
                info!("Closing {} in {}: {}", ctx.identity.username, ctx.room.link, e);
                FrameOutcome::Close(Refusal::ProcessingError)
            }
        },
        Err(e) => {
            error!("Error processing message from {} in {}: {}", ctx.identity.username, ctx.room.link, e);
            FrameOutcome::Close(Refusal::ProcessingError)
        }
    }
}

async fn persist(gateway: &Gateway, ctx: &SessionContext, text: &str) -> Result<Message, PipelineError> {
    let new = parse_frame(ctx, text)?;
    new.validate()?;

    let message = gateway.store.call(move |db| db.create_message(new)).await?;
    Ok(message)
}

fn parse_frame(ctx: &SessionContext, text: &str) -> Result<NewMessage, PipelineError> {
    let author_id = ctx.identity.id;
    let room_id = ctx.room.id;

    match ctx.mode {
        ChatMode::Room => {
            let frame: RoomFrame = serde_json::from_str(text)?;
            Ok(NewMessage {
                author_id,
                room_id,
                kind: frame.message_type,
                content: frame.message,
                file: frame.file,
                parent_id: frame.parent,
            })
        }
        ChatMode::Direct => {
            let frame: DirectFrame = serde_json::from_str(text)?;
            Ok(NewMessage::text(author_id, room_id, frame.message))
        }
    }
}
