use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use pacer_core::domain::message::MessageFragment;
use pacer_core::domain::prospect::ConversationId;
use pacer_core::errors::{ApplicationError, DomainError, InterfaceError, ValidationError};
use pacer_core::scheduling::{format_timestamp, parse_scheduled_for};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::health::AppState;

#[derive(Clone, Debug, Deserialize)]
pub struct InboundMessage {
    pub conversation_id: String,
    pub text: String,
    /// RFC 3339 with offset; defaults to the time the request arrived.
    #[serde(default)]
    pub received_at: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InboundAccepted {
    pub status: &'static str,
    pub conversation_id: String,
    pub received_at: String,
    pub correlation_id: String,
}

#[derive(Debug)]
pub struct ApiError(pub InterfaceError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": self.0.user_message(),
            "detail": self.0.to_string(),
            "correlation_id": self.0.correlation_id(),
        });
        (status, Json(body)).into_response()
    }
}

pub async fn inbound(
    State(state): State<AppState>,
    Json(message): Json<InboundMessage>,
) -> Result<(StatusCode, Json<InboundAccepted>), ApiError> {
    let correlation_id = Uuid::new_v4().to_string();

    let fragment = fragment_from_request(message)
        .map_err(|error| ApiError(error.into_interface(correlation_id.clone())))?;
    let conversation_id = fragment.conversation_id.clone();
    let received_at = fragment.received_at;

    state.buffer.ingest(fragment).await.map_err(|error| {
        warn!(
            event_name = "ingress.inbound.rejected",
            conversation_id = %conversation_id,
            correlation_id = %correlation_id,
            error = %error,
            "buffer refused inbound fragment"
        );
        ApiError(ApplicationError::Integration(error.to_string()).into_interface(correlation_id.clone()))
    })?;

    debug!(
        event_name = "ingress.inbound.accepted",
        conversation_id = %conversation_id,
        correlation_id = %correlation_id,
        "inbound fragment buffered"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(InboundAccepted {
            status: "accepted",
            conversation_id: conversation_id.0,
            received_at: format_timestamp(received_at),
            correlation_id,
        }),
    ))
}

fn fragment_from_request(message: InboundMessage) -> Result<MessageFragment, ApplicationError> {
    let conversation_id = message.conversation_id.trim();
    if conversation_id.is_empty() {
        return Err(ValidationError::EmptyConversationId.into());
    }
    if message.text.trim().is_empty() {
        return Err(DomainError::InvariantViolation("message text must not be empty".to_string())
            .into());
    }

    let received_at = match message.received_at.as_deref() {
        Some(raw) => parse_scheduled_for(raw)?,
        None => Utc::now(),
    };

    Ok(MessageFragment::new(ConversationId(conversation_id.to_string()), message.text, received_at))
}
