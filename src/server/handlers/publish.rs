use std::collections::HashMap;

use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
};

use crate::hub::{HubError, PublishReceipt};
use crate::outbound::notify::Notification;
use crate::server::AppState;
use crate::server::responses::ResponseBody;
use crate::wire::WireError;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

pub(crate) async fn publish(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<ResponseBody<PublishReceipt>>), HubError> {
    let topic_param = &state.hub.names().topic;
    let topic = query
        .get(topic_param)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| WireError::Missing(topic_param.clone()))?;

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_CONTENT_TYPE);

    let receipt = state
        .hub
        .publish(Notification::new(topic.clone(), content_type, body))
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ResponseBody::new(StatusCode::ACCEPTED, receipt)),
    ))
}
