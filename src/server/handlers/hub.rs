use axum::{Form, extract::State, http::StatusCode};

use crate::hub::{HandshakeResponse, HubError};
use crate::server::AppState;
use crate::wire::HandshakeParams;

/// Form-encoded subscribe/unsubscribe call.
///
/// `204` once verified, `202` when verification was deferred.
pub(crate) async fn handshake(
    State(state): State<AppState>,
    Form(pairs): Form<Vec<(String, String)>>,
) -> Result<StatusCode, HubError> {
    let params = HandshakeParams::from_pairs(pairs, state.hub.names())?;

    match state.hub.handle_handshake(params).await? {
        HandshakeResponse::Verified => Ok(StatusCode::NO_CONTENT),
        HandshakeResponse::Accepted => Ok(StatusCode::ACCEPTED),
    }
}
