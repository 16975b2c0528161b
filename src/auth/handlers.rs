use axum::{extract::State, Json};
use serde::Deserialize;
use tracing::{info, instrument};

use super::authorizer::ConnectionGrant;
use crate::shared::{AppError, AppState};

#[derive(Debug, Deserialize)]
pub struct AuthorizeConnectionRequest {
    pub token: String,
}

/// HTTP handler for the connection authorization callout
///
/// POST /auth/connection
/// Returns the permission grant for the token's room and user
#[instrument(name = "authorize_connection", skip(state, request))]
pub async fn authorize_connection(
    State(state): State<AppState>,
    Json(request): Json<AuthorizeConnectionRequest>,
) -> Result<Json<ConnectionGrant>, AppError> {
    let grant = state.authorizer.authorize_connection(&request.token).await?;
    info!(room_id = %grant.room_id, user_id = %grant.user_id, "Grant issued");
    Ok(Json(grant))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::JoinAttributes;
    use crate::room::CreateRoomRequest;
    use crate::shared::test_utils::AppStateBuilder;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        routing::post,
        Router,
    };
    use tower::ServiceExt; // for `oneshot`

    fn app(state: AppState) -> Router {
        Router::new()
            .route("/auth/connection", post(authorize_connection))
            .with_state(state)
    }

    fn auth_request(body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/auth/connection")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_authorize_connection_handler() {
        let app_state = AppStateBuilder::new().with_jwt_secret("handler-secret").build();
        app_state.rooms.create(CreateRoomRequest::new("r1")).await.unwrap();
        let token = app_state
            .authorizer
            .issue_join_token("r1", "u1", JoinAttributes::default())
            .await
            .unwrap();

        let body = serde_json::json!({ "token": token }).to_string();
        let response = app(app_state).oneshot(auth_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let grant: ConnectionGrant = serde_json::from_slice(&body).unwrap();
        assert_eq!(grant.room_id, "r1");
        assert_eq!(grant.user_id, "u1");
    }

    #[tokio::test]
    async fn test_invalid_token_is_unauthorized() {
        let app_state = AppStateBuilder::new().build();

        let body = r#"{"token": "not-a-jwt"}"#.to_string();
        let response = app(app_state).oneshot(auth_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_missing_token_field() {
        let app_state = AppStateBuilder::new().build();

        let response = app(app_state)
            .oneshot(auth_request(r#"{"jwt": "x"}"#.to_string()))
            .await
            .unwrap();

        // Should return 422 Unprocessable Entity for invalid JSON structure
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
