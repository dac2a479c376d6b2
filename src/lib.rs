pub mod config;
pub mod events;
pub mod ids;
pub mod index;
pub mod res;
pub mod rooms;
pub mod session;
pub mod store;

use std::ops::Deref;

use axum::{
    Json, Router,
    extract::FromRef,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tower_sessions::{Expiry, SessionManagerLayer, cookie::SameSite};

use crate::session::KvSessionStore;

pub use config::{Config, RoomPolicy};
pub use rooms::{RoomError, Rooms};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub rooms: Rooms,
}

/// Builds the whole service: pages, room API and the session cookie carrying admission tokens.
/// Sessions are kept in the room store, so routers sharing a store share sessions too.
pub fn app(state: AppState, config: &Config) -> Router {
    let session_layer = SessionManagerLayer::new(KvSessionStore::new(state.rooms.store().clone()))
        .with_name(session::SESSION_COOKIE)
        .with_path("/")
        .with_http_only(true)
        .with_secure(config.cookie_secure)
        .with_same_site(SameSite::Strict)
        .with_expiry(Expiry::OnInactivity(time::Duration::seconds(
            config.policy.room_ttl as i64,
        )));

    Router::new()
        .route("/", get(index::index))
        .merge(rooms::router())
        .with_state(state)
        .layer(session_layer)
        .layer(TraceLayer::new_for_http())
}

pub type AppResult<T> = Result<T, AppError>;
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error) = match self.0.downcast_ref::<RoomError>() {
            Some(RoomError::Unauthorized) => (StatusCode::UNAUTHORIZED, "Unauthorized".to_owned()),
            Some(RoomError::NotFound) => (StatusCode::NOT_FOUND, "room-not-found".to_owned()),
            Some(RoomError::Full) => (StatusCode::CONFLICT, "room-full".to_owned()),
            Some(RoomError::Validation(reason)) => (StatusCode::UNPROCESSABLE_ENTITY, reason.clone()),
            _ => {
                tracing::error!(error = ?self.0, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_owned())
            }
        };

        (status, Json(json!({ "error": error }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub struct Markdown<T>(pub T);

impl<T> IntoResponse for Markdown<T>
where
    T: Deref<Target = str>
{
    fn into_response(self) -> axum::response::Response {
        use pulldown_cmark::{Parser, Options};

        let parser = Parser::new_ext(&*self.0, Options::ENABLE_TABLES);

        let mut html_output = String::new();
        pulldown_cmark::html::push_html(&mut html_output, parser);
        Html(html_output).into_response()
    }
}
