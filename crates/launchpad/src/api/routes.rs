//! API route definitions.

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware,
    routing::{get, post, put},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::auth::auth_middleware;

use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let cors = build_cors_layer(state.auth.allowed_origins());
    let auth_state = state.auth.clone();

    // Everything but /health needs a valid identity token.
    let protected_routes = Router::new()
        .route("/me", get(handlers::get_me))
        .route("/me/affiliation", put(handlers::set_affiliation))
        .route("/capacity", get(handlers::get_capacity))
        .route(
            "/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route("/sessions/{session_id}", get(handlers::get_session))
        .route("/sessions/{session_id}/stop", post(handlers::stop_session))
        // Admin routes (RequireAdmin is checked in each handler)
        .route("/admin/sessions", get(handlers::admin_list_sessions))
        .route("/admin/users", get(handlers::admin_list_users))
        .route(
            "/admin/sessions/{session_id}",
            axum::routing::delete(handlers::admin_delete_session),
        )
        .route(
            "/admin/sessions/{session_id}/stop",
            post(handlers::admin_stop_session),
        )
        .route("/admin/reap", post(handlers::admin_reap))
        .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
        .with_state(state.clone());

    let public_routes = Router::new()
        .route("/health", get(handlers::health))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(cors)
        .layer(trace_layer)
}

/// Cross-origin policy for browser clients.
///
/// Credentials are only allowed for explicitly listed origins. An empty or
/// fully invalid list pins the allowed origin to `null`.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins = parse_origins(allowed_origins);
    if origins.is_empty() {
        if allowed_origins.is_empty() {
            tracing::warn!("No CORS origins configured, cross-origin requests are refused");
        } else {
            tracing::error!(
                "None of the {} configured CORS origins parse",
                allowed_origins.len()
            );
        }
        return CorsLayer::new().allow_origin(AllowOrigin::exact(HeaderValue::from_static("null")));
    }

    tracing::info!("CORS enabled for {} origin(s)", origins.len());
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::COOKIE,
        ])
        .allow_credentials(true)
}

fn parse_origins(allowed_origins: &[String]) -> Vec<HeaderValue> {
    allowed_origins
        .iter()
        .map(|origin| origin.trim().trim_end_matches('/'))
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Skipping unparseable CORS origin {:?}", origin);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_are_trimmed_and_invalid_ones_dropped() {
        let parsed = parse_origins(&[
            " https://lab.uni.edu/ ".to_string(),
            String::new(),
            "bad\norigin".to_string(),
        ]);
        assert_eq!(parsed, vec![HeaderValue::from_static("https://lab.uni.edu")]);
    }
}
