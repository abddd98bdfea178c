//! HTTP server: routing, status page and cache actions.
//!
//! Route order matters: the npm package document is the catch-all, so every
//! other route must be registered explicitly above it.

use crate::auth::AuthToken;
use crate::error::AppResult;
use crate::registry::{composer, npm};
use crate::session::Session;
use crate::state::AppState;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Form, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(status_page).post(cache_action))
        .route("/favicon.ico", get(favicon))
        .route("/packages.json", get(composer::aggregate_document))
        .route("/composer/{uuid}/{file}", get(composer::archive))
        .route("/-/{*rest}", get(npm_search_stub))
        .route("/npm/{uuid}/{file}", get(npm::archive))
        .route("/{*name}", get(npm::package_document))
        .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn run(config: crate::config::Config) -> anyhow::Result<()> {
    let state = AppState::new(config)?;
    let listen_addr = state.config.listen_addr.clone();
    let app = build_router(state);

    let listener = TcpListener::bind(&listen_addr).await?;
    info!(addr = %listen_addr, "registry listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received, stopping");
    }
}

/// `GET /` — cached project URLs for this token and their expiry.
async fn status_page(
    State(state): State<AppState>,
    AuthToken(token): AuthToken,
) -> AppResult<Html<String>> {
    let session = Session::open(&state, &token).await?;
    let (urls, expires_at) = session.cached_project_urls();

    let expire_label = expires_at
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    let mut items = String::new();
    for url in &urls {
        items.push_str(&format!("      <li><a href=\"{url}\">{url}</a></li>\n"));
    }

    Ok(Html(format!(
        r#"<!DOCTYPE html>
<html>
  <head><title>Comrade Pavlik</title></head>
  <body>
    <h1>Comrade Pavlik</h1>
    <p>{count} cached project(s), expire at {expire_label}</p>
    <ul>
{items}    </ul>
    <form method="post" action="/">
      <button name="action" value="clear_cache">Clear cache</button>
      <button name="action" value="update_cache">Update cache</button>
    </form>
  </body>
</html>
"#,
        count = urls.len(),
    )))
}

#[derive(Deserialize)]
struct CacheActionForm {
    #[serde(default)]
    action: String,
}

/// `POST /` — cache maintenance; always redirects back to the status page.
async fn cache_action(
    State(state): State<AppState>,
    AuthToken(token): AuthToken,
    Form(form): Form<CacheActionForm>,
) -> AppResult<Response> {
    let session = Session::open(&state, &token).await?;
    match form.action.as_str() {
        "clear_cache" => {
            info!("clearing cached project list");
            session.clear_project_cache();
        }
        "update_cache" => {
            info!("scheduling project list warm-up");
            session.warm_up();
        }
        _ => {}
    }
    Ok((StatusCode::FOUND, [(header::LOCATION, "/")]).into_response())
}

async fn favicon(
    State(state): State<AppState>,
    AuthToken(token): AuthToken,
) -> AppResult<StatusCode> {
    Session::open(&state, &token).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /-/{*}` — npm search routes. With a proper `.npmrc` these are never
/// called; answering an error beats pretending to be a public registry.
async fn npm_search_stub(
    State(state): State<AppState>,
    AuthToken(token): AuthToken,
) -> AppResult<Response> {
    Session::open(&state, &token).await?;
    Ok((
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "text/plain")],
        "invalid .npmrc setup: search routes are not served by this registry",
    )
        .into_response())
}
