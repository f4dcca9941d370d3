//! A minimal `/healthz` liveness endpoint, served alongside the main
//! supervision loop

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;

use crate::Error;

async fn healthz() -> StatusCode {
    StatusCode::OK
}

fn build_app() -> Router {
    Router::new().route("/healthz", get(healthz))
}

/// Serve `/healthz` on `port` until shutdown is signaled
pub async fn run(port: u16, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let app = build_app();

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|value| *value).await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_returns_200() {
        let app = build_app();
        let request = axum::http::Request::builder()
            .uri("/healthz")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
