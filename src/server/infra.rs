// Infrastructure concerns: error handling, signals.
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::signal;
use tokio::sync::watch::Sender;
use tracing::{error, info};

pub struct WebappError {
    inner: anyhow::Error,
}

impl IntoResponse for WebappError {
    fn into_response(self) -> Response {
        error!("Error: {:?}", self.inner);
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
    }
}

impl<E> From<E> for WebappError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self { inner: err.into() }
    }
}

pub async fn shutdown_signal(terminate_jobs: Sender<bool>) {
    let interrupt = async {
        signal::ctrl_c()
            .await
            .expect("Unable to set signal handler for Ctrl+C");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {
            info!("Received Ctrl+C signal");
            terminate_jobs.send(true).ok();
        },
        _ = terminate => {
            info!("Received terminate signal");
            terminate_jobs.send(true).ok();
        },
    }
}
