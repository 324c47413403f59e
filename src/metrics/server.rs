use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tracing::{error, info};

use crate::metrics::Metrics;

/// Serves `/metrics` for scrapes while a run is in progress.
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> std::io::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting metrics server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    match render(&metrics) {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; version=0.0.4")],
                Vec::new(),
            )
        }
    }
}

fn render(metrics: &Metrics) -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metrics.registry.gather(), &mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_text_format() {
        let metrics = Metrics::new().unwrap();
        metrics.records_read_total.inc_by(3);

        let body = String::from_utf8(render(&metrics).unwrap()).unwrap();
        assert!(body.contains("emitter_records_read_total 3"));
    }
}
