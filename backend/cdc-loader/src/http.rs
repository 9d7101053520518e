//! Operational HTTP surface: liveness, readiness and Prometheus scrape.

use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::error;

use crate::metrics::{self, BridgeMetrics};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/ready", web::get().to(ready))
        .route("/metrics", web::get().to(metrics_handler));
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

/// Ready while the consumer loop is draining the queue
async fn ready(metrics: web::Data<BridgeMetrics>) -> HttpResponse {
    if metrics.consumer_running.get() == 1 {
        HttpResponse::Ok().json(json!({ "status": "ready" }))
    } else {
        HttpResponse::ServiceUnavailable().json(json!({ "status": "consumer not running" }))
    }
}

async fn metrics_handler() -> HttpResponse {
    match metrics::render() {
        Ok((content_type, body)) => HttpResponse::Ok().content_type(content_type).body(body),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}
