use crate::collectors::processes::{filter_by_name, sort_records, ProcessRecord, SortKey};
use crate::collectors::MetricsSnapshot;
use crate::control::services::{filter_by_state, filter_by_term, ServiceState};
use crate::control::ControlError;
use crate::engine::{EngineStatus, Metric, MonitorEngine};
use crate::history::{time_labels, Stats};
use crate::metrics::Metrics;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub engine: Arc<MonitorEngine>,
}

#[derive(Debug, Serialize)]
pub struct ApiSnapshot {
    pub status: EngineStatus,
    pub interval_secs: u64,
    pub tick_count: u64,
    pub snapshot: Option<MetricsSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct ApiSeries {
    pub metric: Metric,
    pub stats: Stats,
    pub samples: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smoothed: Option<Vec<f64>>,
    pub labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub metric: Option<String>,
    pub smooth: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ProcessQuery {
    pub q: Option<String>,
    pub sort: Option<String>,
    pub asc: Option<bool>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ServiceQuery {
    pub q: Option<String>,
    pub state: Option<String>,
}

pub fn build_router(metrics: Arc<Metrics>, engine: Arc<MonitorEngine>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .route("/api/history", get(history_handler))
        .route("/api/processes", get(processes_handler))
        .route("/api/services", get(services_handler))
        .with_state(HttpAppState { metrics, engine })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn snapshot_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let engine = &state.engine;
    Json(ApiSnapshot {
        status: engine.status(),
        interval_secs: engine.interval().as_secs(),
        tick_count: engine.tick_count(),
        snapshot: engine.latest().await,
    })
}

async fn history_handler(
    State(state): State<HttpAppState>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let metrics = match query.metric.as_deref() {
        Some(name) => match name.parse::<Metric>() {
            Ok(metric) => vec![metric],
            Err(err) => return (StatusCode::BAD_REQUEST, err).into_response(),
        },
        None => Metric::ALL.to_vec(),
    };

    let interval_secs = state.engine.interval().as_secs();
    let mut series = Vec::with_capacity(metrics.len());
    for metric in metrics {
        let buf = state.engine.history_buffer(metric).await;
        series.push(ApiSeries {
            metric,
            stats: buf.stats(),
            smoothed: query.smooth.map(|window| buf.smoothed(window)),
            labels: time_labels(buf.len(), interval_secs),
            samples: buf.snapshot(),
        });
    }
    Json(series).into_response()
}

async fn processes_handler(
    State(state): State<HttpAppState>,
    Query(query): Query<ProcessQuery>,
) -> Response {
    let Some(inventory) = state.engine.process_inventory() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "process inventory is not enabled",
        )
            .into_response();
    };
    let key = match query.sort.as_deref().map(str::parse::<SortKey>) {
        None => SortKey::Memory,
        Some(Ok(key)) => key,
        Some(Err(err)) => return (StatusCode::BAD_REQUEST, err).into_response(),
    };

    let records = match tokio::task::spawn_blocking(move || inventory.list()).await {
        Ok(records) => records,
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("process listing failed: {err}"),
            )
                .into_response()
        }
    };

    let mut records: Vec<ProcessRecord> =
        filter_by_name(records, query.q.as_deref().unwrap_or_default());
    sort_records(&mut records, key, !query.asc.unwrap_or(false));
    if let Some(limit) = query.limit {
        records.truncate(limit);
    }
    Json(records).into_response()
}

async fn services_handler(
    State(state): State<HttpAppState>,
    Query(query): Query<ServiceQuery>,
) -> Response {
    let Some(controller) = state.engine.service_controller() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "service control is not enabled",
        )
            .into_response();
    };
    let wanted = match query.state.as_deref().map(str::parse::<ServiceState>) {
        None => None,
        Some(Ok(wanted)) => Some(wanted),
        Some(Err(err)) => return (StatusCode::BAD_REQUEST, err).into_response(),
    };

    let records = match tokio::task::spawn_blocking(move || controller.list()).await {
        Ok(Ok(records)) => records,
        Ok(Err(err @ ControlError::InstrumentationUnavailable(_))) => {
            return (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
        }
        Ok(Err(err)) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("service listing failed: {err}"),
            )
                .into_response()
        }
    };

    let mut records = filter_by_term(records, query.q.as_deref().unwrap_or_default());
    if let Some(wanted) = wanted {
        records = filter_by_state(&records, wanted);
    }
    Json(records).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::testing::CountingSampler;
    use crate::control::services::{ServiceController, ServiceManager, ServiceRecord, StartMode};
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app_with_ticks(ticks: usize) -> (Router, Arc<Metrics>) {
        let metrics = Metrics::new().expect("metrics registry");
        let engine = MonitorEngine::builder(Box::new(CountingSampler::default()))
            .interval_secs(1)
            .metrics(metrics.clone())
            .build()
            .expect("engine");
        for _ in 0..ticks {
            engine.refresh_now().await.expect("tick");
        }
        (build_router(metrics.clone(), Arc::new(engine)), metrics)
    }

    async fn get_text(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (app, _) = app_with_ticks(0).await;
        let (status, body) = get_text(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn metrics_reflect_last_tick() {
        let (app, _) = app_with_ticks(2).await;
        let (status, body) = get_text(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("hostpulse_cpu_usage_percent 2"));
        assert!(body.contains("hostpulse_scrape_count_total 1"));
    }

    #[tokio::test]
    async fn snapshot_reports_engine_state() {
        let (app, _) = app_with_ticks(1).await;
        let (status, body) = get_text(app, "/api/snapshot").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "Stopped");
        assert_eq!(json["tick_count"], 1);
        assert_eq!(json["snapshot"]["process_count"], 3);
    }

    #[tokio::test]
    async fn history_returns_series_with_stats() {
        let (app, _) = app_with_ticks(3).await;
        let (status, body) = get_text(app, "/api/history?metric=cpu&smooth=3").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        let series = &json[0];
        assert_eq!(series["metric"], "cpu");
        assert_eq!(series["samples"], serde_json::json!([1.0, 2.0, 3.0]));
        assert_eq!(series["stats"]["average"], 2.0);
        assert_eq!(series["labels"], serde_json::json!(["0:02", "0:01", "0:00"]));
        assert_eq!(series["smoothed"][1], 2.0);
    }

    #[tokio::test]
    async fn history_rejects_unknown_metric() {
        let (app, _) = app_with_ticks(0).await;
        let (status, _) = get_text(app, "/api/history?metric=fan").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn processes_need_an_inventory() {
        let (app, _) = app_with_ticks(0).await;
        let (status, _) = get_text(app, "/api/processes").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    struct FixedServices;

    impl ServiceManager for FixedServices {
        fn list(&self) -> Result<Vec<ServiceRecord>, ControlError> {
            Ok(["cron", "sshd"]
                .iter()
                .zip([ServiceState::Running, ServiceState::Stopped])
                .map(|(name, state)| ServiceRecord {
                    name: name.to_string(),
                    display_name: name.to_uppercase(),
                    description: String::new(),
                    state,
                    start_mode: StartMode::Automatic,
                    process_name: None,
                })
                .collect())
        }

        fn start(&self, _name: &str) -> Result<(), ControlError> {
            Ok(())
        }

        fn stop(&self, _name: &str) -> Result<(), ControlError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn services_are_listed_and_filtered() {
        let metrics = Metrics::new().expect("metrics registry");
        let engine = MonitorEngine::builder(Box::new(CountingSampler::default()))
            .service_controller(ServiceController::new(Arc::new(FixedServices)))
            .build()
            .expect("engine");
        let app = build_router(metrics, Arc::new(engine));

        let (status, body) = get_text(app.clone(), "/api/services").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json.as_array().map(Vec::len), Some(2));

        let (_, body) = get_text(app.clone(), "/api/services?state=stopped").await;
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json[0]["name"], "sshd");
        assert_eq!(json.as_array().map(Vec::len), Some(1));

        let (status, _) = get_text(app, "/api/services?state=paused").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn services_need_a_controller() {
        let (app, _) = app_with_ticks(0).await;
        let (status, _) = get_text(app, "/api/services").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
