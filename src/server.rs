use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::catalog::{Catalog, Namespace};
use crate::cli::ServeArgs;
use crate::download;
use crate::generation::{GenerationClient, GenerationError, OpenAiBackend};
use crate::record::{RecordError, RecordRequest, RecordService};
use crate::seeds::ExampleBank;
use crate::storage::StoragePaths;

#[derive(Clone)]
struct AppState {
    records: Arc<RecordService>,
}

pub async fn run(opts: ServeArgs) -> anyhow::Result<()> {
    let fetch = &opts.fetch;
    let paths = StoragePaths::new(&fetch.data_dir);
    let sources = download::ensure_inputs(&paths, fetch)
        .await
        .context("ensure catalog inputs")?;

    let catalog =
        Catalog::load(&fetch.catalog_sources(&sources)).context("load reference catalogs")?;
    tracing::info!(
        diagnosis_codes = catalog.len(Namespace::Diagnosis),
        procedure_codes = catalog.len(Namespace::Procedure),
        "Reference catalogs loaded"
    );

    let examples = match &sources.seed_records {
        Some(path) => ExampleBank::load(path).context("load seed records")?,
        None => ExampleBank::empty(),
    };

    let backend = OpenAiBackend::new(&opts.openai_base_url, &opts.openai_api_key)
        .context("create completion backend")?;
    let client = GenerationClient::new(Arc::new(backend), opts.retry_policy())
        .with_fallback_model(opts.fallback_model.clone());
    let policy = client.policy();
    tracing::info!(
        max_attempts = policy.max_attempts,
        attempt_timeout_s = policy.attempt_timeout.as_secs(),
        worst_case_s = policy.worst_case_latency().as_secs(),
        fallback_model = opts.fallback_model.as_deref().unwrap_or("-"),
        "Completion retry budget"
    );

    let records = RecordService::new(
        Arc::new(catalog),
        Arc::new(examples),
        client,
        opts.default_model.clone(),
    );

    let cors = cors_layer(&opts.allowed_origins)?;
    let app = router(Arc::new(records)).layer(cors);

    let addr: SocketAddr = format!("{}:{}", opts.host, opts.port)
        .parse()
        .context("parse host:port")?;

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(records: Arc<RecordService>) -> Router {
    Router::new()
        .route("/api/health", get(api_health))
        .route("/api/generate/records", post(api_generate_record))
        .with_state(AppState { records })
}

fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o.trim() == "*") {
        return Ok(layer.allow_origin(Any));
    }

    let mut values = Vec::with_capacity(origins.len());
    for origin in origins {
        // Browsers send the origin without a trailing slash.
        let origin = origin.trim().trim_end_matches('/');
        let value = HeaderValue::from_str(origin)
            .map_err(|_| anyhow!("invalid CORS origin: {origin:?}"))?;
        values.push(value);
    }
    Ok(layer.allow_origin(AllowOrigin::list(values)))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    diagnosis_codes: usize,
    procedure_codes: usize,
    seed_examples: usize,
}

async fn api_health(State(st): State<AppState>) -> impl IntoResponse {
    let catalog = st.records.catalog();
    Json(HealthResponse {
        status: "ok",
        diagnosis_codes: catalog.len(Namespace::Diagnosis),
        procedure_codes: catalog.len(Namespace::Procedure),
        seed_examples: st.records.examples().len(),
    })
}

async fn api_generate_record(
    State(st): State<AppState>,
    Json(req): Json<RecordRequest>,
) -> Result<String, RecordError> {
    st.records.handle(req).await
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

impl RecordError {
    fn status_code(&self) -> StatusCode {
        match self {
            RecordError::Validation(_) => StatusCode::BAD_REQUEST,
            RecordError::Generation(GenerationError::Rejected { .. })
            | RecordError::Generation(GenerationError::EmptyCompletion { .. }) => {
                StatusCode::BAD_GATEWAY
            }
            RecordError::Generation(GenerationError::Unavailable { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RecordError::Generation(GenerationError::TimedOut { .. }) => {
                StatusCode::GATEWAY_TIMEOUT
            }
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            RecordError::Validation(_) => "validation_error",
            RecordError::Generation(GenerationError::Rejected { .. }) => "upstream_rejected",
            RecordError::Generation(GenerationError::EmptyCompletion { .. }) => "upstream_empty",
            RecordError::Generation(GenerationError::Unavailable { .. }) => "upstream_unavailable",
            RecordError::Generation(GenerationError::TimedOut { .. }) => "upstream_timeout",
        }
    }
}

impl IntoResponse for RecordError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error = self.error_type();
        if status.is_client_error() {
            tracing::warn!(error, status = status.as_u16(), message = %self, "rejected request");
        } else {
            tracing::error!(
                error,
                status = status.as_u16(),
                message = %self,
                "record generation failed"
            );
        }
        (
            status,
            Json(ErrorResponse {
                error,
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::generation::testing::{RecordingSleeper, ScriptedBackend};
    use crate::generation::{AttemptError, RetryPolicy};
    use crate::record::ValidationError;

    fn app(backend: &Arc<ScriptedBackend>) -> Router {
        let catalog = Catalog::from_entries(
            [("J30.1", "Allergic rhinitis due to pollen")],
            [("76830", "Ultrasound, transvaginal")],
        );
        let client = GenerationClient::new(
            backend.clone(),
            RetryPolicy {
                max_attempts: 2,
                jitter: false,
                ..RetryPolicy::default()
            },
        )
        .with_sleeper(Arc::new(RecordingSleeper::default()));
        let records = RecordService::new(
            Arc::new(catalog),
            Arc::new(ExampleBank::empty()),
            client,
            "gpt-3.5-turbo-1106",
        );
        router(Arc::new(records))
    }

    async fn post_json(app: Router, body: &str) -> (StatusCode, Option<String>, String) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/generate/records")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, content_type, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn generate_returns_plain_text() {
        let backend = Arc::new(ScriptedBackend::always(Ok(
            "Pelvic ultrasound. Findings: ...".to_string(),
        )));
        let (status, content_type, body) = post_json(
            app(&backend),
            r#"{"model":"gpt-4","messages":[{"role":"user","content":"J30.1"}],"cpt_codes":"76830"}"#,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().starts_with("text/plain"));
        assert_eq!(body, "Pelvic ultrasound. Findings: ...");
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn validation_errors_are_client_errors() {
        let backend = Arc::new(ScriptedBackend::always(Ok("note".to_string())));
        let (status, _, body) =
            post_json(app(&backend), r#"{"messages":[],"cpt_codes":["76830"]}"#).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["error"], "validation_error");
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn upstream_unavailable_maps_to_503() {
        let backend = Arc::new(ScriptedBackend::always(Err(AttemptError::transient("503"))));
        let (status, _, body) = post_json(
            app(&backend),
            r#"{"messages":[{"role":"user","content":"J30.1"}],"cpt_codes":["76830"]}"#,
        )
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["error"], "upstream_unavailable");
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn health_reports_catalog_sizes() {
        let backend = Arc::new(ScriptedBackend::always(Ok("note".to_string())));
        let resp = app(&backend)
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["diagnosis_codes"], 1);
        assert_eq!(v["procedure_codes"], 1);
        assert_eq!(v["seed_examples"], 0);
    }

    #[test]
    fn error_status_mapping() {
        let model = "gpt-4".to_string();
        let cases = [
            (RecordError::Validation(ValidationError::EmptyModel), StatusCode::BAD_REQUEST),
            (
                RecordError::Generation(GenerationError::Rejected {
                    model: model.clone(),
                    status: Some(401),
                    message: "bad key".to_string(),
                }),
                StatusCode::BAD_GATEWAY,
            ),
            (
                RecordError::Generation(GenerationError::EmptyCompletion { model: model.clone() }),
                StatusCode::BAD_GATEWAY,
            ),
            (
                RecordError::Generation(GenerationError::Unavailable {
                    model: model.clone(),
                    attempts: 6,
                    message: "429".to_string(),
                }),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                RecordError::Generation(GenerationError::TimedOut { model, attempts: 6 }),
                StatusCode::GATEWAY_TIMEOUT,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status_code(), status);
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[test]
    fn cors_origins() {
        assert!(cors_layer(&["*".to_string()]).is_ok());
        assert!(cors_layer(&["http://localhost:3000/".to_string()]).is_ok());
        assert!(cors_layer(&["http://bad\norigin".to_string()]).is_err());
    }
}
