//! The SSE endpoint's HTTP server loop: accept, route, authenticate,
//! compute task identity, and hand the body off to a session stream
//! (spec.md §6 "External interfaces", §4.G).

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_stream::StreamExt as _;
use tracing::{debug, error, info};

use rsrch_pipeline::{ModelClient, PipelineConfig, PipelineDriver, SearchClient};
use rsrch_protocol::{AuthVerifier, EngineError, NoopAuthVerifier, TaskId};
use rsrch_task_manager::{PipelineRunner, TaskManager, TaskManagerConfig};
use rsrch_task_store::TaskStore;

use crate::cors::CorsLayer;
use crate::{request, stream_manager};

type BoxBody = http_body_util::combinators::UnsyncBoxBody<Bytes, std::convert::Infallible>;

fn full_body(text: impl Into<Bytes>) -> BoxBody {
    Full::new(text.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Static server configuration (spec.md §6).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    pub sse_path: String,
    pub enable_cors: bool,
    pub default_search_provider: String,
    /// Comma-joined default model lists applied when a request's
    /// `thinkingModel`/`taskModel` query params are absent (spec.md §6:
    /// "URL wins over config").
    pub default_thinking_models: String,
    pub default_task_models: String,
    /// Search API key pool, comma-joined (spec.md §4.E rotation input).
    pub search_api_keys: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8000".parse().unwrap(),
            sse_path: "/api/sse".to_string(),
            enable_cors: true,
            default_search_provider: "tavily".to_string(),
            default_thinking_models: String::new(),
            default_task_models: String::new(),
            search_api_keys: Vec::new(),
        }
    }
}

pub struct SseServerBuilder {
    config: ServerConfig,
    task_manager: Arc<TaskManager>,
    model_client: Arc<dyn ModelClient>,
    search_client: Arc<dyn SearchClient>,
    auth: Arc<dyn AuthVerifier>,
}

impl SseServerBuilder {
    pub fn new(
        store: Arc<dyn TaskStore>,
        task_manager_config: TaskManagerConfig,
        model_client: Arc<dyn ModelClient>,
        search_client: Arc<dyn SearchClient>,
    ) -> Self {
        Self {
            config: ServerConfig::default(),
            task_manager: Arc::new(TaskManager::new(store, task_manager_config)),
            model_client,
            search_client,
            auth: Arc::new(NoopAuthVerifier),
        }
    }

    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.config.bind_address = addr;
        self
    }

    pub fn sse_path(mut self, path: impl Into<String>) -> Self {
        self.config.sse_path = path.into();
        self
    }

    pub fn cors(mut self, enable: bool) -> Self {
        self.config.enable_cors = enable;
        self
    }

    pub fn default_search_provider(mut self, provider: impl Into<String>) -> Self {
        self.config.default_search_provider = provider.into();
        self
    }

    pub fn default_thinking_models(mut self, models: impl Into<String>) -> Self {
        self.config.default_thinking_models = models.into();
        self
    }

    pub fn default_task_models(mut self, models: impl Into<String>) -> Self {
        self.config.default_task_models = models.into();
        self
    }

    pub fn search_api_keys(mut self, keys: Vec<String>) -> Self {
        self.config.search_api_keys = keys;
        self
    }

    pub fn auth(mut self, auth: Arc<dyn AuthVerifier>) -> Self {
        self.auth = auth;
        self
    }

    pub fn build(self) -> SseServer {
        SseServer {
            config: self.config,
            task_manager: self.task_manager,
            model_client: self.model_client,
            search_client: self.search_client,
            auth: self.auth,
        }
    }
}

/// The SSE server. Cheap to clone — every field is an `Arc`/`Copy`-ish
/// handle, matching the teacher's "single shared instance captured by
/// every spawned connection task" pattern.
#[derive(Clone)]
pub struct SseServer {
    config: ServerConfig,
    task_manager: Arc<TaskManager>,
    model_client: Arc<dyn ModelClient>,
    search_client: Arc<dyn SearchClient>,
    auth: Arc<dyn AuthVerifier>,
}

impl SseServer {
    pub fn builder(
        store: Arc<dyn TaskStore>,
        task_manager_config: TaskManagerConfig,
        model_client: Arc<dyn ModelClient>,
        search_client: Arc<dyn SearchClient>,
    ) -> SseServerBuilder {
        SseServerBuilder::new(store, task_manager_config, model_client, search_client)
    }

    pub fn task_manager(&self) -> Arc<TaskManager> {
        Arc::clone(&self.task_manager)
    }

    /// Recover any tasks left `running` from a prior process before
    /// accepting traffic (spec.md §4.F startup path).
    pub async fn recover(&self) -> Result<(), EngineError> {
        let report = self.task_manager.recover_on_startup().await?;
        if !report.is_clean() {
            info!(message = %report.format_message(), "stream server recovery");
        }
        Ok(())
    }

    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_address).await?;
        info!(
            addr = %self.config.bind_address,
            path = %self.config.sse_path,
            "sse server listening",
        );

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "accepted connection");
            let server = self.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service =
                    service_fn(move |req| handle_request(req, server.clone()));
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(error = %err, "connection ended");
                }
            });
        }
    }
}

fn query_pairs(uri: &hyper::Uri) -> Vec<(String, String)> {
    uri.query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

fn error_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::AuthFailed => StatusCode::UNAUTHORIZED,
        EngineError::MemoryPressure | EngineError::TooManyConnections(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    server: SseServer,
) -> Result<Response<BoxBody>, std::convert::Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if method == Method::OPTIONS {
        let mut response = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(full_body(Bytes::new()))
            .unwrap();
        if server.config.enable_cors {
            CorsLayer::apply_cors_headers(response.headers_mut());
        }
        return Ok(response);
    }

    if method != Method::GET || path != server.config.sse_path {
        let mut response = Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full_body(Bytes::from_static(b"not found")))
            .unwrap();
        if server.config.enable_cors {
            CorsLayer::apply_cors_headers(response.headers_mut());
        }
        return Ok(response);
    }

    let bearer = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(|v| v.trim_start_matches("Bearer ").to_string());

    let auth_outcome = server.auth.verify(bearer.as_deref()).await;
    if !auth_outcome.valid {
        let message = auth_outcome.error.unwrap_or_else(|| "unauthorized".to_string());
        let mut response = Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .body(full_body(Bytes::from(message)))
            .unwrap();
        if server.config.enable_cors {
            CorsLayer::apply_cors_headers(response.headers_mut());
        }
        return Ok(response);
    }

    let pairs = query_pairs(req.uri());
    let incoming = request::parse(
        &pairs,
        &server.config.default_search_provider,
        &server.config.default_thinking_models,
        &server.config.default_task_models,
    );

    let task_id = match TaskId::from_caller_or_fingerprint(
        incoming.caller_task_id.as_deref(),
        &incoming.params,
    ) {
        Ok(id) => id,
        Err(err) => {
            let mut response = Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(full_body(Bytes::from(err.to_string())))
                .unwrap();
            if server.config.enable_cors {
                CorsLayer::apply_cors_headers(response.headers_mut());
            }
            return Ok(response);
        }
    };

    let request_id = uuid::Uuid::now_v7().to_string();
    let query = incoming.params.query.clone();
    let model_name = incoming
        .params
        .thinking_models
        .first()
        .cloned()
        .unwrap_or_default();
    let search_provider = incoming.params.search_provider.clone();

    // One driver per request: `thinkingModel`/`taskModel` may be overridden
    // per call (spec.md §6 "URL wins over config"), so the model/task lists
    // baked into a `PipelineDriver` can't be shared across requests.
    let pipeline_config =
        PipelineConfig::from_params(&incoming.params, server.config.search_api_keys.clone());
    let runner: Arc<dyn PipelineRunner> = Arc::new(PipelineDriver::new(
        Arc::clone(&server.model_client),
        Arc::clone(&server.search_client),
        pipeline_config,
    ));

    let session = stream_manager::open_session(
        &server.task_manager,
        runner,
        task_id.clone(),
        query,
        incoming.params,
        Some(incoming.attribution),
        incoming.force_restart,
    )
    .await;

    let body_stream = match session {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "failed to open sse session");
            let status = error_status(&err);
            let mut response = Response::builder()
                .status(status)
                .body(full_body(Bytes::from(err.to_string())))
                .unwrap();
            if server.config.enable_cors {
                CorsLayer::apply_cors_headers(response.headers_mut());
            }
            return Ok(response);
        }
    };

    let framed = body_stream
        .map(|chunk| Ok::<_, std::convert::Infallible>(Frame::data(Bytes::from(
            crate::sse::format_chunk(&chunk),
        ))));
    let body = StreamBody::new(framed).boxed_unsync();

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
        .header(hyper::header::CACHE_CONTROL, "no-cache, no-transform")
        .header(hyper::header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .header("X-Task-ID", task_id.as_str())
        .header("X-Request-ID", request_id)
        .header("X-Model-Name", model_name)
        .header("X-Search-Provider", search_provider)
        .body(body)
        .unwrap();

    if server.config.enable_cors {
        CorsLayer::apply_cors_headers(response.headers_mut());
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_binds_local_sse_path() {
        let config = ServerConfig::default();
        assert_eq!(config.sse_path, "/api/sse");
        assert!(config.enable_cors);
    }

    #[test]
    fn error_status_maps_auth_and_capacity_errors() {
        assert_eq!(error_status(&EngineError::AuthFailed), StatusCode::UNAUTHORIZED);
        assert_eq!(
            error_status(&EngineError::MemoryPressure),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_status(&EngineError::TooManyConnections("t".to_string())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_status(&EngineError::BadRequest("x".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
