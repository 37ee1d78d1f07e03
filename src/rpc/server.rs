//! JSON-RPC server over a minimal HTTP/1.1 listener

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::types::*;
use crate::core::Store;
use crate::db::repositories::{
    AnalysisStatus, AnalysisUpdate, ContextType, InteractionType, NewAnalysis, NewFeedback,
    NewInteraction, NewPerformanceMetric, NewRepository, NewSuggestion, NewWorkflow,
    QualityCategory, RepositoryUpdate, SuggestionStatus, SuggestionType, SuggestionUpdate,
    WorkflowStatus,
};

/// Largest request body the server will buffer
const MAX_REQUEST_BYTES: usize = 8 * 1024 * 1024;

pub struct RpcServer {
    host: String,
    port: u16,
    store: Store,
}

impl RpcServer {
    pub fn new(host: impl Into<String>, port: u16, store: Store) -> Self {
        Self {
            host: host.into(),
            port,
            store,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr).await?;

        tracing::info!("RPC server listening on {}", addr);
        Self::serve(listener, self.store.clone()).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(listener: TcpListener, store: Store) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            tracing::debug!("Accepted connection from {}", addr);

            let store = store.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, store).await {
                    tracing::error!("Error handling connection: {}", e);
                }
            });
        }
    }

    async fn handle_connection(mut stream: TcpStream, store: Store) -> Result<()> {
        let mut pending = Vec::new();
        let mut chunk = vec![0u8; 8192];

        loop {
            let body = loop {
                match split_request(&pending) {
                    Frame::Complete { consumed, body } => {
                        pending.drain(..consumed);
                        break body;
                    }
                    Frame::Incomplete if pending.len() <= MAX_REQUEST_BYTES => {}
                    _ => {
                        let response = JsonRpcResponse::error(json!(null), PARSE_ERROR, "Request too large");
                        send_response(&mut stream, response).await?;
                        return Ok(());
                    }
                }
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Ok(());
                }
                pending.extend_from_slice(&chunk[..n]);
            };

            let request: JsonRpcRequest = match serde_json::from_str(&body) {
                Ok(r) => r,
                Err(e) => {
                    let response =
                        JsonRpcResponse::error(json!(null), PARSE_ERROR, &format!("Parse error: {}", e));
                    send_response(&mut stream, response).await?;
                    continue;
                }
            };

            let response = Self::handle_request(&store, request).await;
            send_response(&mut stream, response).await?;
        }
    }

    /// Answer one request against the store
    pub async fn handle_request(store: &Store, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id;
        tracing::debug!("RPC {}", request.method);

        match dispatch(store, &request.method, request.params).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => {
                if error.code != METHOD_NOT_FOUND && error.code != INVALID_PARAMS {
                    tracing::warn!("RPC {} failed: {}", request.method, error.message);
                }
                JsonRpcResponse::failure(id, error)
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum Frame {
    Incomplete,
    Complete { consumed: usize, body: String },
    /// Declared body exceeds `MAX_REQUEST_BYTES`
    TooLarge,
}

/// Split one complete HTTP request off the front of `buffer`.
///
/// Yields the number of bytes consumed and the body once the headers and the
/// `Content-Length` body have arrived.
fn split_request(buffer: &[u8]) -> Frame {
    let Some(header_end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") else {
        return Frame::Incomplete;
    };
    let headers = String::from_utf8_lossy(&buffer[..header_end]);
    let length = headers
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    if length > MAX_REQUEST_BYTES {
        return Frame::TooLarge;
    }

    let body_start = header_end + 4;
    let Some(body_end) = body_start.checked_add(length) else {
        return Frame::TooLarge;
    };
    if buffer.len() < body_end {
        return Frame::Incomplete;
    }
    Frame::Complete {
        consumed: body_end,
        body: String::from_utf8_lossy(&buffer[body_start..body_end]).to_string(),
    }
}

async fn send_response(stream: &mut TcpStream, response: JsonRpcResponse) -> Result<()> {
    let response_str = serde_json::to_string(&response)?;
    tracing::debug!("Sending: {}", response_str);

    let http_response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        response_str.len(),
        response_str
    );

    stream.write_all(http_response.as_bytes()).await?;
    stream.flush().await?;

    Ok(())
}

type RpcResult = std::result::Result<Value, JsonRpcError>;

fn parse<T: DeserializeOwned>(params: Value) -> std::result::Result<T, JsonRpcError> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(JsonRpcError::invalid_params)
}

fn reply<T: Serialize>(value: T) -> RpcResult {
    Ok(serde_json::to_value(value)?)
}

fn default_limit() -> usize {
    100
}

#[derive(Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Deserialize)]
struct UrlParams {
    url: String,
}

#[derive(Deserialize)]
struct PageParams {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

#[derive(Deserialize)]
struct RepositoryUpdateParams {
    id: String,
    #[serde(flatten)]
    update: RepositoryUpdate,
}

#[derive(Deserialize)]
struct AnalysisListParams {
    repository_id: String,
    #[serde(default)]
    status: Option<AnalysisStatus>,
}

#[derive(Deserialize)]
struct AnalysisUpdateParams {
    id: String,
    #[serde(flatten)]
    update: AnalysisUpdate,
}

#[derive(Deserialize)]
struct AnalysisStatusParams {
    id: String,
    status: AnalysisStatus,
}

#[derive(Deserialize)]
struct SuggestionListParams {
    #[serde(default)]
    analysis_id: Option<String>,
    #[serde(default)]
    repository_id: Option<String>,
    #[serde(default)]
    suggestion_type: Option<SuggestionType>,
    #[serde(default)]
    status: Option<SuggestionStatus>,
    #[serde(default)]
    min_confidence: Option<f64>,
}

#[derive(Deserialize)]
struct SuggestionUpdateParams {
    id: String,
    #[serde(flatten)]
    update: SuggestionUpdate,
}

#[derive(Deserialize)]
struct SuggestionStatusParams {
    id: String,
    status: SuggestionStatus,
    #[serde(default)]
    feedback: Option<String>,
}

#[derive(Deserialize)]
struct WorkflowIdParams {
    workflow_id: String,
}

#[derive(Deserialize)]
struct RepositoryIdParams {
    repository_id: String,
}

#[derive(Deserialize)]
struct TransitionParams {
    workflow_id: String,
    status: WorkflowStatus,
}

#[derive(Deserialize)]
struct ProgressParams {
    workflow_id: String,
    progress: f64,
    #[serde(default)]
    step: Option<String>,
    #[serde(default)]
    agent: Option<String>,
}

#[derive(Deserialize)]
struct RecordErrorParams {
    workflow_id: String,
    message: String,
    #[serde(default = "default_error_type")]
    error_type: String,
}

fn default_error_type() -> String {
    "error".to_string()
}

#[derive(Deserialize)]
struct ContextParams {
    workflow_id: String,
    context_data: Value,
}

#[derive(Deserialize)]
struct OutputParams {
    workflow_id: String,
    #[serde(default)]
    branch_name: Option<String>,
    #[serde(default)]
    pull_request_url: Option<String>,
}

#[derive(Deserialize)]
struct SnapshotParams {
    workflow_id: String,
    agent_name: String,
    context_type: ContextType,
    data: Value,
}

#[derive(Deserialize)]
struct InteractionsParams {
    workflow_id: String,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    interaction_type: Option<InteractionType>,
}

#[derive(Deserialize)]
struct SnapshotsParams {
    workflow_id: String,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    context_type: Option<ContextType>,
}

#[derive(Deserialize)]
struct LatestSnapshotParams {
    workflow_id: String,
    agent_name: String,
    context_type: ContextType,
}

#[derive(Deserialize)]
struct QualityParams {
    analysis_id: String,
    metric_name: String,
    metric_value: f64,
    category: QualityCategory,
}

#[derive(Deserialize)]
struct MetricsListParams {
    workflow_id: String,
    #[serde(default)]
    operation: Option<String>,
}

#[derive(Deserialize)]
struct OptionalRepositoryParams {
    #[serde(default)]
    repository_id: Option<String>,
}

#[derive(Deserialize)]
struct OptionalWorkflowParams {
    #[serde(default)]
    workflow_id: Option<String>,
}

async fn dispatch(store: &Store, method: &str, params: Value) -> RpcResult {
    match method {
        "health" => {
            let healthy = store.db.health_check().await?;
            reply(json!({ "healthy": healthy, "version": env!("CARGO_PKG_VERSION") }))
        }

        "repository.create" => reply(store.repositories.create(parse::<NewRepository>(params)?).await?),
        "repository.get" => {
            let p: IdParams = parse(params)?;
            reply(store.repositories.get(&p.id).await?)
        }
        "repository.get_by_url" => {
            let p: UrlParams = parse(params)?;
            reply(store.repositories.get_by_url(&p.url).await?)
        }
        "repository.list" => {
            let p: PageParams = parse(params)?;
            reply(store.repositories.list(p.limit, p.offset).await?)
        }
        "repository.update" => {
            let p: RepositoryUpdateParams = parse(params)?;
            reply(store.repositories.update(&p.id, p.update).await?)
        }
        "repository.delete" => {
            let p: IdParams = parse(params)?;
            store.repositories.delete(&p.id).await?;
            reply(json!({ "deleted": p.id }))
        }

        "analysis.create" => reply(store.analyses.create(parse::<NewAnalysis>(params)?).await?),
        "analysis.get" => {
            let p: IdParams = parse(params)?;
            reply(store.analyses.get(&p.id).await?)
        }
        "analysis.list" => {
            let p: AnalysisListParams = parse(params)?;
            reply(store.analyses.list_by_repository(&p.repository_id, p.status).await?)
        }
        "analysis.update" => {
            let p: AnalysisUpdateParams = parse(params)?;
            reply(store.analyses.update(&p.id, p.update).await?)
        }
        "analysis.set_status" => {
            let p: AnalysisStatusParams = parse(params)?;
            reply(store.analyses.set_status(&p.id, p.status).await?)
        }
        "analysis.delete" => {
            let p: IdParams = parse(params)?;
            store.analyses.delete(&p.id).await?;
            reply(json!({ "deleted": p.id }))
        }

        "suggestion.create" => reply(store.suggestions.create(parse::<NewSuggestion>(params)?).await?),
        "suggestion.get" => {
            let p: IdParams = parse(params)?;
            reply(store.suggestions.get(&p.id).await?)
        }
        "suggestion.list" => {
            let p: SuggestionListParams = parse(params)?;
            if let Some(analysis_id) = p.analysis_id {
                reply(store.suggestions.list_by_analysis(&analysis_id, p.status).await?)
            } else if let Some(repository_id) = p.repository_id {
                reply(store.suggestions.list_by_repository(&repository_id).await?)
            } else if let Some(suggestion_type) = p.suggestion_type {
                reply(store.suggestions.list_by_type(suggestion_type, p.status).await?)
            } else if let Some(min_confidence) = p.min_confidence {
                reply(store.suggestions.high_confidence(min_confidence).await?)
            } else {
                Err(JsonRpcError::invalid_params(
                    "one of analysis_id, repository_id, suggestion_type or min_confidence is required",
                ))
            }
        }
        "suggestion.update" => {
            let p: SuggestionUpdateParams = parse(params)?;
            reply(store.suggestions.update(&p.id, p.update).await?)
        }
        "suggestion.set_status" => {
            let p: SuggestionStatusParams = parse(params)?;
            reply(store.suggestions.set_status(&p.id, p.status, p.feedback).await?)
        }
        "suggestion.delete" => {
            let p: IdParams = parse(params)?;
            store.suggestions.delete(&p.id).await?;
            reply(json!({ "deleted": p.id }))
        }

        "workflow.create" => reply(store.workflows.create(parse::<NewWorkflow>(params)?).await?),
        "workflow.get" => {
            let p: WorkflowIdParams = parse(params)?;
            reply(store.workflows.get_by_workflow_id(&p.workflow_id).await?)
        }
        "workflow.list" => {
            let p: RepositoryIdParams = parse(params)?;
            reply(store.workflows.list_by_repository(&p.repository_id).await?)
        }
        "workflow.active" => reply(store.workflows.active().await?),
        "workflow.transition" => {
            let p: TransitionParams = parse(params)?;
            reply(store.workflows.transition(&p.workflow_id, p.status).await?)
        }
        "workflow.update_progress" => {
            let p: ProgressParams = parse(params)?;
            reply(
                store
                    .workflows
                    .update_progress(&p.workflow_id, p.progress, p.step, p.agent)
                    .await?,
            )
        }
        "workflow.record_error" => {
            let p: RecordErrorParams = parse(params)?;
            reply(
                store
                    .workflows
                    .record_error(&p.workflow_id, p.message, p.error_type)
                    .await?,
            )
        }
        "workflow.set_context" => {
            let p: ContextParams = parse(params)?;
            reply(store.workflows.set_context(&p.workflow_id, p.context_data).await?)
        }
        "workflow.set_output" => {
            let p: OutputParams = parse(params)?;
            reply(
                store
                    .workflows
                    .set_output(&p.workflow_id, p.branch_name, p.pull_request_url)
                    .await?,
            )
        }
        "workflow.delete" => {
            let p: WorkflowIdParams = parse(params)?;
            store.workflows.delete(&p.workflow_id).await?;
            reply(json!({ "deleted": p.workflow_id }))
        }

        "audit.record_interaction" => {
            reply(store.audit.record_interaction(parse::<NewInteraction>(params)?).await?)
        }
        "audit.record_snapshot" => {
            let p: SnapshotParams = parse(params)?;
            reply(
                store
                    .audit
                    .record_snapshot(&p.workflow_id, &p.agent_name, p.context_type, p.data)
                    .await?,
            )
        }
        "audit.interactions" => {
            let p: InteractionsParams = parse(params)?;
            let mut query = store.audit.interactions(&p.workflow_id);
            if let Some(agent) = p.agent {
                query = query.agent(agent);
            }
            if let Some(kind) = p.interaction_type {
                query = query.kind(kind);
            }
            reply(query.collect().await?)
        }
        "audit.snapshots" => {
            let p: SnapshotsParams = parse(params)?;
            let mut query = store.audit.snapshots(&p.workflow_id);
            if let Some(agent) = p.agent {
                query = query.agent(agent);
            }
            if let Some(context_type) = p.context_type {
                query = query.context_type(context_type);
            }
            reply(query.collect().await?)
        }
        "audit.latest_snapshot" => {
            let p: LatestSnapshotParams = parse(params)?;
            reply(
                store
                    .audit
                    .latest_snapshot(&p.workflow_id, &p.agent_name, p.context_type)
                    .await?,
            )
        }

        "metrics.record" => reply(store.metrics.record_metric(parse::<NewPerformanceMetric>(params)?).await?),
        "metrics.record_quality" => {
            let p: QualityParams = parse(params)?;
            reply(
                store
                    .metrics
                    .record_quality_metric(&p.analysis_id, &p.metric_name, p.metric_value, p.category)
                    .await?,
            )
        }
        "metrics.record_feedback" => reply(store.metrics.record_feedback(parse::<NewFeedback>(params)?).await?),
        "metrics.list" => {
            let p: MetricsListParams = parse(params)?;
            reply(
                store
                    .metrics
                    .metrics_for_workflow(&p.workflow_id, p.operation.as_deref())
                    .await?,
            )
        }
        "metrics.performance_summary" => {
            let p: WorkflowIdParams = parse(params)?;
            reply(store.metrics.performance_summary(&p.workflow_id).await?)
        }

        "summary.repository" => {
            let p: OptionalRepositoryParams = parse(params)?;
            match p.repository_id {
                Some(id) => reply(store.summaries.repository_summary(&id).await?),
                None => reply(store.summaries.repository_summaries().await?),
            }
        }
        "summary.workflow" => {
            let p: OptionalWorkflowParams = parse(params)?;
            match p.workflow_id {
                Some(id) => reply(store.summaries.workflow_summary(&id).await?),
                None => reply(store.summaries.workflow_summaries().await?),
            }
        }
        "summary.suggestions" => {
            let p: RepositoryIdParams = parse(params)?;
            reply(store.summaries.suggestion_summaries(&p.repository_id).await?)
        }

        _ => Err(JsonRpcError::method_not_found(method)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_request_waits_for_full_body() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n{\"a\":";
        assert_eq!(split_request(raw), Frame::Incomplete);

        let raw = b"POST / HTTP/1.1\r\ncontent-length: 7\r\n\r\n{\"a\":1}POST";
        let Frame::Complete { consumed, body } = split_request(raw) else {
            panic!("expected a complete frame");
        };
        assert_eq!(body, "{\"a\":1}");
        assert_eq!(&raw[consumed..], b"POST");
    }

    #[test]
    fn test_split_request_needs_headers() {
        assert_eq!(split_request(b"POST / HTTP/1.1\r\nContent-Length: 2"), Frame::Incomplete);
    }

    #[test]
    fn test_split_request_rejects_oversized_length() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n{}";
        assert_eq!(split_request(raw), Frame::TooLarge);

        let raw = format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", MAX_REQUEST_BYTES + 1);
        assert_eq!(split_request(raw.as_bytes()), Frame::TooLarge);
    }

    #[test]
    fn test_parse_treats_null_as_empty_object() {
        let p: PageParams = parse(Value::Null).unwrap();
        assert_eq!(p.limit, 100);
        assert_eq!(p.offset, 0);

        let err = parse::<IdParams>(json!({})).err().unwrap();
        assert_eq!(err.code, INVALID_PARAMS);
    }
}
