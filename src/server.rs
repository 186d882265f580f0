use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, FromRequest, Multipart, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use tokio::net::TcpListener;

use crate::error::ProxyError;
use crate::limiter::client_identity;
use crate::proxy::AnalysisProxy;
use crate::response::ProxyResponse;
use crate::tools::analyze::AnalyzeRequest;
use crate::tools::transcribe::{AudioUpload, DEFAULT_AUDIO_FILE_NAME};

/// Headroom on top of the audio cap for multipart boundaries and other fields.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Multipart field carrying the recording.
const AUDIO_FIELD: &str = "audio";

#[derive(Clone)]
pub struct AppState {
    proxy: Arc<AnalysisProxy>,
}

/// Build the proxy router: `/analyze` and `/transcribe`, CORS headers on
/// every response.
pub fn router(proxy: Arc<AnalysisProxy>) -> Router {
    let body_limit = proxy.limits().max_audio_bytes + MULTIPART_OVERHEAD;
    Router::new()
        .route("/analyze", any(analyze))
        .route(
            "/transcribe",
            any(transcribe).layer(DefaultBodyLimit::max(body_limit)),
        )
        .layer(axum::middleware::map_response(with_cors))
        .with_state(AppState { proxy })
}

/// Serve until the listener fails or `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    proxy: Arc<AnalysisProxy>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(proxy);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
}

async fn analyze(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(early) = method_gate(&method) {
        return early;
    }
    if let Err(e) = state.proxy.ensure_configured() {
        return error_reply(&e);
    }

    let request: AnalyzeRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!("analyze: undecodable body: {e}");
            return error_reply(&ProxyError::Validation("invalid JSON body".to_string()));
        }
    };

    let client = client_identity(&headers, peer);
    match state.proxy.analyze(&client, request).await {
        Ok(result) => reply(StatusCode::OK, ProxyResponse::analysis(result)),
        Err(e) => error_reply(&e),
    }
}

async fn transcribe(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    if let Some(early) = method_gate(request.method()) {
        return early;
    }
    if let Err(e) = state.proxy.ensure_configured() {
        return error_reply(&e);
    }

    let client = client_identity(request.headers(), peer);
    let mut multipart = match Multipart::from_request(request, &state).await {
        Ok(m) => m,
        Err(rejection) => {
            tracing::debug!("transcribe: not a multipart request: {rejection}");
            return error_reply(&ProxyError::InvalidAudio(
                "expected multipart/form-data with an audio file".to_string(),
            ));
        }
    };

    let audio = match read_audio(&mut multipart).await {
        Ok(audio) => audio,
        Err(e) => return error_reply(&e),
    };

    match state.proxy.transcribe(&client, audio).await {
        Ok(text) => reply(StatusCode::OK, ProxyResponse::transcript(text)),
        Err(e) => error_reply(&e),
    }
}

/// Take the `audio` field, or failing that the first file field.
async fn read_audio(multipart: &mut Multipart) -> Result<AudioUpload, ProxyError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ProxyError::InvalidAudio(e.body_text()))?
    {
        let is_audio = field.name() == Some(AUDIO_FIELD) || field.file_name().is_some();
        if !is_audio {
            continue;
        }
        let file_name = field
            .file_name()
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_AUDIO_FILE_NAME)
            .to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ProxyError::InvalidAudio(e.body_text()))?;
        return Ok(AudioUpload {
            bytes: bytes.to_vec(),
            file_name,
            content_type,
        });
    }
    Err(ProxyError::InvalidAudio("no audio file uploaded".to_string()))
}

/// Preflight and wrong-method handling shared by both endpoints.
fn method_gate(method: &Method) -> Option<Response> {
    if method == Method::OPTIONS {
        return Some(StatusCode::OK.into_response());
    }
    if method != Method::POST {
        let mut response = reply(
            StatusCode::METHOD_NOT_ALLOWED,
            ProxyResponse::error("method not allowed"),
        );
        response
            .headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("POST, OPTIONS"));
        return Some(response);
    }
    None
}

fn reply(status: StatusCode, body: ProxyResponse) -> Response {
    (status, axum::Json(body)).into_response()
}

fn error_reply(e: &ProxyError) -> Response {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    reply(status, ProxyResponse::from_error(e))
}

async fn with_cors(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    response
}
