//! Request handlers.

use axum::Json;
use axum::body::Body;
use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use axum::response::{IntoResponse, Response};

use super::state::ServerState;
use crate::application::{ServeImageRequest, ServedImage};
use crate::domain::errors::ProxyError;

/// HTTP-date layout used by `Expires`.
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

fn header_value(value: String) -> Result<HeaderValue, ProxyError> {
    HeaderValue::try_from(value).map_err(|e| ProxyError::transform(format!("invalid header value: {e}")))
}

/// `GET /api/image`
pub async fn serve_image(
    State(state): State<ServerState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    let request = ServeImageRequest {
        query: url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
            .into_owned()
            .collect(),
        accept: header_string(&headers, header::ACCEPT),
        user_agent: header_string(&headers, header::USER_AGENT),
        origin: header_string(&headers, header::ORIGIN),
    };

    let served = state.serve_image.execute(request).await?;
    image_response(served)
}

fn image_response(served: ServedImage) -> Result<Response, ProxyError> {
    let ServedImage {
        cache_key,
        content_type,
        max_age,
        expires,
        body,
        ..
    } = served;

    let mut response = Body::from_stream(body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::ETAG, header_value(format!("\"{cache_key}\""))?);
    headers.insert(header::EXPIRES, header_value(expires.format(HTTP_DATE).to_string())?);
    headers.insert(header::CONTENT_TYPE, header_value(content_type)?);
    headers.insert(
        header::CACHE_CONTROL,
        header_value(format!("public, max-age={}", max_age.as_secs()))?,
    );
    Ok(response)
}

/// `GET /version`
pub async fn version() -> impl IntoResponse {
    Json(serde_json::json!({ "version": crate::VERSION }))
}
