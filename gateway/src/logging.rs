use axum::{
    extract::Request,
    middleware::Next,
    response::Response,
};
use std::time::Instant;

/// Middleware that logs HTTP requests at INFO level, with the model when the
/// path names one.
pub async fn request_logger(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let model = model_from_path(&path).map(str::to_string);

    let response = next.run(request).await;

    let status = response.status();
    let duration = start.elapsed();

    tracing::info!(
        method = %method,
        path = %path,
        model = model.as_deref().unwrap_or("-"),
        status = %status.as_u16(),
        duration_ms = %duration.as_millis(),
        "HTTP request"
    );

    response
}

/// `/v1/models/{model}/...` and `/admin/models/{model}/...`.
fn model_from_path(path: &str) -> Option<&str> {
    let mut segments = path.trim_start_matches('/').split('/');
    match (segments.next(), segments.next(), segments.next()) {
        (Some("v1" | "admin"), Some("models"), Some(model)) if !model.is_empty() => Some(model),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_from_path() {
        assert_eq!(model_from_path("/v1/models/chat/submit"), Some("chat"));
        assert_eq!(model_from_path("/admin/models/ocr/start"), Some("ocr"));
        assert_eq!(model_from_path("/admin/models"), None);
        assert_eq!(model_from_path("/v1/items/abc"), None);
    }
}
