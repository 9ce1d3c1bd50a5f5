//! Request id propagation.
//!
//! Every request runs inside a `request` span carrying an id taken from the
//! `x-request-id` header or freshly generated. The id is echoed back on the
//! response and stored in the request extensions as [`RequestId`].

use axum::{
    extract::Request,
    http::{header::HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::future::Future;
use std::pin::Pin;
use tracing::Instrument;
use uuid::Uuid;

/// Header carrying the request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

type MiddlewareFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

type MiddlewareFn = fn(Request, Next) -> MiddlewareFuture;

/// Layer returned by [`request_id_layer`].
pub type RequestIdLayer = axum::middleware::FromFnLayer<MiddlewareFn, (), (Request,)>;

/// Id of the current request, available as an extension.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Creates the request id layer.
pub fn request_id_layer() -> RequestIdLayer {
    axum::middleware::from_fn(request_id_middleware)
}

fn request_id_middleware(mut request: Request, next: Next) -> MiddlewareFuture {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        uri = %request.uri(),
    );

    Box::pin(
        async move {
            let mut response = next.run(request).await;
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
            }
            response
        }
        .instrument(span),
    )
}
