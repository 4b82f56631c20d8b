//! Span builders for relay instrumentation.

/// Span covering one relayed call, from `on_call_start` to the terminal
/// record.
///
/// Usage: `let span = relay_call_span!(request_id, method, uri);`
///
/// `status` and `latency_ms` are recorded once the call terminates;
/// `failed` is set to `true` on the failure path.
#[macro_export]
macro_rules! relay_call_span {
    ($request_id:expr, $method:expr, $uri:expr) => {
        tracing::info_span!(
            "relay_call",
            request_id = %$request_id,
            method = %$method,
            uri = %$uri,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
            failed = tracing::field::Empty,
        )
    };
}

/// Span for one inbound request handled by the debug proxy.
#[macro_export]
macro_rules! proxy_request_span {
    ($method:expr, $path:expr) => {
        tracing::info_span!(
            "proxy_request",
            method = %$method,
            path = %$path,
            captured = tracing::field::Empty,
        )
    };
}
