use axum::body::{Body, Bytes};
use axum::http::{header, HeaderValue};
use axum::response::Response;
use futures_util::{stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Terminator every stream ends with, error or not, so the client read loop
/// always finishes deterministically.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// One wire frame: a compact JSON record in an SSE data line.
pub fn frame<T: Serialize>(event: &T) -> String {
    match serde_json::to_string(event) {
        Ok(json) => format!("data: {json}\n\n"),
        Err(e) => {
            log::error!("[sse] failed to encode event: {e}");
            "data: {}\n\n".to_string()
        }
    }
}

/// Turns a channel of events into a streaming response. The producer side
/// just drops its sender when finished; the terminator frame is appended
/// here, after the channel drains, so it follows even an error event.
pub fn event_stream<T: Serialize + Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> Response {
    let body = UnboundedReceiverStream::new(rx)
        .map(|event| Ok::<_, Infallible>(Bytes::from(frame(&event))))
        .chain(stream::once(async { Ok::<_, Infallible>(Bytes::from(DONE_FRAME)) }));

    let mut response = Response::new(Body::from_stream(body));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::select::ProgressEvent;

    #[test]
    fn test_frame_is_data_line_terminated() {
        let frame = frame(&ProgressEvent::Ram { ram_gb: 14 });
        assert_eq!(frame, "data: {\"step\":\"ram\",\"ramGB\":14}\n\n");
    }

    #[test]
    fn test_result_event_keeps_null_speed_visible() {
        let frame = frame(&ProgressEvent::Result {
            model: "Qwen3 4B".to_string(),
            ram_gb: 14,
            speed: None,
            fallback: true,
        });
        assert!(frame.contains("\"speed\":null"));
        assert!(frame.contains("\"fallback\":true"));
    }

    #[test]
    fn test_done_frame_shape() {
        assert_eq!(DONE_FRAME, "data: [DONE]\n\n");
    }
}
