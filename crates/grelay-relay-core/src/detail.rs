use serde::{Deserialize, Serialize};

pub const DEFAULT_REQUEST_BODY_MAX_SIZE: usize = 128 * 1024;
pub const DEFAULT_RESPONSE_BODY_MAX_SIZE: usize = 128 * 1024;
pub const CONTENT_MAX_SIZE: usize = 2 * 1024;

const ELLIPSIS: &str = "...";

/// Raw request and response bodies kept for audit. Never read by billing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDetail {
    pub request_body: String,
    pub response_body: String,
    pub request_body_truncated: bool,
    pub response_body_truncated: bool,
}

impl RequestDetail {
    pub fn new(
        request_body: &[u8],
        response_body: &[u8],
        request_max: usize,
        response_max: usize,
    ) -> Self {
        let (request_body, request_body_truncated) =
            truncate_text(&String::from_utf8_lossy(request_body), request_max);
        let (response_body, response_body_truncated) =
            truncate_text(&String::from_utf8_lossy(response_body), response_max);
        Self {
            request_body,
            response_body,
            request_body_truncated,
            response_body_truncated,
        }
    }
}

/// Cuts `text` to at most `max` bytes on a char boundary, marking the cut.
pub fn truncate_text(text: &str, max: usize) -> (String, bool) {
    if text.len() <= max {
        return (text.to_string(), false);
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + ELLIPSIS.len());
    out.push_str(&text[..end]);
    out.push_str(ELLIPSIS);
    (out, true)
}

pub fn truncate_content(content: &str) -> String {
    truncate_text(content, CONTENT_MAX_SIZE).0
}
