//! gRPC framing and the gRPC-Web bridge
//!
//! Listeners with the `grpc_web` filter accept gRPC-Web requests and send
//! them upstream as plain gRPC. The upstream trailers come back as a
//! trailer frame appended to the body, base64 encoded for the `-text` form.

use crate::error::ProxyError;
use crate::forwarder::UpstreamTrailers;
use crate::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, TE};
use hyper::{HeaderMap, Response, StatusCode};

pub const GRPC_WEB_FILTER: &str = "grpc_web";
pub const GRPC_CONTENT_TYPE: &str = "application/grpc";
pub const GRPC_STATUS: &str = "grpc-status";
pub const GRPC_MESSAGE: &str = "grpc-message";

const FRAME_HEADER_LEN: usize = 5;
const COMPRESSED_FLAG: u8 = 0x01;
const TRAILER_FLAG: u8 = 0x80;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrpcWebMode {
    Binary,
    /// Body is base64 encoded
    Text,
}

impl GrpcWebMode {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let content_type = headers.get(CONTENT_TYPE)?.to_str().ok()?;
        if content_type.starts_with("application/grpc-web-text") {
            Some(GrpcWebMode::Text)
        } else if content_type.starts_with("application/grpc-web") {
            Some(GrpcWebMode::Binary)
        } else {
            None
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            GrpcWebMode::Binary => "application/grpc-web+proto",
            GrpcWebMode::Text => "application/grpc-web-text+proto",
        }
    }
}

/// One length-prefixed message
#[derive(Debug, PartialEq, Eq)]
pub struct GrpcFrame<'a> {
    pub flags: u8,
    pub payload: &'a [u8],
}

impl GrpcFrame<'_> {
    pub fn is_trailer(&self) -> bool {
        self.flags & TRAILER_FLAG != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & COMPRESSED_FLAG != 0
    }
}

/// Prefix `message` with an uncompressed frame header
pub fn frame(message: &[u8]) -> Bytes {
    encode_frame(0, message).into()
}

fn encode_frame(flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.push(flags);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub fn frames(mut body: &[u8]) -> Result<Vec<GrpcFrame<'_>>> {
    let mut out = Vec::new();
    while !body.is_empty() {
        if body.len() < FRAME_HEADER_LEN {
            return Err(ProxyError::Grpc("truncated frame header".into()));
        }
        let len = u32::from_be_bytes([body[1], body[2], body[3], body[4]]) as usize;
        let end = FRAME_HEADER_LEN + len;
        if body.len() < end {
            return Err(ProxyError::Grpc(format!("frame of {} bytes is truncated", len)));
        }
        out.push(GrpcFrame {
            flags: body[0],
            payload: &body[FRAME_HEADER_LEN..end],
        });
        body = &body[end..];
    }
    Ok(out)
}

/// Headers every gRPC request towards an upstream carries
pub fn set_request_headers(headers: &mut HeaderMap) {
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
    headers.insert(TE, HeaderValue::from_static("trailers"));
    headers.remove(CONTENT_LENGTH);
}

/// Rewrite a gRPC-Web request body and headers into plain gRPC
pub fn web_request(mode: GrpcWebMode, headers: &mut HeaderMap, body: Bytes) -> Result<Bytes> {
    let body = match mode {
        GrpcWebMode::Binary => body,
        GrpcWebMode::Text => STANDARD
            .decode(body.trim_ascii())
            .map(Bytes::from)
            .map_err(|e| ProxyError::Grpc(format!("invalid base64 body: {}", e)))?,
    };
    set_request_headers(headers);
    Ok(body)
}

/// gRPC status of a collected reply; trailers-only replies carry it in the headers
pub fn status(response: &Response<Bytes>) -> Option<(u32, String)> {
    let trailers = response.extensions().get::<UpstreamTrailers>().map(|t| &t.0);
    let source = trailers
        .filter(|t| t.contains_key(GRPC_STATUS))
        .unwrap_or(response.headers());
    let code = source.get(GRPC_STATUS)?.to_str().ok()?.trim().parse().ok()?;
    let message = source
        .get(GRPC_MESSAGE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    Some((code, message))
}

/// Append the upstream trailers as a trailer frame and restore the gRPC-Web content type
pub fn web_response(mode: GrpcWebMode, response: Response<Bytes>) -> Response<Bytes> {
    let (mut parts, body) = response.into_parts();
    let trailers = parts
        .extensions
        .remove::<UpstreamTrailers>()
        .map(|t| t.0)
        .unwrap_or_default();

    let mut block = String::new();
    for (name, value) in &trailers {
        if let Ok(value) = value.to_str() {
            block.push_str(&format!("{}:{}\r\n", name, value));
        }
    }
    if !trailers.contains_key(GRPC_STATUS) {
        for name in [GRPC_STATUS, GRPC_MESSAGE] {
            if let Some(value) = parts.headers.get(name).and_then(|v| v.to_str().ok()) {
                block.push_str(&format!("{}:{}\r\n", name, value));
            }
        }
    }

    let mut out = body.to_vec();
    out.extend_from_slice(&encode_frame(TRAILER_FLAG, block.as_bytes()));
    let body = match mode {
        GrpcWebMode::Binary => Bytes::from(out),
        GrpcWebMode::Text => Bytes::from(STANDARD.encode(out)),
    };
    parts
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static(mode.content_type()));
    parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    Response::from_parts(parts, body)
}

/// HTTP status for a gRPC status code
pub fn http_status(code: u32) -> StatusCode {
    match code {
        0 => StatusCode::OK,
        1 => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        3 | 9 | 11 => StatusCode::BAD_REQUEST,
        4 => StatusCode::GATEWAY_TIMEOUT,
        5 => StatusCode::NOT_FOUND,
        6 | 10 => StatusCode::CONFLICT,
        7 => StatusCode::FORBIDDEN,
        8 => StatusCode::TOO_MANY_REQUESTS,
        12 => StatusCode::NOT_IMPLEMENTED,
        14 => StatusCode::SERVICE_UNAVAILABLE,
        16 => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(body: &[u8], trailers: Option<HeaderMap>) -> Response<Bytes> {
        let mut response = Response::new(Bytes::copy_from_slice(body));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
        if let Some(trailers) = trailers {
            response.extensions_mut().insert(UpstreamTrailers(trailers));
        }
        response
    }

    #[test]
    fn test_frames() {
        let mut body = frame(b"abc").to_vec();
        body.extend_from_slice(&frame(b"").to_vec());
        let parsed = frames(&body).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].payload, b"abc");
        assert!(!parsed[0].is_trailer());
        assert!(parsed[1].payload.is_empty());

        assert!(frames(&body[..3]).is_err());
        assert!(frames(&body[..6]).is_err());
    }

    #[test]
    fn test_mode_from_content_type() {
        let mut headers = HeaderMap::new();
        assert_eq!(GrpcWebMode::from_headers(&headers), None);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc-web+proto"));
        assert_eq!(GrpcWebMode::from_headers(&headers), Some(GrpcWebMode::Binary));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc-web-text"));
        assert_eq!(GrpcWebMode::from_headers(&headers), Some(GrpcWebMode::Text));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
        assert_eq!(GrpcWebMode::from_headers(&headers), None);
    }

    #[test]
    fn test_text_request_is_decoded() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(12));
        let framed = frame(b"hello");
        let encoded = Bytes::from(STANDARD.encode(&framed));

        let body = web_request(GrpcWebMode::Text, &mut headers, encoded).unwrap();
        assert_eq!(body, framed);
        assert_eq!(headers[CONTENT_TYPE], GRPC_CONTENT_TYPE);
        assert_eq!(headers[TE], "trailers");
        assert!(!headers.contains_key(CONTENT_LENGTH));

        assert!(web_request(GrpcWebMode::Text, &mut headers, Bytes::from("%%%")).is_err());
    }

    #[test]
    fn test_trailers_become_trailer_frame() {
        let mut trailers = HeaderMap::new();
        trailers.insert(GRPC_STATUS, HeaderValue::from_static("0"));
        let response = web_response(GrpcWebMode::Binary, reply(&frame(b"pet"), Some(trailers)));
        assert_eq!(response.headers()[CONTENT_TYPE], "application/grpc-web+proto");

        let parsed = frames(response.body()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].payload, b"pet");
        assert!(parsed[1].is_trailer());
        assert_eq!(parsed[1].payload, b"grpc-status:0\r\n");
    }

    #[test]
    fn test_trailers_only_reply() {
        let mut response = reply(b"", None);
        response
            .headers_mut()
            .insert(GRPC_STATUS, HeaderValue::from_static("5"));
        response
            .headers_mut()
            .insert(GRPC_MESSAGE, HeaderValue::from_static("no such pet"));
        assert_eq!(status(&response), Some((5, "no such pet".to_string())));

        let response = web_response(GrpcWebMode::Text, response);
        let decoded = STANDARD.decode(response.body()).unwrap();
        let parsed = frames(&decoded).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].payload, b"grpc-status:5\r\ngrpc-message:no such pet\r\n");
    }

    #[test]
    fn test_http_status() {
        assert_eq!(http_status(0), StatusCode::OK);
        assert_eq!(http_status(5), StatusCode::NOT_FOUND);
        assert_eq!(http_status(16), StatusCode::UNAUTHORIZED);
        assert_eq!(http_status(14), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(http_status(99), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
