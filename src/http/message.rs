//! HTTP/1.1 request and response shapes used by the service sessions

use std::collections::HashMap;

/// Outgoing request. The session fills in `Host`, auth, and framing headers.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn get(path: impl Into<String>) -> HttpRequest {
        HttpRequest { method: "GET".into(), path: path.into(), ..Default::default() }
    }

    pub fn post(path: impl Into<String>, content_type: &str, body: Vec<u8>) -> HttpRequest {
        HttpRequest {
            method: "POST".into(),
            path: path.into(),
            content_type: Some(content_type.to_string()),
            body,
            ..Default::default()
        }
    }

    /// Serialize the head and body for the wire.
    pub fn to_bytes(&self, host: &str, port: u16, basic_authorization: &str) -> Vec<u8> {
        use std::fmt::Write;
        let mut head = String::new();
        let _ = write!(head, "{} {} HTTP/1.1\r\n", self.method, self.path);
        let _ = write!(head, "Host: {host}:{port}\r\n");
        let _ = write!(head, "Authorization: Basic {basic_authorization}\r\n");
        let _ = write!(head, "Content-Length: {}\r\n", self.body.len());
        if let Some(content_type) = &self.content_type {
            let _ = write!(head, "Content-Type: {content_type}\r\n");
        }
        for (name, value) in &self.headers {
            let _ = write!(head, "{name}: {value}\r\n");
        }
        head.push_str("\r\n");
        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Parsed response; header names are lowercased.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status_code: u16,
    pub reason: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// HTTP/1.1 defaults to keep-alive unless the peer opts out.
    pub fn keep_alive(&self) -> bool {
        !self
            .header("connection")
            .is_some_and(|value| value.eq_ignore_ascii_case("close"))
    }

    pub fn body_as_string(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}
