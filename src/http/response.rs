//! HTTP/1.1 response building and encoding.

use bytes::Bytes;
use chrono::Utc;

pub const SERVER_NAME: &str = concat!("reactor-pool/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: Bytes,
    /// Send the head only (HEAD requests); `Content-Length` still reflects
    /// the body.
    pub head_only: bool,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
            head_only: false,
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn head_only(mut self) -> Self {
        self.head_only = true;
        self
    }

    /// Small HTML page carrying `message`.
    pub fn page(status: u16, message: &str) -> Self {
        Response::new(status)
            .header("Content-Type", "text/html; charset=utf-8")
            .body(format!("<html><body>{message}</body></html>"))
    }

    /// Page saying `<status> <reason>`.
    pub fn error(status: u16) -> Self {
        Response::page(status, &format!("{status} {}", reason(status)))
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn carries_body(&self) -> bool {
        !matches!(self.status, 100..=199 | 204 | 304)
    }

    /// Serialize the status line, headers and (unless suppressed) the body.
    pub fn encode(&self, keep_alive: bool) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason(self.status));
        head.push_str(&format!("Server: {SERVER_NAME}\r\n"));
        head.push_str(&format!("Date: {}\r\n", http_now()));
        head.push_str(if keep_alive {
            "Connection: keep-alive\r\n"
        } else {
            "Connection: close\r\n"
        });
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        if self.carries_body() {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        if self.carries_body() && !self.head_only {
            out.extend_from_slice(&self.body);
        }
        out
    }
}

fn http_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
