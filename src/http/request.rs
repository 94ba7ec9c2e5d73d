//! HTTP/1.x request framing.
//!
//! Only what the server acts on is extracted: the request line, the header
//! list and a `Content-Length` delimited body.

use bytes::Bytes;

/// Largest accepted request head (request line plus headers).
pub const MAX_HEAD_LEN: usize = 16 * 1024;
/// Largest accepted request body.
pub const MAX_BODY_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Other(String),
}

impl Method {
    fn from_token(token: &str) -> Self {
        match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            other => Method::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// Path without the query string.
    pub path: String,
    pub query: Option<String>,
    /// Minor version of HTTP/1.x.
    pub version: u8,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// A full request and the number of bytes it occupied.
    Complete(Request, usize),
    /// Need more data.
    Incomplete,
    /// Malformed or oversized request.
    Error,
}

impl Request {
    /// Parse one complete request, ignoring any trailing bytes.
    pub fn parse(input: &[u8]) -> Option<Request> {
        match parse(input) {
            ParseResult::Complete(request, _) => Some(request),
            _ => None,
        }
    }

    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the client expects the connection to stay open.
    pub fn keep_alive(&self) -> bool {
        match self.header("Connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version >= 1,
        }
    }

    /// Value of cookie `name`.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.header("Cookie")?.split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then_some(value)
        })
    }

    /// Token from `Authorization: Bearer …`, falling back to the `token`
    /// cookie.
    pub fn bearer_token(&self) -> Option<&str> {
        let from_header = self.header("Authorization").and_then(|v| {
            let (scheme, token) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        });
        from_header
            .or_else(|| self.cookie("token"))
            .filter(|t| !t.is_empty())
    }
}

/// Parse a request from the front of `input`.
pub fn parse(input: &[u8]) -> ParseResult {
    let head_end = match find_head_end(input) {
        Some(pos) => pos,
        None if input.len() > MAX_HEAD_LEN => return ParseResult::Error,
        None => return ParseResult::Incomplete,
    };
    if head_end > MAX_HEAD_LEN {
        return ParseResult::Error;
    }

    let Ok(head) = std::str::from_utf8(&input[..head_end]) else {
        return ParseResult::Error;
    };
    let mut lines = head.split("\r\n");

    let Some((method, target, version)) = lines.next().and_then(parse_request_line) else {
        return ParseResult::Error;
    };

    let mut headers = Vec::new();
    for line in lines {
        match line.split_once(':') {
            Some((name, value)) if !name.is_empty() && !name.contains(' ') => {
                headers.push((name.to_string(), value.trim().to_string()));
            }
            _ => return ParseResult::Error,
        }
    }

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (target.to_string(), None),
    };

    let mut request = Request {
        method,
        path,
        query,
        version,
        headers,
        body: Bytes::new(),
    };

    // Chunked bodies are not supported.
    if request
        .header("Transfer-Encoding")
        .is_some_and(|v| !v.eq_ignore_ascii_case("identity"))
    {
        return ParseResult::Error;
    }

    let body_len = match request.header("Content-Length") {
        None => 0,
        Some(v) => match v.parse::<usize>() {
            Ok(n) if n <= MAX_BODY_LEN => n,
            _ => return ParseResult::Error,
        },
    };

    let body_start = head_end + 4;
    let total = body_start + body_len;
    if input.len() < total {
        return ParseResult::Incomplete;
    }
    request.body = Bytes::copy_from_slice(&input[body_start..total]);
    ParseResult::Complete(request, total)
}

fn parse_request_line(line: &str) -> Option<(Method, &str, u8)> {
    let mut parts = line.split(' ');
    let method = parts.next().filter(|m| !m.is_empty())?;
    let target = parts.next().filter(|t| t.starts_with('/'))?;
    let version = match parts.next()? {
        "HTTP/1.1" => 1,
        "HTTP/1.0" => 0,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((Method::from_token(method), target, version))
}

/// Position of the blank line that ends the head.
fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get() {
        let input = b"GET /index.html?x=1 HTTP/1.1\r\nHost: localhost\r\nAccept-Encoding: gzip, deflate\r\n\r\n";
        match parse(input) {
            ParseResult::Complete(req, n) => {
                assert_eq!(n, input.len());
                assert_eq!(req.method, Method::Get);
                assert_eq!(req.path, "/index.html");
                assert_eq!(req.query.as_deref(), Some("x=1"));
                assert_eq!(req.header("host"), Some("localhost"));
                assert_eq!(req.header("ACCEPT-ENCODING"), Some("gzip, deflate"));
                assert!(req.keep_alive());
                assert!(req.body.is_empty());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_post_body() {
        let input = b"POST /query HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 5\r\n\r\nhelloGET";
        match parse(input) {
            ParseResult::Complete(req, n) => {
                assert_eq!(req.method, Method::Post);
                assert_eq!(&req.body[..], b"hello");
                assert_eq!(n, input.len() - 3);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_incomplete() {
        assert!(matches!(parse(b"GET / HTTP/1.1\r\nHost: a\r\n"), ParseResult::Incomplete));
        assert!(matches!(
            parse(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc"),
            ParseResult::Incomplete
        ));
        assert!(matches!(parse(b""), ParseResult::Incomplete));
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(parse(b"GARBAGE\r\n\r\n"), ParseResult::Error));
        assert!(matches!(parse(b"GET index HTTP/1.1\r\n\r\n"), ParseResult::Error));
        assert!(matches!(parse(b"GET / HTTP/2\r\n\r\n"), ParseResult::Error));
        assert!(matches!(
            parse(b"GET / HTTP/1.1\r\nno colon here\r\n\r\n"),
            ParseResult::Error
        ));
        assert!(matches!(
            parse(b"POST / HTTP/1.1\r\nContent-Length: nope\r\n\r\n"),
            ParseResult::Error
        ));
        assert!(matches!(
            parse(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n"),
            ParseResult::Error
        ));
    }

    #[test]
    fn test_oversized_head() {
        let mut input = b"GET / HTTP/1.1\r\nX-Fill: ".to_vec();
        input.extend(std::iter::repeat(b'a').take(MAX_HEAD_LEN + 1));
        assert!(matches!(parse(&input), ParseResult::Error));
    }

    #[test]
    fn test_keep_alive_rules() {
        let req = Request::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!req.keep_alive());
        let req = Request::parse(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n").unwrap();
        assert!(req.keep_alive());
        let req = Request::parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!req.keep_alive());
    }

    #[test]
    fn test_bearer_token_sources() {
        let req = Request::parse(b"GET / HTTP/1.1\r\nAuthorization: Bearer abc\r\n\r\n").unwrap();
        assert_eq!(req.bearer_token(), Some("abc"));

        let req = Request::parse(b"GET / HTTP/1.1\r\nCookie: theme=dark; token=xyz\r\n\r\n").unwrap();
        assert_eq!(req.bearer_token(), Some("xyz"));

        let req = Request::parse(b"GET / HTTP/1.1\r\nCookie: token=\r\n\r\n").unwrap();
        assert_eq!(req.bearer_token(), None);

        let req = Request::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.bearer_token(), None);
    }
}
