//! GET and HEAD: static resources served from the cache.

use super::{HttpService, Method, Request, Response};
use crate::cache::{CacheError, Content};
use tracing::{debug, error};

pub(super) fn serve(service: &HttpService, request: &Request) -> Response {
    let cache = service.cache();
    let freshness_ms = cache.settings().freshness_ms;

    let entry = match cache.lookup_or_populate(&request.path, freshness_ms) {
        Ok(entry) => entry,
        Err(e) => return failure(&request.path, e),
    };
    let content = entry.content();
    let max_age = format!("max-age={}", freshness_ms / 1000);

    let range = request.header("Range");
    if range.is_none() && not_modified(request, &content) {
        return Response::new(304)
            .header("ETag", content.etag.clone())
            .header("Last-Modified", content.last_modified.clone())
            .header("Cache-Control", max_age);
    }

    let mut response = Response::new(200);
    let body = match (&content.compressed, accepts_deflate(request)) {
        (Some(compressed), true) => {
            response = response
                .header("Content-Encoding", "deflate")
                .header("Vary", "Accept-Encoding");
            compressed.clone()
        }
        _ => content.body.clone(),
    };

    let body = match range.map(|r| parse_range(r, body.len())) {
        None | Some(RangeSpec::Ignored) => body,
        Some(RangeSpec::Satisfiable(start, end)) => {
            response.status = 206;
            response = response.header("Content-Range", format!("bytes {start}-{end}/{}", body.len()));
            body.slice(start..=end)
        }
        Some(RangeSpec::Unsatisfiable) => {
            return Response::error(416).header("Content-Range", format!("bytes */{}", body.len()));
        }
    };

    let response = response
        .header("Accept-Ranges", "bytes")
        .header("Cache-Control", max_age)
        .header("ETag", content.etag.clone())
        .header("Last-Modified", content.last_modified.clone())
        .header("Content-Type", content.mime.content_type())
        .body(body);

    if request.method == Method::Head {
        response.head_only()
    } else {
        response
    }
}

fn failure(path: &str, e: CacheError) -> Response {
    match e {
        CacheError::NotFound => {
            debug!(path, "No such resource");
            Response::error(404)
        }
        CacheError::Forbidden | CacheError::IsDirectory => {
            debug!(path, error = %e, "Access forbidden");
            Response::error(403)
        }
        CacheError::Io(e) => {
            error!(path, error = %e, "Failed to load resource");
            Response::error(500)
        }
    }
}

fn accepts_deflate(request: &Request) -> bool {
    request
        .header("Accept-Encoding")
        .is_some_and(|v| v.split(',').any(|c| c.trim().starts_with("deflate")))
}

/// A `max-age=0` request whose validator matches the cached one.
fn not_modified(request: &Request, content: &Content) -> bool {
    let Some(cache_control) = request.header("Cache-Control") else {
        return false;
    };
    if cache_control.contains("no-store") || cache_control.contains("no-cache") {
        return false;
    }
    let wants_revalidation = cache_control.split(',').any(|directive| {
        directive
            .trim()
            .strip_prefix("max-age=")
            .is_some_and(|v| v.trim() == "0")
    });
    if !wants_revalidation {
        return false;
    }

    match request.header("If-None-Match") {
        Some(etag) => etag == content.etag,
        None => request
            .header("If-Modified-Since")
            .is_some_and(|since| since == content.last_modified),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RangeSpec {
    /// Inclusive byte range within the body.
    Satisfiable(usize, usize),
    Unsatisfiable,
    /// Not a single byte range; the full body is served.
    Ignored,
}

fn parse_range(header: &str, len: usize) -> RangeSpec {
    let Some(ranges) = header.trim().strip_prefix("bytes=") else {
        return RangeSpec::Ignored;
    };
    if ranges.contains(',') {
        return RangeSpec::Ignored;
    }
    let Some((first, last)) = ranges.split_once('-') else {
        return RangeSpec::Ignored;
    };
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        // Suffix range: the last N bytes.
        return match last.parse::<usize>() {
            Ok(0) => RangeSpec::Unsatisfiable,
            Ok(_) if len == 0 => RangeSpec::Unsatisfiable,
            Ok(n) => RangeSpec::Satisfiable(len.saturating_sub(n), len - 1),
            Err(_) => RangeSpec::Ignored,
        };
    }

    let Ok(start) = first.parse::<usize>() else {
        return RangeSpec::Ignored;
    };
    if start >= len {
        return RangeSpec::Unsatisfiable;
    }
    if last.is_empty() {
        return RangeSpec::Satisfiable(start, len - 1);
    }
    match last.parse::<usize>() {
        Ok(end) if end < start => RangeSpec::Ignored,
        Ok(end) => RangeSpec::Satisfiable(start, end.min(len - 1)),
        Err(_) => RangeSpec::Ignored,
    }
}
