//! Content types by file extension.

/// Media types the server knows how to label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeType {
    Png,
    Jpeg,
    Gif,
    Bmp,
    Icon,
    Webp,
    Svg,
    Pdf,
    Gzip,
    Css,
    Html,
    Text,
    Javascript,
    Json,
    Binary,
}

impl MimeType {
    /// Classify a request path by its extension. Paths without one are
    /// served as binary.
    pub fn from_path(path: &str) -> Self {
        let name = path.rsplit('/').next().unwrap_or(path);
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => Self::from_extension(ext),
            _ => MimeType::Binary,
        }
    }

    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "png" => MimeType::Png,
            "jpg" | "jpeg" | "jpe" | "jfif" | "pjp" => MimeType::Jpeg,
            "gif" => MimeType::Gif,
            "bmp" => MimeType::Bmp,
            "ico" | "cur" => MimeType::Icon,
            "webp" => MimeType::Webp,
            "svg" => MimeType::Svg,
            "pdf" => MimeType::Pdf,
            "gz" => MimeType::Gzip,
            "css" => MimeType::Css,
            "js" | "mjs" => MimeType::Javascript,
            "html" | "htm" => MimeType::Html,
            "txt" => MimeType::Text,
            "json" => MimeType::Json,
            _ => MimeType::Binary,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            MimeType::Png => "image/png",
            MimeType::Jpeg => "image/jpeg",
            MimeType::Gif => "image/gif",
            MimeType::Bmp => "image/bmp",
            MimeType::Icon => "image/x-icon",
            MimeType::Webp => "image/webp",
            MimeType::Svg => "image/svg+xml",
            MimeType::Pdf => "application/pdf",
            MimeType::Gzip => "application/gzip",
            MimeType::Css => "text/css",
            MimeType::Html => "text/html; charset=utf-8",
            MimeType::Text => "text/plain; charset=utf-8",
            MimeType::Javascript => "application/javascript",
            MimeType::Json => "application/json",
            MimeType::Binary => "application/octet-stream",
        }
    }

    /// Text-like content is stored compressed alongside the raw body.
    pub fn is_compressible(self) -> bool {
        matches!(
            self,
            MimeType::Svg
                | MimeType::Css
                | MimeType::Html
                | MimeType::Text
                | MimeType::Javascript
                | MimeType::Json
        )
    }
}
