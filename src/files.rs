//! standard file answering for GET and HEAD
//!
//! Companion helpers on top of the io engine: resolve a request target
//! under the connection domain's document root and answer with the file
//! content. A target escaping the root after dot segment normalization
//! yields 404, as does a missing file.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::handler::ConnId;
use crate::http::{HttpMessage, MAX_URI_BYTES};
use crate::server::Server;

/// mime description supplied by the caller, no sniffing happens here
#[derive(Debug, Clone)]
pub struct FileFormat {
    pub mime: String,
    pub charset: Option<String>,
}

impl FileFormat {
    pub fn new(mime: &str) -> Self {
        Self {
            mime: mime.into(),
            charset: None,
        }
    }

    pub fn with_charset(mime: &str, charset: &str) -> Self {
        Self {
            mime: mime.into(),
            charset: Some(charset.into()),
        }
    }

    fn content_type(&self) -> String {
        match &self.charset {
            Some(charset) => format!("{}; charset={}", self.mime, charset),
            None => self.mime.clone(),
        }
    }
}

/// resolve a request target below `root`, `None` when it escapes
pub fn uri_file_path(root: &Path, uri: &[u8]) -> Option<PathBuf> {
    if uri.len() > MAX_URI_BYTES {
        return None;
    }
    let uri = std::str::from_utf8(uri).ok()?;
    let path = uri.split(['?', '#']).next()?;

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }

    let mut resolved = root.to_path_buf();
    for segment in &segments {
        resolved.push(segment);
    }
    if segments.is_empty() || path.ends_with('/') {
        resolved.push("index.html");
    }
    Some(resolved)
}

fn not_found(request: &HttpMessage) -> HttpMessage {
    let mut response =
        HttpMessage::response(*request.config(), request.version(), 404, "Not Found");
    response.set_content_length(0);
    response.close_header();
    response
}

fn file_response(
    request: &HttpMessage,
    format: &FileFormat,
    data: &[u8],
    with_body: bool,
) -> HttpMessage {
    let mut response = HttpMessage::response(*request.config(), request.version(), 200, "OK");
    response.add_header("Content-Type", &format.content_type());
    response.set_content_length(data.len());
    response.close_header();
    if with_body {
        // the header was closed right above
        let _ = response.add_body(data);
    }
    response
}

impl Server {
    /// answer a GET request with the addressed file
    pub async fn answer_get(&self, socket: ConnId, format: FileFormat, request: &HttpMessage) -> bool {
        if !request.is_request("GET") {
            return false;
        }
        self.answer_file(socket, format, request, true).await
    }

    /// answer a HEAD request with the file's headers only
    pub async fn answer_head(
        &self,
        socket: ConnId,
        format: FileFormat,
        request: &HttpMessage,
    ) -> bool {
        if !request.is_request("HEAD") {
            return false;
        }
        self.answer_file(socket, format, request, false).await
    }

    async fn answer_file(
        &self,
        socket: ConnId,
        format: FileFormat,
        request: &HttpMessage,
        with_body: bool,
    ) -> bool {
        let Some(domain) = self.connection_domain(socket) else {
            return false;
        };
        let Some(uri) = request.request_uri() else {
            return false;
        };

        let response = match uri_file_path(domain.document_root(), uri) {
            Some(path) => match tokio::fs::read(&path).await {
                Ok(data) => file_response(request, &format, &data, with_body),
                Err(e) => {
                    debug!(socket, path = %path.display(), %e, "file not answerable");
                    not_found(request)
                }
            },
            None => not_found(request),
        };
        self.send_secure(socket, response.into_buffer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpMessageConfig;
    use crate::Parsing;
    use bytes::BytesMut;

    #[test]
    fn resolves_below_the_root() {
        let root = Path::new("/srv/www");
        assert_eq!(
            uri_file_path(root, b"/index.html"),
            Some(PathBuf::from("/srv/www/index.html"))
        );
        assert_eq!(
            uri_file_path(root, b"/a/b/c.css"),
            Some(PathBuf::from("/srv/www/a/b/c.css"))
        );
    }

    #[test]
    fn normalizes_dot_segments() {
        let root = Path::new("/srv/www");
        assert_eq!(
            uri_file_path(root, b"/a/../b.html"),
            Some(PathBuf::from("/srv/www/b.html"))
        );
        assert_eq!(
            uri_file_path(root, b"/a/./b.html"),
            Some(PathBuf::from("/srv/www/a/b.html"))
        );
    }

    #[test]
    fn escaping_the_root_is_rejected() {
        let root = Path::new("/srv/www");
        assert!(uri_file_path(root, b"/../etc/passwd").is_none());
        assert!(uri_file_path(root, b"/a/../../etc/passwd").is_none());
    }

    #[test]
    fn directory_targets_get_the_index() {
        let root = Path::new("/srv/www");
        assert_eq!(
            uri_file_path(root, b"/"),
            Some(PathBuf::from("/srv/www/index.html"))
        );
        assert_eq!(
            uri_file_path(root, b"/sub/"),
            Some(PathBuf::from("/srv/www/sub/index.html"))
        );
    }

    #[test]
    fn query_and_fragment_are_stripped() {
        let root = Path::new("/srv/www");
        assert_eq!(
            uri_file_path(root, b"/page.html?x=1#top"),
            Some(PathBuf::from("/srv/www/page.html"))
        );
    }

    #[test]
    fn head_response_has_headers_only() {
        let raw = b"HEAD /f.txt HTTP/1.1\r\nHost: a\r\n\r\n";
        let mut request =
            HttpMessage::with_buffer(HttpMessageConfig::default().init(), BytesMut::from(&raw[..]));
        assert!(matches!(request.parse(), Ok(Parsing::Complete { .. })));

        let format = FileFormat::with_charset("text/plain", "utf-8");
        let response = file_response(&request, &format, b"hello", false);
        let raw = response.into_buffer();
        let text = String::from_utf8(raw.to_vec()).unwrap();
        assert!(text.contains("Content-Type:text/plain; charset=utf-8\r\n"));
        assert!(text.contains("Content-Length:5\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
