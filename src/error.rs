use std::path::PathBuf;

use thiserror::Error;

/// Error type for everything below the content model manager.
///
/// The manager itself never hands these to its callers: a failed resolution
/// degrades to "no grammar" and the error is logged.
#[derive(Error, Debug)]
pub enum ContentModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status error: {status} for {url} - {message}")]
    HttpStatus {
        url: String,
        status: u16,
        message: String,
    },

    #[error("Request timeout: {url} after {timeout_seconds} seconds")]
    Timeout { url: String, timeout_seconds: u64 },

    #[error("Invalid URI: {uri} - {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Unsupported protocol '{protocol}' for {uri}")]
    UnsupportedProtocol { uri: String, protocol: String },

    #[error("Insecure redirection: {uri} redirected to {target}")]
    InsecureRedirect { uri: String, target: String },

    #[error("XML document error: {} - {details}", uri.as_deref().unwrap_or("<unsaved>"))]
    Dom { uri: Option<String>, details: String },

    #[error("XML catalog error: {path} - {details}")]
    Catalog { path: PathBuf, details: String },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Resource still downloading: {uri}")]
    Downloading { uri: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl ContentModelError {
    /// Network failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ContentModelError::Http(error) => {
                error.is_timeout() || error.is_connect() || error.is_request()
            }
            ContentModelError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Errors that abandon a whole grammar read instead of one nested
    /// reference.
    pub fn aborts_read(&self) -> bool {
        matches!(
            self,
            ContentModelError::Cancelled | ContentModelError::Downloading { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ContentModelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let status = ContentModelError::HttpStatus {
            url: "http://example.com/schema.xsd".to_string(),
            status: 404,
            message: "HTTP 404: Not Found".to_string(),
        };
        assert!(status.to_string().contains("404"));
        assert!(status.to_string().contains("http://example.com/schema.xsd"));

        let dom = ContentModelError::Dom {
            uri: None,
            details: "unexpected end of stream".to_string(),
        };
        assert!(dom.to_string().contains("<unsaved>"));

        let invalid = ContentModelError::InvalidUri {
            uri: "http://example.com/../x.xsd".to_string(),
            reason: "path traversal".to_string(),
        };
        assert!(invalid.to_string().contains("path traversal"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "Access denied");
        let error: ContentModelError = io_error.into();

        match error {
            ContentModelError::Io(_) => (),
            _ => panic!("Expected ContentModelError::Io"),
        }
    }

    #[test]
    fn test_retryable_errors() {
        let timeout = ContentModelError::Timeout {
            url: "http://example.com".to_string(),
            timeout_seconds: 30,
        };
        assert!(timeout.is_retryable());

        let cancelled = ContentModelError::Cancelled;
        assert!(!cancelled.is_retryable());
        assert!(cancelled.aborts_read());

        let downloading = ContentModelError::Downloading {
            uri: "http://example.com/a.xsd".to_string(),
        };
        assert!(downloading.aborts_read());
        assert!(!timeout.aborts_read());
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let error = ContentModelError::Io(io_error);

        let source = error.source().unwrap();
        assert_eq!(source.to_string(), "File not found");
    }
}
