//! URI helpers shared by the resolvers, the providers and the cache store.

use std::path::{Path, PathBuf};

use url::Url;

/// Parse `uri` as an absolute URI. Single-letter schemes are Windows drive
/// letters, not URIs.
pub fn parse_absolute(uri: &str) -> Option<Url> {
    Url::parse(uri).ok().filter(|url| url.scheme().len() > 1)
}

/// Expand `system_id` against `base_uri`, the way a relative schema reference
/// in a document is interpreted.
pub fn expand_system_id(system_id: &str, base_uri: Option<&str>) -> Option<String> {
    let system_id = system_id.trim();
    if system_id.is_empty() {
        return None;
    }
    if let Some(url) = parse_absolute(system_id) {
        return Some(url.to_string());
    }
    let path = Path::new(system_id);
    if path.is_absolute() {
        return Url::from_file_path(path).ok().map(|url| url.to_string());
    }
    let base = base_uri.and_then(base_url)?;
    base.join(system_id).ok().map(|url| url.to_string())
}

/// Interpret `base` as a URI, or as a file path when it is not one.
pub fn base_url(base: &str) -> Option<Url> {
    parse_absolute(base).or_else(|| {
        let path = Path::new(base);
        if path.is_absolute() {
            Url::from_file_path(path).ok()
        } else {
            std::env::current_dir()
                .ok()
                .and_then(|cwd| Url::from_file_path(cwd.join(path)).ok())
        }
    })
}

/// Turn a directory URI or path into a base URI whose joins land inside it.
pub fn directory_url(dir: &str) -> Option<Url> {
    let mut url = base_url(dir)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Some(url)
}

/// URIs downloaded by the resource cache.
pub fn is_remote(uri: &str) -> bool {
    matches!(
        parse_absolute(uri).as_ref().map(Url::scheme),
        Some("http" | "https" | "ftp")
    )
}

/// Local path of a `file:` URI or of a plain path.
pub fn to_file_path(uri: &str) -> Option<PathBuf> {
    match parse_absolute(uri) {
        Some(url) if url.scheme() == "file" => url.to_file_path().ok(),
        Some(_) => None,
        None => Some(PathBuf::from(uri)),
    }
}

pub fn from_file_path(path: &Path) -> Option<String> {
    Url::from_file_path(path).ok().map(|url| url.to_string())
}

/// Lower-cased extension of the last path segment.
pub fn extension(uri: &str) -> Option<String> {
    let path = match parse_absolute(uri) {
        Some(url) => url.path().to_string(),
        None => uri.to_string(),
    };
    let file_name = path.rsplit(['/', '\\']).next()?;
    let (_, ext) = file_name.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

/// Last path segment, used to label documentation sources.
pub fn file_name(uri: &str) -> &str {
    let trimmed = uri.trim_end_matches('/');
    trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_relative_system_id() {
        assert_eq!(
            expand_system_id("a.xsd", Some("file:///work/docs/doc.xml")).as_deref(),
            Some("file:///work/docs/a.xsd")
        );
        assert_eq!(
            expand_system_id("../xsd/a.xsd", Some("file:///work/docs/doc.xml")).as_deref(),
            Some("file:///work/xsd/a.xsd")
        );
        assert_eq!(
            expand_system_id("b.xsd", Some("http://example.com/schemas/a.xsd")).as_deref(),
            Some("http://example.com/schemas/b.xsd")
        );
    }

    #[test]
    fn test_expand_absolute_system_id() {
        assert_eq!(
            expand_system_id("http://example.com/a.xsd", None).as_deref(),
            Some("http://example.com/a.xsd")
        );
        assert_eq!(
            expand_system_id("/opt/schemas/a.xsd", None).as_deref(),
            Some("file:///opt/schemas/a.xsd")
        );
        assert!(expand_system_id("a.xsd", None).is_none());
        assert!(expand_system_id("  ", Some("file:///doc.xml")).is_none());
    }

    #[test]
    fn test_remote_detection() {
        assert!(is_remote("http://example.com/a.xsd"));
        assert!(is_remote("https://example.com/a.xsd"));
        assert!(is_remote("ftp://example.com/a.xsd"));
        assert!(!is_remote("file:///tmp/a.xsd"));
        assert!(!is_remote("a.xsd"));
    }

    #[test]
    fn test_extension_and_file_name() {
        assert_eq!(extension("file:///tmp/A.XSD").as_deref(), Some("xsd"));
        assert_eq!(extension("http://example.com/s.rng?x=1").as_deref(), Some("rng"));
        assert_eq!(extension("schema"), None);
        assert_eq!(file_name("http://example.com/schemas/note.dtd"), "note.dtd");
    }

    #[test]
    fn test_file_path_round_trip() {
        let path = to_file_path("file:///tmp/a.xsd").unwrap();
        assert_eq!(path, PathBuf::from("/tmp/a.xsd"));
        assert!(to_file_path("http://example.com/a.xsd").is_none());
        assert_eq!(from_file_path(&path).as_deref(), Some("file:///tmp/a.xsd"));
    }
}
