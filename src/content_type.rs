//! Extension to MIME type table used when serving files.

use std::collections::HashMap;
use std::path::Path;

use crate::msg::ext;

const DEFAULT_TYPES: &[(&str, &str)] = &[
    (".css", "text/css"),
    (".gif", "image/gif"),
    (".htm", "text/html"),
    (".html", "text/html"),
    (".ico", "image/x-icon"),
    (".jpeg", "image/jpeg"),
    (".jpg", "image/jpeg"),
    (".js", "application/javascript"),
    (".json", "application/json"),
    (".mjs", "application/javascript"),
    (".pdf", "application/pdf"),
    (".png", "image/png"),
    (".svg", "image/svg+xml"),
    (".tif", "image/tiff"),
    (".tiff", "image/tiff"),
    (".xml", "text/xml"),
    (".zip", "application/zip"),
    (".webp", "image/webp"),
    (".woff", "font/woff"),
    (".woff2", "font/woff2"),
];

/// Immutable extension table. Extensions not listed get no content type.
#[derive(Debug, Clone)]
pub struct ContentTypes {
    types: HashMap<String, String>,
}

impl Default for ContentTypes {
    fn default() -> Self {
        Self::from_pairs(DEFAULT_TYPES.iter().copied())
    }
}

impl ContentTypes {
    /// Builds a table from `(".ext", "mime/type")` pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        ContentTypes {
            types: pairs
                .into_iter()
                .map(|(ext, mime)| (ext.to_string(), mime.to_string()))
                .collect(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.types.get(ext(path)).map(String::as_str)
    }

    pub fn for_path(&self, path: &Path) -> Option<&str> {
        self.get(&path.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_and_unknown_extensions() {
        let types = ContentTypes::default();
        assert_eq!(types.get("site/main.css"), Some("text/css"));
        assert_eq!(types.get("font.woff2"), Some("font/woff2"));
        assert_eq!(types.for_path(Path::new("/srv/index.html")), Some("text/html"));
        assert_eq!(types.get("notes.md"), None);
        assert_eq!(types.get("Makefile"), None);
    }
}
