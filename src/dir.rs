//! Directory roots with optional allow-tests.
//!
//! A [`Dir`] is built once at startup and never changes. It maps untrusted
//! request paths onto its root and decides which relative paths are visible,
//! both for file serving and for filtering watcher events.

use regex::Regex;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Decides whether a path relative to a [`Dir`] root is visible.
#[derive(Clone)]
pub enum PathTest {
    /// Visible when the pattern matches.
    Pattern(Regex),
    /// Visible when the function returns true.
    Func(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl PathTest {
    pub fn func(fun: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        PathTest::Func(Arc::new(fun))
    }

    /// Inverse test: paths matching `pattern` are hidden, everything else is visible.
    pub fn hide(pattern: &str) -> Result<Self, regex::Error> {
        let re = Regex::new(pattern)?;
        Ok(PathTest::func(move |path| !re.is_match(path)))
    }

    pub fn test(&self, path: &str) -> bool {
        match self {
            PathTest::Pattern(re) => re.is_match(path),
            PathTest::Func(fun) => fun(path),
        }
    }
}

impl From<Regex> for PathTest {
    fn from(re: Regex) -> Self {
        PathTest::Pattern(re)
    }
}

impl fmt::Debug for PathTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathTest::Pattern(re) => f.debug_tuple("Pattern").field(&re.as_str()).finish(),
            PathTest::Func(_) => f.write_str("Func(..)"),
        }
    }
}

/// A directory root plus an optional allow-test.
#[derive(Debug, Clone)]
pub struct Dir {
    root: PathBuf,
    test: Option<PathTest>,
}

impl Dir {
    /// Relative paths are taken relative to the current working directory.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        };
        let root = std::fs::canonicalize(&joined).unwrap_or(joined);
        Dir { root, test: None }
    }

    pub fn with_test(mut self, test: impl Into<PathTest>) -> Self {
        self.test = Some(test.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Joins a request path onto the root. `None` when the path tries to
    /// escape the root.
    pub fn resolve_url(&self, requested: &str) -> Option<PathBuf> {
        clean_path(requested).map(|rel| self.root.join(rel))
    }

    /// Applies the allow-test. The empty path (the root itself) is never allowed.
    pub fn allow(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        self.test.as_ref().map_or(true, |test| test.test(path))
    }

    pub fn allow_path(&self, location: &Path) -> bool {
        self.allow(&self.rel(location))
    }

    /// Path of `location` relative to the root, `/`-separated.
    /// Empty when `location` is the root or lies outside it.
    pub fn rel(&self, location: &Path) -> String {
        let Ok(rest) = location.strip_prefix(&self.root) else {
            return String::new();
        };
        rest.components()
            .filter_map(|component| match component {
                Component::Normal(name) => Some(name.to_string_lossy()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Normalizes an untrusted request path into a root-relative path.
///
/// Strips scheme and authority, query and fragment, percent-decodes, and
/// drops empty and `.` segments. A trailing slash is kept. Returns `None`
/// for any `..` segment, NUL byte, backslash or undecodable input.
pub fn clean_path(requested: &str) -> Option<String> {
    let path = strip_origin(requested);
    let path = path
        .split(|c: char| c == '?' || c == '#')
        .next()
        .unwrap_or_default();

    let decoded = urlencoding::decode(path).ok()?;
    if decoded.contains('\0') || decoded.contains('\\') {
        return None;
    }

    let mut segments = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            name => segments.push(name),
        }
    }

    let mut out = segments.join("/");
    if decoded.ends_with('/') && !out.is_empty() {
        out.push('/');
    }
    Some(out)
}

fn strip_origin(requested: &str) -> &str {
    match requested.find("://") {
        Some(idx) => {
            let rest = &requested[idx + 3..];
            rest.find('/').map_or("/", |slash| &rest[slash..])
        }
        None => requested,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_path_normalizes() {
        assert_eq!(clean_path("/").as_deref(), Some(""));
        assert_eq!(clean_path("/about").as_deref(), Some("about"));
        assert_eq!(clean_path("about/").as_deref(), Some("about/"));
        assert_eq!(clean_path("//a/./b?x=1#top").as_deref(), Some("a/b"));
        assert_eq!(clean_path("/with%20space.html").as_deref(), Some("with space.html"));
        assert_eq!(clean_path("http://localhost:8080/docs/").as_deref(), Some("docs/"));
        assert_eq!(clean_path("http://localhost:8080").as_deref(), Some(""));
    }

    #[test]
    fn clean_path_rejects_traversal() {
        assert_eq!(clean_path("/../etc/passwd"), None);
        assert_eq!(clean_path("/a/../b"), None);
        assert_eq!(clean_path("/%2e%2e/secret"), None);
        assert_eq!(clean_path("/a%2F..%2Fb"), None);
        assert_eq!(clean_path("/a\\..\\b"), None);
        assert_eq!(clean_path("/nul%00byte"), None);
    }

    #[test]
    fn allow_rejects_empty_path() {
        let dir = Dir::new("/srv/site");
        assert!(!dir.allow(""));
        assert!(dir.allow("index.html"));
    }

    #[test]
    fn allow_applies_tests() {
        let dir = Dir::new("/srv/site").with_test(Regex::new(r"[.](html|css)$").unwrap());
        assert!(dir.allow("index.html"));
        assert!(!dir.allow("script.js"));

        let dir = Dir::new("/srv/site").with_test(PathTest::hide(r"(^|/)[.]").unwrap());
        assert!(dir.allow("a/b.txt"));
        assert!(!dir.allow(".env"));
        assert!(!dir.allow("a/.git/config"));
    }

    #[test]
    fn rel_is_relative_to_root() {
        let dir = Dir::new("/srv/site");
        assert_eq!(dir.rel(Path::new("/srv/site/css/main.css")), "css/main.css");
        assert_eq!(dir.rel(Path::new("/srv/site")), "");
        assert_eq!(dir.rel(Path::new("/srv/other/x.css")), "");
        assert!(!dir.allow_path(Path::new("/srv/other/x.css")));
    }

    #[test]
    fn resolve_url_stays_inside_root() {
        let dir = Dir::new("/srv/site");
        assert_eq!(
            dir.resolve_url("/css/main.css"),
            Some(PathBuf::from("/srv/site/css/main.css"))
        );
        assert_eq!(dir.resolve_url("/../site2/x"), None);
    }
}
