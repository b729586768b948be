//! Request path → file resolution over one [`Dir`] or an ordered list of them.
//!
//! Resolution never reports "not found", "hidden" or "traversal" as an error:
//! all three are `Ok(None)`, so fallback chains compose with `?` and early
//! returns. Only genuine filesystem failures (permissions, I/O) are `Err`.

use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::dir::{clean_path, Dir};
use crate::error::AfrError;
use crate::msg::ext;

/// Page served with status 404 when site resolution finds nothing.
pub const NOT_FOUND_PAGE: &str = "404.html";

/// An existing filesystem entry found for a request. Never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsInfo {
    pub path: PathBuf,
    pub is_file: bool,
}

impl FsInfo {
    pub fn only_file(self) -> Option<Self> {
        self.is_file.then_some(self)
    }
}

/// Exact resolution: files and directories alike.
pub async fn resolve(dir: &Dir, requested: &str) -> Result<Option<FsInfo>, AfrError> {
    match clean_path(requested) {
        Some(rel) => resolve_clean(dir, &rel).await,
        None => Ok(None),
    }
}

/// Exact resolution restricted to regular files.
pub async fn resolve_file(dir: &Dir, requested: &str) -> Result<Option<FsInfo>, AfrError> {
    Ok(resolve(dir, requested).await?.and_then(FsInfo::only_file))
}

/// Site resolution: exact file, then `<path>.html`, then `<path>/index.html`.
///
/// Requests with an extension only ever get the exact match; requests
/// ending in `/` skip the `.html` attempt.
pub async fn resolve_site(dir: &Dir, requested: &str) -> Result<Option<FsInfo>, AfrError> {
    let Some(rel) = clean_path(requested) else {
        return Ok(None);
    };

    if let Some(info) = resolve_clean_file(dir, &rel).await? {
        return Ok(Some(info));
    }
    if !ext(&rel).is_empty() {
        return Ok(None);
    }

    let dir_like = rel.is_empty() || rel.ends_with('/');
    if !dir_like {
        if let Some(info) = resolve_clean_file(dir, &format!("{rel}.html")).await? {
            return Ok(Some(info));
        }
    }

    let index = if dir_like {
        format!("{rel}index.html")
    } else {
        format!("{rel}/index.html")
    };
    resolve_clean_file(dir, &index).await
}

pub async fn resolve_in(dirs: &[Dir], requested: &str) -> Result<Option<FsInfo>, AfrError> {
    for dir in dirs {
        if let Some(info) = resolve(dir, requested).await? {
            return Ok(Some(info));
        }
    }
    Ok(None)
}

pub async fn resolve_file_in(dirs: &[Dir], requested: &str) -> Result<Option<FsInfo>, AfrError> {
    for dir in dirs {
        if let Some(info) = resolve_file(dir, requested).await? {
            return Ok(Some(info));
        }
    }
    Ok(None)
}

/// First directory with a site match wins.
pub async fn resolve_site_in(dirs: &[Dir], requested: &str) -> Result<Option<FsInfo>, AfrError> {
    for dir in dirs {
        if let Some(info) = resolve_site(dir, requested).await? {
            return Ok(Some(info));
        }
    }
    Ok(None)
}

/// The custom not-found page, if any directory has one.
pub async fn resolve_not_found_in(dirs: &[Dir]) -> Result<Option<FsInfo>, AfrError> {
    resolve_file_in(dirs, NOT_FOUND_PAGE).await
}

async fn resolve_clean(dir: &Dir, rel: &str) -> Result<Option<FsInfo>, AfrError> {
    let dir_like = rel.ends_with('/');
    let rel = rel.trim_end_matches('/');
    if !dir.allow(rel) {
        return Ok(None);
    }

    let path = dir.root().join(rel);
    let Some(meta) = maybe_stat(&path).await? else {
        return Ok(None);
    };
    // `name/` never addresses a regular file.
    if dir_like && meta.is_file() {
        return Ok(None);
    }

    Ok(Some(FsInfo {
        path,
        is_file: meta.is_file(),
    }))
}

async fn resolve_clean_file(dir: &Dir, rel: &str) -> Result<Option<FsInfo>, AfrError> {
    Ok(resolve_clean(dir, rel).await?.and_then(FsInfo::only_file))
}

/// `stat` that maps a missing entry to `None`.
pub async fn maybe_stat(path: &Path) -> Result<Option<Metadata>, AfrError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta)),
        Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::PathTest;
    use std::fs;
    use tempfile::TempDir;

    fn site(files: &[&str]) -> TempDir {
        let tmp = tempfile::tempdir().unwrap();
        for file in files {
            let path = tmp.path().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, file.as_bytes()).unwrap();
        }
        tmp
    }

    fn found(info: Option<FsInfo>, root: &Path) -> Option<String> {
        info.map(|info| {
            info.path
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
    }

    #[tokio::test]
    async fn traversal_is_absent_even_if_target_exists() {
        let outer = site(&["secret.txt", "root/index.html"]);
        let dir = Dir::new(outer.path().join("root"));

        for path in ["/../secret.txt", "../secret.txt", "/%2e%2e/secret.txt", "/x/../../secret.txt"] {
            assert_eq!(resolve(&dir, path).await.unwrap(), None, "{path}");
            assert_eq!(resolve_site(&dir, path).await.unwrap(), None, "{path}");
        }
    }

    #[tokio::test]
    async fn exact_resolution_reports_directories() {
        let tmp = site(&["docs/guide.html"]);
        let dir = Dir::new(tmp.path());

        let info = resolve(&dir, "/docs").await.unwrap().unwrap();
        assert!(!info.is_file);
        assert_eq!(resolve_file(&dir, "/docs").await.unwrap(), None);
        assert!(resolve_file(&dir, "/docs/guide.html").await.unwrap().is_some());
        assert_eq!(resolve(&dir, "/").await.unwrap(), None);
        assert_eq!(resolve(&dir, "/docs/guide.html/").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hidden_paths_look_missing() {
        let tmp = site(&[".env", "index.html"]);
        let dir = Dir::new(tmp.path()).with_test(PathTest::hide(r"(^|/)[.]").unwrap());

        assert_eq!(resolve(&dir, "/.env").await.unwrap(), None);
        assert!(resolve(&dir, "/index.html").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn site_falls_back_to_html_then_index() {
        let tmp = site(&["about.html", "blog/index.html", "index.html"]);
        let dir = Dir::new(tmp.path());
        let root = dir.root().to_path_buf();

        let hit = |path: &'static str| {
            let dir = dir.clone();
            async move { resolve_site(&dir, path).await.unwrap() }
        };

        assert_eq!(found(hit("/about").await, &root).as_deref(), Some("about.html"));
        assert_eq!(found(hit("/blog").await, &root).as_deref(), Some("blog/index.html"));
        assert_eq!(found(hit("/blog/").await, &root).as_deref(), Some("blog/index.html"));
        assert_eq!(found(hit("/").await, &root).as_deref(), Some("index.html"));
        assert_eq!(hit("/missing").await, None);
        // `/about/` skips the `.html` attempt and there is no `about/index.html`.
        assert_eq!(hit("/about/").await, None);
    }

    #[tokio::test]
    async fn site_with_extension_only_tries_exact_match() {
        let tmp = site(&["page.v2.html", "page.v2/index.html", "style.css.html"]);
        let dir = Dir::new(tmp.path());

        assert_eq!(resolve_site(&dir, "/page.v2").await.unwrap(), None);
        assert_eq!(resolve_site(&dir, "/style.css").await.unwrap(), None);
    }

    #[tokio::test]
    async fn first_directory_wins() {
        let first = site(&["shared.html"]);
        let second = site(&["shared.html", "only-second.html", "404.html"]);
        let dirs = [Dir::new(first.path()), Dir::new(second.path())];

        let info = resolve_site_in(&dirs, "/shared").await.unwrap().unwrap();
        assert!(info.path.starts_with(dirs[0].root()));

        let info = resolve_site_in(&dirs, "/only-second").await.unwrap().unwrap();
        assert!(info.path.starts_with(dirs[1].root()));

        let info = resolve_in(&dirs, "/only-second.html").await.unwrap().unwrap();
        assert!(info.is_file);

        let not_found = resolve_not_found_in(&dirs).await.unwrap().unwrap();
        assert!(not_found.path.ends_with("404.html"));
        assert_eq!(resolve_not_found_in(&dirs[..1]).await.unwrap(), None);
    }
}
