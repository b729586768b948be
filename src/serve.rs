//! File-serving responses built on [`crate::resolve`].

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
};
use std::path::Path;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::content_type::ContentTypes;
use crate::dir::Dir;
use crate::error::AfrError;
use crate::resolve::{resolve_file_in, resolve_not_found_in, resolve_site_in, FsInfo};

/// Streams a file. `content-type` comes from `types` unless `headers`
/// already has one.
pub async fn serve_exact_file(
    path: &Path,
    status: StatusCode,
    mut headers: HeaderMap,
    types: &ContentTypes,
) -> Result<Response, AfrError> {
    let file = tokio::fs::File::open(path).await?;

    if !headers.contains_key(header::CONTENT_TYPE) {
        if let Some(val) = types
            .for_path(path)
            .and_then(|mime| HeaderValue::from_str(mime).ok())
        {
            headers.insert(header::CONTENT_TYPE, val);
        }
    }

    let mut res = Response::new(Body::from_stream(ReaderStream::new(file)));
    *res.status_mut() = status;
    *res.headers_mut() = headers;
    Ok(res)
}

/// Serves files out of an ordered list of directories.
#[derive(Debug, Clone)]
pub struct FileServer {
    dirs: Vec<Dir>,
    types: ContentTypes,
    site: bool,
}

impl FileServer {
    pub fn new(dirs: Vec<Dir>) -> Self {
        FileServer {
            dirs,
            types: ContentTypes::default(),
            site: false,
        }
    }

    pub fn with_types(mut self, types: ContentTypes) -> Self {
        self.types = types;
        self
    }

    /// Use site resolution with the `404.html` fallback instead of exact files.
    pub fn site(mut self, site: bool) -> Self {
        self.site = site;
        self
    }

    pub fn dirs(&self) -> &[Dir] {
        &self.dirs
    }

    /// Serves according to the configured mode. `Ok(None)` means nothing matched.
    pub async fn respond(&self, requested: &str) -> Result<Option<Response>, AfrError> {
        if self.site {
            self.serve_site_with_not_found(requested).await
        } else {
            self.serve_file(requested).await
        }
    }

    pub async fn serve_file(&self, requested: &str) -> Result<Option<Response>, AfrError> {
        let info = resolve_file_in(&self.dirs, requested).await?;
        self.serve_info(info, StatusCode::OK).await
    }

    pub async fn serve_site(&self, requested: &str) -> Result<Option<Response>, AfrError> {
        let info = resolve_site_in(&self.dirs, requested).await?;
        self.serve_info(info, StatusCode::OK).await
    }

    pub async fn serve_site_not_found(&self) -> Result<Option<Response>, AfrError> {
        let info = resolve_not_found_in(&self.dirs).await?;
        self.serve_info(info, StatusCode::NOT_FOUND).await
    }

    pub async fn serve_site_with_not_found(
        &self,
        requested: &str,
    ) -> Result<Option<Response>, AfrError> {
        match self.serve_site(requested).await? {
            Some(res) => Ok(Some(res)),
            None => self.serve_site_not_found().await,
        }
    }

    async fn serve_info(
        &self,
        info: Option<FsInfo>,
        status: StatusCode,
    ) -> Result<Option<Response>, AfrError> {
        let Some(info) = info else {
            return Ok(None);
        };
        debug!("Serving {} for request", info.path.display());
        serve_exact_file(&info.path, status, HeaderMap::new(), &self.types)
            .await
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    async fn body_of(res: Response) -> String {
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn caller_content_type_wins() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("data.json");
        fs::write(&path, "{}").unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let res = serve_exact_file(&path, StatusCode::ACCEPTED, headers, &ContentTypes::default())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(body_of(res).await, "{}");
    }

    #[tokio::test]
    async fn custom_types_and_dir_priority() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        fs::write(first.path().join("app.wasm"), "first").unwrap();
        fs::write(second.path().join("app.wasm"), "second").unwrap();
        fs::write(second.path().join("404.html"), "gone").unwrap();

        let files = FileServer::new(vec![Dir::new(first.path()), Dir::new(second.path())])
            .with_types(ContentTypes::from_pairs([(".wasm", "application/wasm")]));
        assert_eq!(files.dirs().len(), 2);

        let res = files.respond("/app.wasm").await.unwrap().unwrap();
        assert_eq!(res.headers()[header::CONTENT_TYPE], "application/wasm");
        assert_eq!(body_of(res).await, "first");

        assert!(files.respond("/missing.wasm").await.unwrap().is_none());

        let site = files.site(true);
        let res = site.respond("/missing").await.unwrap().unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_of(res).await, "gone");
    }
}
