//! Static file backend

use crate::config::{ContentTypes, FileExtPolicy, MatchOptions};
use crate::error::Status;
use crate::response::{Request, Response, StatusLine};
use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::debug;

/// A file being served: `20 <content-type>` followed by the file contents
#[derive(Debug)]
pub struct StaticResponse {
    line: StatusLine,
    file: Option<File>,
    path: PathBuf,
}

impl StaticResponse {
    pub fn new(file: File, path: PathBuf, content_type: &str) -> Self {
        Self {
            line: StatusLine::new(Status::Success, content_type),
            file: Some(file),
            path,
        }
    }

    /// Path of the file actually opened
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn close(&mut self) {
        self.file = None;
    }
}

impl AsyncRead for StaticResponse {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.line.is_done() {
            this.line.fill(buf);
            return Poll::Ready(Ok(()));
        }

        match this.file.as_mut() {
            Some(file) => Pin::new(file).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// A directory of files served under one backend
#[derive(Debug, Clone, Copy)]
pub struct StaticFiles<'a> {
    pub location: &'a Path,
    pub file_ext: FileExtPolicy,
    pub options: &'a MatchOptions,
    pub content_types: &'a ContentTypes,
}

/// File found on disk for a request
struct Resolved {
    path: PathBuf,
    file: File,
    /// The request named a directory and the index file was served
    directory: bool,
}

impl StaticFiles<'_> {
    /// Build the response for `unmatched`, the request path left over after
    /// routing.
    ///
    /// Misses turn into `51 Not Found`. Requests that name a directory
    /// without a trailing slash, or a file with one, are redirected to the
    /// canonical URL.
    pub async fn respond(&self, req: &Request, unmatched: &str) -> Response {
        let Some(relative) = sanitize(unmatched) else {
            debug!(path = %unmatched, "Rejected static path");
            return Response::not_found();
        };

        let target = self.location.join(&relative);
        let Some(resolved) = self.find(target).await else {
            return Response::not_found();
        };

        let request_path = req.url.path();
        let has_slash = request_path.ends_with('/');
        if resolved.directory && !has_slash {
            let path = format!("{}/", request_path);
            return Response::permanent_redirect(&redirect_target(req, &path));
        }
        if !resolved.directory && has_slash && request_path != "/" {
            let path = request_path.trim_end_matches('/').to_string();
            return Response::permanent_redirect(&redirect_target(req, &path));
        }

        let content_type = self.content_types.for_path(&resolved.path);
        debug!(path = %resolved.path.display(), content_type, "Serving static file");
        Response::Static(StaticResponse::new(
            resolved.file,
            resolved.path,
            content_type,
        ))
    }

    async fn find(&self, target: PathBuf) -> Option<Resolved> {
        let mut candidate = target;
        let mut directory = false;

        if let Ok(meta) = tokio::fs::metadata(&candidate).await {
            if meta.is_dir() {
                directory = true;
                candidate.push(&self.options.index_filename);
            }
        }

        if let Some(file) = open_regular(&candidate).await {
            return Some(Resolved {
                path: candidate,
                file,
                directory,
            });
        }

        if self.file_ext == FileExtPolicy::Strip {
            for ext in &self.options.default_exts {
                let path = with_extension_appended(&candidate, ext);
                if let Some(file) = open_regular(&path).await {
                    return Some(Resolved {
                        path,
                        file,
                        directory,
                    });
                }
            }
        }

        None
    }
}

/// Decode the unmatched path and make sure it stays inside the backend root
fn sanitize(unmatched: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(unmatched).ok()?;
    let trimmed = decoded.trim_end_matches('/');

    if trimmed.contains('\0') {
        return None;
    }

    let mut relative = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    Some(relative)
}

/// `foo` + `gmi` -> `foo.gmi`, even when `foo` already has an extension
fn with_extension_appended(path: &Path, ext: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

async fn open_regular(path: &Path) -> Option<File> {
    let file = File::open(path).await.ok()?;
    let meta = file.metadata().await.ok()?;
    meta.is_file().then_some(file)
}

fn redirect_target(req: &Request, path: &str) -> String {
    let mut url = req.url.clone();
    url.set_fragment(None);
    url.set_path(path);
    url.to_string()
}
