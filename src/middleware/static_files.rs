//! Serves files out of a directory tree: path-traversal-safe resolution, conditional
//! `GET` via `ETag`/`Last-Modified`, single-range byte responses, and an index-file
//! fallback for directory requests.
//!
//! Not grounded on a single teacher file (the teacher repo has no static file
//! middleware); built from this crate's own conventions — `Error` taxonomy,
//! `tokio::time::timeout`-bounded I/O the way the body parser bounds read sizes
//! rather than time, and `mime_guess`/`sha2`/`httpdate`, already declared in
//! `Cargo.toml` for exactly this purpose.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::context::Context;
use crate::error::Error;
use crate::middleware::{mw, Middleware};
use crate::router::Next;

const FS_TIMEOUT: Duration = Duration::from_secs(5);

/// Governs whether dotfiles (`.git`, `.env`, `.htaccess`, ...) under the served root
/// are reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiddenPolicy {
    /// Serve dotfiles like any other file.
    Allow,
    /// Respond as if the file did not exist (calls through to `fallthrough`).
    Ignore,
    /// Respond `403 Forbidden`.
    Deny,
}

/// Tuning knobs for the static file middleware.
#[derive(Clone)]
pub struct StaticConfig {
    pub root: PathBuf,
    /// `Cache-Control: public, max-age=<seconds>` sent with every served file.
    pub max_age: u64,
    /// Index file names tried, in order, for a directory request.
    pub index: Vec<String>,
    pub hidden: HiddenPolicy,
    pub etag: bool,
    pub last_modified: bool,
    /// Extensions tried, in order, when the exact requested path is not found (`.html`
    /// is the common case: `/about` resolving to `about.html`).
    pub extensions: Vec<String>,
    /// When true, a request that matches no file calls `next` instead of raising a
    /// 404, letting a later middleware or route handle it.
    pub fallthrough: bool,
    /// When true, `/dir` (no trailing slash) that resolves to a directory is
    /// redirected to `/dir/` so relative links inside the served `index.html` resolve
    /// correctly.
    pub redirect_trailing_slash: bool,
}

impl StaticConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StaticConfig {
            root: root.into(),
            max_age: 0,
            index: vec!["index.html".to_string()],
            hidden: HiddenPolicy::Ignore,
            etag: true,
            last_modified: true,
            extensions: Vec::new(),
            fallthrough: true,
            redirect_trailing_slash: true,
        }
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

/// Rejects a request path containing a `..` path component, including one revealed
/// only after a second round of percent-decoding (`%252e%252e` decodes once to
/// `%2e%2e`, which itself decodes to `..`). A single pass of percent-decoding is
/// already performed by the router/wire layer before this middleware ever sees
/// `ctx.path()`; decoding again here is specifically to catch that double-encoded
/// form, not to repeat work already done upstream.
fn has_traversal(raw_path: &str) -> bool {
    let once = urlencoding::decode(raw_path).map(|c| c.into_owned()).unwrap_or_default();
    let twice = urlencoding::decode(&once).map(|c| c.into_owned()).unwrap_or_default();
    [raw_path, &once, &twice]
        .iter()
        .any(|candidate| candidate.split(['/', '\\']).any(|seg| seg == ".."))
}

/// Joins `root` with the request path, verifying the result both lexically (no `..`
/// component survives the join) and physically (the canonicalized result is still
/// inside `root` once symlinks are resolved).
async fn resolve_path(root: &Path, request_path: &str) -> Result<Option<PathBuf>, Error> {
    if has_traversal(request_path) {
        return Ok(None);
    }

    let relative = request_path.trim_start_matches('/');
    let mut joined = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            // ParentDir, RootDir and Prefix components cannot occur once
            // `has_traversal` has already rejected `..` and `request_path` was
            // stripped of its leading `/`, but matching exhaustively avoids a silent
            // path-traversal regression if that invariant is ever loosened.
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return Ok(None),
        }
    }

    let canonical_root = match tokio::time::timeout(FS_TIMEOUT, tokio::fs::canonicalize(root)).await {
        Ok(Ok(p)) => p,
        _ => return Ok(None),
    };
    let canonical = match tokio::time::timeout(FS_TIMEOUT, tokio::fs::canonicalize(&joined)).await {
        Ok(Ok(p)) => p,
        Ok(Err(_)) | Err(_) => return Ok(None),
    };
    if !canonical.starts_with(&canonical_root) {
        return Ok(None);
    }
    Ok(Some(canonical))
}

fn etag_for(len: u64, modified_unix: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(len.to_le_bytes());
    hasher.update(modified_unix.to_le_bytes());
    let digest = hasher.finalize();
    format!("\"{}\"", URL_SAFE_NO_PAD.encode(&digest[..16]))
}

struct ResolvedFile {
    path: PathBuf,
    len: u64,
    modified_unix: i64,
}

async fn stat_file(path: &Path) -> Result<Option<ResolvedFile>, Error> {
    let metadata = match tokio::time::timeout(FS_TIMEOUT, tokio::fs::metadata(path)).await {
        Ok(Ok(m)) if m.is_file() => m,
        Ok(Ok(_)) => return Ok(None),
        Ok(Err(_)) | Err(_) => return Ok(None),
    };
    let modified_unix = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok(Some(ResolvedFile {
        path: path.to_path_buf(),
        len: metadata.len(),
        modified_unix,
    }))
}

/// Parses a single-range `bytes=start-end` request; multi-range requests
/// (`bytes=0-10,20-30`) are not supported and fall back to serving the full body.
fn parse_range(header: &str, len: u64) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_s, end_s) = spec.split_once('-')?;
    if start_s.is_empty() {
        let suffix_len: u64 = end_s.parse().ok()?;
        let start = len.saturating_sub(suffix_len);
        return Some((start, len.saturating_sub(1)));
    }
    let start: u64 = start_s.parse().ok()?;
    let end = if end_s.is_empty() {
        len.saturating_sub(1)
    } else {
        end_s.parse().ok()?
    };
    if start > end || start >= len {
        return None;
    }
    Some((start, end.min(len.saturating_sub(1))))
}

async fn read_range(path: &Path, start: u64, end: u64) -> Result<Bytes, Error> {
    let fut = async {
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; (end - start + 1) as usize];
        file.read_exact(&mut buf).await?;
        Ok::<_, std::io::Error>(Bytes::from(buf))
    };
    tokio::time::timeout(FS_TIMEOUT, fut)
        .await
        .map_err(|_| Error::service_unavailable("timed out reading file"))?
        .map_err(Error::from)
}

async fn read_whole(path: &Path) -> Result<Bytes, Error> {
    let fut = tokio::fs::read(path);
    let bytes = tokio::time::timeout(FS_TIMEOUT, fut)
        .await
        .map_err(|_| Error::service_unavailable("timed out reading file"))??;
    Ok(Bytes::from(bytes))
}

/// Builds the static file middleware. Only `GET`/`HEAD` are handled; anything else
/// falls through to `next` unconditionally.
pub fn static_files(config: StaticConfig) -> impl Middleware {
    mw(move |ctx: &mut Context, next: Next| {
        let config = config.clone();
        async move {
            if !matches!(*ctx.method(), http::Method::GET | http::Method::HEAD) {
                return next.run(ctx).await;
            }

            let request_path = ctx.path().to_string();
            let Some(mut resolved) = resolve_path(&config.root, &request_path).await? else {
                return fall_or_404(ctx, next, &config).await;
            };

            if is_hidden(&resolved) {
                match config.hidden {
                    HiddenPolicy::Allow => {}
                    HiddenPolicy::Ignore => return fall_or_404(ctx, next, &config).await,
                    HiddenPolicy::Deny => {
                        return Err(Error::forbidden("access to this path is not allowed"))
                    }
                }
            }

            let mut file = stat_file(&resolved).await?;

            if file.is_none() {
                // Either a directory or nothing at all; try the directory's index
                // files, then the configured fallback extensions.
                let is_dir = tokio::time::timeout(FS_TIMEOUT, tokio::fs::metadata(&resolved))
                    .await
                    .ok()
                    .and_then(|r| r.ok())
                    .map(|m| m.is_dir())
                    .unwrap_or(false);

                if is_dir {
                    if config.redirect_trailing_slash && !request_path.ends_with('/') {
                        ctx.redirect_with_status(&format!("{request_path}/"), 301)?;
                        return Ok(());
                    }
                    for index in &config.index {
                        let candidate = resolved.join(index);
                        if let Some(found) = stat_file(&candidate).await? {
                            resolved = candidate;
                            file = Some(found);
                            break;
                        }
                    }
                } else {
                    for ext in &config.extensions {
                        let candidate = resolved.with_extension(ext.trim_start_matches('.'));
                        if let Some(found) = stat_file(&candidate).await? {
                            resolved = candidate;
                            file = Some(found);
                            break;
                        }
                    }
                }
            }

            let Some(file) = file else {
                return fall_or_404(ctx, next, &config).await;
            };

            let etag = config.etag.then(|| etag_for(file.len, file.modified_unix));
            if let Some(etag) = &etag {
                if ctx.header("if-none-match") == Some(etag.as_str()) {
                    ctx.status(304)?;
                    ctx.end();
                    return Ok(());
                }
                ctx.set_header("etag", etag)?;
            }
            if config.last_modified {
                let http_date = httpdate::fmt_http_date(
                    std::time::UNIX_EPOCH + Duration::from_secs(file.modified_unix.max(0) as u64),
                );
                ctx.set_header("last-modified", &http_date)?;
            }
            if config.max_age > 0 {
                ctx.set_header("cache-control", &format!("public, max-age={}", config.max_age))?;
            }

            let mime = mime_guess::from_path(&file.path).first_or_octet_stream();
            let content_type = mime.essence_str().to_string();

            if *ctx.method() == http::Method::HEAD {
                ctx.set_header("content-type", &content_type)?;
                ctx.end();
                return Ok(());
            }

            if let Some(range_header) = ctx.header("range").map(str::to_string) {
                if let Some((start, end)) = parse_range(&range_header, file.len) {
                    let bytes = read_range(&file.path, start, end).await?;
                    ctx.status(206)?;
                    ctx.set_header(
                        "content-range",
                        &format!("bytes {start}-{end}/{}", file.len),
                    )?;
                    ctx.set_header("accept-ranges", "bytes")?;
                    ctx.send(&content_type, bytes)?;
                    return Ok(());
                }
            }

            let bytes = read_whole(&file.path).await?;
            ctx.set_header("accept-ranges", "bytes")?;
            ctx.send(&content_type, bytes)?;
            Ok(())
        }
    })
}

async fn fall_or_404(ctx: &mut Context, next: Next, config: &StaticConfig) -> Result<(), Error> {
    if config.fallthrough {
        next.run(ctx).await
    } else {
        Err(Error::not_found(format!("no such file: {}", ctx.path())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_is_detected_across_one_decode_layer() {
        assert!(has_traversal("/../secret"));
        assert!(has_traversal("/foo/%2e%2e/secret"));
        assert!(has_traversal("/foo/%252e%252e/secret"));
        assert!(!has_traversal("/foo/bar.txt"));
    }

    #[test]
    fn range_parses_simple_forms() {
        assert_eq!(parse_range("bytes=0-99", 1000), Some((0, 99)));
        assert_eq!(parse_range("bytes=100-", 1000), Some((100, 999)));
        assert_eq!(parse_range("bytes=-100", 1000), Some((900, 999)));
    }

    #[test]
    fn range_rejects_multi_range() {
        assert_eq!(parse_range("bytes=0-10,20-30", 1000), None);
    }

    #[test]
    fn range_rejects_start_past_end_of_file() {
        assert_eq!(parse_range("bytes=5000-", 1000), None);
    }

    #[tokio::test]
    async fn resolve_path_stays_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file.txt"), b"hello").unwrap();
        let resolved = resolve_path(dir.path(), "/file.txt").await.unwrap();
        assert!(resolved.is_some());
        let escaped = resolve_path(dir.path(), "/../etc/passwd").await.unwrap();
        assert!(escaped.is_none());
    }

    #[tokio::test]
    async fn serves_a_file_with_etag_and_honors_if_none_match() {
        use crate::context::Context;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hi there").unwrap();

        let mw_instance = static_files(StaticConfig::new(dir.path().to_path_buf()));
        let mut ctx = Context::new();
        ctx.request.path = "/hello.txt".to_string();
        mw_instance.call(&mut ctx, Next::terminal()).await.unwrap();
        assert_eq!(ctx.response.status_code, 200);
        assert_eq!(ctx.response.body_debug(), "hi there");
        let etag = ctx.response.headers.get("etag").unwrap().to_string();

        let mut ctx2 = Context::new();
        ctx2.request.path = "/hello.txt".to_string();
        ctx2.request.headers.set("if-none-match", &etag).unwrap();
        mw_instance.call(&mut ctx2, Next::terminal()).await.unwrap();
        assert_eq!(ctx2.response.status_code, 304);
    }
}
