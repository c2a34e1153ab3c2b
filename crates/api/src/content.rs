use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::state::AppState;

/// RFC 7233 Range-aware static file server for `.mp4`/`.webm`/`.ts` (and the
/// `.m3u8`/`.webp` outputs) under `/content/<YYYY>/<MM>/<postId>/...`.
pub async fn serve_content(
    State(state): State<Arc<AppState>>,
    AxumPath(rel): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    let path = match resolve_path(&state.config.media_content_dir, &rel) {
        Some(p) => p,
        None => return (StatusCode::BAD_REQUEST, "invalid path").into_response(),
    };

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(m) if m.is_file() => m,
        _ => return (StatusCode::NOT_FOUND, "not found").into_response(),
    };

    let total_len = metadata.len();
    let content_type = content_type_for(&path);
    let etag = format!(
        "\"{}-{}\"",
        total_len,
        metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0)
    );
    let last_modified = metadata
        .modified()
        .ok()
        .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc2822())
        .unwrap_or_default();

    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());

    let (start, end, status) = match range_header.map(parse_range) {
        Some(Some(spec)) => match resolve_range(spec, total_len) {
            Some((s, e)) => (s, e, StatusCode::PARTIAL_CONTENT),
            None => {
                return Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{}", total_len))
                    .header(header::ACCEPT_RANGES, "bytes")
                    .body(Body::empty())
                    .unwrap()
                    .into_response();
            }
        },
        Some(None) => {
            return (StatusCode::BAD_REQUEST, "malformed Range header").into_response();
        }
        None => (0, total_len.saturating_sub(1), StatusCode::OK),
    };
    let length = end.saturating_sub(start) + 1;

    let mut file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(_) => return (StatusCode::NOT_FOUND, "not found").into_response(),
    };
    if file.seek(std::io::SeekFrom::Start(start)).await.is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "seek failed").into_response();
    }

    // Stream rather than buffer: a full-length response to `bytes=0-` on a
    // multi-gigabyte segment must not hold the whole file in memory.
    let stream = ReaderStream::new(file.take(length));
    let body = Body::from_stream(stream);

    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, length.to_string())
        .header(header::ETAG, etag)
        .header(header::LAST_MODIFIED, last_modified)
        .header(header::CACHE_CONTROL, cache_control_for(&path));

    if status == StatusCode::PARTIAL_CONTENT {
        response = response.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end, total_len),
        );
    }

    response.body(body).unwrap().into_response()
}

fn resolve_path(root: &std::path::Path, rel: &str) -> Option<PathBuf> {
    if rel.contains("..") {
        return None;
    }
    Some(root.join(rel.trim_start_matches('/')))
}

fn content_type_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("ts") => "video/mp2t",
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Playlists are revalidated frequently since live/VOD rewrites happen on
/// reprocessing; media segments and thumbnails are immutable once written.
fn cache_control_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "public, max-age=10",
        _ => "public, max-age=31536000, immutable",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeSpec {
    /// `bytes=start-end` or `bytes=start-` (end unspecified, taken to mean
    /// "to the end of the file").
    Range { start: u64, end: Option<u64> },
    /// `bytes=-N`: the last `N` bytes of the file.
    Suffix(u64),
}

/// Parses a `Range` header value into the three RFC 7233 forms this server
/// supports. Only single-range requests are handled; multi-range (`bytes=0-1,2-3`)
/// is not, matching the corpus's static-file servers which also decline it
/// rather than returning `multipart/byteranges`.
fn parse_range(header: &str) -> Option<RangeSpec> {
    let spec = header.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_s, end_s) = spec.split_once('-')?;

    if start_s.is_empty() {
        let suffix: u64 = end_s.parse().ok()?;
        return Some(RangeSpec::Suffix(suffix));
    }

    let start: u64 = start_s.parse().ok()?;
    if end_s.is_empty() {
        Some(RangeSpec::Range { start, end: None })
    } else {
        let end: u64 = end_s.parse().ok()?;
        Some(RangeSpec::Range { start, end: Some(end) })
    }
}

/// Resolves a parsed range against the file's total length, clamping to the
/// file bounds. Returns `None` when the range is unsatisfiable (start at or
/// past the end, or a zero-length file with any range at all).
fn resolve_range(spec: RangeSpec, total_len: u64) -> Option<(u64, u64)> {
    if total_len == 0 {
        return None;
    }
    match spec {
        RangeSpec::Range { start, end } => {
            if start >= total_len {
                return None;
            }
            let end = end.map(|e| e.min(total_len - 1)).unwrap_or(total_len - 1);
            Some((start, end))
        }
        RangeSpec::Suffix(n) => {
            if n == 0 {
                return None;
            }
            let start = total_len.saturating_sub(n);
            Some((start, total_len - 1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_path_rejects_traversal() {
        assert!(resolve_path(std::path::Path::new("/content"), "../../etc/passwd").is_none());
    }

    #[test]
    fn parse_range_handles_open_ended() {
        assert_eq!(parse_range("bytes=100-"), Some(RangeSpec::Range { start: 100, end: None }));
    }

    #[test]
    fn parse_range_handles_closed_range() {
        assert_eq!(
            parse_range("bytes=0-999"),
            Some(RangeSpec::Range { start: 0, end: Some(999) })
        );
    }

    #[test]
    fn parse_range_handles_suffix_range() {
        assert_eq!(parse_range("bytes=-500"), Some(RangeSpec::Suffix(500)));
    }

    #[test]
    fn parse_range_rejects_multi_range() {
        assert_eq!(parse_range("bytes=0-10,20-30"), None);
    }

    #[test]
    fn resolve_range_open_ended_covers_whole_remainder() {
        let (start, end) = resolve_range(RangeSpec::Range { start: 0, end: None }, 10_000_000).unwrap();
        assert_eq!((start, end), (0, 9_999_999));
    }

    #[test]
    fn resolve_range_suffix_clamps_to_file_length() {
        let (start, end) = resolve_range(RangeSpec::Suffix(500), 100).unwrap();
        assert_eq!((start, end), (0, 99));
    }

    #[test]
    fn resolve_range_rejects_start_past_end() {
        assert!(resolve_range(RangeSpec::Range { start: 200, end: None }, 100).is_none());
    }

    #[test]
    fn resolve_range_clamps_end_to_file_length() {
        let (start, end) = resolve_range(RangeSpec::Range { start: 0, end: Some(1_000_000) }, 100).unwrap();
        assert_eq!((start, end), (0, 99));
    }

    #[test]
    fn content_type_matches_extension() {
        assert_eq!(content_type_for(std::path::Path::new("a.mp4")), "video/mp4");
        assert_eq!(content_type_for(std::path::Path::new("a.m3u8")), "application/vnd.apple.mpegurl");
    }

    #[test]
    fn cache_control_varies_for_playlists() {
        assert_eq!(cache_control_for(std::path::Path::new("master.m3u8")), "public, max-age=10");
        assert_eq!(
            cache_control_for(std::path::Path::new("480p_000.ts")),
            "public, max-age=31536000, immutable"
        );
    }
}
