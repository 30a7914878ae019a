//! Turns a [`FileDownload`] into an HTTP response.
//!
//! Handles conditional requests (`If-Match`, `If-Unmodified-Since`,
//! `If-None-Match`, `If-Modified-Since`), a single `Range: bytes=` range
//! guarded by `If-Range`, and the descriptive headers of the file.

use crate::{errors::AppError, services::coordinator::FileDownload};
use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::Response,
};
use chrono::{DateTime, Utc};
use std::io::SeekFrom;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::error;

/// Outcome of evaluating the conditional request headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    Proceed,
    NotModified,
    Failed,
}

/// Requested byte range, `end` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    Full,
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

fn header_text(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

/// Match `current` (quoted) against an entity-tag list. Weak tags only match
/// under weak comparison.
fn etag_matches(list: &str, current: Option<&str>, weak: bool) -> bool {
    list.split(',').map(str::trim).any(|candidate| {
        if candidate == "*" {
            return true;
        }
        let (is_weak, tag) = match candidate.strip_prefix("W/") {
            Some(tag) => (true, tag),
            None => (false, candidate),
        };
        (weak || !is_weak) && Some(tag) == current
    })
}

/// Evaluate preconditions in the order HTTP prescribes. Dates compare at
/// whole-second precision.
pub fn check_preconditions(
    headers: &HeaderMap,
    etag: Option<&str>,
    last_modified: DateTime<Utc>,
) -> Precondition {
    let modified = last_modified.timestamp();

    if let Some(list) = header_text(headers, header::IF_MATCH) {
        if !etag_matches(list, etag, false) {
            return Precondition::Failed;
        }
    } else if let Some(since) =
        header_text(headers, header::IF_UNMODIFIED_SINCE).and_then(parse_http_date)
    {
        if modified > since.timestamp() {
            return Precondition::Failed;
        }
    }

    if let Some(list) = header_text(headers, header::IF_NONE_MATCH) {
        if etag_matches(list, etag, true) {
            return Precondition::NotModified;
        }
    } else if let Some(since) =
        header_text(headers, header::IF_MODIFIED_SINCE).and_then(parse_http_date)
    {
        if modified <= since.timestamp() {
            return Precondition::NotModified;
        }
    }

    Precondition::Proceed
}

/// Parse a `Range` header against a representation of `size` bytes.
///
/// Only one range is supported; multiple or malformed ranges are ignored and
/// the whole file is served.
pub fn parse_range(value: &str, size: u64) -> RangeRequest {
    let Some(ranges) = value.trim().strip_prefix("bytes=") else {
        return RangeRequest::Full;
    };
    if ranges.contains(',') {
        return RangeRequest::Full;
    }
    let Some((first, last)) = ranges.split_once('-') else {
        return RangeRequest::Full;
    };
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        let Ok(suffix) = last.parse::<u64>() else {
            return RangeRequest::Full;
        };
        if suffix == 0 || size == 0 {
            return RangeRequest::Unsatisfiable;
        }
        return RangeRequest::Partial {
            start: size.saturating_sub(suffix),
            end: size - 1,
        };
    }

    let Ok(start) = first.parse::<u64>() else {
        return RangeRequest::Full;
    };
    let end = if last.is_empty() {
        None
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => Some(end),
            _ => return RangeRequest::Full,
        }
    };
    if start >= size {
        return RangeRequest::Unsatisfiable;
    }
    RangeRequest::Partial {
        start,
        end: end.map_or(size - 1, |end| end.min(size - 1)),
    }
}

/// `If-Range` lets the range through only if the validator still matches.
fn if_range_allows(headers: &HeaderMap, etag: Option<&str>, last_modified: DateTime<Utc>) -> bool {
    let Some(value) = header_text(headers, header::IF_RANGE).map(str::trim) else {
        return true;
    };
    if value.starts_with("W/") {
        return false;
    }
    if value.starts_with('"') {
        return Some(value) == etag;
    }
    parse_http_date(value).is_some_and(|at| at.timestamp() == last_modified.timestamp())
}

fn is_plain(c: char) -> bool {
    c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\'
}

/// `inline` disposition naming the file, with an RFC 5987 `filename*` when
/// the name is not plain ASCII.
pub fn content_disposition(name: &str) -> String {
    if name.chars().all(is_plain) {
        return format!("inline; filename=\"{}\"", name);
    }
    let fallback: String = name
        .chars()
        .map(|c| if is_plain(c) { c } else { '_' })
        .collect();
    let mut encoded = String::with_capacity(name.len() * 3);
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    format!(
        "inline; filename=\"{}\"; filename*=UTF-8''{}",
        fallback, encoded
    )
}

fn set_header(headers: &mut HeaderMap, name: HeaderName, value: &str) -> Result<(), AppError> {
    let value = HeaderValue::from_str(value)
        .map_err(|_| AppError::internal(format!("invalid {} header value", name)))?;
    headers.insert(name, value);
    Ok(())
}

fn respond(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Build the response for `download`. With `head_only` the headers are
/// computed as for GET and the body is left empty.
pub async fn file_response<R>(
    download: FileDownload<R>,
    request: &HeaderMap,
    head_only: bool,
) -> Result<Response, AppError>
where
    R: AsyncRead + AsyncSeek + Send + Unpin + 'static,
{
    let FileDownload {
        file,
        display_name,
        mut reader,
    } = download;
    let size = u64::try_from(file.size_bytes).unwrap_or(0);
    let etag = file.etag.as_ref().map(|tag| format!("\"{}\"", tag));

    let mut headers = HeaderMap::new();
    set_header(&mut headers, header::LAST_MODIFIED, &http_date(file.created_at))?;
    if let Some(tag) = &etag {
        set_header(&mut headers, header::ETAG, tag)?;
    }
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    match check_preconditions(request, etag.as_deref(), file.created_at) {
        Precondition::Failed => {
            return Ok(respond(StatusCode::PRECONDITION_FAILED, headers, Body::empty()));
        }
        Precondition::NotModified => {
            return Ok(respond(StatusCode::NOT_MODIFIED, headers, Body::empty()));
        }
        Precondition::Proceed => {}
    }

    set_header(&mut headers, header::CONTENT_TYPE, &file.mime)?;
    set_header(
        &mut headers,
        header::CONTENT_DISPOSITION,
        &content_disposition(&display_name),
    )?;

    let range = match header_text(request, header::RANGE) {
        Some(value) if if_range_allows(request, etag.as_deref(), file.created_at) => {
            parse_range(value, size)
        }
        _ => RangeRequest::Full,
    };
    let (status, start, len) = match range {
        RangeRequest::Full => (StatusCode::OK, 0, size),
        RangeRequest::Partial { start, end } => {
            set_header(
                &mut headers,
                header::CONTENT_RANGE,
                &format!("bytes {}-{}/{}", start, end, size),
            )?;
            (StatusCode::PARTIAL_CONTENT, start, end - start + 1)
        }
        RangeRequest::Unsatisfiable => {
            set_header(&mut headers, header::CONTENT_RANGE, &format!("bytes */{}", size))?;
            return Ok(respond(StatusCode::RANGE_NOT_SATISFIABLE, headers, Body::empty()));
        }
    };
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));

    if head_only {
        return Ok(respond(status, headers, Body::empty()));
    }

    if start > 0 {
        reader.seek(SeekFrom::Start(start)).await.map_err(|err| {
            error!(file_id = %file.id, "seek to {} failed: {}", start, err);
            AppError::internal("could not read file")
        })?;
    }
    let body = Body::from_stream(ReaderStream::new(reader.take(len)));
    Ok(respond(status, headers, body))
}
