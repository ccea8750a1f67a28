use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MultipartError {
    #[error("multipart body is missing the opening boundary")]
    MissingBoundary,
    #[error("malformed multipart part: {0}")]
    MalformedPart(String),
    #[error("multipart body ended without a closing boundary")]
    Truncated,
}

/// One named part of a multipart body. Parts are framed as form-file parts
/// whose name carries the payload identity (a file path or a commit name).
#[derive(Debug, Clone)]
pub struct Part {
    pub name: String,
    pub data: Bytes,
}

pub fn new_boundary() -> String {
    format!("shardfs-{}", Uuid::new_v4().simple())
}

pub fn content_type(boundary: &str) -> String {
    format!("multipart/form-data; boundary={boundary}")
}

/// Opening frame for one part. The caller streams the part payload after
/// this and terminates it with [`part_trailer`].
pub fn part_header(boundary: &str, name: &str) -> Bytes {
    Bytes::from(format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"{name}\"; filename=\"{name}\"\r\n\
         Content-Type: application/octet-stream\r\n\
         \r\n"
    ))
}

pub fn part_trailer() -> Bytes {
    Bytes::from_static(b"\r\n")
}

/// Closing frame for the whole body.
pub fn close_delimiter(boundary: &str) -> Bytes {
    Bytes::from(format!("--{boundary}--\r\n"))
}

/// Extract the boundary parameter from a multipart content-type value.
pub fn boundary_from_content_type(value: &str) -> Option<String> {
    value.split(';').find_map(|param| {
        let (key, val) = param.trim().split_once('=')?;
        if !key.eq_ignore_ascii_case("boundary") {
            return None;
        }
        Some(val.trim_matches('"').to_string())
    })
}

/// Parse a complete multipart body into its parts, in order.
pub fn parse(body: &[u8], boundary: &str) -> Result<Vec<Part>, MultipartError> {
    let delimiter = format!("--{boundary}");
    let delim = delimiter.as_bytes();

    let mut pos = find(body, delim, 0).ok_or(MultipartError::MissingBoundary)?;
    let mut parts = Vec::new();
    loop {
        pos += delim.len();
        // A close delimiter carries a trailing "--".
        if body[pos..].starts_with(b"--") {
            return Ok(parts);
        }
        pos = skip_crlf(body, pos)?;

        let mut name = None;
        loop {
            let eol = find(body, b"\r\n", pos).ok_or(MultipartError::Truncated)?;
            let line = &body[pos..eol];
            pos = eol + 2;
            if line.is_empty() {
                break;
            }
            let line = String::from_utf8_lossy(line);
            if line.to_ascii_lowercase().starts_with("content-disposition") {
                name = parse_disposition_name(&line);
            }
        }
        let name = name.ok_or_else(|| {
            MultipartError::MalformedPart("part has no content-disposition name".to_string())
        })?;

        let mut boundary_marker = Vec::with_capacity(delim.len() + 4);
        boundary_marker.extend_from_slice(b"\r\n");
        boundary_marker.extend_from_slice(delim);
        let end = find(body, &boundary_marker, pos).ok_or(MultipartError::Truncated)?;
        parts.push(Part {
            name,
            data: Bytes::copy_from_slice(&body[pos..end]),
        });
        pos = end + 2;
    }
}

fn parse_disposition_name(line: &str) -> Option<String> {
    line.split(';').find_map(|param| {
        let (key, val) = param.trim().split_once('=')?;
        if key.trim() != "name" {
            return None;
        }
        Some(val.trim().trim_matches('"').to_string())
    })
}

fn skip_crlf(body: &[u8], pos: usize) -> Result<usize, MultipartError> {
    if body[pos..].starts_with(b"\r\n") {
        Ok(pos + 2)
    } else {
        Err(MultipartError::MalformedPart(
            "boundary line not terminated".to_string(),
        ))
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}
