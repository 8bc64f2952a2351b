//! HEAD probe used to learn content length, range support, a server hint,
//! and a suggested filename before a transfer is split. Grounded in a
//! prior `Range: bytes=0-0` GET probe; this crate uses a plain HEAD
//! instead, and keeps the same `Content-Disposition` filename parsing.

use reqwest::Client;

use crate::error::{parse_retry_after, DownloadError};
use crate::types::{RequestContext, ServerCapabilities, ServerHint};

pub async fn probe(client: &Client, url: &str, ctx: &RequestContext) -> Result<ServerCapabilities, DownloadError> {
    let mut builder = client.head(url);
    for (key, value) in &ctx.headers {
        builder = builder.header(key, value);
    }

    let response = builder.send().await.map_err(DownloadError::Network)?;

    if !response.status().is_success() {
        return Err(DownloadError::UnexpectedStatus {
            status: response.status().as_u16(),
            url: url.to_string(),
            retry_after_secs: parse_retry_after(response.headers()),
        });
    }

    let accepts_ranges = response
        .headers()
        .get("accept-ranges")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("bytes"))
        .unwrap_or(false);

    let content_length = response.content_length();

    let server_hint = response
        .headers()
        .get("server")
        .and_then(|v| v.to_str().ok())
        .and_then(ServerHint::detect);

    let suggested_filename = response
        .headers()
        .get("content-disposition")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_filename);

    Ok(ServerCapabilities {
        accepts_ranges,
        content_length,
        server_hint,
        suggested_filename,
    })
}

/// Extract the filename from a `Content-Disposition` header value. The
/// RFC 5987 `filename*=` extended form takes priority over plain
/// `filename=`.
pub fn extract_filename(disposition: &str) -> Option<String> {
    extract_filename_star(disposition).or_else(|| extract_filename_plain(disposition))
}

fn extract_filename_star(disposition: &str) -> Option<String> {
    let lower = disposition.to_lowercase();
    let idx = lower.find("filename*=")?;
    let rest = &disposition[idx + "filename*=".len()..];
    let rest = rest.split(';').next().unwrap_or(rest).trim();
    let after_charset = rest.strip_prefix("UTF-8''").or_else(|| rest.strip_prefix("utf-8''"))?;
    Some(percent_decode(after_charset))
}

fn percent_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    let mut pending: Vec<u8> = Vec::new();

    while let Some(c) = chars.next() {
        if c == '%' {
            let h1 = chars.next();
            let h2 = chars.next();
            if let (Some(h1), Some(h2)) = (h1, h2) {
                let hex = format!("{}{}", h1, h2);
                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    pending.push(byte);
                    continue;
                }
            }
            flush_pending(&mut pending, &mut out);
            out.push('%');
            if let Some(h1) = h1 {
                out.push(h1);
            }
            if let Some(h2) = h2 {
                out.push(h2);
            }
        } else {
            flush_pending(&mut pending, &mut out);
            out.push(c);
        }
    }
    flush_pending(&mut pending, &mut out);
    out
}

fn flush_pending(pending: &mut Vec<u8>, out: &mut String) {
    if pending.is_empty() {
        return;
    }
    match std::str::from_utf8(pending) {
        Ok(s) => out.push_str(s),
        Err(_) => out.push('\u{FFFD}'),
    }
    pending.clear();
}

fn extract_filename_plain(disposition: &str) -> Option<String> {
    let lower = disposition.to_lowercase();
    let idx = lower.find("filename=")?;
    let start = idx + "filename=".len();
    let slice = &disposition[start..];
    let end = slice.find(';').unwrap_or(slice.len());
    let raw = slice[..end].trim().trim_matches('"');
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}
