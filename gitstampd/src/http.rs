//! HTTP front end (§4.6): dispatches `stamp-tag-v1`/`stamp-branch-v1`
//! requests to the [`gitstamp_core::Stamper`] and serves the public key.
//! Grounded in the teacher's `webhook.rs` (one handler per route, request
//! data threaded through `Extension`s) and `original_source/zeitgitter/server.py`
//! (`StamperRequestHandler`).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Extension, Query};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use gitstamp_core::{StampResult, Stamper};
use tower_http::trace::TraceLayer;
use tracing::instrument;

use crate::error::{Error, Result};

const MAX_BODY_BYTES: usize = 1000;

pub fn router(stamper: Arc<Stamper>) -> Router {
    Router::new()
        .route("/", get(get_root).post(post_root))
        .layer(Extension(stamper))
        .layer(TraceLayer::new_for_http())
}

#[instrument(skip(stamper))]
async fn get_root(
    Extension(stamper): Extension<Arc<Stamper>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response> {
    match params.get("request").map(String::as_str) {
        Some("get-public-key-v1") => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/pgp-keys")],
            stamper.public_key().to_string(),
        )
            .into_response()),
        _ => Err(Error::BadRequest),
    }
}

#[instrument(skip(stamper, headers, body))]
async fn post_root(
    Extension(stamper): Extension<Arc<Stamper>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok());
    let content_length = content_length.ok_or(Error::LengthRequired)?;
    if content_length > MAX_BODY_BYTES as i64 || content_length < 0 {
        return Err(Error::TooLong);
    }

    let params = if content_type.starts_with("multipart/form-data") {
        parse_multipart(content_type, &body)?
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        parse_urlencoded(&body)
    } else {
        return Err(Error::UnsupportedMediaType);
    };

    dispatch(&stamper, &params).await
}

fn parse_urlencoded(body: &[u8]) -> HashMap<String, String> {
    url::form_urlencoded::parse(body)
        .into_owned()
        .collect()
}

fn parse_multipart(content_type: &str, body: &[u8]) -> Result<HashMap<String, String>> {
    let boundary = content_type
        .split(';')
        .find_map(|part| part.trim().strip_prefix("boundary="))
        .ok_or(Error::BadRequest)?
        .trim_matches('"');
    let delimiter = format!("--{boundary}");

    let text = String::from_utf8_lossy(body);
    let mut params = HashMap::new();
    for part in text.split(&delimiter) {
        let part = part.trim_start_matches("\r\n").trim_end_matches("\r\n");
        if part.is_empty() || part == "--" {
            continue;
        }
        let Some((headers, value)) = part.split_once("\r\n\r\n") else {
            continue;
        };
        let name = headers
            .lines()
            .find_map(|line| {
                line.to_ascii_lowercase()
                    .starts_with("content-disposition")
                    .then(|| line.to_string())
            })
            .and_then(|line| {
                line.split(';').find_map(|p| {
                    let p = p.trim();
                    p.strip_prefix("name=\"")
                        .and_then(|rest| rest.strip_suffix('"'))
                        .map(str::to_string)
                })
            });
        if let Some(name) = name {
            params.insert(name, value.trim_end_matches("\r\n").to_string());
        }
    }
    Ok(params)
}

async fn dispatch(stamper: &Stamper, params: &HashMap<String, String>) -> Result<Response> {
    let request = params.get("request").map(String::as_str);
    let result = match request {
        Some("stamp-tag-v1") => {
            let commit = params.get("commit").ok_or(Error::BadRequest)?;
            let tagname = params.get("tagname").ok_or(Error::BadRequest)?;
            stamper.stamp_tag(commit, tagname).await?
        }
        Some("stamp-branch-v1") => {
            let commit = params.get("commit").ok_or(Error::BadRequest)?;
            let tree = params.get("tree").ok_or(Error::BadRequest)?;
            let parent = params.get("parent").map(String::as_str);
            stamper.stamp_branch(commit, parent, tree).await?
        }
        _ => return Err(Error::BadRequest),
    };

    match result {
        StampResult::Ok(object) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/x-git-object")],
            object,
        )
            .into_response()),
        StampResult::Invalid => Err(Error::BadRequest),
        StampResult::Timeout => Err(Error::TooManyRequests),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_multipart_extracts_named_fields() {
        let body = b"--XBOUNDARY\r\nContent-Disposition: form-data; name=\"request\"\r\n\r\nstamp-tag-v1\r\n--XBOUNDARY\r\nContent-Disposition: form-data; name=\"commit\"\r\n\r\n1111111111111111111111111111111111111111\r\n--XBOUNDARY--\r\n";
        let params = parse_multipart("multipart/form-data; boundary=XBOUNDARY", body).unwrap();
        assert_eq!(params.get("request").map(String::as_str), Some("stamp-tag-v1"));
        assert_eq!(
            params.get("commit").map(String::as_str),
            Some("1111111111111111111111111111111111111111")
        );
    }

    #[test]
    fn parse_urlencoded_decodes_fields() {
        let params = parse_urlencoded(b"request=stamp-tag-v1&tagname=my-tag");
        assert_eq!(params.get("tagname").map(String::as_str), Some("my-tag"));
    }
}
