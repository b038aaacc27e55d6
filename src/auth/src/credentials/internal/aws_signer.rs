// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Signs requests using [AWS Signature Version 4].
//!
//! [AWS Signature Version 4]: https://docs.aws.amazon.com/IAM/latest/UserGuide/reference_sigv-create-signed-request.html

use crate::Result;
use crate::credentials::aws::AwsSecurityCredentials;
use crate::errors;
use hmac::{Hmac, Mac};
use http::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;
use url::Url;

pub(crate) const X_AMZ_DATE: &str = "x-amz-date";
pub(crate) const X_AMZ_SECURITY_TOKEN: &str = "x-amz-security-token";
const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const REQUEST_TYPE: &str = "aws4_request";
const TIME_FORMAT_LONG: &[FormatItem<'static>] =
    format_description!("[year][month][day]T[hour][minute][second]Z");
const TIME_FORMAT_SHORT: &[FormatItem<'static>] = format_description!("[year][month][day]");

/// Escapes everything except the unreserved characters: 'A'-'Z', 'a'-'z',
/// '0'-'9', '-', '.', '_', and '~'.
static QUERY_ENCODE_SET: AsciiSet = NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Escapes a string so it can be used as a query parameter.
///
/// Spaces become `+`, as in `application/x-www-form-urlencoded`.
pub(crate) fn query_escape(input: &str) -> String {
    utf8_percent_encode(input, &QUERY_ENCODE_SET)
        .to_string()
        .replace("%20", "+")
}

/// Creates the `Authorization` header (and friends) for AWS requests.
#[derive(Clone, Debug)]
pub(crate) struct AwsRequestSigner {
    region: String,
    credentials: AwsSecurityCredentials,
}

impl AwsRequestSigner {
    pub(crate) fn new<R: Into<String>>(region: R, credentials: AwsSecurityCredentials) -> Self {
        Self {
            region: region.into(),
            credentials,
        }
    }

    /// Signs a request at the given time.
    ///
    /// Returns the request headers: `headers`, plus `host`,
    /// `x-amz-security-token` (with temporary credentials), `x-amz-date`
    /// (unless `headers` has a `date`), and `authorization`.
    pub(crate) fn sign(
        &self,
        method: &str,
        url: &Url,
        headers: &HeaderMap,
        body: &[u8],
        now: OffsetDateTime,
    ) -> Result<HeaderMap> {
        let host = request_host(url)?;

        let mut signed = headers.clone();
        signed.insert(http::header::HOST, header_value(&host)?);
        if let Some(token) = &self.credentials.session_token {
            signed.insert(
                HeaderName::from_static(X_AMZ_SECURITY_TOKEN),
                header_value(token)?,
            );
        }
        if !signed.contains_key(http::header::DATE) {
            signed.insert(
                HeaderName::from_static(X_AMZ_DATE),
                header_value(&format_time(now, TIME_FORMAT_LONG)?)?,
            );
        }

        let authorization = self.authorization(method, url, &host, &signed, body, now)?;
        signed.insert(AUTHORIZATION, header_value(&authorization)?);
        Ok(signed)
    }

    fn authorization(
        &self,
        method: &str,
        url: &Url,
        host: &str,
        headers: &HeaderMap,
        body: &[u8],
        now: OffsetDateTime,
    ) -> Result<String> {
        let (signed_headers, canonical_headers) = canonical_headers(headers)?;
        let date_stamp = format_time(now, TIME_FORMAT_SHORT)?;
        let service = host.split('.').next().unwrap_or_default();
        let scope = format!("{date_stamp}/{}/{service}/{REQUEST_TYPE}", self.region);

        let canonical_request = format!(
            "{method}\n{}\n{}\n{canonical_headers}\n{signed_headers}\n{}",
            canonical_path(url),
            canonical_query(url),
            hex_sha256(body),
        );
        let string_to_sign = format!(
            "{ALGORITHM}\n{}\n{scope}\n{}",
            format_time(now, TIME_FORMAT_LONG)?,
            hex_sha256(canonical_request.as_bytes())
        );

        let mut key = format!("AWS4{}", self.credentials.secret_access_key).into_bytes();
        for input in [
            date_stamp.as_str(),
            self.region.as_str(),
            service,
            REQUEST_TYPE,
            string_to_sign.as_str(),
        ] {
            key = hmac_sha256(&key, input.as_bytes())?;
        }

        Ok(format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={}",
            self.credentials.access_key_id,
            hex::encode(key)
        ))
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(errors::non_retryable)
}

fn request_host(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| errors::non_retryable_from_str(format!("missing host in AWS URL {url}")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// The escaped path, with `.` and `..` segments resolved.
fn canonical_path(url: &Url) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in url.path().split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Sorted by key, then by value, with both escaped.
fn canonical_query(url: &Url) -> String {
    let mut pairs = url
        .query_pairs()
        .map(|(k, v)| (query_escape(&k), query_escape(&v)))
        .collect::<Vec<_>>();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Returns the signed header names and the canonical header block.
///
/// Header names are lowercase, repeated headers are joined with `,`.
fn canonical_headers(headers: &HeaderMap) -> Result<(String, String)> {
    let mut canonical = BTreeMap::new();
    for name in headers.keys() {
        let values = headers
            .get_all(name)
            .iter()
            .map(|v| {
                v.to_str()
                    .map(normalize_header_value)
                    .map_err(errors::non_retryable)
            })
            .collect::<Result<Vec<_>>>()?;
        canonical.insert(name.as_str().to_lowercase(), values.join(","));
    }
    let signed_headers = canonical.keys().cloned().collect::<Vec<_>>().join(";");
    let data = canonical
        .iter()
        .map(|(k, v)| format!("{k}:{v}\n"))
        .collect::<String>();
    Ok((signed_headers, data))
}

fn normalize_header_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn hex_sha256(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content).as_slice())
}

fn format_time(now: OffsetDateTime, format: &[FormatItem<'static>]) -> Result<String> {
    now.to_offset(time::UtcOffset::UTC)
        .format(format)
        .map_err(errors::non_retryable)
}

fn hmac_sha256(key: &[u8], content: &[u8]) -> Result<Vec<u8>> {
    let mut h = Hmac::<Sha256>::new_from_slice(key).map_err(errors::non_retryable)?;
    h.update(content);
    Ok(h.finalize().into_bytes().to_vec())
}
