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

use crate::Result;
use crate::errors;
use crate::token::Token;
use crate::trust_boundary::{NO_OP_ENCODED_LOCATIONS, TRUST_BOUNDARY_KEY};

use http::HeaderMap;
use http::header::{AUTHORIZATION, HeaderName, HeaderValue};

mod build_info {
    // The file has been placed there by the build script.
    include!(concat!(env!("OUT_DIR"), "/build_env.rs"));
}

/// The name of the telemetry header.
pub(crate) const X_GOOG_API_CLIENT: &str = "x-goog-api-client";

/// The header used to bill a different project for quota.
pub(crate) const QUOTA_PROJECT_KEY: &str = "x-goog-user-project";

/// The header carrying the trust boundary of the access token.
pub(crate) const ALLOWED_LOCATIONS_HEADER: &str = "x-allowed-locations";

/// Format the `x-goog-api-client` header for token exchange requests.
///
/// The STS uses this to track which credential sources and options are in
/// use.
pub(crate) fn metrics_header_value(
    source: &str,
    sa_impersonation: bool,
    config_lifetime: bool,
) -> String {
    let rustc_version = build_info::RUSTC_VERSION;
    let auth_version = build_info::PKG_VERSION;

    format!(
        "gl-rust/{rustc_version} auth/{auth_version} google-byoid-sdk source/{source} sa-impersonation/{sa_impersonation} config-lifetime/{config_lifetime}"
    )
}

/// Creates the headers to authenticate a request with `token`.
///
/// The trust boundary, if any, is read from the token metadata. The no-op
/// boundary is never sent.
pub(crate) fn build_bearer_headers(
    token: &Token,
    quota_project_id: &Option<String>,
) -> Result<HeaderMap> {
    let mut value = HeaderValue::from_str(&format!("{} {}", token.token_type, token.token))
        .map_err(errors::non_retryable)?;
    value.set_sensitive(true);

    let mut header_map = HeaderMap::new();
    header_map.insert(AUTHORIZATION, value);

    if let Some(project) = quota_project_id {
        header_map.insert(
            HeaderName::from_static(QUOTA_PROJECT_KEY),
            HeaderValue::from_str(project).map_err(errors::non_retryable)?,
        );
    }

    let trust_boundary = token
        .metadata
        .as_ref()
        .and_then(|m| m.get(TRUST_BOUNDARY_KEY))
        .filter(|v| !v.is_empty() && v.as_str() != NO_OP_ENCODED_LOCATIONS);
    if let Some(locations) = trust_boundary {
        header_map.insert(
            HeaderName::from_static(ALLOWED_LOCATIONS_HEADER),
            HeaderValue::from_str(locations).map_err(errors::non_retryable)?,
        );
    }

    Ok(header_map)
}
