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

//! Trust boundaries (also known as regional access boundaries).
//!
//! A trust boundary restricts the locations where a principal's tokens may be
//! used. The boundary is looked up from the IAM Credentials `allowedLocations`
//! APIs and attached to the token metadata, from where it is rendered as the
//! `x-allowed-locations` header.
//!
//! The lookup is retried on transient errors. If a lookup fails after a
//! previous success, the previous (stale) value is used. Once the service
//! reports that the principal has no restrictions ([NO_OP_ENCODED_LOCATIONS])
//! no further lookups are made for the lifetime of the provider.

use crate::Result;
use crate::constants::DEFAULT_UNIVERSE_DOMAIN;
use crate::errors::{self, CredentialsError};
use crate::mds::client::Client as MdsClient;
use crate::retry::RetryPolicy;
use crate::token::{Token, TokenProvider};
use http::HeaderValue;
use http::header::AUTHORIZATION;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::LazyLock;
use tokio::sync::{Mutex, OnceCell};

/// The key used to store the encoded locations in [Token] metadata.
pub const TRUST_BOUNDARY_KEY: &str = "x-allowed-locations";

/// The encoded locations value meaning "no restrictions".
pub const NO_OP_ENCODED_LOCATIONS: &str = "0x0";

const ENABLE_ENV_VAR: &str = "GOOGLE_AUTH_REGIONAL_ACCESS_BOUNDARY_ENABLE_EXPERIMENT";
const LEGACY_ENABLE_ENV_VAR: &str = "GOOGLE_AUTH_TRUST_BOUNDARY_ENABLED";

const MSG: &str = "failed to fetch trust boundary";

/// Whether trust boundary lookups are enabled for this process.
pub(crate) static ENABLED: LazyLock<bool> = LazyLock::new(|| {
    parse_flag(
        std::env::var(ENABLE_ENV_VAR).ok(),
        std::env::var(LEGACY_ENABLE_ENV_VAR).ok(),
    )
});

fn parse_flag(current: Option<String>, legacy: Option<String>) -> bool {
    current
        .or(legacy)
        .map(|v| {
            let v = v.trim();
            v.eq_ignore_ascii_case("true") || v == "1"
        })
        .unwrap_or(false)
}

/// The locations where a principal's tokens may be used.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
pub(crate) struct TrustBoundaryData {
    #[serde(default)]
    locations: Vec<String>,
    #[serde(rename = "encodedLocations", default)]
    encoded_locations: String,
}

impl TrustBoundaryData {
    pub(crate) fn new<I, S>(locations: I, encoded_locations: S) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        S: Into<String>,
    {
        Self {
            locations: locations.into_iter().map(Into::into).collect(),
            encoded_locations: encoded_locations.into(),
        }
    }

    pub(crate) fn no_op() -> Self {
        Self::new(Vec::<String>::new(), NO_OP_ENCODED_LOCATIONS)
    }

    /// The human-readable locations, in the order returned by the service.
    pub(crate) fn locations(&self) -> &[String] {
        &self.locations
    }

    /// The encoded form of the locations, sent in the `x-allowed-locations`
    /// header.
    pub(crate) fn encoded_locations(&self) -> &str {
        &self.encoded_locations
    }

    /// Returns true if the principal has no location restrictions.
    pub(crate) fn is_no_op(&self) -> bool {
        self.encoded_locations == NO_OP_ENCODED_LOCATIONS
    }
}

/// Resolves where (and whether) to look up the trust boundary of a principal.
#[async_trait::async_trait]
pub(crate) trait ConfigProvider: std::fmt::Debug + Send + Sync {
    async fn universe_domain(&self) -> Result<String>;
    async fn lookup_url(&self) -> Result<String>;
}

/// The configuration for a service account with a known email.
#[derive(Clone, Debug)]
pub(crate) struct ServiceAccountConfig {
    email: String,
    universe_domain: String,
}

impl ServiceAccountConfig {
    pub(crate) fn new<E: Into<String>, U: Into<String>>(email: E, universe_domain: U) -> Self {
        Self {
            email: email.into(),
            universe_domain: universe_domain.into(),
        }
    }
}

#[async_trait::async_trait]
impl ConfigProvider for ServiceAccountConfig {
    async fn universe_domain(&self) -> Result<String> {
        Ok(self.universe_domain.clone())
    }

    async fn lookup_url(&self) -> Result<String> {
        if self.email.is_empty() {
            return Err(errors::non_retryable_from_str(
                "trust boundary lookup requires a service account email",
            ));
        }
        Ok(service_account_lookup_url(&self.email))
    }
}

/// The configuration for workload and workforce identity federation.
#[derive(Clone, Debug)]
pub(crate) struct ExternalAccountConfig {
    audience: String,
    universe_domain: String,
}

impl ExternalAccountConfig {
    pub(crate) fn new<A: Into<String>, U: Into<String>>(audience: A, universe_domain: U) -> Self {
        Self {
            audience: audience.into(),
            universe_domain: universe_domain.into(),
        }
    }
}

#[async_trait::async_trait]
impl ConfigProvider for ExternalAccountConfig {
    async fn universe_domain(&self) -> Result<String> {
        Ok(self.universe_domain.clone())
    }

    async fn lookup_url(&self) -> Result<String> {
        external_account_lookup_url(&self.audience).ok_or_else(|| {
            errors::non_retryable_from_str(format!(
                "cannot derive a trust boundary lookup URL from audience {}",
                self.audience
            ))
        })
    }
}

/// The subset of the metadata service used to configure trust boundaries.
#[async_trait::async_trait]
pub(crate) trait MetadataLookup: std::fmt::Debug + Send + Sync {
    async fn email(&self) -> Result<String>;
    async fn universe_domain(&self) -> Result<String>;
}

#[async_trait::async_trait]
impl MetadataLookup for MdsClient {
    async fn email(&self) -> Result<String> {
        MdsClient::email(self).await
    }

    async fn universe_domain(&self) -> Result<String> {
        MdsClient::universe_domain(self).await
    }
}

/// The configuration for the default service account on Compute Engine.
///
/// The email and universe domain are queried at most once, failures
/// included.
// Only external account credentials are built by this crate.
#[allow(dead_code)]
#[derive(Debug)]
pub(crate) struct GceConfigProvider<M = MdsClient> {
    metadata: M,
    email: OnceCell<Result<String>>,
    universe_domain: OnceCell<Result<String>>,
}

#[allow(dead_code)]
impl<M> GceConfigProvider<M>
where
    M: MetadataLookup,
{
    pub(crate) fn new(metadata: M) -> Self {
        Self {
            metadata,
            email: OnceCell::new(),
            universe_domain: OnceCell::new(),
        }
    }
}

#[async_trait::async_trait]
impl<M> ConfigProvider for GceConfigProvider<M>
where
    M: MetadataLookup,
{
    async fn universe_domain(&self) -> Result<String> {
        self.universe_domain
            .get_or_init(|| self.metadata.universe_domain())
            .await
            .clone()
    }

    async fn lookup_url(&self) -> Result<String> {
        let email = self
            .email
            .get_or_init(|| self.metadata.email())
            .await
            .clone()?;
        ServiceAccountConfig::new(email, DEFAULT_UNIVERSE_DOMAIN)
            .lookup_url()
            .await
    }
}

/// Fetches and caches the trust boundary for one principal.
#[derive(Debug)]
pub(crate) struct DataProvider<C> {
    config: C,
    client: Client,
    retry: RetryPolicy,
    cached: Mutex<Option<TrustBoundaryData>>,
}

impl<C> DataProvider<C>
where
    C: ConfigProvider,
{
    pub(crate) fn new(config: C) -> Self {
        Self {
            config,
            client: Client::new(),
            retry: RetryPolicy::default(),
            cached: Mutex::new(None),
        }
    }

    /// Returns the trust boundary, using `token` to authorize any lookup.
    pub(crate) async fn trust_boundary_data(&self, token: &Token) -> Result<TrustBoundaryData> {
        let universe_domain = self.config.universe_domain().await?;
        let mut cached = self.cached.lock().await;
        if universe_domain != DEFAULT_UNIVERSE_DOMAIN {
            let data = TrustBoundaryData::no_op();
            *cached = Some(data.clone());
            return Ok(data);
        }
        if let Some(data) = cached.as_ref().filter(|d| d.is_no_op()) {
            return Ok(data.clone());
        }

        let url = self.config.lookup_url().await?;
        match self.fetch_with_retry(&url, token).await {
            Ok(data) => {
                *cached = Some(data.clone());
                Ok(data)
            }
            Err(e) => match cached.as_ref() {
                Some(stale) => {
                    tracing::warn!("{MSG}, using the previous value: {e}");
                    Ok(stale.clone())
                }
                None => Err(e),
            },
        }
    }

    async fn fetch_with_retry(&self, url: &str, token: &Token) -> Result<TrustBoundaryData> {
        let authorization = format!("{} {}", token.token_type, token.token);
        let mut authorization =
            HeaderValue::from_str(&authorization).map_err(errors::non_retryable)?;
        authorization.set_sensitive(true);
        self.retry
            .run(|| fetch(&self.client, url, authorization.clone()))
            .await
    }
}

async fn fetch(client: &Client, url: &str, authorization: HeaderValue) -> Result<TrustBoundaryData> {
    tracing::debug!("fetching trust boundary from {url}");
    let response = client
        .get(url)
        .header(AUTHORIZATION, authorization)
        .send()
        .await
        .map_err(|e| errors::from_http_error(e, MSG))?;
    let status = response.status();
    if !status.is_success() {
        // Any server error may go away on the next attempt.
        let transient = status.is_server_error() || errors::is_retryable(status);
        return Err(errors::from_http_response_with(response, MSG, transient).await);
    }
    let data = response
        .json::<TrustBoundaryData>()
        .await
        .map_err(|e| CredentialsError::from_source(!e.is_decode(), e))?;
    if data.encoded_locations.is_empty() {
        return Err(errors::non_retryable_from_str(
            "invalid API response: encodedLocations is empty",
        ));
    }
    tracing::debug!(locations = ?data.locations(), "fetched trust boundary");
    Ok(data)
}

/// Attaches the trust boundary to the tokens returned by `T`.
#[derive(Debug)]
pub(crate) struct TrustBoundaryTokenProvider<T, C> {
    inner: T,
    data: DataProvider<C>,
}

impl<T, C> TrustBoundaryTokenProvider<T, C>
where
    T: TokenProvider,
    C: ConfigProvider,
{
    pub(crate) fn new(inner: T, config: C) -> Self {
        Self {
            inner,
            data: DataProvider::new(config),
        }
    }
}

#[async_trait::async_trait]
impl<T, C> TokenProvider for TrustBoundaryTokenProvider<T, C>
where
    T: TokenProvider,
    C: ConfigProvider,
{
    async fn token(&self) -> Result<Token> {
        let mut token = self.inner.token().await?;
        let data = self.data.trust_boundary_data(&token).await?;
        token
            .metadata
            .get_or_insert_with(HashMap::new)
            .insert(
                TRUST_BOUNDARY_KEY.to_string(),
                data.encoded_locations().to_string(),
            );
        Ok(token)
    }
}

pub(crate) fn service_account_lookup_url(email: &str) -> String {
    format!(
        "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/{email}/allowedLocations"
    )
}

pub(crate) fn external_account_lookup_url(audience: &str) -> Option<String> {
    let path = audience
        .trim_start_matches("//iam.googleapis.com/")
        .trim_start_matches("https://iam.googleapis.com/")
        .trim_start_matches('/');

    let parts: Vec<&str> = path.split('/').collect();

    // projects/{project}/locations/global/workloadIdentityPools/{pool}/providers/{provider}
    if parts.len() >= 6
        && parts[0] == "projects"
        && parts[2] == "locations"
        && parts[4] == "workloadIdentityPools"
    {
        let (project, pool) = (parts[1], parts[5]);
        return Some(format!(
            "https://iamcredentials.googleapis.com/v1/projects/{project}/locations/global/workloadIdentityPools/{pool}/allowedLocations"
        ));
    }

    // locations/global/workforcePools/{pool}/providers/{provider}
    if parts.len() >= 4 && parts[0] == "locations" && parts[2] == "workforcePools" {
        let pool = parts[3];
        return Some(format!(
            "https://iamcredentials.googleapis.com/v1/locations/global/workforcePools/{pool}/allowedLocations"
        ));
    }

    None
}
