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

use crate::constants::DEFAULT_UNIVERSE_DOMAIN;
use crate::errors::{self, CredentialsError};
use http::StatusCode;
use reqwest::{Client as ReqwestClient, RequestBuilder};

/// A client for GCP Compute Engine Metadata Service (MDS).
///
/// Only the lookups needed to compute trust boundaries are implemented.
#[derive(Clone, Debug)]
pub(crate) struct Client {
    endpoint: String,
    inner: ReqwestClient,
}

impl Client {
    /// Creates a new client for the Metadata Service.
    pub(crate) fn new(endpoint_override: Option<String>) -> Self {
        let endpoint = Self::resolve_endpoint(endpoint_override);
        let endpoint = endpoint.trim_end_matches('/').to_string();

        Self {
            endpoint,
            inner: ReqwestClient::new(),
        }
    }

    fn resolve_endpoint(endpoint_override: Option<String>) -> String {
        if let Ok(host) = std::env::var(super::GCE_METADATA_HOST_ENV_VAR) {
            // Check GCE_METADATA_HOST environment variable first
            format!("http://{host}")
        } else if let Some(e) = endpoint_override {
            e
        } else {
            super::METADATA_ROOT.to_string()
        }
    }

    /// Creates a GET request to the MDS service with the correct headers.
    fn get(&self, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.endpoint, path);
        self.inner
            .get(url)
            .header(super::METADATA_FLAVOR, super::METADATA_FLAVOR_VALUE)
    }

    /// Fetches the email of the default service account.
    pub(crate) async fn email(&self) -> crate::Result<String> {
        let path = format!("{}/email", super::MDS_DEFAULT_URI);
        let error_message = "failed to fetch email";

        let response = self
            .get(&path)
            .send()
            .await
            .map_err(|e| errors::from_http_error(e, error_message))?;
        let response = Self::check_response_status(response, error_message).await?;

        let email = response
            .text()
            .await
            .map_err(|e| CredentialsError::from_source(!e.is_decode(), e))?;
        Ok(email.trim().to_string())
    }

    /// Fetches the universe domain of the instance.
    ///
    /// Older metadata servers do not know about universe domains, a 404 (or
    /// an empty response) means the default universe.
    pub(crate) async fn universe_domain(&self) -> crate::Result<String> {
        let error_message = "failed to fetch universe domain";

        let response = self
            .get(super::MDS_UNIVERSE_DOMAIN_URI)
            .send()
            .await
            .map_err(|e| errors::from_http_error(e, error_message))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(DEFAULT_UNIVERSE_DOMAIN.to_string());
        }
        let response = Self::check_response_status(response, error_message).await?;

        let domain = response
            .text()
            .await
            .map_err(|e| CredentialsError::from_source(!e.is_decode(), e))?;
        let domain = domain.trim();
        if domain.is_empty() {
            return Ok(DEFAULT_UNIVERSE_DOMAIN.to_string());
        }
        Ok(domain.to_string())
    }

    async fn check_response_status(
        response: reqwest::Response,
        error_message: &str,
    ) -> crate::Result<reqwest::Response> {
        if !response.status().is_success() {
            let err = errors::from_http_response(response, error_message).await;
            Err(err)
        } else {
            Ok(response)
        }
    }
}
