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
use crate::constants::{ACCESS_TOKEN_TYPE, TOKEN_EXCHANGE_GRANT_TYPE};
use crate::errors::{self, CredentialsError};
use base64::Engine;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

const MSG: &str = "failed to exchange token";

/// Handles OAuth2 Secure Token Service (STS) exchange.
/// Reference: https://datatracker.ietf.org/doc/html/rfc8693
pub(crate) struct STSHandler;

impl STSHandler {
    /// Performs an oauth2 token exchange with the provided [ExchangeTokenRequest] information.
    pub(crate) async fn exchange_token(
        client: &reqwest::Client,
        req: ExchangeTokenRequest,
    ) -> Result<TokenResponse> {
        // A sorted map produces a stable request body.
        let mut params = BTreeMap::new();

        params.insert("grant_type", TOKEN_EXCHANGE_GRANT_TYPE.to_string());
        params.insert("requested_token_type", ACCESS_TOKEN_TYPE.to_string());

        params.insert("subject_token", req.subject_token);
        params.insert("subject_token_type", req.subject_token_type);

        if !req.scope.is_empty() {
            params.insert("scope", req.scope.join(" "));
        }
        if let Some(audience) = req.audience {
            params.insert("audience", audience);
        }
        if let Some(options) = req.extra_options {
            let value = serde_json::to_string(&options).map_err(errors::non_retryable)?;
            params.insert("options", value);
        }

        Self::execute(client, req.url, req.authentication, req.headers, params).await
    }

    async fn execute(
        client: &reqwest::Client,
        url: String,
        client_auth: ClientAuthentication,
        headers: http::HeaderMap,
        params: BTreeMap<&str, String>,
    ) -> Result<TokenResponse> {
        let mut headers = headers;
        let mut params = params;
        client_auth.inject_auth(&mut headers, &mut params)?;

        let response = client
            .post(url)
            .headers(headers)
            .form(&params)
            .send()
            .await
            .map_err(|e| errors::from_http_error(e, MSG))?;

        if !response.status().is_success() {
            return Err(errors::from_http_response(response, MSG).await);
        }

        let token_res = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| CredentialsError::new(!e.is_decode(), MSG, e))?;
        if token_res.expires_in < 0 {
            return Err(errors::non_retryable_from_str(
                "got invalid expiry from security token service",
            ));
        }
        Ok(token_res)
    }
}

/// TokenResponse is used to decode the remote server response during
/// an oauth2 token exchange.
#[derive(Deserialize, Default, PartialEq, Debug)]
pub(crate) struct TokenResponse {
    pub(crate) access_token: String,
    #[serde(default)]
    pub(crate) issued_token_type: String,
    pub(crate) token_type: String,
    /// The lifetime of the token in seconds.
    pub(crate) expires_in: i64,
    #[serde(default)]
    pub(crate) scope: String,
}

/// Authentication style via headers or form params.
/// See https://datatracker.ietf.org/doc/html/rfc6749#section-2.3.1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ClientAuthStyle {
    InParams,
    InHeader,
}

/// ClientAuthentication represents an OAuth client ID and secret and the
/// mechanism for passing these credentials as stated
/// in https://datatracker.ietf.org/doc/html/rfc6749#section-2.3.1.
#[derive(Clone, Debug)]
pub(crate) struct ClientAuthentication {
    pub(crate) auth_style: ClientAuthStyle,
    pub(crate) client_id: Option<String>,
    pub(crate) client_secret: Option<String>,
}

impl Default for ClientAuthentication {
    fn default() -> Self {
        Self {
            auth_style: ClientAuthStyle::InHeader,
            client_id: None,
            client_secret: None,
        }
    }
}

impl ClientAuthentication {
    /// Add authentication to a Secure Token Service exchange request.
    ///
    /// Modifies either the passed headers or form parameters depending on the
    /// desired authentication format. Does nothing unless both the client id
    /// and secret are set.
    pub(crate) fn inject_auth(
        &self,
        headers: &mut http::HeaderMap,
        params: &mut BTreeMap<&str, String>,
    ) -> Result<()> {
        let (Some(client_id), Some(client_secret)) = (&self.client_id, &self.client_secret) else {
            return Ok(());
        };
        if client_id.is_empty() || client_secret.is_empty() {
            return Ok(());
        }
        match self.auth_style {
            ClientAuthStyle::InHeader => {
                let plain_header = format!("{client_id}:{client_secret}");
                let encoded = base64::engine::general_purpose::STANDARD.encode(plain_header);
                let mut value = http::HeaderValue::from_str(&format!("Basic {encoded}"))
                    .map_err(errors::non_retryable)?;
                value.set_sensitive(true);
                headers.insert(http::header::AUTHORIZATION, value);
            }
            ClientAuthStyle::InParams => {
                params.insert("client_id", client_id.clone());
                params.insert("client_secret", client_secret.clone());
            }
        }
        Ok(())
    }
}

/// Information required to perform an oauth2 token exchange with the provided endpoint.
#[derive(Debug, Default)]
pub(crate) struct ExchangeTokenRequest {
    pub(crate) url: String,
    pub(crate) authentication: ClientAuthentication,
    pub(crate) headers: http::HeaderMap,
    pub(crate) subject_token: String,
    pub(crate) subject_token_type: String,
    pub(crate) audience: Option<String>,
    pub(crate) scope: Vec<String>,
    pub(crate) extra_options: Option<HashMap<String, String>>,
}
