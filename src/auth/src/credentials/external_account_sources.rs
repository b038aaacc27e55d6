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

//! The sources of subject tokens for external account credentials.

pub(crate) mod aws_sourced;
pub(crate) mod executable_sourced;
pub(crate) mod file_sourced;
pub(crate) mod programmatic_sourced;
pub(crate) mod url_sourced;
pub(crate) mod x509_sourced;

use crate::Result;
use crate::errors;
use serde_json::Value;

/// How to extract the subject token from a file or HTTP response.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum SubjectTokenFormat {
    /// The whole content is the token.
    Text,
    /// The content is a JSON object, the token is in the given field.
    Json { field_name: String },
}

impl SubjectTokenFormat {
    pub(crate) fn extract(&self, content: &str) -> Result<String> {
        let field_name = match self {
            Self::Text => return Ok(content.to_string()),
            Self::Json { field_name } => field_name,
        };
        let json: Value = serde_json::from_str(content).map_err(errors::non_retryable)?;
        match json.get(field_name) {
            Some(Value::String(token)) => Ok(token.clone()),
            None | Some(_) => Err(errors::non_retryable_from_str(format!(
                "failed to read subject token field `{field_name}` as string, body=<{json}>"
            ))),
        }
    }
}
