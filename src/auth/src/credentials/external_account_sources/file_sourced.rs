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

use super::SubjectTokenFormat;
use crate::Result;
use crate::credentials::subject_token::dynamic::SubjectTokenSource;
use crate::errors;

/// Reads the subject token from a local file.
#[derive(Debug)]
pub(crate) struct FileSourcedCredentials {
    pub file: String,
    pub format: SubjectTokenFormat,
}

impl FileSourcedCredentials {
    pub(crate) fn new(file: String, format: SubjectTokenFormat) -> Self {
        Self { file, format }
    }
}

#[async_trait::async_trait]
impl SubjectTokenSource for FileSourcedCredentials {
    async fn subject_token(&self) -> Result<String> {
        let content = tokio::fs::read_to_string(&self.file)
            .await
            .map_err(errors::non_retryable)?;
        let token = self.format.extract(content.trim())?;
        if token.is_empty() {
            return Err(errors::non_retryable_from_str(format!(
                "the subject token file `{}` does not contain a token",
                self.file
            )));
        }
        Ok(token)
    }

    fn provider_type(&self) -> &'static str {
        "file"
    }
}
