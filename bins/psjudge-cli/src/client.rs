// Thin HTTP client for the builder API

use anyhow::{bail, Context, Result};
use psjudge_common::api::{
    BuildReportResponse, BuildStatusResponse, ErrorResponse, RegisterBuildRequest,
    RegisterResponse, RegisterTestCaseRequest,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<Value> {
        let url = self.url(path);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.context("Failed to read response body")?;
        interpret_response(status, &bytes)
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let url = self.url(path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.context("Failed to read response body")?;
        interpret_response(status, &bytes)
    }

    pub async fn register_build(&self, request: &RegisterBuildRequest) -> Result<RegisterResponse> {
        decode(self.post("/api/v1/build/new", request).await?)
    }

    pub async fn register_test_case(
        &self,
        request: &RegisterTestCaseRequest,
    ) -> Result<RegisterResponse> {
        decode(self.post("/api/v1/testcase/new", request).await?)
    }

    pub async fn status(&self, uuid: &str) -> Result<BuildStatusResponse> {
        decode(self.get(&format!("/api/v1/build/status/{}", uuid)).await?)
    }

    pub async fn report(&self, uuid: &str) -> Result<BuildReportResponse> {
        decode(self.get(&format!("/api/v1/build/report/{}", uuid)).await?)
    }
}

/// A body carrying `error.text` is a failure whatever the HTTP status says.
/// An empty body on success reads as `null`.
pub fn interpret_response(status: u16, body: &[u8]) -> Result<Value> {
    let value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => value,
            Err(e) => {
                if (200..300).contains(&status) {
                    return Err(e).context("Server returned a non-JSON body");
                }
                bail!("HTTP {}: {}", status, String::from_utf8_lossy(body).trim());
            }
        }
    };

    if let Some(text) = ErrorResponse::from_body(&value) {
        bail!("{}", text);
    }
    if !(200..300).contains(&status) {
        bail!("HTTP {}", status);
    }
    Ok(value)
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).context("Unexpected response shape")
}
