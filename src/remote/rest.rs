//! REST backend speaking PostgREST conventions
//!
//! Requires the `rest` feature.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value;

use super::{RemoteBackend, RemoteError, RemoteResult};
use crate::config::RemoteConfig;
use crate::error::{Result, SyncError};

pub struct RestBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
    timeout: Duration,
}

impl RestBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token,
            timeout,
        })
    }

    /// Build from config; `None` when no URL is configured
    pub fn from_config(config: &RemoteConfig, timeout: Duration) -> Result<Option<Self>> {
        let Some(url) = config.url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| SyncError::Config("remote.api_key is required with remote.url".into()))?;
        Self::new(url, api_key, config.access_token.clone(), timeout).map(Some)
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        request
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", bearer))
    }

    async fn send(&self, request: RequestBuilder) -> RemoteResult<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(classify_status(status, message))
    }

    fn transport_error(&self, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else {
            RemoteError::Network(e.to_string())
        }
    }

    async fn rows(&self, response: Response) -> RemoteResult<Vec<Value>> {
        let body: Value = response
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        match body {
            Value::Array(rows) => Ok(rows),
            other => Err(RemoteError::Malformed(format!(
                "expected an array of rows, got {}",
                type_name(&other)
            ))),
        }
    }
}

/// HTTP status to error: 408/429/5xx are transient, 401/403 mean the session
/// is missing or expired, other failures are rejections
fn classify_status(status: StatusCode, message: String) -> RemoteError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        RemoteError::Unauthorized {
            status: status.as_u16(),
            message,
        }
    } else if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        RemoteError::Network(format!("HTTP {}: {}", status.as_u16(), message))
    } else {
        RemoteError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[async_trait]
impl RemoteBackend for RestBackend {
    fn name(&self) -> &str {
        "rest"
    }

    async fn has_session(&self) -> bool {
        self.access_token.is_some()
    }

    async fn select(&self, table: &str, since: Option<DateTime<Utc>>) -> RemoteResult<Vec<Value>> {
        let mut query = vec![("select".to_string(), "*".to_string())];
        if let Some(since) = since {
            query.push((
                "updated_at".to_string(),
                format!("gte.{}", since.to_rfc3339_opts(SecondsFormat::Micros, true)),
            ));
        }

        let request = self.client.get(self.table_url(table)).query(&query);
        let response = self.send(request).await?;
        self.rows(response).await
    }

    async fn insert(&self, table: &str, row: &Value) -> RemoteResult<Option<Value>> {
        let request = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(row);
        let response = self.send(request).await?;
        Ok(self.rows(response).await?.into_iter().next())
    }

    async fn update(&self, table: &str, id: &str, patch: &Value) -> RemoteResult<Option<Value>> {
        let request = self
            .client
            .patch(self.table_url(table))
            .query(&[("id", format!("eq.{}", id))])
            .header("Prefer", "return=representation")
            .json(patch);
        let response = self.send(request).await?;
        Ok(self.rows(response).await?.into_iter().next())
    }

    async fn delete(&self, table: &str, id: &str) -> RemoteResult<()> {
        let request = self
            .client
            .delete(self.table_url(table))
            .query(&[("id", format!("eq.{}", id))]);
        self.send(request).await?;
        Ok(())
    }

    async fn upsert(&self, table: &str, rows: &[Value]) -> RemoteResult<Vec<Value>> {
        let request = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(rows);
        let response = self.send(request).await?;
        self.rows(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, String::new()).is_transient());
        assert_eq!(
            classify_status(StatusCode::CONFLICT, "duplicate".into()),
            RemoteError::Rejected {
                status: 409,
                message: "duplicate".into()
            }
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, "JWT expired".into()),
            RemoteError::Unauthorized {
                status: 401,
                message: "JWT expired".into()
            }
        );
        assert!(classify_status(StatusCode::FORBIDDEN, String::new()).is_unauthorized());
    }

    #[test]
    fn test_from_config() {
        let timeout = Duration::from_secs(5);
        assert!(RestBackend::from_config(&RemoteConfig::default(), timeout)
            .unwrap()
            .is_none());

        let missing_key = RemoteConfig {
            url: Some("https://crm.example.co".into()),
            ..Default::default()
        };
        assert!(RestBackend::from_config(&missing_key, timeout).is_err());

        let backend = RestBackend::from_config(
            &RemoteConfig {
                url: Some("https://crm.example.co/".into()),
                api_key: Some("anon".into()),
                access_token: None,
            },
            timeout,
        )
        .unwrap()
        .unwrap();
        assert_eq!(backend.table_url("clients"), "https://crm.example.co/rest/v1/clients");
    }
}
