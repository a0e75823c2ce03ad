//! Blocking `ureq` calls moved off the async runtime.

use std::time::Duration;

use serde_json::Value;

use super::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Method {
    Get,
    Delete,
    Post,
    Patch,
}

/// One JSON request. Built on the async side, sent on a blocking thread.
#[derive(Debug, Clone)]
pub(crate) struct JsonRequest {
    method: Method,
    url: String,
    token: Option<String>,
    query: Vec<(String, String)>,
    body: Option<Value>,
    timeout: Duration,
}

impl JsonRequest {
    pub(crate) fn new(method: Method, url: String, timeout: Duration) -> Self {
        Self {
            method,
            url,
            token: None,
            query: Vec::new(),
            body: None,
            timeout,
        }
    }

    pub(crate) fn bearer(mut self, token: Option<&str>) -> Self {
        self.token = token.map(str::to_string);
        self
    }

    pub(crate) fn query(mut self, pairs: Vec<(String, String)>) -> Self {
        self.query = pairs;
        self
    }

    pub(crate) fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Send and decode the response. An empty body decodes to `Null`.
    pub(crate) async fn send(self) -> Result<Value, ApiError> {
        let url = self.url.clone();
        tokio::task::spawn_blocking(move || self.send_blocking())
            .await
            .map_err(|e| ApiError::Transport {
                url,
                message: format!("task join error: {}", e),
            })?
    }

    fn send_blocking(self) -> Result<Value, ApiError> {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(self.timeout))
            .build();
        let agent = ureq::Agent::new_with_config(config);
        let auth = self.token.as_ref().map(|t| format!("Bearer {}", t));

        let sent = match self.method {
            Method::Get | Method::Delete => {
                let mut request = if self.method == Method::Get {
                    agent.get(&self.url)
                } else {
                    agent.delete(&self.url)
                };
                if let Some(ref auth) = auth {
                    request = request.header("Authorization", auth);
                }
                for (key, value) in &self.query {
                    request = request.query(key, value);
                }
                request.call()
            }
            Method::Post | Method::Patch => {
                let mut request = if self.method == Method::Post {
                    agent.post(&self.url)
                } else {
                    agent.patch(&self.url)
                };
                if let Some(ref auth) = auth {
                    request = request.header("Authorization", auth);
                }
                request.send_json(self.body.as_ref().unwrap_or(&Value::Null))
            }
        };

        let response = sent.map_err(|e| match e {
            ureq::Error::StatusCode(status) => ApiError::Status {
                url: self.url.clone(),
                status,
                message: String::new(),
            },
            other => ApiError::Transport {
                url: self.url.clone(),
                message: other.to_string(),
            },
        })?;

        let text = response
            .into_body()
            .read_to_string()
            .map_err(|e| ApiError::Transport {
                url: self.url.clone(),
                message: e.to_string(),
            })?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ApiError::Decode {
            url: self.url,
            message: format!("failed to parse response as JSON: {}", e),
        })
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_normalizes_slashes() {
        assert_eq!(join_url("http://x/", "/a/b"), "http://x/a/b");
        assert_eq!(join_url("http://x", "a"), "http://x/a");
    }

    #[tokio::test]
    async fn unreachable_host_is_transient() {
        let err = JsonRequest::new(
            Method::Get,
            "http://127.0.0.1:9/nothing".into(),
            Duration::from_millis(500),
        )
        .send()
        .await
        .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::TransientIo);
    }
}
