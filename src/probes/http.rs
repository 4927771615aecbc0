use once_cell::sync::Lazy;
use reqwest::{Client, Method, header};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use super::ProbeError;
use crate::version::user_agent;

/// Callers bound whole requests with their own timeouts; this caps the
/// TCP and TLS handshake for all of them.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared by every HTTP probe, intervention webhook and notifier so the
/// whole fleet reuses one connection pool.
pub(crate) static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .user_agent(user_agent())
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .unwrap_or_else(|_| Client::new())
});

#[derive(Debug, Clone, Deserialize)]
pub struct HttpProbeConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Accepted status codes. Empty means any 2xx.
    #[serde(default)]
    pub expected_status: Vec<u16>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl HttpProbeConfig {
    pub fn accepts(&self, status: u16) -> bool {
        if self.expected_status.is_empty() {
            (200..300).contains(&status)
        } else {
            self.expected_status.contains(&status)
        }
    }
}

pub(crate) fn parse_method(method: &str) -> Result<Method, String> {
    Method::from_bytes(method.to_uppercase().as_bytes()).map_err(|e| format!("Unsupported HTTP method '{method}': {e}"))
}

pub(crate) fn header_map(headers: &HashMap<String, String>) -> Result<header::HeaderMap, String> {
    let mut map = header::HeaderMap::with_capacity(headers.len());
    for (key, value) in headers {
        let name = header::HeaderName::from_bytes(key.as_bytes()).map_err(|e| format!("Invalid header name: {e}"))?;
        let value = header::HeaderValue::from_str(value).map_err(|e| format!("Invalid header value: {e}"))?;
        map.insert(name, value);
    }
    Ok(map)
}

pub(crate) async fn check(config: &HttpProbeConfig, timeout: Duration) -> Result<u16, ProbeError> {
    let method = parse_method(&config.method).map_err(ProbeError::InvalidTarget)?;
    let headers = header_map(&config.headers).map_err(ProbeError::InvalidTarget)?;
    let response = HTTP_CLIENT
        .request(method, &config.url)
        .headers(headers)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(e.to_string())
            }
        })?;
    let status = response.status().as_u16();
    if config.accepts(status) {
        Ok(status)
    } else {
        Err(ProbeError::Status(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(expected: Vec<u16>) -> HttpProbeConfig {
        HttpProbeConfig {
            url: "http://localhost".into(),
            method: default_method(),
            headers: HashMap::new(),
            expected_status: expected,
        }
    }

    #[test]
    fn default_accepts_any_2xx() {
        let cfg = config(vec![]);
        assert!(cfg.accepts(200));
        assert!(cfg.accepts(204));
        assert!(!cfg.accepts(301));
        assert!(!cfg.accepts(503));
    }

    #[test]
    fn explicit_status_list() {
        let cfg = config(vec![401, 403]);
        assert!(cfg.accepts(401));
        assert!(!cfg.accepts(200));
    }

    #[test]
    fn rejects_bad_headers() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        assert!(header_map(&headers).is_err());
        assert!(parse_method("post").is_ok());
    }
}
