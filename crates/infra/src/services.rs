//! HTTP client for the work services.

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use tokio::runtime::Handle;
use tracing::debug;

use conductor_workers::{ServiceCall, ServiceError, WorkServices};

/// Posts each call as JSON to `{base_url}/work/{call_name}` and returns the
/// JSON response body.
///
/// `5xx` and transport errors are `Unavailable`; other non-success statuses
/// are `Failed`.
#[derive(Debug, Clone)]
pub struct HttpWorkServices {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    runtime: Handle,
}

impl HttpWorkServices {
    pub fn new(base_url: impl Into<String>, runtime: Handle) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            runtime,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    async fn post(&self, call: &ServiceCall, deadline: Duration) -> Result<JsonValue, ServiceError> {
        let url = format!("{}/work/{}", self.base_url, call.name());
        let mut req = self.client.post(&url).json(call).timeout(deadline);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ServiceError::Unavailable(format!("{} returned {}", url, status)));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ServiceError::Failed(format!("{} returned {}: {}", url, status, body)));
        }

        resp.json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))
    }
}

impl WorkServices for HttpWorkServices {
    fn invoke(&self, call: &ServiceCall, deadline: Duration) -> Result<JsonValue, ServiceError> {
        if deadline.is_zero() {
            return Err(ServiceError::Unavailable("deadline already passed".to_string()));
        }
        debug!(call = call.name(), deadline_ms = deadline.as_millis() as u64, "invoking work service");
        self.runtime.block_on(self.post(call, deadline))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Serve one canned HTTP response per connection.
    fn serve(runtime: &tokio::runtime::Runtime, status: &'static str, body: &'static str) -> String {
        let listener = runtime
            .block_on(TcpListener::bind("127.0.0.1:0"))
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");

        runtime.spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("test runtime")
    }

    #[test]
    fn success_returns_the_json_body() {
        let rt = runtime();
        let url = serve(&rt, "200 OK", r#"{"total_records": 7}"#);
        let services = HttpWorkServices::new(url, rt.handle().clone());

        let out = services.invoke(&ServiceCall::SilverEtl, Duration::from_secs(5)).unwrap();
        assert_eq!(out["total_records"], 7);
    }

    #[test]
    fn server_errors_are_unavailable_and_client_errors_failed() {
        let rt = runtime();
        let down = HttpWorkServices::new(serve(&rt, "503 Service Unavailable", "{}"), rt.handle().clone());
        assert!(matches!(
            down.invoke(&ServiceCall::DataQualityAudit, Duration::from_secs(5)),
            Err(ServiceError::Unavailable(_))
        ));

        let rejected = HttpWorkServices::new(serve(&rt, "422 Unprocessable Entity", "{}"), rt.handle().clone());
        assert!(matches!(
            rejected.invoke(&ServiceCall::DataQualityAudit, Duration::from_secs(5)),
            Err(ServiceError::Failed(_))
        ));
    }

    #[test]
    fn non_json_body_is_an_invalid_response() {
        let rt = runtime();
        let services = HttpWorkServices::new(serve(&rt, "200 OK", "not json"), rt.handle().clone());
        assert!(matches!(
            services.invoke(&ServiceCall::SilverEtl, Duration::from_secs(5)),
            Err(ServiceError::InvalidResponse(_))
        ));
    }

    #[test]
    fn exhausted_deadline_skips_the_request() {
        let rt = runtime();
        let services = HttpWorkServices::new("http://127.0.0.1:9", rt.handle().clone());
        assert!(matches!(
            services.invoke(&ServiceCall::SilverEtl, Duration::ZERO),
            Err(ServiceError::Unavailable(_))
        ));
    }
}
