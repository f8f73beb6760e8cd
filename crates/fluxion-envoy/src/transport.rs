// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! HTTP access to the Envoy with 401 recovery

use crate::auth::{SessionAuthority, SessionCredentials};
use crate::errors::{EnvoyError, EnvoyResult};
use reqwest::header::{CONTENT_TYPE, COOKIE};
use reqwest::multipart::Form;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

const MAX_ATTEMPTS: u32 = 3;

/// Client used for the Envoy and the Enphase cloud. Redirects are never
/// followed and the Envoy's self-signed certificate is accepted.
pub fn build_http_client(timeout: Duration) -> EnvoyResult<Client> {
    Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(|e| EnvoyError::ConfigError(format!("Failed to build HTTP client: {e}")))
}

/// Body and metadata of a completed request.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub url: String,
    pub body: String,
}

impl RawResponse {
    async fn read(response: reqwest::Response) -> EnvoyResult<Self> {
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;
        Ok(Self {
            status,
            content_type,
            url,
            body,
        })
    }

    fn from_file(path: &str, body: String) -> EnvoyResult<Self> {
        let content_type = if path.ends_with(".json") {
            "application/json"
        } else if path.ends_with(".xml") {
            "application/xml"
        } else {
            return Err(EnvoyError::ConfigError(format!(
                "Unsupported fixture file (expected .json or .xml): {path}"
            )));
        };
        Ok(Self {
            status: 200,
            content_type: Some(content_type.to_string()),
            url: path.to_string(),
            body,
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Media type without parameters, lowercased.
    pub fn media_type(&self) -> Option<String> {
        self.content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_lowercase())
    }

    pub fn is_json(&self) -> bool {
        self.media_type().as_deref() == Some("application/json") || url_path(&self.url).ends_with(".json")
    }

    pub fn is_xml(&self) -> bool {
        matches!(
            self.media_type().as_deref(),
            Some("text/xml" | "application/xml")
        ) || url_path(&self.url).ends_with(".xml")
    }

    pub fn json(&self) -> EnvoyResult<Value> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

fn url_path(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}

fn is_remote(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Request layer shared by the fetch scheduler, commands and the meter stream.
#[derive(Clone)]
pub struct EnvoyTransport {
    client: Client,
    authority: Arc<dyn SessionAuthority>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl std::fmt::Debug for EnvoyTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvoyTransport")
            .field("max_attempts", &self.max_attempts)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

impl EnvoyTransport {
    pub fn new(authority: Arc<dyn SessionAuthority>, timeout: Duration) -> EnvoyResult<Self> {
        Ok(Self {
            client: build_http_client(timeout)?,
            authority,
            max_attempts: MAX_ATTEMPTS,
            retry_delay: Duration::from_millis(500),
        })
    }

    /// Set custom retry configuration
    pub fn with_retry_config(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn authority(&self) -> &Arc<dyn SessionAuthority> {
        &self.authority
    }

    fn authorize(builder: RequestBuilder, credentials: &SessionCredentials) -> RequestBuilder {
        let builder = match &credentials.bearer {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        };
        match credentials.cookie_header() {
            Some(cookie) => builder.header(COOKIE, cookie),
            None => builder,
        }
    }

    /// GET with transport retries and 401 recovery.
    ///
    /// Up to `max_attempts` sends on transport errors, spaced by the fixed
    /// retry delay, and at most `max_attempts - 1` reauthentications. The
    /// first 401 revalidates the session cookie; if that is refused, or on
    /// the second 401, a new token is acquired. `Ok(None)` means 404.
    /// Non-HTTP locations are read from disk.
    pub async fn get(&self, url: &str) -> EnvoyResult<Option<RawResponse>> {
        if !is_remote(url) {
            return read_file(url).await;
        }

        let mut failures = 0;
        let mut received_401 = 0;

        loop {
            let credentials = self.authority.credentials();
            debug!(
                "🌐 [ENVOY GET] Attempt #{}: {} (bearer: {}, cookies: {})",
                failures + received_401 + 1,
                url,
                credentials.bearer.is_some(),
                credentials.cookies.len()
            );

            let response = match Self::authorize(self.client.get(url), &credentials).send().await {
                Ok(response) => response,
                Err(e) => {
                    failures += 1;
                    if failures >= self.max_attempts {
                        error!("❌ [ENVOY GET] {} failed after {} attempts: {}", url, failures, e);
                        return Err(EnvoyError::HttpError(e));
                    }
                    warn!(
                        "⚠️ [ENVOY GET] {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        url, failures, self.max_attempts, e, self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
            };

            match response.status() {
                // Transport failures and 401s have separate budgets
                StatusCode::UNAUTHORIZED if received_401 + 1 < self.max_attempts => {
                    debug!(
                        "🔑 [ENVOY GET] 401 from {}, reauthenticating ({} of {})",
                        url,
                        received_401 + 1,
                        self.max_attempts - 1
                    );
                    let refreshed = if received_401 == 0 {
                        self.authority.refresh_session().await?
                    } else {
                        false
                    };
                    if !refreshed {
                        self.authority.reauthenticate().await?;
                    }
                    received_401 += 1;
                }
                StatusCode::UNAUTHORIZED => {
                    error!("❌ [ENVOY GET] Still unauthorized after reauthentication: {}", url);
                    return Err(EnvoyError::Unauthorized {
                        url: url.to_string(),
                    });
                }
                StatusCode::NOT_FOUND => {
                    debug!("🌐 [ENVOY GET] 404 for {}, no data", url);
                    return Ok(None);
                }
                _ => {
                    let raw = RawResponse::read(response).await?;
                    trace!("   Body: {}", raw.body);
                    return Ok(Some(raw));
                }
            }
        }
    }

    pub async fn post_json(&self, url: &str, body: &Value) -> EnvoyResult<RawResponse> {
        debug!("🌐 [ENVOY POST] {}", url);
        trace!("   Data: {}", body);
        let credentials = self.authority.credentials();
        let response = Self::authorize(self.client.post(url), &credentials)
            .json(body)
            .send()
            .await?;
        RawResponse::read(response).await
    }

    pub async fn put_json(&self, url: &str, body: &Value) -> EnvoyResult<RawResponse> {
        debug!("🌐 [ENVOY PUT] {}", url);
        trace!("   Data: {}", body);
        let credentials = self.authority.credentials();
        let response = Self::authorize(self.client.put(url), &credentials)
            .json(body)
            .send()
            .await?;
        RawResponse::read(response).await
    }

    pub async fn post_multipart(&self, url: &str, form: Form) -> EnvoyResult<RawResponse> {
        debug!("🌐 [ENVOY POST] multipart {}", url);
        let credentials = self.authority.credentials();
        let response = Self::authorize(self.client.post(url), &credentials)
            .multipart(form)
            .send()
            .await?;
        RawResponse::read(response).await
    }

    /// Single authenticated GET whose body is consumed by the caller.
    pub async fn open_stream(&self, url: &str, timeout: Option<Duration>) -> EnvoyResult<reqwest::Response> {
        let credentials = self.authority.credentials();
        let mut builder = Self::authorize(self.client.get(url), &credentials);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(builder.send().await?)
    }
}

async fn read_file(location: &str) -> EnvoyResult<Option<RawResponse>> {
    let path = Path::new(location);
    if !tokio::fs::try_exists(path).await? {
        debug!("📄 [ENVOY FILE] {} does not exist, no data", location);
        return Ok(None);
    }
    let body = tokio::fs::read_to_string(path).await?;
    debug!("📄 [ENVOY FILE] Read {} bytes from {}", body.len(), location);
    RawResponse::from_file(location, body).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mockito::Server;
    use parking_lot::RwLock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const UNAUTHORIZED: &str = "HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
    const OK_JSON: &str = "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{}";

    /// One reply per accepted connection; `None` hangs up without answering.
    async fn scripted_server(script: Vec<Option<&'static str>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for reply in script {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = [0u8; 4096];
                let _ = socket.read(&mut request).await;
                if let Some(reply) = reply {
                    let _ = socket.write_all(reply.as_bytes()).await;
                    let _ = socket.shutdown().await;
                }
            }
        });
        format!("http://{addr}")
    }

    /// Refresh always fails; reauthentication swaps the bearer to "new".
    struct CountingAuthority {
        credentials: RwLock<Arc<SessionCredentials>>,
        refreshes: AtomicUsize,
        reauths: AtomicUsize,
    }

    impl CountingAuthority {
        fn new() -> Self {
            Self {
                credentials: RwLock::new(Arc::new(SessionCredentials::bearer("old"))),
                refreshes: AtomicUsize::new(0),
                reauths: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SessionAuthority for CountingAuthority {
        fn credentials(&self) -> Arc<SessionCredentials> {
            Arc::clone(&self.credentials.read())
        }

        async fn refresh_session(&self) -> EnvoyResult<bool> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }

        async fn reauthenticate(&self) -> EnvoyResult<()> {
            self.reauths.fetch_add(1, Ordering::SeqCst);
            *self.credentials.write() = Arc::new(SessionCredentials::bearer("new"));
            Ok(())
        }

        async fn establish_session(&self) -> EnvoyResult<()> {
            Ok(())
        }
    }

    fn transport(authority: Arc<CountingAuthority>) -> EnvoyTransport {
        EnvoyTransport::new(authority, Duration::from_secs(5))
            .unwrap()
            .with_retry_config(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_401_then_200_reauthenticates_once() {
        let mut server = Server::new_async().await;
        let rejected = server
            .mock("GET", "/production.json")
            .match_header("authorization", "Bearer old")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let accepted = server
            .mock("GET", "/production.json")
            .match_header("authorization", "Bearer new")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"production": []}"#)
            .expect(1)
            .create_async()
            .await;

        let authority = Arc::new(CountingAuthority::new());
        let response = transport(authority.clone())
            .get(&format!("{}/production.json", server.url()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response.status, 200);
        assert!(response.is_json());
        assert_eq!(authority.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(authority.reauths.load(Ordering::SeqCst), 1);
        rejected.assert_async().await;
        accepted.assert_async().await;
    }

    #[tokio::test]
    async fn test_persistent_401_is_unauthorized() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/ivp/meters")
            .with_status(401)
            .expect(3)
            .create_async()
            .await;

        let authority = Arc::new(CountingAuthority::new());
        let err = transport(authority.clone())
            .get(&format!("{}/ivp/meters", server.url()))
            .await
            .unwrap_err();

        assert!(err.is_unauthorized());
        // refresh only on the first 401, a new token on both
        assert_eq!(authority.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(authority.reauths.load(Ordering::SeqCst), 2);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_transport_error_does_not_use_reauth_budget() {
        let base = scripted_server(vec![None, Some(UNAUTHORIZED), Some(UNAUTHORIZED), Some(OK_JSON)]).await;

        let authority = Arc::new(CountingAuthority::new());
        let response = transport(authority.clone())
            .get(&format!("{base}/production.json"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(authority.reauths.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transport_retries_use_fixed_delay() {
        let authority = Arc::new(CountingAuthority::new());
        let transport = EnvoyTransport::new(authority, Duration::from_secs(5))
            .unwrap()
            .with_retry_config(3, Duration::from_millis(300));

        let started = std::time::Instant::now();
        let result = transport.get("http://127.0.0.1:1/home.json").await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(EnvoyError::HttpError(_))));
        // two 300 ms waits; doubling would take 900 ms
        assert!(elapsed >= Duration::from_millis(600), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(850), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_404_is_no_data() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/ivp/ensemble/inventory")
            .with_status(404)
            .create_async()
            .await;

        let result = transport(Arc::new(CountingAuthority::new()))
            .get(&format!("{}/ivp/ensemble/inventory", server.url()))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_server_error_is_returned_to_caller() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/home.json")
            .with_status(503)
            .with_body("busy")
            .create_async()
            .await;

        let response = transport(Arc::new(CountingAuthority::new()))
            .get(&format!("{}/home.json", server.url()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status, 503);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_transport_error_after_three_attempts() {
        // Nothing listens on port 1
        let result = transport(Arc::new(CountingAuthority::new()))
            .get("http://127.0.0.1:1/home.json")
            .await;
        assert!(matches!(result, Err(EnvoyError::HttpError(_))));
    }

    #[tokio::test]
    async fn test_put_sends_cookie_instead_of_bearer() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/admin/lib/tariff")
            .match_header("cookie", "sessionId=abc")
            .match_header("authorization", mockito::Matcher::Missing)
            .with_status(200)
            .create_async()
            .await;

        let authority = Arc::new(CountingAuthority::new());
        *authority.credentials.write() = Arc::new(SessionCredentials::from_cookies(
            "tok",
            vec![("sessionId".to_string(), "abc".to_string())],
        ));
        let response = transport(authority)
            .put_json(
                &format!("{}/admin/lib/tariff", server.url()),
                &serde_json::json!({"tariff": {}}),
            )
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_file_fallback() {
        let dir = tempfile::TempDir::new().unwrap();
        let json_path = dir.path().join("production_json.json");
        std::fs::write(&json_path, r#"{"production": []}"#).unwrap();
        let xml_path = dir.path().join("info.xml");
        std::fs::write(&xml_path, "<envoy_info><sn>1</sn></envoy_info>").unwrap();

        let transport = transport(Arc::new(CountingAuthority::new()));
        let json = transport.get(json_path.to_str().unwrap()).await.unwrap().unwrap();
        assert_eq!(json.status, 200);
        assert!(json.is_json());

        let xml = transport.get(xml_path.to_str().unwrap()).await.unwrap().unwrap();
        assert!(xml.is_xml());

        let missing = dir.path().join("absent.json");
        assert!(transport.get(missing.to_str().unwrap()).await.unwrap().is_none());
    }
}
