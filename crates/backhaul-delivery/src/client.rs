//! Upstream HTTP client with a bounded number of parallel calls.
//!
//! Every captured request is replayed against the configured origin:
//! its own method, headers, and body, with scheme and host rewritten.
//! Connections are closed after each call and the idle pool is capped, so
//! the process cannot run away with file descriptors under load.

use std::{sync::Arc, time::Duration};

use backhaul_core::CapturedRequest;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION};
use tokio::sync::Semaphore;
use tracing::{info, warn};
use url::Url;

use crate::error::{DeliveryError, Result};

/// Sender of captured requests to the origin.
///
/// At most `num_clients` calls run in parallel; the semaphore holding that
/// cap doubles as the open-request count awaited by [`ForwardClient::shutdown`].
pub struct ForwardClient {
    client: reqwest::Client,
    open_requests: Arc<Semaphore>,
    num_clients: u32,
    remote: Url,
}

impl ForwardClient {
    /// Builds the shared client for the given origin.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when `num_clients` is zero, the remote
    /// URL is unparseable or lacks a host, or the HTTP client cannot be
    /// constructed.
    pub fn new(remote_url: &str, request_timeout: Duration, num_clients: u32) -> Result<Self> {
        if num_clients < 1 {
            return Err(DeliveryError::configuration("number of clients must be >= 1"));
        }

        let remote = Url::parse(remote_url)
            .map_err(|e| DeliveryError::configuration(format!("remote URL: {e}")))?;
        if remote.host_str().is_none() {
            return Err(DeliveryError::configuration("remote URL must include a host"));
        }

        info!(
            redirect_url = %format!("{}://{}", remote.scheme(), remote.authority()),
            max_open_requests = num_clients,
            request_timeout = ?request_timeout,
            "initializing forward client"
        );

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(num_clients as usize)
            .build()
            .map_err(|e| DeliveryError::configuration(format!("building HTTP client: {e}")))?;

        Ok(Self {
            client,
            open_requests: Arc::new(Semaphore::new(num_clients as usize)),
            num_clients,
            remote,
        })
    }

    /// Sends one captured request to the origin.
    ///
    /// Blocks while all `num_clients` slots are busy. The response body is
    /// drained and dropped; inbound callers never see it.
    ///
    /// # Errors
    ///
    /// - [`DeliveryError::Build`] when the captured URL or method cannot be
    ///   turned into a request (permanent),
    /// - [`DeliveryError::Transport`] on connect failure, timeout, or
    ///   cancellation,
    /// - [`DeliveryError::UpstreamStatus`] when the origin answers with a
    ///   status above 299.
    pub async fn send(&self, request: &CapturedRequest) -> Result<()> {
        let _permit = self
            .open_requests
            .acquire()
            .await
            .map_err(|_| DeliveryError::transport("client is shut down"))?;

        let url = request.upstream_url(&self.remote).map_err(DeliveryError::build)?;
        let method = reqwest::Method::from_bytes(request.method().as_bytes())
            .map_err(|e| DeliveryError::build(format!("method {:?}: {e}", request.method())))?;

        info!(method = %method, url = %url, "proxying...");

        let response = self
            .client
            .request(method.clone(), url.clone())
            .headers(upstream_headers(request))
            .body(request.body().clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::transport("request timed out")
                } else if e.is_connect() {
                    DeliveryError::transport(format!("connection failed: {e}"))
                } else {
                    DeliveryError::transport(e.to_string())
                }
            })?;

        let status = response.status();
        // Drain the body so the connection can settle before close.
        let _ = response.bytes().await;

        info!(method = %method, url = %url, status = status.as_u16(), "...done");

        if status.as_u16() > 299 {
            return Err(DeliveryError::upstream_status(status.as_u16()));
        }

        Ok(())
    }

    /// Waits until no call is in flight.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::ShutdownTimeout`] when open requests remain
    /// past the deadline.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.open_requests.acquire_many(self.num_clients))
            .await
        {
            Ok(_) => Ok(()),
            Err(_) => Err(DeliveryError::ShutdownTimeout { timeout }),
        }
    }
}

/// Attaches the captured headers as-is and marks the connection for close,
/// so no keep-alive reuse outlives the call.
fn upstream_headers(request: &CapturedRequest) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in request.headers() {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(header = %name, "skipping unrepresentable header name");
            continue;
        };
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(name.clone(), value);
                },
                Err(_) => warn!(header = %name, "skipping unrepresentable header value"),
            }
        }
    }
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    headers
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use backhaul_core::Headers;
    use bytes::Bytes;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn captured(method: &str, origin_url: &str, body: &'static [u8]) -> CapturedRequest {
        let mut headers = Headers::new();
        headers.insert("x-custom".into(), vec!["kept".into()]);
        CapturedRequest::from_parts(
            method.into(),
            origin_url.into(),
            headers,
            Bytes::from_static(body),
        )
    }

    fn client_for(server_uri: &str, num_clients: u32) -> ForwardClient {
        ForwardClient::new(server_uri, Duration::from_secs(5), num_clients)
            .expect("client should build")
    }

    #[tokio::test]
    async fn forwards_method_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/e"))
            .and(matchers::header("x-custom", "kept"))
            .and(matchers::header("connection", "close"))
            .and(matchers::body_bytes(b"Body".to_vec()))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), 4);
        client.send(&captured("POST", "/e", b"Body")).await.expect("send should succeed");

        server.verify().await;
    }

    #[tokio::test]
    async fn status_above_299_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), 4);
        let error = client.send(&captured("GET", "/x", b"")).await.expect_err("500 should fail");

        assert!(matches!(error, DeliveryError::UpstreamStatus { status: 500 }));
        assert!(error.is_retryable());
        assert_eq!(error.to_string(), "response 500");
    }

    #[tokio::test]
    async fn redirect_status_without_location_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .respond_with(ResponseTemplate::new(302))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), 4);
        let error = client.send(&captured("GET", "/r", b"")).await.expect_err("302 should fail");

        assert!(matches!(error, DeliveryError::UpstreamStatus { status: 302 }));
    }

    #[tokio::test]
    async fn connection_failure_is_transport_error() {
        // Port 1 is unassigned and closed on any sane host.
        let client = client_for("http://127.0.0.1:1", 1);
        let error =
            client.send(&captured("GET", "/x", b"")).await.expect_err("connect should fail");

        assert!(matches!(error, DeliveryError::Transport { .. }));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn slow_origin_times_out() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = ForwardClient::new(&server.uri(), Duration::from_millis(50), 1)
            .expect("client should build");
        let error =
            client.send(&captured("GET", "/slow", b"")).await.expect_err("should time out");

        assert!(matches!(error, DeliveryError::Transport { .. }));
    }

    #[tokio::test]
    async fn parallel_sends_are_capped() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
            .mount(&server)
            .await;

        let client = Arc::new(client_for(&server.uri(), 2));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client.send(&captured("GET", "/slow", b"")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().expect("send should succeed");
        }

        // Four 200 ms calls over two slots need at least two rounds.
        assert!(start.elapsed() >= Duration::from_millis(350), "cap was not enforced");
    }

    #[tokio::test]
    async fn shutdown_waits_for_open_requests() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
            .mount(&server)
            .await;

        let client = Arc::new(client_for(&server.uri(), 2));
        let in_flight = {
            let client = client.clone();
            tokio::spawn(async move { client.send(&captured("GET", "/slow", b"")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = Instant::now();
        client.shutdown(Duration::from_secs(2)).await.expect("shutdown should succeed");
        assert!(start.elapsed() >= Duration::from_millis(100), "shutdown returned too early");

        in_flight.await.unwrap().expect("in-flight send should have completed");
    }

    #[tokio::test]
    async fn shutdown_reports_deadline_overrun() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(800)))
            .mount(&server)
            .await;

        let client = Arc::new(client_for(&server.uri(), 1));
        let in_flight = {
            let client = client.clone();
            tokio::spawn(async move { client.send(&captured("GET", "/slow", b"")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let error = client
            .shutdown(Duration::from_millis(50))
            .await
            .expect_err("shutdown should overrun");
        assert!(matches!(error, DeliveryError::ShutdownTimeout { .. }));

        in_flight.await.unwrap().expect("in-flight send should still complete");
    }

    #[test]
    fn rejects_invalid_configuration() {
        assert!(matches!(
            ForwardClient::new("http://origin.example.com", Duration::from_secs(1), 0),
            Err(DeliveryError::Configuration { .. })
        ));
        assert!(matches!(
            ForwardClient::new("not a url", Duration::from_secs(1), 1),
            Err(DeliveryError::Configuration { .. })
        ));
    }
}
