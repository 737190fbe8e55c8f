use crate::error::{Result, ToolError};
use crate::plan::HttpRequestArgs;
use crate::policy::Policy;
use crate::shell::truncate_utf8;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const BODY_BYTES_MAX: usize = 20_000;
const REDIRECT_HOPS_MAX: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Checks the URL against the domain allow-list and returns it parsed.
pub fn allowed_url(policy: &Policy, raw: &str) -> Result<reqwest::Url> {
    let url = reqwest::Url::parse(raw.trim())
        .map_err(|e| ToolError::InvalidArguments(format!("invalid url {raw:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ToolError::InvalidArguments(format!(
            "url scheme must be http or https, got {:?}",
            url.scheme()
        )));
    }
    let Some(host) = url.host_str() else {
        return Err(ToolError::InvalidArguments(format!("url has no host: {raw:?}")));
    };
    if !policy.domain_ok(host) {
        return Err(ToolError::PolicyViolation(format!(
            "domain not allowed by policy.network.http_allow_domains: {host}"
        )));
    }
    Ok(url)
}

/// Builds the shared client. Each redirect hop is re-checked against the domain allow-list;
/// a hop to a host outside it stops the chain and the 3xx response is returned as-is.
pub fn build_client(policy: Arc<Policy>) -> Result<reqwest::Client> {
    let timeout = policy.timeouts.http();
    let redirects = reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= REDIRECT_HOPS_MAX {
            return attempt.error("too many redirects");
        }
        let allowed = matches!(attempt.url().scheme(), "http" | "https")
            && attempt.url().host_str().is_some_and(|host| policy.domain_ok(host));
        if allowed {
            attempt.follow()
        } else {
            tracing::warn!(url = %attempt.url(), "redirect to disallowed host not followed");
            attempt.stop()
        }
    });
    reqwest::Client::builder()
        .timeout(timeout)
        .redirect(redirects)
        .build()
        .map_err(|e| ToolError::Io(format!("failed to build http client: {e}")))
}

#[tracing::instrument(level = "info", skip_all, fields(method = %args.method))]
pub async fn send(client: &reqwest::Client, policy: &Policy, args: &HttpRequestArgs) -> Result<HttpResponse> {
    let url = allowed_url(policy, &args.url)?;
    let method = reqwest::Method::from_bytes(args.method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| ToolError::InvalidArguments(format!("invalid http method {:?}", args.method)))?;

    let mut request = client.request(method, url).timeout(policy.timeouts.http());
    for (name, value) in &args.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request = match &args.body {
        None | Some(serde_json::Value::Null) => request,
        Some(serde_json::Value::String(raw)) => request.body(raw.clone()),
        Some(json) => request.json(json),
    };
    execute(request).await
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn post_webhook(
    client: &reqwest::Client,
    webhook_url: Option<&str>,
    payload: &serde_json::Value,
    timeout: std::time::Duration,
) -> Result<HttpResponse> {
    let Some(url) = webhook_url.map(str::trim).filter(|u| !u.is_empty()) else {
        return Err(ToolError::PreconditionFailed("MAKE_WEBHOOK_URL not set".to_string()));
    };
    execute(client.post(url).timeout(timeout).json(payload)).await
}

async fn execute(request: reqwest::RequestBuilder) -> Result<HttpResponse> {
    let response = request.send().await.map_err(map_transport_error)?;
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let body = read_body_capped(response, BODY_BYTES_MAX).await?;
    tracing::info!(status, "http request completed");
    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

/// Buffers at most `max` bytes of the body; the rest is never read off the socket.
async fn read_body_capped(mut response: reqwest::Response, max: usize) -> Result<String> {
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(map_transport_error)? {
        let room = max.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if buf.len() >= max {
            break;
        }
    }
    // A cut through a multi-byte sequence leaves an incomplete tail; drop it.
    if let Err(e) = std::str::from_utf8(&buf) {
        if e.error_len().is_none() {
            buf.truncate(e.valid_up_to());
        }
    }
    Ok(truncate_utf8(String::from_utf8_lossy(&buf).into_owned(), max))
}

fn map_transport_error(e: reqwest::Error) -> ToolError {
    if e.is_timeout() {
        ToolError::Timeout(format!("http request timed out: {e}"))
    } else if e.is_builder() {
        ToolError::InvalidArguments(format!("invalid http request: {e}"))
    } else {
        ToolError::ExecutionFailed(format!("http request failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::NetworkPolicy;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn policy(domains: &[&str]) -> Policy {
        Policy {
            network: NetworkPolicy {
                http_allow_domains: domains.iter().map(|d| d.to_string()).collect(),
            },
            ..Policy::default()
        }
    }

    fn get(url: String) -> HttpRequestArgs {
        HttpRequestArgs {
            method: "GET".to_string(),
            url,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// Serves one raw HTTP response on a loopback port and returns the port.
    async fn one_shot_raw(response: Vec<u8>) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let _ = socket.write_all(&response).await;
            let _ = socket.shutdown().await;
        });
        port
    }

    /// Serves one canned HTTP response on a loopback port.
    async fn one_shot_server(body: &'static str) -> String {
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let port = one_shot_raw(response.into_bytes()).await;
        format!("http://127.0.0.1:{port}/ping")
    }

    fn redirect_to(location: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 302 Found\r\nlocation: {location}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
        )
        .into_bytes()
    }

    #[test]
    fn disallowed_domain_is_a_policy_violation() {
        let err = allowed_url(&policy(&["api.github.com"]), "https://evil.example/x").unwrap_err();
        assert_eq!(err.kind(), "policy_violation");
    }

    #[test]
    fn malformed_url_is_a_validation_error() {
        let err = allowed_url(&policy(&["*"]), "not a url").unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        let err = allowed_url(&policy(&["*"]), "file:///etc/passwd").unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn request_to_allowed_host_returns_status_and_body() {
        let url = one_shot_server("pong").await;
        let args = HttpRequestArgs {
            method: "get".to_string(),
            url,
            headers: BTreeMap::new(),
            body: None,
        };
        let response = send(&reqwest::Client::new(), &policy(&["127.0.0.1"]), &args)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "pong");
        assert_eq!(response.headers.get("content-type").map(String::as_str), Some("text/plain"));
    }

    #[tokio::test]
    async fn redirect_to_disallowed_host_is_not_followed() {
        let internal = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let internal_port = internal.local_addr().unwrap().port();
        let front = one_shot_raw(redirect_to(&format!("http://localhost:{internal_port}/internal"))).await;

        let policy = Arc::new(policy(&["127.0.0.1"]));
        assert!(!policy.domain_ok("localhost"));
        let client = build_client(policy.clone()).unwrap();
        let response = send(&client, &policy, &get(format!("http://127.0.0.1:{front}/start")))
            .await
            .unwrap();

        assert_eq!(response.status, 302);
        assert!(response.body.is_empty());
        let contacted =
            tokio::time::timeout(std::time::Duration::from_millis(200), internal.accept()).await;
        assert!(contacted.is_err(), "disallowed host was contacted");
    }

    #[tokio::test]
    async fn redirect_within_allowed_hosts_is_followed() {
        let target = one_shot_server("landed").await;
        let front = one_shot_raw(redirect_to(&target)).await;

        let policy = Arc::new(policy(&["127.0.0.1"]));
        let client = build_client(policy.clone()).unwrap();
        let response = send(&client, &policy, &get(format!("http://127.0.0.1:{front}/start")))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, "landed");
    }

    #[tokio::test]
    async fn oversized_body_is_capped_without_reading_it_all() {
        let head = "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\nconnection: close\r\n\r\n";
        let mut raw = head.as_bytes().to_vec();
        raw.extend(std::iter::repeat_n(b'a', BODY_BYTES_MAX - 1));
        // A 2-byte char straddling the cap must not leave a broken tail.
        raw.extend("é".as_bytes());
        raw.extend(std::iter::repeat_n(b'b', 4 * BODY_BYTES_MAX));
        let port = one_shot_raw(raw).await;

        let policy = policy(&["127.0.0.1"]);
        let response = send(&reqwest::Client::new(), &policy, &get(format!("http://127.0.0.1:{port}/big")))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body.len(), BODY_BYTES_MAX - 1);
        assert!(response.body.bytes().all(|b| b == b'a'));
    }

    #[tokio::test]
    async fn webhook_without_url_is_precondition_failed() {
        let err = post_webhook(
            &reqwest::Client::new(),
            None,
            &serde_json::json!({}),
            std::time::Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "precondition_failed");
    }

    #[tokio::test]
    async fn refused_connection_is_captured_not_fatal() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let args = HttpRequestArgs {
            method: "GET".to_string(),
            url: format!("http://127.0.0.1:{port}/"),
            headers: BTreeMap::new(),
            body: None,
        };
        let err = send(&reqwest::Client::new(), &policy(&["127.0.0.1"]), &args)
            .await
            .unwrap_err();
        assert!(!err.is_fatal());
    }
}
