//! Domain-filtering HTTP proxy for sandboxed children.
//!
//! Confined processes have no direct network access. Their `HTTP_PROXY` /
//! `HTTPS_PROXY` point at this proxy, which forwards plain HTTP requests
//! and `CONNECT` tunnels to hosts on the allow-list and answers everything
//! else with `403 Forbidden`.
//!
//! One proxy serves every session that shares a sandbox handle: each
//! accepted connection runs on its own task, and the allow-list sits behind
//! an `RwLock` so it can be swapped while the proxy is running.
//!
//! ```no_run
//! use polyrun::network::proxy::NetworkFilter;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let filter = NetworkFilter::new(vec!["*.example.com".to_string()]);
//! let mut server = filter.start(0).await?;
//! println!("proxy on {}", server.addr());
//! server.shutdown();
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Allow-list filter shared by every proxy connection.
#[derive(Clone)]
pub struct NetworkFilter {
    allowed_domains: Arc<RwLock<Vec<String>>>,
}

/// A running proxy. Dropping it stops accepting connections.
pub struct ProxyServer {
    addr: SocketAddr,
    unix_socket: Option<PathBuf>,
    tasks: Vec<JoinHandle<()>>,
}

impl NetworkFilter {
    pub fn new(allowed_domains: Vec<String>) -> Self {
        Self {
            allowed_domains: Arc::new(RwLock::new(allowed_domains)),
        }
    }

    /// Starts the proxy on `127.0.0.1:<port>` (`0` picks a free port).
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start(&self, port: u16) -> Result<ProxyServer> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port)))
            .await
            .context("Failed to bind proxy server")?;
        let addr = listener.local_addr()?;

        let filter = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => spawn_connection(stream, filter.clone()),
                    Err(e) => tracing::error!("Failed to accept proxy connection: {}", e),
                }
            }
        });

        tracing::debug!("Network proxy listening on {}", addr);

        Ok(ProxyServer {
            addr,
            unix_socket: None,
            tasks: vec![task],
        })
    }

    /// Replaces the allow-list; affects new requests only.
    pub fn update_allowed_domains(&self, domains: Vec<String>) {
        if let Ok(mut allowed) = self.allowed_domains.write() {
            *allowed = domains;
            tracing::info!("Updated allowed domains: {:?}", *allowed);
        }
    }

    /// True if `domain` (without port) matches an allow-list entry.
    pub fn is_allowed(&self, domain: &str) -> bool {
        let allowed = match self.allowed_domains.read() {
            Ok(guard) => guard,
            Err(_) => return false,
        };

        allowed
            .iter()
            .any(|pattern| matches_pattern(domain, pattern))
    }
}

impl ProxyServer {
    /// TCP address of the proxy.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `http://127.0.0.1:<port>`
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Unix socket path, if one was attached.
    pub fn unix_socket(&self) -> Option<&Path> {
        self.unix_socket.as_deref()
    }

    /// Additionally serves the proxy on a Unix domain socket at `path`, for
    /// children in a separate network namespace.
    #[cfg(unix)]
    pub fn listen_unix(&mut self, path: &Path, filter: &NetworkFilter) -> Result<()> {
        let listener = tokio::net::UnixListener::bind(path)
            .with_context(|| format!("Failed to bind proxy socket {}", path.display()))?;

        let filter = filter.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => spawn_connection(stream, filter.clone()),
                    Err(e) => tracing::error!("Failed to accept proxy socket connection: {}", e),
                }
            }
        }));
        self.unix_socket = Some(path.to_path_buf());

        tracing::debug!("Network proxy also listening on {}", path.display());
        Ok(())
    }

    /// Stops the accept loops. Idempotent.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_connection<S>(stream: S, filter: NetworkFilter)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, filter).await {
            tracing::debug!("Proxy connection error: {}", e);
        }
    });
}

async fn handle_connection<S>(stream: S, filter: NetworkFilter) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    http1::Builder::new()
        .serve_connection(
            TokioIo::new(stream),
            service_fn(move |req| {
                let filter = filter.clone();
                async move { handle_request(req, filter).await }
            }),
        )
        .with_upgrades()
        .await
        .context("Failed to serve connection")
}

async fn handle_request(
    req: Request<Incoming>,
    filter: NetworkFilter,
) -> Result<Response<Full<Bytes>>> {
    let host = extract_host(&req).unwrap_or_default();

    if !filter.is_allowed(&host) {
        tracing::warn!("Blocked request to: {}", host);
        return text_response(
            StatusCode::FORBIDDEN,
            format!("Domain blocked by sandbox proxy: {}\n", host),
        );
    }

    tracing::debug!("Allowing request to: {}", host);

    match *req.method() {
        Method::CONNECT => handle_connect(req).await,
        _ => handle_http(req, &host).await,
    }
}

/// Opens a raw tunnel for `CONNECT host:port`.
async fn handle_connect(req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
    let authority = req
        .uri()
        .authority()
        .context("Missing authority in CONNECT request")?
        .as_str()
        .to_string();
    let (host, port) = parse_host_port(&authority)?;

    // Fail the CONNECT itself when the upstream is unreachable.
    let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("Failed to connect to {}:{}: {}", host, port, e);
            return text_response(StatusCode::BAD_GATEWAY, format!("Upstream unreachable: {}\n", e));
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut upgraded = TokioIo::new(upgraded);
                if let Err(e) = tokio::io::copy_bidirectional(&mut upgraded, &mut upstream).await {
                    tracing::debug!("Tunnel error: {}", e);
                }
            }
            Err(e) => tracing::debug!("Failed to upgrade connection: {}", e),
        }
    });

    text_response(StatusCode::OK, String::new())
}

/// Forwards a plain HTTP request.
async fn handle_http(req: Request<Incoming>, host: &str) -> Result<Response<Full<Bytes>>> {
    let method = req.method().clone();
    let headers = req.headers().clone();
    let upstream_uri = build_upstream_uri(req.uri(), host)?;

    tracing::debug!("{} {}", method, upstream_uri);

    let body = req
        .into_body()
        .collect()
        .await
        .context("Failed to read request body")?
        .to_bytes();

    let mut upstream_req = Request::builder()
        .method(method)
        .uri(upstream_uri)
        .body(Full::new(body))
        .context("Failed to build upstream request")?;
    *upstream_req.headers_mut() = headers;

    let client = Client::builder(TokioExecutor::new()).build_http();
    let upstream_res = match client.request(upstream_req).await {
        Ok(res) => res,
        Err(e) => {
            return text_response(StatusCode::BAD_GATEWAY, format!("Upstream request failed: {}\n", e));
        }
    };

    let status = upstream_res.status();
    let headers = upstream_res.headers().clone();
    let body = upstream_res
        .into_body()
        .collect()
        .await
        .context("Failed to read upstream response")?
        .to_bytes();

    let mut response = Response::builder()
        .status(status)
        .body(Full::new(body))
        .context("Failed to build proxy response")?;
    *response.headers_mut() = headers;
    Ok(response)
}

fn text_response(status: StatusCode, body: String) -> Result<Response<Full<Bytes>>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .context("Failed to build proxy response")
}

fn extract_host<B>(req: &Request<B>) -> Option<String> {
    // CONNECT carries the target in the authority; prefer it there.
    if req.method() == Method::CONNECT {
        if let Some(auth) = req.uri().authority() {
            return Some(strip_port(auth.as_str()));
        }
    }

    if let Some(host) = req.uri().host() {
        return Some(host.to_string());
    }

    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(strip_port)
}

fn strip_port(host_port: &str) -> String {
    host_port.split(':').next().unwrap_or(host_port).to_string()
}

fn parse_host_port(host_port: &str) -> Result<(String, u16)> {
    let (host, port) = host_port
        .rsplit_once(':')
        .with_context(|| format!("Invalid host:port format: {}", host_port))?;
    if host.is_empty() || host.contains(':') {
        anyhow::bail!("Invalid host:port format: {}", host_port);
    }
    let port = port.parse::<u16>().context("Invalid port number")?;
    Ok((host.to_string(), port))
}

fn build_upstream_uri(uri: &Uri, host: &str) -> Result<Uri> {
    let authority = uri.authority().map(|a| a.as_str()).unwrap_or(host);
    let scheme = uri.scheme_str().unwrap_or("http");
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    format!("{}://{}{}", scheme, authority, path)
        .parse()
        .context("Failed to parse upstream URI")
}

/// Matches a host against an allow-list entry.
///
/// - `*` matches every host
/// - `*.example.com` matches `example.com` and any subdomain of it
/// - anything else matches exactly (case-insensitive)
///
/// ```
/// # use polyrun::network::proxy::matches_pattern;
/// assert!(matches_pattern("sub.example.com", "*.example.com"));
/// assert!(matches_pattern("example.com", "*.example.com"));
/// assert!(!matches_pattern("badexample.com", "*.example.com"));
/// ```
pub fn matches_pattern(domain: &str, pattern: &str) -> bool {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();

    if pattern == "*" {
        return true;
    }

    match pattern.strip_prefix("*.") {
        Some(base) => domain == base || domain.ends_with(&format!(".{}", base)),
        None => domain == pattern,
    }
}

/// `KEY=value` assignments that route HTTP clients through the proxy at
/// `proxy_url`. Loopback stays direct.
pub fn proxy_env(proxy_url: &str) -> Vec<String> {
    vec![
        format!("HTTP_PROXY={}", proxy_url),
        format!("HTTPS_PROXY={}", proxy_url),
        format!("http_proxy={}", proxy_url),
        format!("https_proxy={}", proxy_url),
        "NO_PROXY=localhost,127.0.0.1".to_string(),
        "no_proxy=localhost,127.0.0.1".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_proxy_env_covers_both_cases() {
        let env = proxy_env("http://127.0.0.1:3128");
        assert!(env.contains(&"HTTPS_PROXY=http://127.0.0.1:3128".to_string()));
        assert!(env.contains(&"https_proxy=http://127.0.0.1:3128".to_string()));
        assert!(env.iter().any(|kv| kv.starts_with("NO_PROXY=localhost")));
    }

    #[test]
    fn test_matches_pattern_wildcard() {
        assert!(matches_pattern("sub.example.com", "*.example.com"));
        assert!(matches_pattern("a.b.example.com", "*.example.com"));
        assert!(matches_pattern("example.com", "*.example.com"));
        assert!(!matches_pattern("other.com", "*.example.com"));
        assert!(!matches_pattern("exampleXcom", "*.example.com"));
        assert!(!matches_pattern("notexample.com", "*.example.com"));
    }

    #[test]
    fn test_matches_pattern_exact_and_case() {
        assert!(matches_pattern("GitHub.com", "github.com"));
        assert!(matches_pattern("github.com.", "github.com"));
        assert!(!matches_pattern("api.github.com", "github.com"));
        assert!(matches_pattern("anything.net", "*"));
    }

    #[test]
    fn test_is_allowed_and_update() {
        let filter = NetworkFilter::new(vec!["*.old.com".to_string()]);
        assert!(filter.is_allowed("sub.old.com"));
        assert!(!filter.is_allowed("sub.new.com"));

        filter.update_allowed_domains(vec!["*.new.com".to_string()]);
        assert!(!filter.is_allowed("sub.old.com"));
        assert!(filter.is_allowed("sub.new.com"));
    }

    #[test]
    fn test_empty_allowlist_denies_all() {
        let filter = NetworkFilter::new(vec![]);
        assert!(!filter.is_allowed("example.com"));
        assert!(!filter.is_allowed(""));
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert!(parse_host_port("invalid").is_err());
        assert!(parse_host_port("host:port:extra").is_err());
        assert!(parse_host_port(":80").is_err());
    }

    #[test]
    fn test_extract_host() {
        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("evil.com:443")
            .header("host", "allowed.com")
            .body(())
            .unwrap();
        assert_eq!(extract_host(&req).as_deref(), Some("evil.com"));

        let req = Request::builder()
            .uri("http://pypi.org:8080/simple/")
            .body(())
            .unwrap();
        assert_eq!(extract_host(&req).as_deref(), Some("pypi.org"));

        let req = Request::builder()
            .uri("/simple/")
            .header("host", "pypi.org:80")
            .body(())
            .unwrap();
        assert_eq!(extract_host(&req).as_deref(), Some("pypi.org"));
    }

    #[tokio::test]
    async fn test_proxy_rejects_unlisted_connect() {
        let filter = NetworkFilter::new(vec!["allowed.invalid".to_string()]);
        let mut server = filter.start(0).await.unwrap();

        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream
            .write_all(b"CONNECT blocked.invalid:443 HTTP/1.1\r\nHost: blocked.invalid:443\r\n\r\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf[..n]);
        assert!(response.starts_with("HTTP/1.1 403"), "got: {response}");

        server.shutdown();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_proxy_serves_concurrent_clients() {
        let filter = NetworkFilter::new(vec![]);
        let server = filter.start(0).await.unwrap();
        let addr = server.addr();

        let clients = (0..8).map(|i| {
            tokio::spawn(async move {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                let req = format!("GET http://host{i}.invalid/ HTTP/1.1\r\nHost: host{i}.invalid\r\n\r\n");
                stream.write_all(req.as_bytes()).await.unwrap();
                let mut buf = vec![0u8; 1024];
                let n = stream.read(&mut buf).await.unwrap();
                String::from_utf8_lossy(&buf[..n]).into_owned()
            })
        });

        for client in clients.collect::<Vec<_>>() {
            let response = client.await.unwrap();
            assert!(response.starts_with("HTTP/1.1 403"));
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let filter = NetworkFilter::new(vec![]);
        let mut server = filter.start(0).await.unwrap();
        let addr = server.addr();
        server.shutdown();
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
