// packages/proxy/src/routing/directory.rs
//! Server directory resolution
//!
//! In normal mode the live server list is fetched from the game's directory
//! service, and a rewritten copy pointing at the local listeners is served
//! on the redirected hostname. Direct mode uses the static targets from the
//! region profile and never touches the network.

use crate::routing::listener::{accept_backoff, classify_bind_error};
use crate::routing::region::{RegionProfile, ServerTarget, TargetMap};
use crate::utils::errors::{ProxyError, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trust_dns_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Directory service collaborator
pub trait DirectoryClient: Send {
    /// Fetch the live server list
    fn fetch(&mut self) -> BoxFuture<'_, Result<TargetMap>>;

    /// Serve the server list on `hostname`, rewritten to the local listeners
    fn listen<'a>(&'a mut self, hostname: &'a str, local: &'a TargetMap) -> BoxFuture<'a, Result<()>>;

    /// Stop serving; calling it again is a no-op
    fn close(&mut self);
}

/// Resolves logical server ids to upstream targets
pub enum DirectoryResolver {
    /// Direct mode
    Static(TargetMap),
    Remote(Box<dyn DirectoryClient>),
}

impl DirectoryResolver {
    /// Build the resolver for a region profile
    pub fn for_profile(profile: &RegionProfile, client: Option<Box<dyn DirectoryClient>>) -> Result<Self> {
        if profile.is_direct() {
            return Ok(DirectoryResolver::Static(profile.static_targets()));
        }
        client
            .map(DirectoryResolver::Remote)
            .ok_or_else(|| ProxyError::ConfigError("Directory client required outside direct mode".to_string()))
    }

    /// Resolve targets; remote lookups are bounded by `timeout`
    pub async fn resolve(&mut self, timeout: Duration) -> Result<TargetMap> {
        match self {
            DirectoryResolver::Static(targets) => Ok(targets.clone()),
            DirectoryResolver::Remote(client) => match tokio::time::timeout(timeout, client.fetch()).await {
                Ok(result) => result,
                Err(_) => Err(ProxyError::DirectoryTimeout(timeout)),
            },
        }
    }

    pub async fn listen(&mut self, hostname: &str, local: &TargetMap) -> Result<()> {
        match self {
            DirectoryResolver::Static(_) => Ok(()),
            DirectoryResolver::Remote(client) => client.listen(hostname, local).await,
        }
    }

    pub fn close(&mut self) {
        if let DirectoryResolver::Remote(client) = self {
            client.close();
        }
    }
}

/// Server list entry as served by the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryServer {
    #[serde(with = "server_id")]
    pub id: String,
    pub ip: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Server list document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerList {
    pub servers: Vec<DirectoryServer>,
}

impl ServerList {
    pub fn parse(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| ProxyError::DirectoryFailed(format!("Invalid server list: {}", e)))
    }

    pub fn targets(&self) -> TargetMap {
        self.servers
            .iter()
            .map(|s| (s.id.clone(), ServerTarget::new(s.ip.clone(), s.port)))
            .collect()
    }

    /// Copy with every locally served id pointing at its listener
    pub fn rewritten(&self, local: &TargetMap) -> Self {
        let servers = self
            .servers
            .iter()
            .filter_map(|server| {
                local.get(&server.id).map(|target| DirectoryServer {
                    ip: target.ip.clone(),
                    port: target.port,
                    ..server.clone()
                })
            })
            .collect();
        Self { servers }
    }
}

/// Ids appear as numbers or strings depending on the region
mod server_id {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(id: &str, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(match RawId::deserialize(deserializer)? {
            RawId::Number(n) => n.to_string(),
            RawId::Text(s) => s,
        })
    }
}

/// HTTP directory client resolving through dedicated DNS servers
///
/// The directory hostname is itself redirected by the proxy, so the system
/// resolver would return the local listen address.
pub struct HttpDirectoryClient {
    url: Uri,
    resolver: TokioAsyncResolver,
    serve_port: u16,
    servers: ServerList,
    server: Option<CancellationToken>,
}

impl HttpDirectoryClient {
    pub fn new(url: &str, dns_servers: &[String], serve_port: u16) -> Result<Self> {
        let url: Uri = url
            .parse()
            .map_err(|e| ProxyError::ConfigError(format!("Invalid directory URL {}: {}", url, e)))?;

        if url.scheme_str().unwrap_or("http") != "http" {
            return Err(ProxyError::ConfigError(format!(
                "Unsupported directory URL scheme: {}",
                url
            )));
        }

        let ips = dns_servers
            .iter()
            .map(|s| {
                s.parse::<IpAddr>()
                    .map_err(|e| ProxyError::ConfigError(format!("Invalid DNS server {}: {}", s, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let config = if ips.is_empty() {
            ResolverConfig::default()
        } else {
            ResolverConfig::from_parts(None, vec![], NameServerConfigGroup::from_ips_clear(&ips, 53, true))
        };
        let resolver = TokioAsyncResolver::tokio(config, ResolverOpts::default());

        Ok(Self {
            url,
            resolver,
            serve_port,
            servers: ServerList::default(),
            server: None,
        })
    }

    async fn upstream_addr(&self) -> Result<SocketAddr> {
        let host = self
            .url
            .host()
            .ok_or_else(|| ProxyError::ConfigError(format!("Directory URL has no host: {}", self.url)))?;
        let port = self.url.port_u16().unwrap_or(80);

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| ProxyError::DirectoryFailed(format!("Unable to resolve {}: {}", host, e)))?;
        let ip = lookup
            .iter()
            .next()
            .ok_or_else(|| ProxyError::DirectoryFailed(format!("No address for {}", host)))?;
        debug!("Resolved {} to {}", host, ip);
        Ok(SocketAddr::new(ip, port))
    }

    async fn fetch_list(&mut self) -> Result<TargetMap> {
        let addr = self.upstream_addr().await?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ProxyError::DirectoryFailed(format!("Unable to connect to {}: {}", addr, e)))?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::DirectoryFailed(format!("HTTP handshake failed: {}", e)))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Directory connection closed: {}", e);
            }
        });

        let host = self.url.host().unwrap_or_default();
        let path = self.url.path_and_query().map_or("/", |pq| pq.as_str());
        let request = Request::get(path)
            .header(header::HOST, host)
            .header(header::ACCEPT, "application/json")
            .body(Empty::<Bytes>::new())
            .map_err(|e| ProxyError::DirectoryFailed(format!("Request build error: {}", e)))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ProxyError::DirectoryFailed(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::DirectoryFailed(format!("{} returned {}", self.url, status)));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ProxyError::DirectoryFailed(format!("Body read error: {}", e)))?
            .to_bytes();

        self.servers = ServerList::parse(&body)?;
        let targets = self.servers.targets();
        info!("[sls] loaded {} servers from {}", targets.len(), self.url);
        Ok(targets)
    }

    async fn serve(&mut self, hostname: &str, local: &TargetMap) -> Result<()> {
        let bind_addr = format!("{}:{}", hostname, self.serve_port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| classify_bind_error(&bind_addr, e))?;
        let local_addr = listener.local_addr()?;

        let body = Bytes::from(serde_json::to_vec(&self.servers.rewritten(local))?);
        let cancel = CancellationToken::new();
        tokio::spawn(serve_loop(listener, body, cancel.clone()));

        if let Some(previous) = self.server.replace(cancel) {
            previous.cancel();
        }
        info!("[sls] server list available on {}", local_addr);
        Ok(())
    }
}

impl DirectoryClient for HttpDirectoryClient {
    fn fetch(&mut self) -> BoxFuture<'_, Result<TargetMap>> {
        Box::pin(self.fetch_list())
    }

    fn listen<'a>(&'a mut self, hostname: &'a str, local: &'a TargetMap) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.serve(hostname, local))
    }

    fn close(&mut self) {
        if let Some(cancel) = self.server.take() {
            cancel.cancel();
            info!("[sls] server list closed");
        }
    }
}

impl Drop for HttpDirectoryClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn serve_loop(listener: TcpListener, body: Bytes, cancel: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept directory connection: {}", e);
                    accept_backoff().await;
                    continue;
                }
            }
        };

        let body = body.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            debug!("Serving server list to {}", peer);
            let service = service_fn(move |req: Request<Incoming>| {
                let body = body.clone();
                async move { Ok::<_, Infallible>(server_list_response(&req, body)) }
            });

            let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
            tokio::select! {
                result = conn => {
                    if let Err(e) = result {
                        warn!("Directory connection error: {}", e);
                    }
                }
                _ = cancel.cancelled() => {}
            }
        });
    }
}

fn server_list_response(req: &Request<Incoming>, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    if req.method() != hyper::Method::GET {
        *response.body_mut() = Full::new(Bytes::new());
        *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        return response;
    }
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// In-memory directory with scripted answers
    #[derive(Clone, Default)]
    pub(crate) struct FakeDirectory {
        pub targets: TargetMap,
        pub delay: Option<Duration>,
        pub fail: bool,
        pub listening: Arc<Mutex<Option<(String, TargetMap)>>>,
        pub closes: Arc<Mutex<u32>>,
        /// Serving address reported as already taken
        pub occupied: Option<String>,
    }

    impl DirectoryClient for FakeDirectory {
        fn fetch(&mut self) -> BoxFuture<'_, Result<TargetMap>> {
            Box::pin(async move {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                if self.fail {
                    return Err(ProxyError::DirectoryFailed("scripted failure".to_string()));
                }
                Ok(self.targets.clone())
            })
        }

        fn listen<'a>(&'a mut self, hostname: &'a str, local: &'a TargetMap) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                if let Some(addr) = &self.occupied {
                    return Err(ProxyError::AddressInUse { addr: addr.clone() });
                }
                *self.listening.lock().unwrap() = Some((hostname.to_string(), local.clone()));
                Ok(())
            })
        }

        fn close(&mut self) {
            if self.listening.lock().unwrap().take().is_some() {
                *self.closes.lock().unwrap() += 1;
            }
        }
    }

    const LIST: &str = r#"{"servers":[
        {"id": 4004, "ip": "203.0.113.10", "port": 7801, "name": "Velika"},
        {"id": "4009", "ip": "203.0.113.11", "port": 7802}
    ]}"#;

    fn targets(ids: &[(&str, &str, u16)]) -> TargetMap {
        ids.iter()
            .map(|(id, ip, port)| (id.to_string(), ServerTarget::new(*ip, *port)))
            .collect()
    }

    #[test]
    fn test_parse_server_list() {
        let list = ServerList::parse(LIST.as_bytes()).unwrap();
        let map = list.targets();
        assert_eq!(map.len(), 2);
        assert_eq!(map["4004"], ServerTarget::new("203.0.113.10", 7801));
        assert_eq!(list.servers[0].name.as_deref(), Some("Velika"));
        assert!(ServerList::parse(b"[]").is_err());
    }

    #[test]
    fn test_rewrite_points_at_local_listeners() {
        let list = ServerList::parse(LIST.as_bytes()).unwrap();
        let local = targets(&[("4004", "127.0.0.1", 9250)]);
        let rewritten = list.rewritten(&local);
        assert_eq!(rewritten.servers.len(), 1);
        assert_eq!(rewritten.servers[0].ip, "127.0.0.1");
        assert_eq!(rewritten.servers[0].port, 9250);
        assert_eq!(rewritten.servers[0].name.as_deref(), Some("Velika"));
    }

    #[tokio::test]
    async fn test_static_resolution() {
        let mut resolver = DirectoryResolver::Static(targets(&[("1", "10.0.0.1", 7801)]));
        let map = resolver.resolve(Duration::from_secs(5)).await.unwrap();
        assert_eq!(map.len(), 1);
        resolver.close();
    }

    #[test]
    fn test_for_profile_requires_client_outside_direct_mode() {
        let mut profile = RegionProfile {
            listen_hostname: "127.0.0.2".to_string(),
            hostname: "sls.example.com".to_string(),
            alt_hostnames: Vec::new(),
            console: false,
            classic: false,
            directory_url: None,
            directory_port: 80,
            custom_servers: Default::default(),
        };
        assert!(DirectoryResolver::for_profile(&profile, None).is_err());

        profile.console = true;
        let resolver = DirectoryResolver::for_profile(&profile, None).unwrap();
        assert!(matches!(resolver, DirectoryResolver::Static(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_timeout() {
        let fake = FakeDirectory {
            delay: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let mut resolver = DirectoryResolver::Remote(Box::new(fake));
        let err = resolver.resolve(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ProxyError::DirectoryTimeout(_)));
    }

    #[tokio::test]
    async fn test_partial_map_is_not_an_error() {
        let fake = FakeDirectory {
            targets: targets(&[("4004", "10.0.0.1", 7801)]),
            ..Default::default()
        };
        let mut resolver = DirectoryResolver::Remote(Box::new(fake));
        let map = resolver.resolve(Duration::from_secs(5)).await.unwrap();
        assert_eq!(map.len(), 1);
    }

    /// Minimal HTTP origin answering every request with `body`
    async fn origin(body: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let service = service_fn(move |_req: Request<Incoming>| async move {
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(body.as_bytes()))))
                    });
                    let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_http_client_fetch_and_serve() {
        let addr = origin(LIST).await;
        let url = format!("http://{}/servers", addr);
        let mut client = HttpDirectoryClient::new(&url, &[], 0).unwrap();

        let map = client.fetch().await.unwrap();
        assert_eq!(map.len(), 2);

        let local = targets(&[("4009", "127.0.0.1", 9251)]);
        client.listen("127.0.0.1", &local).await.unwrap();
        assert!(client.server.is_some());
        client.close();
        client.close();
        assert!(client.server.is_none());
    }

    #[test]
    fn test_rejects_https_and_bad_dns() {
        assert!(HttpDirectoryClient::new("https://sls.example.com/list", &[], 80).is_err());
        assert!(HttpDirectoryClient::new("http://sls.example.com/list", &["not-an-ip".to_string()], 80).is_err());
    }
}
