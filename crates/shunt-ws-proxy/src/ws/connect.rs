//! Upstream WebSocket dialing.
//!
//! Given the original upgrade request and a pass-through handler's options,
//! this module works out where the real upstream lives (including forwarding
//! rewrites, transparent-proxy host derivation and the loopback-to-remote
//! substitution), assembles TLS trust and proxy settings, and opens the
//! upstream WebSocket. Trust roots and the caching resolver are materialized
//! at most once per handler instance.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use hickory_resolver::TokioResolver;
use http::header::{HeaderName, HeaderValue, HOST};
use rustls::{ClientConfig, RootCertStore};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::OnceCell;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::{Host, Url};

use crate::error::WsProxyError;
use crate::net::dns::{build_resolver, LookupOptions};
use crate::net::proxy::{connect_via_proxy, ProxyConfig};
use crate::net::tls::{parse_client_identity, parse_pem_certificates, system_roots, NoVerifier};
use crate::request::WsRequest;
use crate::socket::RawSocket;

/// An established upstream WebSocket.
pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why an upstream connection did not come up.
#[derive(Debug)]
pub enum UpstreamError {
    /// The origin answered the upgrade with a plain HTTP response instead of
    /// a 101; the response must be mirrored verbatim to the client.
    Rejected(http::Response<Option<Vec<u8>>>),
    /// The upstream could not be dialed at all.
    Failed(WsProxyError),
}

/// Which hostnames may present broken TLS without failing the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IgnoreHttpsErrors {
    /// `true` ignores certificate errors for every host.
    All(bool),
    /// Ignore certificate errors only for the listed hostnames.
    Hosts(Vec<String>),
}

impl Default for IgnoreHttpsErrors {
    fn default() -> Self {
        IgnoreHttpsErrors::All(false)
    }
}

impl IgnoreHttpsErrors {
    pub fn matches(&self, host: &str) -> bool {
        match self {
            IgnoreHttpsErrors::All(all) => *all,
            IgnoreHttpsErrors::Hosts(hosts) => {
                hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
            }
        }
    }
}

/// One extra CA to trust in addition to the system roots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CaSource {
    /// Inline PEM certificate data.
    Inline { cert: String },
    /// Path to a PEM certificate file, read once per handler.
    Path {
        #[serde(rename = "certPath")]
        cert_path: String,
    },
}

/// PEM client identity presented to a specific upstream host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCertificate {
    pub cert: String,
    pub key: String,
}

/// Connection options for pass-through handlers.
#[derive(Debug, Clone, Default)]
pub struct PassthroughOptions {
    pub ignore_host_https_errors: IgnoreHttpsErrors,
    pub trust_additional_cas: Vec<CaSource>,
    /// Client certificates keyed by `host` or `host:port`.
    pub client_certificate_host_map: HashMap<String, ClientCertificate>,
    pub proxy_config: Option<ProxyConfig>,
    pub lookup_options: Option<LookupOptions>,
}

/// How the Host header tracks a forwarding rewrite.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum UpdateHostHeader {
    /// Rewrite the header to the new target (the default).
    #[default]
    Auto,
    /// Leave the client's Host header untouched.
    Preserve,
    /// Set the header to this literal value.
    Custom(String),
}

/// Rule-configured rewrite of the upstream target.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardingOptions {
    /// Either a bare `host[:port]` or a full URL.
    pub target_host: String,
    pub update_host_header: UpdateHostHeader,
}

/// The resolved upstream address plus the Host header to present, when it
/// differs from whatever the client sent.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamTarget {
    pub url: Url,
    pub host_header: Option<String>,
}

fn websocket_scheme(scheme: &str) -> &'static str {
    match scheme {
        "https" | "wss" => "wss",
        _ => "ws",
    }
}

fn host_authority(url: &Url) -> String {
    match url.port() {
        Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
        None => url.host_str().unwrap_or_default().to_string(),
    }
}

fn url_host_is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        None => false,
    }
}

/// Work out the URL the upstream connection should go to.
///
/// Handles the three address sources in order: the request's own URL (or the
/// Host header for transparent proxying), any rule-configured forwarding
/// rewrite, and finally the loopback substitution that sends "localhost"
/// traffic from a remote client back to that client's address.
pub fn resolve_upstream_target(
    request: &WsRequest,
    socket: &RawSocket,
    forwarding: Option<&ForwardingOptions>,
) -> Result<UpstreamTarget, WsProxyError> {
    let path_and_query = request
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let (scheme, authority) = match request.uri.host() {
        Some(host) => {
            let scheme = match request.uri.scheme_str() {
                Some(scheme) => websocket_scheme(scheme),
                None => {
                    if socket.hop_was_encrypted() {
                        "wss"
                    } else {
                        "ws"
                    }
                }
            };
            let authority = match request.uri.port_u16() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            (scheme, authority)
        }
        None => {
            // Transparent proxying: the request line had no hostname, so the
            // target comes from the Host header and the scheme from whether
            // the client's last hop was encrypted.
            let host = request.header("host").ok_or_else(|| {
                WsProxyError::InvalidTarget(
                    "request has no hostname and no Host header".to_string(),
                )
            })?;
            let scheme = if socket.hop_was_encrypted() { "wss" } else { "ws" };
            (scheme, host.to_string())
        }
    };

    let mut url = Url::parse(&format!("{scheme}://{authority}{path_and_query}"))
        .map_err(|e| WsProxyError::InvalidTarget(e.to_string()))?;
    let mut host_header = None;

    if let Some(forwarding) = forwarding {
        if forwarding.target_host.contains('/') {
            // A full URL replaces scheme, hostname and port; the path always
            // stays with the original request.
            let target = Url::parse(&forwarding.target_host)
                .map_err(|e| WsProxyError::InvalidTarget(format!("bad targetHost: {e}")))?;
            let host = target.host_str().ok_or_else(|| {
                WsProxyError::InvalidTarget("targetHost url has no host".to_string())
            })?;
            let port = target
                .port()
                .map(|p| format!(":{p}"))
                .unwrap_or_default();
            let scheme = websocket_scheme(target.scheme());
            url = Url::parse(&format!("{scheme}://{host}{port}{path_and_query}"))
                .map_err(|e| WsProxyError::InvalidTarget(e.to_string()))?;
        } else {
            // A bare host[:port] overrides only the authority.
            let (host, port) = match forwarding.target_host.rsplit_once(':') {
                Some((host, port)) if port.parse::<u16>().is_ok() => {
                    (host, port.parse::<u16>().ok())
                }
                _ => (forwarding.target_host.as_str(), None),
            };
            url.set_host(Some(host))
                .map_err(|e| WsProxyError::InvalidTarget(format!("bad targetHost: {e}")))?;
            url.set_port(port)
                .map_err(|_| WsProxyError::InvalidTarget("bad targetHost port".to_string()))?;
        }

        host_header = match &forwarding.update_host_header {
            UpdateHostHeader::Auto => Some(host_authority(&url)),
            UpdateHostHeader::Preserve => None,
            UpdateHostHeader::Custom(value) => Some(value.clone()),
        };
    }

    // Traffic from a remote client addressed to "localhost" means the
    // client's own machine, not the proxy host. The Host header is left
    // alone so the origin still sees what the client wrote.
    if let Some(remote_ip) = request.remote_ip {
        if url_host_is_loopback(&url) && !remote_ip.is_loopback() {
            debug!(
                "Rewriting loopback target to the client's address {}",
                remote_ip
            );
            url.set_ip_host(remote_ip)
                .map_err(|_| WsProxyError::InvalidTarget("cannot rewrite host".to_string()))?;
        }
    }

    Ok(UpstreamTarget { url, host_header })
}

/// Original request headers minus the hop-by-hop and handshake headers the
/// client library synthesizes itself.
pub(crate) fn upstream_headers(raw: &[(String, String)]) -> Vec<(String, String)> {
    raw.iter()
        .filter(|(name, _)| {
            let name = name.to_ascii_lowercase();
            !(name.starts_with("sec-websocket-") || name == "connection" || name == "upgrade")
        })
        .cloned()
        .collect()
}

/// Dials upstream WebSockets for one pass-through handler.
///
/// The trust-root bundle and the caching resolver are built on first use and
/// shared by every connection the handler makes afterwards.
pub struct UpstreamConnector {
    options: PassthroughOptions,
    trusted_roots: OnceCell<Arc<RootCertStore>>,
    resolver: OnceCell<Arc<TokioResolver>>,
}

impl UpstreamConnector {
    pub fn new(options: PassthroughOptions) -> Self {
        Self {
            options,
            trusted_roots: OnceCell::new(),
            resolver: OnceCell::new(),
        }
    }

    pub fn options(&self) -> &PassthroughOptions {
        &self.options
    }

    /// System roots plus any configured additional CAs, built once.
    pub async fn trusted_roots(&self) -> Result<Arc<RootCertStore>, WsProxyError> {
        self.trusted_roots
            .get_or_try_init(|| async {
                let mut roots = system_roots();
                for source in &self.options.trust_additional_cas {
                    let pem = match source {
                        CaSource::Inline { cert } => cert.clone().into_bytes(),
                        CaSource::Path { cert_path } => {
                            tokio::fs::read(cert_path).await.map_err(|e| {
                                WsProxyError::Tls(format!("cannot read CA {cert_path}: {e}"))
                            })?
                        }
                    };
                    let certs = parse_pem_certificates(&pem)
                        .map_err(|e| WsProxyError::Tls(e.to_string()))?;
                    for cert in certs {
                        roots
                            .add(cert)
                            .map_err(|e| WsProxyError::Tls(e.to_string()))?;
                    }
                }
                Ok(Arc::new(roots))
            })
            .await
            .map(Arc::clone)
    }

    async fn resolver(&self) -> Result<Option<Arc<TokioResolver>>, WsProxyError> {
        let Some(lookup_options) = self.options.lookup_options.clone() else {
            return Ok(None);
        };
        let resolver = self
            .resolver
            .get_or_try_init(|| async move {
                build_resolver(&lookup_options)
                    .map(Arc::new)
                    .map_err(|e| WsProxyError::DnsConfig(e.to_string()))
            })
            .await?;
        Ok(Some(Arc::clone(resolver)))
    }

    fn client_certificate(&self, host: &str, port: u16) -> Option<&ClientCertificate> {
        let map = &self.options.client_certificate_host_map;
        map.get(&format!("{host}:{port}")).or_else(|| map.get(host))
    }

    async fn tls_config(&self, host: &str, port: u16) -> Result<Arc<ClientConfig>, WsProxyError> {
        let identity = self
            .client_certificate(host, port)
            .map(|cc| parse_client_identity(&cc.cert, &cc.key))
            .transpose()
            .map_err(|e| WsProxyError::Tls(e.to_string()))?;

        let strict = !self.options.ignore_host_https_errors.matches(host);
        let config = if strict {
            let roots = self.trusted_roots().await?;
            let builder = ClientConfig::builder().with_root_certificates(roots);
            match identity {
                Some((certs, key)) => builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| WsProxyError::Tls(e.to_string()))?,
                None => builder.with_no_client_auth(),
            }
        } else {
            warn!(
                "TLS certificate verification disabled for upstream {}",
                host
            );
            let builder = ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier));
            match identity {
                Some((certs, key)) => builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| WsProxyError::Tls(e.to_string()))?,
                None => builder.with_no_client_auth(),
            }
        };
        Ok(Arc::new(config))
    }

    async fn dial(&self, host: &str, port: u16, url: &Url) -> Result<TcpStream, WsProxyError> {
        if let Some(setting) = self
            .options
            .proxy_config
            .as_ref()
            .and_then(|config| config.select(url))
        {
            return connect_via_proxy(&setting, host, port).await;
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(TcpStream::connect((ip, port)).await?);
        }

        match self.resolver().await? {
            Some(resolver) => {
                let lookup = resolver.lookup_ip(host).await.map_err(|e| {
                    WsProxyError::Dns {
                        host: host.to_string(),
                        details: e.to_string(),
                    }
                })?;
                let ip = lookup.iter().next().ok_or_else(|| WsProxyError::Dns {
                    host: host.to_string(),
                    details: "lookup returned no addresses".to_string(),
                })?;
                Ok(TcpStream::connect((ip, port)).await?)
            }
            None => Ok(TcpStream::connect((host, port)).await?),
        }
    }

    /// Open the upstream WebSocket for `target`, carrying over the original
    /// request's headers. Returns the socket plus whatever subprotocol the
    /// origin negotiated.
    pub async fn connect(
        &self,
        target: &UpstreamTarget,
        request: &WsRequest,
    ) -> Result<(UpstreamSocket, Option<String>), UpstreamError> {
        let host = match target.url.host_str() {
            Some(host) => host.to_string(),
            None => {
                return Err(UpstreamError::Failed(WsProxyError::InvalidTarget(
                    "upstream url has no host".to_string(),
                )))
            }
        };
        let port = target.url.port_or_known_default().unwrap_or(80);
        let secure = target.url.scheme() == "wss";

        if request.version == http::Version::HTTP_2 {
            // Upgrades arriving over h2 still dial the origin as HTTP/1.1;
            // websockets own the whole upstream connection.
            debug!("Downstream spoke HTTP/2, dialing upstream as HTTP/1.1");
        }

        let connector = if secure {
            match self.tls_config(&host, port).await {
                Ok(config) => Some(Connector::Rustls(config)),
                Err(error) => return Err(UpstreamError::Failed(error)),
            }
        } else {
            None
        };

        let stream = match self.dial(&host, port, &target.url).await {
            Ok(stream) => stream,
            Err(error) => return Err(UpstreamError::Failed(error)),
        };

        let mut ws_request = match target.url.as_str().into_client_request() {
            Ok(request) => request,
            Err(error) => return Err(UpstreamError::Failed(error.into())),
        };

        let headers = ws_request.headers_mut();
        for (name, value) in upstream_headers(&request.headers) {
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => warn!("Dropping unforwardable header {:?}", name),
            }
        }
        let host_value = target
            .host_header
            .clone()
            .or_else(|| request.header("host").map(str::to_string));
        if let Some(host_value) = host_value {
            match HeaderValue::from_str(&host_value) {
                Ok(value) => {
                    headers.insert(HOST, value);
                }
                Err(_) => warn!("Dropping unusable Host value {:?}", host_value),
            }
        }

        debug!("Opening upstream websocket to {}", target.url);
        match client_async_tls_with_config(ws_request, stream, None, connector).await {
            Ok((socket, response)) => {
                let subprotocol = response
                    .headers()
                    .get("sec-websocket-protocol")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok((socket, subprotocol))
            }
            Err(WsError::Http(response)) => Err(UpstreamError::Rejected(response)),
            Err(error) => Err(UpstreamError::Failed(error.into())),
        }
    }
}
