use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cli::config::InterceptorSettings;
use crate::net::Headers;
use crate::proxy::classify::{classify, ResourceType};
use crate::proxy::tls::CertificateAuthority;
use crate::proxy::{server, InterceptorError};

/// Response half of a captured exchange
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapturedResponse {
    pub status: u16,
    pub headers: Headers,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl CapturedResponse {
    /// 2xx and 3xx
    pub fn ok(&self) -> bool {
        (200..400).contains(&self.status)
    }

    /// 4xx and 5xx
    pub fn is_error(&self) -> bool {
        self.status >= 400
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// One request seen by the interceptor, with its response once it arrived
#[derive(Debug, Clone, Serialize)]
pub struct CapturedRequest {
    /// Arrival sequence number
    pub id: u64,
    pub method: String,
    pub url: String,
    pub request_headers: Headers,
    #[serde(skip)]
    pub request_body: Option<Vec<u8>>,
    pub resource_type: ResourceType,
    pub response: Option<CapturedResponse>,
    /// Upstream failure, when the exchange could not complete
    pub failure: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl CapturedRequest {
    pub fn ok(&self) -> bool {
        self.response.as_ref().map(CapturedResponse::ok).unwrap_or(false)
    }

    /// Error status or upstream failure; a response that never arrived is not an error
    pub fn is_error(&self) -> bool {
        self.failure.is_some() || self.response.as_ref().map(CapturedResponse::is_error).unwrap_or(false)
    }

    pub fn is_complete(&self) -> bool {
        self.response.is_some() || self.failure.is_some()
    }

    /// HTTPS tunnel whose contents are not visible
    pub fn is_tunnel(&self) -> bool {
        self.method == "CONNECT"
    }

    pub fn status(&self) -> Option<u16> {
        self.response.as_ref().map(|r| r.status)
    }
}

#[derive(Debug, Default)]
struct LogState {
    next_id: u64,
    entries: Vec<CapturedRequest>,
}

/// Capture buffer shared between the proxy server and its owner
#[derive(Debug, Default)]
pub(crate) struct CaptureLog {
    state: Mutex<LogState>,
}

impl CaptureLog {
    /// Record an incoming request and return its sequence number
    pub(crate) async fn begin(
        &self,
        method: &str,
        url: &str,
        headers: Headers,
        body: Option<Vec<u8>>,
    ) -> u64 {
        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;

        let resource_type = classify(url, &headers, None);
        state.entries.push(CapturedRequest {
            id,
            method: method.to_string(),
            url: url.to_string(),
            request_headers: headers,
            request_body: body,
            resource_type,
            response: None,
            failure: None,
            started_at: Utc::now(),
        });
        id
    }

    /// Attach the response; dropped silently if the entry was cleared meanwhile
    pub(crate) async fn complete(&self, id: u64, response: CapturedResponse) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.iter_mut().find(|e| e.id == id) {
            let content_type = response.headers.content_type();
            entry.resource_type = classify(&entry.url, &entry.request_headers, content_type.as_deref());
            entry.response = Some(response);
        }
    }

    pub(crate) async fn fail(&self, id: u64, message: String) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.iter_mut().find(|e| e.id == id) {
            entry.failure = Some(message);
        }
    }

    async fn snapshot(&self) -> Vec<CapturedRequest> {
        self.state.lock().await.entries.clone()
    }

    async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let dropped = state.entries.len();
        state.entries.clear();
        dropped
    }
}

/// Local forward proxy recording every exchange routed through it.
///
/// The proxy runs until [`stop`](Self::stop) is called or the value is dropped.
pub struct Interceptor {
    addr: SocketAddr,
    log: Arc<CaptureLog>,
    authority: Option<Arc<CertificateAuthority>>,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
}

impl Interceptor {
    /// Bind `host:port` (port 0 picks a free one) and start serving, with
    /// HTTPS decryption on and upstream certificates verified
    pub async fn start(host: &str, port: u16) -> Result<Self, InterceptorError> {
        Self::start_with(&InterceptorSettings {
            host: host.to_string(),
            port,
            ..InterceptorSettings::default()
        })
        .await
    }

    pub async fn start_with(settings: &InterceptorSettings) -> Result<Self, InterceptorError> {
        let bind_addr = format!("{}:{}", settings.host, settings.port);
        let listener = std::net::TcpListener::bind((settings.host.as_str(), settings.port)).map_err(|source| {
            InterceptorError::Bind {
                addr: bind_addr.clone(),
                source,
            }
        })?;
        let addr = listener
            .local_addr()
            .map_err(|source| InterceptorError::Bind { addr: bind_addr, source })?;

        let authority = if settings.decrypt_https {
            Some(Arc::new(CertificateAuthority::generate()?))
        } else {
            None
        };

        let log = Arc::new(CaptureLog::default());
        let (shutdown, signal) = oneshot::channel();
        let server = server::spawn(
            listener,
            log.clone(),
            authority.clone(),
            settings.upstream_insecure,
            signal,
        )?;

        info!(
            "Interceptor listening on {} (HTTPS {})",
            addr,
            if authority.is_some() { "decrypted" } else { "tunnelled" }
        );

        Ok(Self {
            addr,
            log,
            authority,
            shutdown: Some(shutdown),
            server: Some(server),
        })
    }

    /// PEM of the CA that signs decrypted HTTPS traffic, if decryption is on
    pub fn ca_certificate_pem(&self) -> Option<Vec<u8>> {
        self.authority
            .as_ref()
            .and_then(|authority| authority.certificate_pem().ok())
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Value for a browser's `--proxy-server` argument
    pub fn proxy_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn is_running(&self) -> bool {
        self.server.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Shut the proxy down; open connections get a short grace period
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.send(()).ok();
        }

        if let Some(mut handle) = self.server.take() {
            if tokio::time::timeout(Duration::from_secs(2), &mut handle).await.is_err() {
                warn!("Interceptor did not shut down in time, aborting it");
                handle.abort();
            }
            debug!("Interceptor on {} stopped", self.addr);
        }
    }

    /// All captured exchanges, in request arrival order
    pub async fn requests(&self) -> Vec<CapturedRequest> {
        self.log.snapshot().await
    }

    pub async fn requests_matching<F>(&self, predicate: F) -> Vec<CapturedRequest>
    where
        F: Fn(&CapturedRequest) -> bool,
    {
        self.log
            .snapshot()
            .await
            .into_iter()
            .filter(|r| predicate(r))
            .collect()
    }

    pub async fn find_first<F>(&self, predicate: F) -> Option<CapturedRequest>
    where
        F: Fn(&CapturedRequest) -> bool,
    {
        self.log.snapshot().await.into_iter().find(|r| predicate(r))
    }

    /// Background fetch/XHR exchanges
    pub async fn fetches(&self) -> Vec<CapturedRequest> {
        self.requests_matching(|r| r.resource_type == ResourceType::Fetch).await
    }

    pub async fn count_by_method(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for request in self.log.snapshot().await {
            *counts.entry(request.method).or_insert(0) += 1;
        }
        counts
    }

    /// Counts per response status; exchanges without a response are left out
    pub async fn count_by_status(&self) -> BTreeMap<u16, usize> {
        let mut counts = BTreeMap::new();
        for status in self.log.snapshot().await.iter().filter_map(CapturedRequest::status) {
            *counts.entry(status).or_insert(0) += 1;
        }
        counts
    }

    /// Forget everything captured so far.
    ///
    /// Responses still in flight for cleared requests are discarded on arrival.
    pub async fn clear(&self) {
        let dropped = self.log.clear().await;
        debug!("Cleared {} captured requests", dropped);
    }
}

impl Drop for Interceptor {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.send(()).ok();
        }
    }
}
