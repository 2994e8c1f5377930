use hyper::http::uri::Authority;
use hyper::server::conn::Http;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode, Uri};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::net::Headers;
use crate::proxy::interceptor::{CaptureLog, CapturedResponse};
use crate::proxy::tls::CertificateAuthority;
use crate::proxy::InterceptorError;

/// Headers that only make sense on one hop, or that the upstream client sets itself
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn strip_hop_by_hop(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)))
        .collect()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    let mut response = Response::new(Body::from(message.into()));
    *response.status_mut() = status;
    response
}

/// State shared by every connection the proxy serves
#[derive(Clone)]
struct Proxy {
    log: Arc<CaptureLog>,
    client: reqwest::Client,
    authority: Option<Arc<CertificateAuthority>>,
}

/// Serve the proxy on `listener` until `shutdown` fires.
///
/// With an `authority`, CONNECT tunnels are decrypted and the exchanges
/// inside them captured like plain HTTP; without one they stay opaque.
pub(crate) fn spawn(
    listener: std::net::TcpListener,
    log: Arc<CaptureLog>,
    authority: Option<Arc<CertificateAuthority>>,
    upstream_insecure: bool,
    shutdown: oneshot::Receiver<()>,
) -> Result<JoinHandle<()>, InterceptorError> {
    // Upstream client: never proxied itself, redirects handed back to the browser
    let client = reqwest::Client::builder()
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(upstream_insecure)
        .build()
        .map_err(|e| InterceptorError::Server(e.to_string()))?;

    listener
        .set_nonblocking(true)
        .map_err(|e| InterceptorError::Server(e.to_string()))?;
    let builder = Server::from_tcp(listener).map_err(|e| InterceptorError::Server(e.to_string()))?;

    let proxy = Proxy {
        log,
        client,
        authority,
    };
    let make_svc = make_service_fn(move |_conn| {
        let proxy = proxy.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(req, proxy.clone()))) }
    });

    let server = builder.serve(make_svc).with_graceful_shutdown(async {
        shutdown.await.ok();
    });

    Ok(tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Interceptor server error: {}", e);
        }
    }))
}

async fn handle(req: Request<Body>, proxy: Proxy) -> Result<Response<Body>, Infallible> {
    if req.method() == Method::CONNECT {
        return Ok(match proxy.authority.clone() {
            Some(authority) => decrypt(req, proxy, authority).await,
            None => tunnel(req, proxy.log).await,
        });
    }

    if req.uri().scheme().is_none() {
        return Ok(error_response(
            StatusCode::BAD_REQUEST,
            "expected an absolute-form proxy request",
        ));
    }
    let url = req.uri().to_string();
    Ok(forward(req, url, &proxy).await)
}

/// Absolute URL of a request received inside a decrypted tunnel
fn tunnel_url(authority: &Authority, uri: &Uri) -> String {
    if uri.scheme().is_some() {
        return uri.to_string();
    }

    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    match authority.port_u16() {
        Some(443) => format!("https://{}{}", authority.host(), path),
        _ => format!("https://{}{}", authority, path),
    }
}

/// Relay a request upstream, capturing both halves
async fn forward(req: Request<Body>, url: String, proxy: &Proxy) -> Response<Body> {
    let log = &proxy.log;
    let method = req.method().clone();
    let headers = Headers::from_header_map(req.headers());

    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) if bytes.is_empty() => None,
        Ok(bytes) => Some(bytes.to_vec()),
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("unreadable request body: {}", e)),
    };

    let id = log.begin(method.as_str(), &url, headers.clone(), body.clone()).await;
    debug!("Intercepted #{} {} {}", id, method, url);

    let mut outbound = strip_hop_by_hop(&headers);
    // Identity encoding keeps captured bodies readable
    outbound.remove("accept-encoding");

    let mut request = proxy.client.request(method, &url).headers(outbound.to_header_map());
    if let Some(body) = body {
        request = request.body(body);
    }

    let upstream = match request.send().await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("Upstream request {} failed: {}", url, e);
            log.fail(id, e.to_string()).await;
            return error_response(StatusCode::BAD_GATEWAY, e.to_string());
        }
    };

    let status = upstream.status();
    let response_headers = Headers::from_header_map(upstream.headers());
    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Upstream body for {} failed: {}", url, e);
            log.fail(id, e.to_string()).await;
            return error_response(StatusCode::BAD_GATEWAY, e.to_string());
        }
    };

    let downstream_headers = strip_hop_by_hop(&response_headers);
    log.complete(
        id,
        CapturedResponse {
            status: status.as_u16(),
            headers: response_headers,
            body: bytes.to_vec(),
        },
    )
    .await;

    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        *headers = downstream_headers.to_header_map();
    }

    match builder.body(Body::from(bytes)) {
        Ok(response) => response,
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

/// Accept CONNECT, then terminate TLS with a minted certificate and serve the
/// tunnelled requests through [`forward`]
async fn decrypt(req: Request<Body>, proxy: Proxy, authority: Arc<CertificateAuthority>) -> Response<Body> {
    let target = match req.uri().authority() {
        Some(target) => target.clone(),
        None => return error_response(StatusCode::BAD_REQUEST, "CONNECT without a target"),
    };

    let acceptor = match authority.acceptor(target.host()).await {
        Ok(acceptor) => acceptor,
        Err(e) => {
            warn!("No certificate for {}: {}", target, e);
            return error_response(StatusCode::BAD_GATEWAY, e.to_string());
        }
    };

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!("Tunnel upgrade for {} failed: {}", target, e);
                return;
            }
        };

        let stream = match acceptor.accept(upgraded).await {
            Ok(stream) => stream,
            Err(e) => {
                // Usually a client that does not trust the interceptor CA
                debug!("TLS handshake for {} failed: {}", target, e);
                let id = proxy
                    .log
                    .begin("CONNECT", &format!("https://{}", target), Headers::new(), None)
                    .await;
                proxy.log.fail(id, format!("TLS handshake failed: {}", e)).await;
                return;
            }
        };

        let service = service_fn(move |inner: Request<Body>| {
            let proxy = proxy.clone();
            let url = tunnel_url(&target, inner.uri());
            async move { Ok::<_, Infallible>(forward(inner, url, &proxy).await) }
        });

        if let Err(e) = Http::new().http1_only(true).serve_connection(stream, service).await {
            debug!("Decrypted tunnel closed: {}", e);
        }
    });

    Response::new(Body::empty())
}

/// Open an opaque tunnel for CONNECT; only the target is recorded
async fn tunnel(req: Request<Body>, log: Arc<CaptureLog>) -> Response<Body> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.to_string(),
        None => return error_response(StatusCode::BAD_REQUEST, "CONNECT without a target"),
    };

    let headers = Headers::from_header_map(req.headers());
    let id = log
        .begin("CONNECT", &format!("https://{}", authority), headers, None)
        .await;

    let mut upstream = match TcpStream::connect(&authority).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Tunnel to {} failed: {}", authority, e);
            log.fail(id, e.to_string()).await;
            return error_response(StatusCode::BAD_GATEWAY, e.to_string());
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(mut upgraded) => {
                if let Err(e) = tokio::io::copy_bidirectional(&mut upgraded, &mut upstream).await {
                    debug!("Tunnel to {} closed: {}", authority, e);
                }
            }
            Err(e) => warn!("Tunnel upgrade for {} failed: {}", authority, e),
        }
    });

    Response::new(Body::empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_headers_are_dropped() {
        let headers: Headers = vec![
            ("Host", "example.com"),
            ("Proxy-Connection", "keep-alive"),
            ("Accept", "text/html"),
            ("Transfer-Encoding", "chunked"),
            ("Cookie", "a=1"),
        ]
        .into_iter()
        .collect();

        let stripped = strip_hop_by_hop(&headers);
        let kept: Vec<&str> = stripped.iter().map(|(k, _)| k).collect();
        assert_eq!(kept, vec!["Accept", "Cookie"]);
    }
}
