//! The HTTP surface: exposition, health and reload.
//!
//! | path         | answer                                                 |
//! |--------------|--------------------------------------------------------|
//! | `/metrics`   | live families followed by the exporter's own telemetry |
//! | `/ping`      | `Pong`                                                 |
//! | `/health`    | `OK`                                                   |
//! | `/-/reload`  | `POST` or `PUT` from loopback requests a reload        |
//!
//! Anything else is a 404.

use std::{
    convert::Infallible,
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::service::Service;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use redis_metrics_signal::Watcher;
use tokio::{
    net::TcpListener,
    pin,
    sync::{Semaphore, TryAcquireError},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

use crate::{
    registry::Exposition,
    reload::{self, Trigger},
};

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Errors produced by [`Server`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The listen address could not be parsed.
    #[error("Invalid listen address {0:?}")]
    Addr(String),
}

/// Parse a listen address. A bare `:port` listens on every interface.
///
/// # Errors
///
/// Returns [`Error::Addr`] if `addr` is neither `ip:port` nor `:port`.
pub fn parse_addr(addr: &str) -> Result<SocketAddr, Error> {
    if let Some(port) = addr.strip_prefix(':') {
        let port = port.parse().map_err(|_| Error::Addr(addr.to_string()))?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    addr.parse().map_err(|_| Error::Addr(addr.to_string()))
}

/// Everything a request handler reads.
struct State {
    exposition: Arc<Exposition>,
    trigger: Trigger,
    telemetry: Option<PrometheusHandle>,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("exposition", &self.exposition)
            .field("trigger", &self.trigger)
            .field("telemetry", &self.telemetry.is_some())
            .finish_non_exhaustive()
    }
}

/// The HTTP server.
#[derive(Debug)]
pub struct Server {
    concurrency_limit: usize,
    state: Arc<State>,
    shutdown: Watcher,
}

impl Server {
    /// Create a server answering from `exposition` and requesting reloads
    /// through `trigger`. When given, `telemetry` is rendered after the live
    /// families on `/metrics`.
    #[must_use]
    pub fn new(
        concurrency_limit: usize,
        exposition: Arc<Exposition>,
        trigger: Trigger,
        telemetry: Option<PrometheusHandle>,
        shutdown: Watcher,
    ) -> Self {
        Self {
            concurrency_limit,
            state: Arc::new(State {
                exposition,
                trigger,
                telemetry,
            }),
            shutdown,
        }
    }

    /// Bind `addr` and serve until shutdown.
    ///
    /// # Errors
    ///
    /// Fails if `addr` can't be bound.
    pub async fn run(self, addr: SocketAddr) -> Result<(), Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {addr}");
        self.serve(listener).await
    }

    /// Serve connections accepted on `listener` until shutdown. Open
    /// connections are closed gracefully before this returns.
    ///
    /// # Errors
    ///
    /// None are known.
    pub async fn serve(self, listener: TcpListener) -> Result<(), Error> {
        let state = self.state;
        run_httpd(listener, self.concurrency_limit, self.shutdown, move |peer| {
            let state = Arc::clone(&state);
            hyper::service::service_fn(move |req: Request<hyper::body::Incoming>| {
                let response = respond(&state, req.method(), req.uri().path(), peer);
                async move { Ok::<_, hyper::Error>(response) }
            })
        })
        .await
    }
}

async fn run_httpd<SF, S>(
    listener: TcpListener,
    concurrency_limit: usize,
    mut shutdown: Watcher,
    make_service: SF,
) -> Result<(), Error>
where
    SF: Send + Sync + 'static + Clone + Fn(SocketAddr) -> S,
    S: Service<
            Request<hyper::body::Incoming>,
            Response = Response<BoxBody<Bytes, hyper::Error>>,
            Error = hyper::Error,
        > + Send
        + 'static,
    S::Future: Send + 'static,
{
    let sem = Arc::new(Semaphore::new(concurrency_limit));
    let mut join_set = JoinSet::new();

    gauge!("redis_metrics_http_connection_limit").set(concurrency_limit as f64);

    loop {
        tokio::select! {
            () = shutdown.recv() => {
                info!("Shutdown signal received, stopping accept loop.");
                break;
            }

            incoming = listener.accept() => {
                let (stream, addr) = match incoming {
                    Ok(sa) => sa,
                    Err(e) => {
                        error!("Error accepting connection: {e}");
                        continue;
                    }
                };
                debug!("Accepted connection from {addr}");

                let sem = Arc::clone(&sem);
                let service = make_service(addr);
                // Unregistered: connections don't hold up the shutdown of the
                // process, they are drained below.
                let mut conn_shutdown = shutdown.clone();

                join_set.spawn(async move {
                    let permit = match sem.try_acquire() {
                        Ok(p) => p,
                        Err(TryAcquireError::Closed) => {
                            error!("Semaphore closed");
                            return;
                        }
                        Err(TryAcquireError::NoPermits) => {
                            warn!("httpd over connection capacity, load shedding");
                            drop(stream);
                            return;
                        }
                    };

                    let builder = auto::Builder::new(TokioExecutor::new());
                    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
                    pin!(conn);
                    let res = tokio::select! {
                        res = conn.as_mut() => res,
                        () = conn_shutdown.recv() => {
                            conn.as_mut().graceful_shutdown();
                            conn.await
                        }
                    };
                    if let Err(e) = res {
                        debug!("Error serving {addr}: {e}");
                    }
                    drop(permit);
                });
            }
        }
    }
    drop(listener);
    while join_set.join_next().await.is_some() {}
    Ok(())
}

fn full(body: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(body.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

fn text(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    if let Ok(value) = header::HeaderValue::from_str(content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
}

fn plain(status: StatusCode, body: &'static str) -> Response<BoxBody<Bytes, hyper::Error>> {
    text(status, "text/plain; charset=utf-8", body)
}

fn respond(
    state: &State,
    method: &Method,
    path: &str,
    peer: SocketAddr,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let label = match path {
        "/metrics" | "/ping" | "/health" | "/-/reload" => path.to_string(),
        _ => "other".to_string(),
    };
    counter!("redis_metrics_http_requests_total", "path" => label).increment(1);

    match path {
        "/metrics" => {
            let mut body = state.exposition.render();
            if let Some(telemetry) = &state.telemetry {
                body.push_str(&telemetry.render());
            }
            text(StatusCode::OK, TEXT_FORMAT, body)
        }
        "/ping" => plain(StatusCode::OK, "Pong"),
        "/health" => plain(StatusCode::OK, "OK"),
        "/-/reload" => request_reload(state, method, peer),
        _ => plain(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn request_reload(
    state: &State,
    method: &Method,
    peer: SocketAddr,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    if method != Method::POST && method != Method::PUT {
        return plain(
            StatusCode::METHOD_NOT_ALLOWED,
            "Only POST or PUT requests allowed",
        );
    }
    if !peer.ip().is_loopback() {
        warn!("Refusing reload request from {peer}");
        return plain(StatusCode::FORBIDDEN, "Forbidden");
    }
    match state.trigger.request() {
        reload::Request::Queued => {
            info!("Reload requested by {peer}");
            plain(StatusCode::OK, "OK")
        }
        reload::Request::Coalesced => {
            debug!("Reload already pending, coalesced request from {peer}");
            plain(StatusCode::OK, "OK")
        }
        reload::Request::Closed => plain(StatusCode::SERVICE_UNAVAILABLE, "Reload unavailable"),
    }
}

#[cfg(test)]
mod tests {
    use metrics_exporter_prometheus::PrometheusBuilder;

    use super::*;
    use crate::{
        collector::{Collectors, Sink, tests::standalone},
        registry::Registry,
        reload::Listener,
    };

    fn state() -> (State, Listener) {
        let (trigger, listener) = reload::channel();
        let state = State {
            exposition: Arc::new(Exposition::new()),
            trigger,
            telemetry: None,
        };
        (state, listener)
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:40000".parse().expect("bad addr")
    }

    async fn body(response: Response<BoxBody<Bytes, hyper::Error>>) -> String {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body failed")
            .to_bytes();
        String::from_utf8(bytes.to_vec()).expect("body not utf-8")
    }

    #[test]
    fn listen_addresses() {
        assert_eq!(
            parse_addr(":8000").expect("parse failed"),
            "0.0.0.0:8000".parse::<SocketAddr>().expect("bad addr")
        );
        assert_eq!(
            parse_addr("127.0.0.1:9121").expect("parse failed"),
            "127.0.0.1:9121".parse::<SocketAddr>().expect("bad addr")
        );
        assert!(matches!(parse_addr("nonsense"), Err(Error::Addr(_))));
        assert!(matches!(parse_addr(":http"), Err(Error::Addr(_))));
    }

    #[test]
    fn debug_with_telemetry() {
        let (trigger, _listener) = reload::channel();
        let (watcher, _broadcaster) = redis_metrics_signal::signal();
        let server = Server::new(
            4,
            Arc::new(Exposition::new()),
            trigger,
            Some(PrometheusBuilder::new().build_recorder().handle()),
            watcher,
        );
        let debug = format!("{server:?}");
        assert!(debug.contains("telemetry: true"));
    }

    #[tokio::test]
    async fn health_endpoints() {
        let (state, _listener) = state();
        let ping = respond(&state, &Method::GET, "/ping", loopback());
        assert_eq!(ping.status(), StatusCode::OK);
        assert_eq!(body(ping).await, "Pong");

        let health = respond(&state, &Method::GET, "/health", loopback());
        assert_eq!(body(health).await, "OK");

        let missing = respond(&state, &Method::GET, "/nope", loopback());
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reload_rules() {
        let (state, mut listener) = state();

        let get = respond(&state, &Method::GET, "/-/reload", loopback());
        assert_eq!(get.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body(get).await, "Only POST or PUT requests allowed");

        let remote: SocketAddr = "10.1.2.3:5000".parse().expect("bad addr");
        let forbidden = respond(&state, &Method::POST, "/-/reload", remote);
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        let first = respond(&state, &Method::POST, "/-/reload", loopback());
        assert_eq!(first.status(), StatusCode::OK);
        let coalesced = respond(&state, &Method::PUT, "/-/reload", loopback());
        assert_eq!(coalesced.status(), StatusCode::OK);

        assert_eq!(listener.recv().await, Some(()));
        drop(listener);
        let closed = respond(&state, &Method::POST, "/-/reload", loopback());
        assert_eq!(closed.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn serves_live_families() {
        let exposition = Arc::new(Exposition::new());
        let collectors = Collectors::new(&Registry::new(1));
        collectors
            .register_all(&exposition)
            .expect("registration failed");
        collectors
            .liveness(&standalone(), true)
            .expect("liveness failed");

        let (trigger, mut reloads) = reload::channel();
        let (watcher, broadcaster) = redis_metrics_signal::signal();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let addr = listener.local_addr().expect("no local addr");
        let server = Server::new(
            8,
            Arc::clone(&exposition),
            trigger,
            None,
            watcher.register().expect("register failed"),
        );
        drop(watcher);
        let handle = tokio::spawn(server.serve(listener));

        let client = reqwest::Client::new();
        let response = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .expect("request failed");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok()),
            Some(TEXT_FORMAT)
        );
        let metrics = response.text().await.expect("body failed");
        assert!(metrics.contains("# TYPE redis_server_up gauge"));
        assert!(metrics.contains(
            "redis_server_up{node_name=\"cache\",node_address=\"10.0.0.1:6379\"} 1"
        ));

        let response = client
            .post(format!("http://{addr}/-/reload"))
            .send()
            .await
            .expect("request failed");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(reloads.recv().await, Some(()));

        broadcaster.signal_and_wait().await;
        handle
            .await
            .expect("server panicked")
            .expect("server failed");
    }
}
