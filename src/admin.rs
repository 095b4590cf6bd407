//! A tiny `hyper` HTTP server exposing `/metrics` in Prometheus text format.
//!
//! This is the Prometheus-pull half of two independent observability
//! surfaces (the other is the statsd-formatted self-stats push handled by
//! `relay::RelayCore::flush_self_stats`), built on the `stats` module
//! (`stats::Collector::prometheus_output`) and the `hyper` dependency this
//! crate already carries.

use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{error, info};

use crate::stats::Collector;

async fn handle(collector: Collector, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => match collector.prometheus_output() {
            Ok(body) => Ok(Response::new(Body::from(body))),
            Err(e) => {
                error!("failed to encode prometheus output: {}", e);
                Ok(Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::from("encoding error"))
                    .unwrap())
            }
        },
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap()),
    }
}

/// Spawn the admin HTTP server on `port`, bound to all interfaces, as a
/// detached tokio task. Errors binding the port are logged and the task
/// simply exits; the admin server is an observability nicety, not required
/// for the relay's data plane to function.
pub fn spawn_admin_server(port: u16, collector: Collector) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tokio::spawn(async move {
        let make_svc = make_service_fn(move |_conn| {
            let collector = collector.clone();
            async move { Ok::<_, Infallible>(service_fn(move |req| handle(collector.clone(), req))) }
        });

        let server = Server::bind(&addr).serve(make_svc);
        info!("admin server listening on {}", addr);
        if let Err(e) = server.await {
            error!("admin server error: {}", e);
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn metrics_endpoint_returns_ok() {
        let collector = Collector::default();
        let scope = collector.scope("test");
        scope.counter("requests").unwrap().inc();

        let req = Request::builder()
            .method(Method::GET)
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let resp = handle(collector, req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_path_returns_404() {
        let collector = Collector::default();
        let req = Request::builder()
            .method(Method::GET)
            .uri("/nope")
            .body(Body::empty())
            .unwrap();
        let resp = handle(collector, req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
