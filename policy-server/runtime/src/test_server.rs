//! A throwaway HTTP server that answers with canned JSON and records what it
//! was asked.

use bytes::Bytes;
use http::{header, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::{convert::Infallible, sync::Arc};
use tokio::net::TcpListener;
use url::Url;

#[derive(Clone, Debug)]
pub(crate) struct Recorded {
    pub(crate) method: http::Method,
    pub(crate) path: String,
    pub(crate) query: String,
    pub(crate) host: String,
    pub(crate) authorization: Option<String>,
    pub(crate) body: String,
}

pub(crate) type Log = Arc<Mutex<Vec<Recorded>>>;

pub(crate) async fn spawn<F>(handler: F) -> (Url, Log)
where
    F: Fn(&Recorded) -> (StatusCode, serde_json::Value) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    let log = Log::default();

    tokio::spawn({
        let log = log.clone();
        async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let handler = handler.clone();
                let log = log.clone();
                let svc = hyper::service::service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    let log = log.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body.collect().await.map(|b| b.to_bytes()).unwrap_or_default();
                        let get_header = |name: header::HeaderName| {
                            parts
                                .headers
                                .get(name)
                                .and_then(|v: &http::HeaderValue| v.to_str().ok())
                                .map(str::to_string)
                        };
                        let recorded = Recorded {
                            method: parts.method.clone(),
                            path: parts.uri.path().to_string(),
                            query: parts.uri.query().unwrap_or_default().to_string(),
                            host: get_header(header::HOST).unwrap_or_default(),
                            authorization: get_header(header::AUTHORIZATION),
                            body: String::from_utf8_lossy(&body).into_owned(),
                        };
                        let (status, json) = handler(&recorded);
                        log.lock().push(recorded);
                        let mut rsp = Response::new(Full::new(Bytes::from(json.to_string())));
                        *rsp.status_mut() = status;
                        rsp.headers_mut().insert(
                            header::CONTENT_TYPE,
                            http::HeaderValue::from_static("application/json"),
                        );
                        Ok::<_, Infallible>(rsp)
                    }
                });
                tokio::spawn(async move {
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await;
                });
            }
        }
    });

    (Url::parse(&format!("http://{addr}/")).unwrap(), log)
}
