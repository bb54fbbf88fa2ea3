//! In-process HTTP node standing in for a downstream replica.

use std::{
    convert::Infallible,
    sync::{Arc, Mutex},
    time::Duration,
};

use http_body_util::{BodyExt, Full};
use hyper::{
    HeaderMap, Request, Response, StatusCode,
    body::{Bytes, Incoming},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

/// One request as the node saw it.
#[derive(Clone, Debug)]
pub struct Received {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: String,
}

impl Received {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

#[derive(Clone, Copy)]
enum Behaviour {
    /// Answer with the status and an echo of the request body.
    Reply(u16),
    /// Never answer within any reasonable client timeout.
    Stall,
}

pub struct Node {
    pub address: String,
    received: Arc<Mutex<Vec<Received>>>,
}

impl Node {
    /// Node answering every request with `status` and an echo of its body.
    pub async fn spawn(status: u16) -> Node {
        Self::start(Behaviour::Reply(status)).await
    }

    /// Node that accepts requests but never responds.
    pub async fn stalled() -> Node {
        Self::start(Behaviour::Stall).await
    }

    async fn start(behaviour: Behaviour) -> Node {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let received = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&received);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let io = TokioIo::new(stream);
                let log = Arc::clone(&log);

                tokio::spawn(async move {
                    let service = service_fn(move |request| {
                        let log = Arc::clone(&log);
                        async move { handle(request, behaviour, log).await }
                    });
                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        eprintln!("Node connection error: {err}");
                    }
                });
            }
        });

        Node { address, received }
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }
}

async fn handle(
    request: Request<Incoming>,
    behaviour: Behaviour,
    log: Arc<Mutex<Vec<Received>>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = request.into_parts();
    let body = match body.collect().await {
        Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
        Err(_) => String::new(),
    };
    log.lock().unwrap().push(Received {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        headers: parts.headers,
        body: body.clone(),
    });

    let status = match behaviour {
        Behaviour::Reply(status) => status,
        Behaviour::Stall => {
            tokio::time::sleep(Duration::from_secs(60)).await;
            200
        }
    };
    let response = Response::builder()
        .status(StatusCode::from_u16(status).unwrap())
        .body(Full::new(Bytes::from(body)))
        .unwrap();
    Ok(response)
}

/// Address nothing listens on.
pub async fn dead_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}
