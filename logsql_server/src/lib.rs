//! The HTTP server of the log search engine.
//!
//! | route | |
//! |---|---|
//! | `POST /search` | semicolon separated statements, streamed records |
//! | `PUT /{table}/store` | newline delimited text or JSON records |
//! | `GET /list` | JSON array of table names |
//! | `GET /health` | `OK` |
//!
//! Every route but `/health` requires a token in the `MINSQL-TOKEN` header.

use std::{convert::Infallible, sync::Arc};

use hyper::{
    Request,
    server::conn::{AddrIncoming, AddrStream},
};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod auth;
pub mod http;

pub use auth::TOKEN_HEADER;
pub use http::{DEFAULT_MAX_REQUEST_BYTES, HttpApi};

/// Serve `api` on `addr` until `shutdown` is cancelled, then finish the
/// in-flight requests.
pub async fn serve(
    addr: AddrIncoming,
    api: Arc<HttpApi>,
    shutdown: CancellationToken,
) -> Result<(), hyper::Error> {
    info!(address = %addr.local_addr(), "listening for HTTP requests");
    hyper::Server::builder(addr)
        .serve(hyper::service::make_service_fn(|_conn: &AddrStream| {
            let api = Arc::clone(&api);
            let service = hyper::service::service_fn(move |request: Request<_>| {
                http::route_request(Arc::clone(&api), request)
            });
            futures::future::ready(Ok::<_, Infallible>(service))
        }))
        .with_graceful_shutdown(shutdown.cancelled())
        .await
}
