//! HTTP API: search, ingestion and table listing.

use std::{convert::Infallible, sync::Arc};

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{StreamExt, stream};
use hyper::{
    Body, Method, Request, Response, StatusCode,
    body::HttpBody,
    header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue},
};
use logsql_config::{ConfigProvider, Scope, is_valid_table_name};
use logsql_ingest::Ingester;
use logsql_query::{OutputFormat, plan_all};
use logsql_search::{Executor, PrepareError, ResolveError, SearchError, SearchStatement};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::auth::{AuthError, authenticate, authorize, token_from_headers};

/// Default bound on a search request body.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

const JSON_CONTENT_TYPE: &str = "application/json";
const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Debug, Error)]
pub enum Error {
    #[error("no handler for {method} {path}")]
    NoHandler { method: Method, path: String },

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("request body exceeds the limit of {0} bytes")]
    RequestSizeExceeded(usize),

    #[error("client hung up while sending the body: {0}")]
    ClientHangup(hyper::Error),

    #[error("request body is not valid UTF-8")]
    NonUtf8Body,

    #[error(transparent)]
    Query(#[from] logsql_query::Error),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("invalid table name '{0}'")]
    InvalidTableName(String),

    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to build response: {0}")]
    Response(#[from] hyper::http::Error),
}

impl From<PrepareError> for Error {
    fn from(e: PrepareError) -> Self {
        match e {
            PrepareError::Resolve(e) => Self::Resolve(e),
            PrepareError::Query(e) => Self::Query(e),
        }
    }
}

impl From<logsql_ingest::Error> for Error {
    fn from(e: logsql_ingest::Error) -> Self {
        match e {
            logsql_ingest::Error::InvalidTableName(name) => Self::InvalidTableName(name),
        }
    }
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Self::NoHandler { .. } | Self::Resolve(ResolveError::TableNotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            Self::Auth(e) => e.status(),
            Self::RequestSizeExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ClientHangup(_)
            | Self::NonUtf8Body
            | Self::Query(_)
            | Self::InvalidTableName(_) => StatusCode::BAD_REQUEST,
            Self::Search(_) => StatusCode::BAD_GATEWAY,
            Self::Resolve(ResolveError::DatastoreNotFound { .. })
            | Self::Encode(_)
            | Self::Response(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn is_internal(&self) -> bool {
        self.status().is_server_error()
    }

    /// Render as a `{"error": "..."}` response.
    fn into_response(self) -> Response<Body> {
        let body = serde_json::json!({ "error": self.to_string() }).to_string();
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = self.status();
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        response
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything a request handler needs.
#[derive(Debug)]
pub struct HttpApi {
    config: Arc<dyn ConfigProvider>,
    executor: Executor,
    ingester: Ingester,
    max_request_bytes: usize,
    shutdown: CancellationToken,
}

impl HttpApi {
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        executor: Executor,
        ingester: Ingester,
        max_request_bytes: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            executor,
            ingester,
            max_request_bytes,
            shutdown,
        }
    }

    /// Plan, authorize and start every statement of the body, then stream
    /// the records. Nothing is searched unless every statement is valid.
    async fn search(&self, req: Request<Body>) -> Result<Response<Body>> {
        let config = self.config.snapshot();
        let token = token_from_headers(req.headers())?.to_string();
        let format = output_format(&req);
        let body = self.read_body(req).await?;
        let text = std::str::from_utf8(&body).map_err(|_| Error::NonUtf8Body)?;

        let plans = plan_all(text)?;
        let now = Utc::now();
        let mut statements = Vec::with_capacity(plans.len());
        for plan in plans {
            if config.table(&plan.table).is_none() {
                return Err(ResolveError::TableNotFound(plan.table).into());
            }
            authorize(&config, &token, &plan.table, Scope::Search, now)?;
            statements.push(SearchStatement::prepare(&config, plan, format)?);
        }
        info!(statements = statements.len(), ?format, "search");

        let mut results = self
            .executor
            .execute(statements, self.shutdown.child_token());

        // a statement that could not list anything fails the request while
        // no status has been sent yet
        let first = match results.next().await {
            Some(Err(e)) => return Err(e.into()),
            first => first,
        };
        let body = stream::iter(first).chain(results);

        let content_type = match format {
            OutputFormat::Json => NDJSON_CONTENT_TYPE,
            OutputFormat::Text => "text/plain; charset=utf-8",
        };
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content_type)
            .body(Body::wrap_stream(body))?)
    }

    /// Ingest the body into `table`.
    async fn store(&self, table: &str, req: Request<Body>) -> Result<Response<Body>> {
        let config = self.config.snapshot();
        let token = token_from_headers(req.headers())?;
        let now = Utc::now();
        // only a known token learns whether the table exists
        authenticate(&config, token, now)?;
        let Some(session) = self.ingester.session(table)? else {
            // accepted and dropped, see `Ingester::session`
            return Ok(Response::new(Body::empty()));
        };
        authorize(&config, token, table, Scope::Store, now)?;

        let summary = session.ingest(req.into_body()).await;
        debug!(%table, ?summary, "store");
        Ok(Response::new(Body::empty()))
    }

    fn list(&self, req: &Request<Body>) -> Result<Response<Body>> {
        let config = self.config.snapshot();
        let token = token_from_headers(req.headers())?;
        authenticate(&config, token, Utc::now())?;

        let body = serde_json::to_string(&config.table_names())?;
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .body(Body::from(body))?)
    }

    /// Read the whole request body, bounded by the configured limit.
    async fn read_body(&self, req: Request<Body>) -> Result<Bytes> {
        let content_length = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if content_length.is_some_and(|len| len > self.max_request_bytes) {
            return Err(Error::RequestSizeExceeded(self.max_request_bytes));
        }

        let mut payload = req.into_body();
        let mut body = BytesMut::with_capacity(content_length.unwrap_or_default());
        while let Some(chunk) = payload.data().await {
            let chunk = chunk.map_err(Error::ClientHangup)?;
            if body.len() + chunk.len() > self.max_request_bytes {
                return Err(Error::RequestSizeExceeded(self.max_request_bytes));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}

fn output_format(req: &Request<Body>) -> OutputFormat {
    let json = req
        .headers()
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains(JSON_CONTENT_TYPE) || v.contains(NDJSON_CONTENT_TYPE));
    if json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    }
}

/// The table of a `/{table}/store` path.
fn store_path_table(path: &str) -> Option<&str> {
    let table = path.strip_prefix('/')?.strip_suffix("/store")?;
    (!table.is_empty() && !table.contains('/')).then_some(table)
}

pub(crate) async fn route_request(
    http_server: Arc<HttpApi>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let content_length = req.headers().get(CONTENT_LENGTH).cloned();
    trace!(%method, %uri, "processing request");

    let response = match (method.clone(), uri.path()) {
        (Method::GET, "/health") => Ok(Response::new(Body::from("OK"))),
        (Method::GET, "/list") => http_server.list(&req),
        (Method::POST, "/search") => http_server.search(req).await,
        (Method::PUT | Method::POST, path) => match store_path_table(path) {
            Some(table) if is_valid_table_name(table) => {
                let table = table.to_string();
                http_server.store(&table, req).await
            }
            Some(table) => Err(Error::InvalidTableName(table.to_string())),
            None => Err(Error::NoHandler {
                method,
                path: path.to_string(),
            }),
        },
        (method, path) => Err(Error::NoHandler {
            method,
            path: path.to_string(),
        }),
    };

    match response {
        Ok(response) => {
            debug!(status = %response.status(), %uri, "successfully processed request");
            Ok(response)
        }
        Err(error) => {
            if error.is_internal() {
                error!(%error, %uri, ?content_length, "error while handling request");
            } else {
                debug!(%error, %uri, ?content_length, "error while handling request");
            }
            Ok(error.into_response())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TOKEN_HEADER;
    use logsql_config::{AuthGrant, Config, DatastoreInfo, StaticConfig, TableInfo};
    use logsql_object_store::{DatastoreConnector, ObjectFormat, ObjectStoreProvider, TableDirPath};
    use logsql_search::StreamingSelector;
    use object_store::ObjectStore;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    const TOKEN: &str = "abcdefghijklmnop";

    fn datastore(bucket: &str) -> DatastoreInfo {
        DatastoreInfo {
            endpoint: "memory://".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            bucket: bucket.to_string(),
            prefix: "minsql".to_string(),
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.datastores.insert("ds1".to_string(), datastore("ds1"));
        let mut grants = BTreeMap::new();
        for table in ["weblog", "api", "readonly"] {
            config
                .tables
                .insert(table.to_string(), TableInfo::new(["ds1"]));
            let scopes = if table == "readonly" {
                vec![Scope::Search]
            } else {
                vec![Scope::Search, Scope::Store]
            };
            grants.insert(table.to_string(), AuthGrant::new(TOKEN, scopes));
        }
        config.auth.insert(TOKEN.to_string(), grants);
        config
    }

    struct Fixture {
        api: Arc<HttpApi>,
        connector: Arc<DatastoreConnector>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_limit(DEFAULT_MAX_REQUEST_BYTES)
        }

        fn with_limit(max_request_bytes: usize) -> Self {
            let config: Arc<dyn ConfigProvider> = Arc::new(StaticConfig::new(config()));
            let connector = Arc::new(DatastoreConnector::default());
            let provider: Arc<dyn ObjectStoreProvider> = Arc::clone(&connector) as _;
            let executor = Executor::new(Arc::clone(&provider), Arc::new(StreamingSelector), 4);
            let ingester = Ingester::new(Arc::clone(&config), provider, 1000);
            let api = HttpApi::new(
                config,
                executor,
                ingester,
                max_request_bytes,
                CancellationToken::new(),
            );
            Self {
                api: Arc::new(api),
                connector,
            }
        }

        async fn send(&self, req: Request<Body>) -> (StatusCode, String) {
            let response = route_request(Arc::clone(&self.api), req).await.unwrap();
            let status = response.status();
            let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
            (status, String::from_utf8(body.to_vec()).unwrap())
        }

        async fn store(&self, table: &str, body: &'static str) -> (StatusCode, String) {
            self.send(
                Request::put(format!("/{table}/store"))
                    .header(TOKEN_HEADER, TOKEN)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
        }

        async fn search(&self, sql: &'static str) -> (StatusCode, String) {
            self.send(
                Request::post("/search")
                    .header(TOKEN_HEADER, TOKEN)
                    .body(Body::from(sql))
                    .unwrap(),
            )
            .await
        }

        async fn object_count(&self, table: &str, format: ObjectFormat) -> usize {
            let store = self
                .connector
                .object_store("ds1", &datastore("ds1"))
                .unwrap();
            let dir = TableDirPath::new("minsql", table, format);
            store.list(Some(&*dir)).count().await
        }
    }

    fn error_body(message: &str) -> String {
        serde_json::json!({ "error": message }).to_string()
    }

    #[test_log::test(tokio::test)]
    async fn store_then_search() {
        let fixture = Fixture::new();
        assert_eq!(
            fixture.store("weblog", "10.0.0.1 GET /x 200\n").await,
            (StatusCode::OK, String::new())
        );
        assert_eq!(
            fixture.search("SELECT $ip, $1 FROM weblog").await,
            (StatusCode::OK, "10.0.0.1 10.0.0.1\n".to_string())
        );
    }

    #[test_log::test(tokio::test)]
    async fn json_records_round_trip() {
        let fixture = Fixture::new();
        assert_eq!(
            fixture.store("api", "{\"a\":\"x\",\"b\":1}\n").await.0,
            StatusCode::OK
        );
        assert_eq!(fixture.object_count("api", ObjectFormat::Json).await, 1);

        let (status, body) = fixture.search("SELECT * FROM api").await;
        assert_eq!(status, StatusCode::OK);
        let record: serde_json::Value = serde_json::from_str(body.trim_end()).unwrap();
        assert_eq!(record, serde_json::json!({"a": "x", "b": 1}));
    }

    #[test_log::test(tokio::test)]
    async fn json_output_of_raw_lines() {
        let fixture = Fixture::new();
        fixture.store("weblog", "10.0.0.1 GET /x 200\n").await;
        let (status, body) = fixture
            .send(
                Request::post("/search")
                    .header(TOKEN_HEADER, TOKEN)
                    .header(ACCEPT, "application/json")
                    .body(Body::from("SELECT $ip AS client FROM weblog"))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "{\"client\":\"10.0.0.1\"}\n");
    }

    #[test_log::test(tokio::test)]
    async fn empty_result_is_ok() {
        let fixture = Fixture::new();
        assert_eq!(
            fixture.search("SELECT * FROM weblog").await,
            (StatusCode::OK, String::new())
        );
    }

    #[test_log::test(tokio::test)]
    async fn unknown_table() {
        let fixture = Fixture::new();
        assert_eq!(
            fixture.search("SELECT * FROM nosuch").await,
            (
                StatusCode::NOT_FOUND,
                error_body("table 'nosuch' not found")
            )
        );

        // ingestion into a table this instance doesn't know yet is dropped
        assert_eq!(
            fixture.store("nosuch", "a line\n").await,
            (StatusCode::OK, String::new())
        );
        assert_eq!(fixture.object_count("nosuch", ObjectFormat::Raw).await, 0);

        // without a valid token, unknown and known tables look the same
        for table in ["nosuch", "weblog"] {
            let (status, body) = fixture
                .send(
                    Request::put(format!("/{table}/store"))
                        .body(Body::from("a line\n"))
                        .unwrap(),
                )
                .await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{table}");
            assert_eq!(body, error_body("missing minsql-token header"));

            let (status, _) = fixture
                .send(
                    Request::put(format!("/{table}/store"))
                        .header(TOKEN_HEADER, "wrong")
                        .body(Body::from("a line\n"))
                        .unwrap(),
                )
                .await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{table}");
        }
        assert_eq!(fixture.object_count("weblog", ObjectFormat::Raw).await, 0);
    }

    #[test_log::test(tokio::test)]
    async fn bad_requests() {
        let fixture = Fixture::new();
        assert_eq!(
            fixture.search("SELECT * FROM weblog GROUP BY $1").await.0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            fixture.search("SELECT $mac FROM weblog").await.0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            fixture.store("9lives", "x\n").await,
            (
                StatusCode::BAD_REQUEST,
                error_body("invalid table name '9lives'")
            )
        );
        assert_eq!(
            fixture
                .send(Request::delete("/search").body(Body::empty()).unwrap())
                .await
                .0,
            StatusCode::NOT_FOUND
        );
    }

    #[test_log::test(tokio::test)]
    async fn one_invalid_statement_searches_nothing() {
        let fixture = Fixture::new();
        fixture.store("weblog", "x\n").await;
        assert_eq!(
            fixture
                .search("SELECT * FROM weblog; SELECT * FROM nosuch")
                .await
                .0,
            StatusCode::NOT_FOUND
        );
    }

    #[test_log::test(tokio::test)]
    async fn authorization() {
        let fixture = Fixture::new();
        let (status, body) = fixture
            .send(
                Request::post("/search")
                    .body(Body::from("SELECT * FROM weblog"))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, error_body("missing minsql-token header"));

        let (status, _) = fixture
            .send(
                Request::post("/search")
                    .header(TOKEN_HEADER, "wrong")
                    .body(Body::from("SELECT * FROM weblog"))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        assert_eq!(
            fixture.store("readonly", "x\n").await.0,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            fixture.object_count("readonly", ObjectFormat::Raw).await,
            0
        );
    }

    #[test_log::test(tokio::test)]
    async fn list_tables() {
        let fixture = Fixture::new();
        let (status, body) = fixture
            .send(
                Request::get("/list")
                    .header(TOKEN_HEADER, TOKEN)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"["api","readonly","weblog"]"#);

        let (status, _) = fixture
            .send(Request::get("/list").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test_log::test(tokio::test)]
    async fn health() {
        let fixture = Fixture::new();
        assert_eq!(
            fixture
                .send(Request::get("/health").body(Body::empty()).unwrap())
                .await,
            (StatusCode::OK, "OK".to_string())
        );
    }

    #[test_log::test(tokio::test)]
    async fn request_size_limit() {
        let fixture = Fixture::with_limit(16);
        let (status, _) = fixture
            .search("SELECT * FROM weblog WHERE $1 = 'some long value'")
            .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn store_paths() {
        assert_eq!(store_path_table("/weblog/store"), Some("weblog"));
        assert_eq!(store_path_table("/store"), None);
        assert_eq!(store_path_table("//store"), None);
        assert_eq!(store_path_table("/a/b/store"), None);
        assert_eq!(store_path_table("/weblog/search"), None);
    }
}
