//! Scatter-gather execution of planned statements.
//!
//! For each statement a fixed pool of workers is started, then every
//! datastore of the table is listed concurrently into a bounded candidate
//! queue. Workers take one object at a time and forward its records to the
//! output channel as they are produced, so records of one object keep their
//! order while records of different objects interleave freely. Statements
//! run strictly one after the other.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use bytes::Bytes;
use futures::{StreamExt, future::join_all, stream::BoxStream};
use logsql_config::Config;
use logsql_object_store::{ObjectFormat, ObjectStoreProvider, TableDirPath};
use logsql_query::{OutputFormat, QueryPlan, RecordEvaluator};
use thiserror::Error;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    resolver::{ResolveError, ResolvedDatastore, resolve_shuffled},
    selector::{ObjectCandidate, RecordSelector},
};

/// Number of rendered records buffered between the workers and the reader
/// of the result stream.
const OUTPUT_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Query(#[from] logsql_query::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SearchError {
    #[error("none of the {datastores} datastores of table '{table}' could be listed")]
    ListingFailed { table: String, datastores: usize },
}

/// A statement bound to the datastores it will read.
#[derive(Debug, Clone)]
pub struct SearchStatement {
    pub evaluator: Arc<RecordEvaluator>,
    pub datastores: Vec<ResolvedDatastore>,
    /// Appended to every output record.
    pub delimiter: Bytes,
}

impl SearchStatement {
    /// Resolve the datastores of `plan` in a fresh random order.
    pub fn prepare(
        config: &Config,
        plan: QueryPlan,
        format: OutputFormat,
    ) -> Result<Self, PrepareError> {
        let datastores = resolve_shuffled(config, &plan.table)?;
        let delimiter = config
            .table(&plan.table)
            .map(|t| Bytes::from(t.output_record_delimiter.clone()))
            .unwrap_or_else(|| Bytes::from_static(b"\n"));
        let evaluator = RecordEvaluator::new(Arc::new(plan), format)?;
        Ok(Self {
            evaluator: Arc::new(evaluator),
            datastores,
            delimiter,
        })
    }

    pub fn table(&self) -> &str {
        &self.evaluator.plan().table
    }
}

/// Stream of delimited output records.
pub type SearchStream = BoxStream<'static, Result<Bytes, SearchError>>;

#[derive(Debug, Clone)]
pub struct Executor {
    provider: Arc<dyn ObjectStoreProvider>,
    selector: Arc<dyn RecordSelector>,
    workers: usize,
}

impl Executor {
    pub fn new(
        provider: Arc<dyn ObjectStoreProvider>,
        selector: Arc<dyn RecordSelector>,
        workers: usize,
    ) -> Self {
        Self {
            provider,
            selector,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `statements` in order, streaming their records.
    ///
    /// Dropping the returned stream, or cancelling `shutdown`, stops all
    /// listing and keeps workers from starting on further objects.
    pub fn execute(
        &self,
        statements: Vec<SearchStatement>,
        shutdown: CancellationToken,
    ) -> SearchStream {
        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        let cancel = shutdown.child_token();

        // stop work once nobody reads the results
        let watched = tx.clone();
        let watch_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watched.closed() => watch_cancel.cancel(),
                _ = watch_cancel.cancelled() => {}
            }
        });

        let executor = self.clone();
        tokio::spawn(async move {
            for statement in statements {
                if cancel.is_cancelled() {
                    break;
                }
                executor.run_statement(statement, &tx, &cancel).await;
            }
            // release the watcher
            cancel.cancel();
        });

        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()
    }

    async fn run_statement(
        &self,
        statement: SearchStatement,
        output: &mpsc::Sender<Result<Bytes, SearchError>>,
        parent: &CancellationToken,
    ) {
        let started = Instant::now();
        let table = statement.table().to_string();
        // a satisfied LIMIT ends this statement only
        let cancel = parent.child_token();
        let emitted = Arc::new(AtomicUsize::new(0));

        let (candidates_tx, candidates_rx) = async_channel::bounded(self.workers);
        let workers: Vec<_> = (0..self.workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    candidates: candidates_rx.clone(),
                    selector: Arc::clone(&self.selector),
                    evaluator: Arc::clone(&statement.evaluator),
                    delimiter: statement.delimiter.clone(),
                    output: output.clone(),
                    emitted: Arc::clone(&emitted),
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        drop(candidates_rx);

        let listed = join_all(statement.datastores.iter().map(|datastore| {
            list_datastore(
                Arc::clone(&self.provider),
                datastore,
                &table,
                candidates_tx.clone(),
                cancel.clone(),
            )
        }))
        .await;
        // closing the queue lets workers finish once it is drained
        drop(candidates_tx);

        let mut objects = 0;
        for worker in workers {
            match worker.await {
                Ok(n) => objects += n,
                Err(e) => warn!(%table, error = %e, "search worker failed"),
            }
        }

        let failed = listed.iter().filter(|ok| !**ok).count();
        if !listed.is_empty() && failed == listed.len() && !cancel.is_cancelled() {
            let _ = output
                .send(Err(SearchError::ListingFailed {
                    table: table.clone(),
                    datastores: listed.len(),
                }))
                .await;
        }
        cancel.cancel();

        info!(
            %table,
            datastores = listed.len(),
            failed_datastores = failed,
            objects,
            records = emitted.load(Ordering::Relaxed),
            elapsed = ?started.elapsed(),
            "search statement complete"
        );
    }
}

/// List both object formats of `table` in one datastore into the candidate
/// queue. Returns false if the datastore could not be listed.
async fn list_datastore(
    provider: Arc<dyn ObjectStoreProvider>,
    datastore: &ResolvedDatastore,
    table: &str,
    candidates: async_channel::Sender<ObjectCandidate>,
    cancel: CancellationToken,
) -> bool {
    let store = match provider.object_store(&datastore.name, &datastore.info) {
        Ok(store) => store,
        Err(e) => {
            warn!(datastore = %datastore.name, %table, error = %e, "cannot connect to datastore");
            return false;
        }
    };
    let name: Arc<str> = Arc::from(datastore.name.as_str());

    for format in ObjectFormat::ALL {
        let dir = TableDirPath::new(&datastore.info.prefix, table, format);
        let mut listing = store.list(Some(&*dir));
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return true,
                next = listing.next() => next,
            };
            let meta = match next {
                None => break,
                Some(Ok(meta)) => meta,
                Some(Err(e)) => {
                    warn!(datastore = %datastore.name, %table, error = %e, "listing failed");
                    return false;
                }
            };
            if meta.size == 0 || meta.location.as_ref().ends_with('/') {
                continue;
            }

            let candidate = ObjectCandidate {
                datastore: Arc::clone(&name),
                store: Arc::clone(&store),
                location: meta.location,
                size: meta.size,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return true,
                sent = candidates.send(candidate) => {
                    if sent.is_err() {
                        return true;
                    }
                }
            }
        }
    }
    true
}

#[derive(Debug)]
struct Worker {
    id: usize,
    candidates: async_channel::Receiver<ObjectCandidate>,
    selector: Arc<dyn RecordSelector>,
    evaluator: Arc<RecordEvaluator>,
    delimiter: Bytes,
    output: mpsc::Sender<Result<Bytes, SearchError>>,
    emitted: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl Worker {
    /// Process candidates until the queue is closed and drained or the
    /// statement is cancelled. Returns the number of objects searched.
    async fn run(self) -> usize {
        let mut objects = 0;
        loop {
            let candidate = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                candidate = self.candidates.recv() => match candidate {
                    Ok(candidate) => candidate,
                    Err(_) => break,
                },
            };
            objects += 1;
            if !self.search(&candidate).await {
                break;
            }
        }
        debug!(worker = self.id, objects, "search worker done");
        objects
    }

    /// Forward the records of one object. Returns false once the worker
    /// should stop.
    async fn search(&self, candidate: &ObjectCandidate) -> bool {
        let limit = self.evaluator.plan().limit;
        let mut records = self
            .selector
            .select(candidate, Arc::clone(&self.evaluator));

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                next = records.next() => next,
            };
            let record = match next {
                None => return true,
                Some(Ok(record)) => record,
                Some(Err(e)) => {
                    warn!(
                        datastore = %candidate.datastore,
                        object = %candidate.location,
                        error = %e,
                        "dropping object from search results"
                    );
                    return true;
                }
            };

            let mut last = false;
            if let Some(limit) = limit {
                match self
                    .emitted
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < limit).then_some(n + 1)
                    }) {
                    Ok(previous) => last = previous + 1 == limit,
                    Err(_) => {
                        self.cancel.cancel();
                        return false;
                    }
                }
            } else {
                self.emitted.fetch_add(1, Ordering::Relaxed);
            }

            let mut record = record.into_bytes();
            record.extend_from_slice(&self.delimiter);
            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                sent = self.output.send(Ok(Bytes::from(record))) => sent,
            };
            if sent.is_err() {
                self.cancel.cancel();
                return false;
            }
            if last {
                self.cancel.cancel();
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{SelectError, StreamingSelector};
    use chrono::{TimeZone, Utc};
    use futures::{StreamExt, TryStreamExt, stream};
    use logsql_config::{DatastoreInfo, TableInfo};
    use logsql_object_store::{DatastoreConnector, ObjectFilePath};
    use object_store::{ObjectStore, PutPayload};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use uuid::Uuid;

    fn datastore(bucket: &str) -> DatastoreInfo {
        DatastoreInfo {
            endpoint: "memory://".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            bucket: bucket.to_string(),
            prefix: "minsql".to_string(),
        }
    }

    struct Fixture {
        config: Config,
        connector: Arc<DatastoreConnector>,
    }

    impl Fixture {
        fn new(buckets: &[&str]) -> Self {
            let mut config = Config::default();
            for bucket in buckets {
                config
                    .datastores
                    .insert(bucket.to_string(), datastore(bucket));
            }
            config
                .tables
                .insert("weblog".to_string(), TableInfo::new(buckets.iter().copied()));
            Self {
                config,
                connector: Arc::new(DatastoreConnector::default()),
            }
        }

        fn store(&self, bucket: &str) -> Arc<dyn ObjectStore> {
            self.connector
                .object_store(bucket, &datastore(bucket))
                .unwrap()
        }

        async fn put_raw(&self, bucket: &str, second: u32, body: &str) {
            let path = ObjectFilePath::new(
                "minsql",
                "weblog",
                ObjectFormat::Raw,
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, second).unwrap(),
                Uuid::new_v4(),
            );
            self.store(bucket)
                .put(&path, PutPayload::from(body.to_string()))
                .await
                .unwrap();
        }

        fn executor(&self, selector: Arc<dyn RecordSelector>) -> Executor {
            let provider: Arc<dyn ObjectStoreProvider> = Arc::clone(&self.connector) as _;
            Executor::new(provider, selector, 4)
        }

        fn statements(&self, sql: &str) -> Vec<SearchStatement> {
            logsql_query::plan_all(sql)
                .unwrap()
                .into_iter()
                .map(|plan| SearchStatement::prepare(&self.config, plan, OutputFormat::Text).unwrap())
                .collect()
        }

        async fn run(&self, sql: &str) -> Vec<Result<String, SearchError>> {
            self.executor(Arc::new(StreamingSelector))
                .execute(self.statements(sql), CancellationToken::new())
                .map(|item| item.map(|b| String::from_utf8(b.to_vec()).unwrap()))
                .collect()
                .await
        }
    }

    fn lines(items: Vec<Result<String, SearchError>>) -> Vec<String> {
        items.into_iter().map(Result::unwrap).collect()
    }

    #[test_log::test(tokio::test)]
    async fn positional_and_ip_entities() {
        let fixture = Fixture::new(&["ds1"]);
        fixture.put_raw("ds1", 0, "10.0.0.1 GET /x 200\n").await;
        assert_eq!(
            lines(fixture.run("SELECT $ip, $1 FROM weblog").await),
            vec!["10.0.0.1 10.0.0.1\n"]
        );
    }

    #[test_log::test(tokio::test)]
    async fn searches_every_datastore() {
        let fixture = Fixture::new(&["ds1", "ds2", "ds3"]);
        fixture.put_raw("ds1", 0, "a 1\nb 2\n").await;
        fixture.put_raw("ds2", 0, "c 3\n").await;
        fixture.put_raw("ds2", 1, "").await;
        fixture.put_raw("ds3", 5, "d 4\ne 5").await;

        let mut records = lines(fixture.run("SELECT $1 FROM weblog WHERE $2 > 1").await);
        records.sort();
        assert_eq!(records, vec!["b\n", "c\n", "d\n", "e\n"]);
    }

    #[test_log::test(tokio::test)]
    async fn records_of_one_object_keep_their_order() {
        let fixture = Fixture::new(&["ds1"]);
        let body: String = (0..500).map(|i| format!("line {i}\n")).collect();
        fixture.put_raw("ds1", 0, &body).await;
        fixture.put_raw("ds1", 1, "other 1\nother 2\n").await;

        let first = lines(fixture.run("SELECT $line FROM weblog").await);
        let from_object: Vec<&String> = first.iter().filter(|l| l.starts_with("line")).collect();
        let expected: Vec<String> = (0..500).map(|i| format!("line {i}\n")).collect();
        assert_eq!(from_object, expected.iter().collect::<Vec<_>>());

        // the same multiset on every run
        let again = lines(fixture.run("SELECT $line FROM weblog").await);
        let mut a = first.clone();
        let mut b = again;
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test_log::test(tokio::test)]
    async fn output_record_delimiter() {
        let mut fixture = Fixture::new(&["ds1"]);
        fixture.config.tables.insert(
            "weblog".to_string(),
            TableInfo::new(["ds1"]).with_record_delimiter("\r\n"),
        );
        fixture.put_raw("ds1", 0, "x\n").await;
        assert_eq!(
            lines(fixture.run("SELECT * FROM weblog").await),
            vec!["x\r\n"]
        );
    }

    #[test_log::test(tokio::test)]
    async fn corrupt_objects_are_skipped() {
        let fixture = Fixture::new(&["ds1"]);
        fixture.put_raw("ds1", 0, "good 1\n").await;
        let bad = ObjectFilePath::new(
            "minsql",
            "weblog",
            ObjectFormat::Json,
            Utc::now(),
            Uuid::new_v4(),
        );
        fixture
            .store("ds1")
            .put(&bad, PutPayload::from_static(b"not parquet at all"))
            .await
            .unwrap();

        assert_eq!(
            lines(fixture.run("SELECT * FROM weblog").await),
            vec!["good 1\n"]
        );
    }

    #[test_log::test(tokio::test)]
    async fn unreachable_datastores_are_skipped() {
        let mut fixture = Fixture::new(&["ds1", "broken"]);
        fixture.config.datastores.insert(
            "broken".to_string(),
            DatastoreInfo {
                endpoint: "gopher://nowhere".to_string(),
                ..datastore("broken")
            },
        );
        fixture.put_raw("ds1", 0, "x\n").await;
        assert_eq!(lines(fixture.run("SELECT * FROM weblog").await), vec!["x\n"]);
    }

    #[test_log::test(tokio::test)]
    async fn error_when_no_datastore_can_be_listed() {
        let mut fixture = Fixture::new(&["broken"]);
        fixture.config.datastores.insert(
            "broken".to_string(),
            DatastoreInfo {
                endpoint: "gopher://nowhere".to_string(),
                ..datastore("broken")
            },
        );
        assert_eq!(
            fixture.run("SELECT * FROM weblog").await,
            vec![Err(SearchError::ListingFailed {
                table: "weblog".to_string(),
                datastores: 1
            })]
        );
    }

    #[test_log::test(tokio::test)]
    async fn empty_table_is_an_empty_result() {
        let fixture = Fixture::new(&["ds1"]);
        assert!(fixture.run("SELECT * FROM weblog").await.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn limit_spans_objects() {
        let fixture = Fixture::new(&["ds1", "ds2"]);
        for second in 0..5 {
            fixture.put_raw("ds1", second, "a\nb\nc\n").await;
            fixture.put_raw("ds2", second, "d\ne\nf\n").await;
        }
        let records = lines(fixture.run("SELECT * FROM weblog LIMIT 4").await);
        assert_eq!(records.len(), 4);

        let records = lines(fixture.run("SELECT * FROM weblog LIMIT 0").await);
        assert!(records.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn statements_run_in_sequence() {
        let fixture = Fixture::new(&["ds1"]);
        for second in 0..3 {
            fixture.put_raw("ds1", second, "one\ntwo\nthree\n").await;
        }
        let records = lines(
            fixture
                .run("SELECT * FROM weblog WHERE $1 = 'one'; SELECT * FROM weblog WHERE $1 = 'two' LIMIT 2")
                .await,
        );
        assert_eq!(records, vec!["one\n", "one\n", "one\n", "two\n", "two\n"]);
    }

    /// Yields records forever, counting them.
    #[derive(Debug, Default)]
    struct EndlessSelector {
        produced: Arc<AtomicUsize>,
    }

    impl RecordSelector for EndlessSelector {
        fn select(
            &self,
            _candidate: &ObjectCandidate,
            _evaluator: Arc<RecordEvaluator>,
        ) -> BoxStream<'static, Result<String, SelectError>> {
            let produced = Arc::clone(&self.produced);
            stream::repeat_with(move || {
                produced.fetch_add(1, Ordering::SeqCst);
                Ok("record".to_string())
            })
            .boxed()
        }
    }

    #[test_log::test(tokio::test)]
    async fn dropping_the_stream_stops_the_workers() {
        let fixture = Fixture::new(&["ds1"]);
        fixture.put_raw("ds1", 0, "x\n").await;
        let selector = Arc::new(EndlessSelector::default());
        let produced = Arc::clone(&selector.produced);
        let executor = fixture.executor(selector);

        let mut stream = executor.execute(
            fixture.statements("SELECT * FROM weblog"),
            CancellationToken::new(),
        );
        let first: Vec<Bytes> = stream.by_ref().take(3).try_collect().await.unwrap();
        assert_eq!(first, vec![Bytes::from_static(b"record\n"); 3]);
        drop(stream);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let settled = produced.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(produced.load(Ordering::SeqCst), settled);
    }

    #[test_log::test(tokio::test)]
    async fn shutdown_ends_the_stream() {
        let fixture = Fixture::new(&["ds1"]);
        fixture.put_raw("ds1", 0, "x\n").await;
        let executor = fixture.executor(Arc::new(EndlessSelector::default()));
        let shutdown = CancellationToken::new();

        let mut stream = executor.execute(fixture.statements("SELECT * FROM weblog"), shutdown.clone());
        assert!(stream.next().await.is_some());
        shutdown.cancel();

        // buffered records may still arrive, but the stream must end
        tokio::time::timeout(Duration::from_secs(5), stream.for_each(|_| async {}))
            .await
            .unwrap();
    }
}
