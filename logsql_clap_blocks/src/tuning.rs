//! CLI config for search and ingestion limits.

use std::time::Duration;

/// CLI config for the server's resource bounds.
#[derive(Debug, Clone, clap::Parser)]
pub struct TuningConfig {
    /// How often the config descriptor is checked for changes made by other
    /// instances.
    #[clap(
        long = "config-poll-interval",
        env = "LOGSQL_CONFIG_POLL_INTERVAL",
        default_value = "5s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub config_poll_interval: Duration,

    /// Maximum size of a search request body, in bytes.
    #[clap(
        long = "max-http-request-size",
        env = "LOGSQL_MAX_HTTP_REQUEST_SIZE",
        default_value = "10485760", // 10 MiB
        action
    )]
    pub max_http_request_size: usize,

    /// Objects searched concurrently by one statement. Defaults to the
    /// number of CPUs.
    #[clap(
        long = "query-workers",
        env = "LOGSQL_QUERY_WORKERS",
        default_value_t = num_cpus::get(),
        value_parser = clap::value_parser!(usize),
        action
    )]
    pub query_workers: usize,

    /// Records committed per object by ingestion.
    #[clap(
        long = "ingest-max-records",
        env = "LOGSQL_INGEST_MAX_RECORDS",
        default_value = "10000",
        action
    )]
    pub ingest_max_records: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> TuningConfig {
        TuningConfig::try_parse_from(std::iter::once("logsql").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        assert_eq!(config.config_poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_http_request_size, 10 * 1024 * 1024);
        assert_eq!(config.query_workers, num_cpus::get());
        assert_eq!(config.ingest_max_records, 10_000);
    }

    #[test]
    fn overrides() {
        let config = parse(&[
            "--config-poll-interval",
            "1m 30s",
            "--query-workers",
            "3",
            "--ingest-max-records=50",
        ]);
        assert_eq!(config.config_poll_interval, Duration::from_secs(90));
        assert_eq!(config.query_workers, 3);
        assert_eq!(config.ingest_max_records, 50);

        assert!(TuningConfig::try_parse_from(["logsql", "--config-poll-interval", "soon"]).is_err());
    }
}
