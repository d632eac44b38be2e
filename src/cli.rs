use clap::{Parser, Subcommand};

const DEFAULT_DATA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/data");

#[derive(Parser, Debug)]
#[command(name = "providers-dashboard")]
#[command(about = "Provider ranking dashboard backend (DuckDB)", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch the utilization extract (if missing) and load it into DuckDB.
    Build(BuildArgs),
    /// Serve the dashboard API (requires a completed build).
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct BuildArgs {
    /// Data directory (source extract, DuckDB DB, meta.json).
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,

    /// Utilization extract: a local .csv/.parquet path or an http(s) URL.
    #[arg(long)]
    pub source: String,

    /// Do not download a missing extract; error instead.
    #[arg(long)]
    pub offline: bool,

    /// Re-download the extract even if a local copy exists.
    #[arg(long)]
    pub force_download: bool,

    /// Reload the utilization table even if it already exists.
    #[arg(long)]
    pub rebuild: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Data directory holding dashboard.duckdb.
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,

    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 8050)]
    pub port: u16,

    /// Maximum number of cached results.
    #[arg(long, default_value_t = 512)]
    pub cache_capacity: usize,

    /// Seconds a cached result stays downloadable.
    #[arg(long, default_value_t = 3600)]
    pub cache_ttl_secs: u64,

    /// Seconds of inactivity before a session is dropped.
    #[arg(long, default_value_t = 7200)]
    pub session_ttl_secs: u64,

    /// Upper bound on one refresh or result computation.
    #[arg(long, default_value_t = 30)]
    pub query_timeout_secs: u64,
}
