use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use serde_json::Value;

/// Command-line arguments for the querycache binary.
#[derive(Debug, Parser)]
#[command(name = "querycache", version, about = "Query result cache tooling")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "QUERYCACHE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print the fingerprint and cache key of a query.
    Fingerprint(QueryArgs),
    /// List the tables a query would be tagged with.
    Tables(TablesArgs),
    /// Show the cached entry for a query, read from the remote tier.
    Inspect(QueryArgs),
    /// Remove every entry under the key prefix from the remote tier.
    Clear,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Force JSON (`true`) or compact (`false`) log output.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the remote tier connection URL.
    #[arg(
        long = "redis-url",
        env = "QUERYCACHE_REDIS_URL",
        value_name = "URL",
        value_hint = ValueHint::Url,
        global = true
    )]
    pub redis_url: Option<String>,

    /// Override the namespace prepended to every cache key.
    #[arg(long = "key-prefix", value_name = "PREFIX", global = true)]
    pub key_prefix: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct QueryArgs {
    /// Query text, as passed to the cache.
    pub query: String,

    /// Bound parameter as JSON; repeat for each parameter. Values that are
    /// not valid JSON are taken as strings.
    #[arg(long = "param", short = 'p', value_name = "JSON")]
    pub params: Vec<String>,
}

impl QueryArgs {
    pub fn param_values(&self) -> Vec<Value> {
        self.params
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone())))
            .collect()
    }
}

#[derive(Debug, Args, Clone)]
pub struct TablesArgs {
    /// Query text to scan for table references.
    pub query: String,
}
