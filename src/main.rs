use std::{process, sync::Arc};

use querycache::{
    cache::{QueryCache, RemoteTier, fingerprint, tables},
    config::{self, Command, QueryArgs, Settings, TablesArgs},
    error::AppError,
    infra::{error::InfraError, redis::RedisTier, telemetry},
};
use serde_json::json;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    match cli_args.command {
        Command::Fingerprint(args) => run_fingerprint(&settings, &args),
        Command::Tables(args) => run_tables(&args),
        Command::Inspect(args) => run_inspect(&settings, &args).await,
        Command::Clear => run_clear(&settings).await,
    }
}

fn run_fingerprint(settings: &Settings, args: &QueryArgs) -> Result<(), AppError> {
    let params = args.param_values();
    let digest = fingerprint::fingerprint(&args.query, &params);
    let output = json!({
        "normalized": fingerprint::normalize_query(&args.query),
        "params": fingerprint::serialize_params(&params),
        "fingerprint": digest,
        "key": fingerprint::cache_key(&settings.cache.key_prefix, &digest),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_tables(args: &TablesArgs) -> Result<(), AppError> {
    for table in tables::extract_tables(&args.query) {
        println!("{table}");
    }
    Ok(())
}

async fn run_inspect(settings: &Settings, args: &QueryArgs) -> Result<(), AppError> {
    let cache = connect_cache(settings).await?;
    let key = cache.cache_key(&args.query, &args.param_values());

    match cache.inspect(&key).await {
        Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
        None => info!(key = %key, "Query is not cached"),
    }

    cache.stop().await;
    Ok(())
}

async fn run_clear(settings: &Settings) -> Result<(), AppError> {
    let cache = connect_cache(settings).await?;
    cache.clear().await;
    cache.stop().await;
    Ok(())
}

async fn connect_cache(settings: &Settings) -> Result<QueryCache, AppError> {
    let url = settings
        .remote
        .url
        .as_deref()
        .ok_or_else(|| AppError::validation("remote.url is required for this command"))?;

    let remote = RedisTier::connect(url).await.map_err(InfraError::from)?;
    let remote: Arc<dyn RemoteTier> = Arc::new(remote);
    Ok(QueryCache::new(settings.cache.clone(), remote))
}
