use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use querykit::cache::KeyPattern;
use querykit::config::{CacheConfig, Config};
use querykit::{http, QueryClient, QueryOptions};
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "querykit")]
#[command(about = "Fetch JSON documents through a persistent query cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/querykit/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch a JSON document, serving it from cache while fresh
  Get {
    url: String,
    /// Skip the cache and fetch again
    #[arg(long)]
    refresh: bool,
  },
  /// Drop the cached copy of a URL, or everything when no URL is given
  Clear { url: Option<String> },
  /// Show cache statistics
  Stats,
}

fn init_logging() -> Result<WorkerGuard> {
  let dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("querykit");
  std::fs::create_dir_all(&dir)?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(
    &dir,
    "querykit.log",
  ));
  let filter = EnvFilter::try_from_env("QUERYKIT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging()?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // The CLI runs one request per process, so fetched documents are always persisted.
  let mut cache = config.cache.clone();
  cache.persistence.enabled = true;
  cache.persistence.keys.push("http".to_string());

  let client = QueryClient::from_config(&cache)?;
  client.init();

  let outcome = run(args.command, &client, &cache, &config).await;
  client.shutdown().await;
  outcome
}

async fn run(
  command: Command,
  client: &QueryClient,
  cache: &CacheConfig,
  config: &Config,
) -> Result<()> {
  match command {
    Command::Get { url, refresh } => {
      let url = Url::parse(&url)?;
      let key = http::url_key(&url);
      let fetcher = http::json_fetcher(http::client(&config.http)?, url);
      let options = QueryOptions::default().with_background_refetch(false);

      let data = if refresh {
        client.refetch(&key, fetcher, &options).await?
      } else {
        let result = client.fetch(&key, fetcher, &options).await?;
        info!(key = %key, source = ?result.source, "Served");
        result.data
      };
      println!("{}", serde_json::to_string_pretty(&data)?);
    }
    Command::Clear { url: Some(url) } => {
      let key = http::url_key(&Url::parse(&url)?);
      client.clear(Some(&KeyPattern::exact(key.clone())));
      println!("Cleared {}", key);
    }
    Command::Clear { url: None } => {
      client.clear(None);
      let store = cache.persistence.open_store()?;
      println!("Cleared {} cached documents", store.clear_all()?);
    }
    Command::Stats => {
      let stats = client.stats();
      let store = cache.persistence.open_store()?;
      println!("persisted documents: {}", store.count()?);
      println!("in-memory queries:   {}", stats.total_queries);
      println!("hit rate:            {:.2}", stats.hit_rate);
    }
  }
  Ok(())
}
