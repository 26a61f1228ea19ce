use anyhow::{Context, Result};
use clap::Parser;
use feedguard::config::{Config, ProcessEnv};
use feedguard::feed::FeedOutput;
use feedguard::fetch::{ErrorKind, FeedFetcher, FetchInput};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Maximum size of a `--input` request file (64 KB).
const MAX_INPUT_FILE_SIZE: u64 = 65_536;

/// Get the default config file path (~/.config/feedguard/config.toml)
fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("feedguard")
        .join("config.toml"))
}

#[derive(Parser, Debug)]
#[command(version, about = "Fetch an RSS/Atom feed through the SSRF guard and print it as JSON")]
struct Args {
    /// Feed URL (http or https)
    url: Option<String>,

    /// Read the request envelope from a JSON file instead of flags
    #[arg(long, value_name = "FILE", conflicts_with = "url")]
    input: Option<PathBuf>,

    /// Maximum number of items to return
    #[arg(long)]
    max_items: Option<usize>,

    /// Authentication scheme: basic or bearer
    #[arg(long, requires = "auth_token")]
    auth_type: Option<String>,

    /// Credential for --auth-type (user:password for basic)
    #[arg(long)]
    auth_token: Option<String>,

    /// Skip certificate validation (refused in production)
    #[arg(long)]
    ignore_tls: bool,

    /// Only return items published at or after this RFC 3339 timestamp
    #[arg(long, value_name = "TIMESTAMP")]
    newer_than: Option<String>,

    /// Drop items with this guid (repeatable)
    #[arg(long = "exclude-guid", value_name = "GUID")]
    exclude_guids: Vec<String>,

    /// User-Agent header value
    #[arg(long)]
    user_agent: Option<String>,

    /// Per-attempt timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Config file path (defaults to ~/.config/feedguard/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl Args {
    fn into_input(self) -> FetchInput {
        FetchInput {
            feed_url: self.url,
            max_items: self.max_items,
            auth_type: self.auth_type,
            auth_token: self.auth_token,
            ignore_tls: self.ignore_tls.then_some(true),
            newer_than: self.newer_than,
            guid_blacklist: (!self.exclude_guids.is_empty()).then_some(self.exclude_guids),
            user_agent: self.user_agent,
            timeout_seconds: self.timeout,
        }
    }
}

fn read_input_file(path: &Path) -> Result<FetchInput> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to read input file: {}", path.display()))?;
    if !metadata.is_file() {
        anyhow::bail!("Input path must be a regular file");
    }
    if metadata.len() > MAX_INPUT_FILE_SIZE {
        anyhow::bail!(
            "Input file is {} bytes (max {} bytes)",
            metadata.len(),
            MAX_INPUT_FILE_SIZE
        );
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid JSON in input file: {}", path.display()))
}

/// Fills fields the caller left out from the config file.
fn apply_config_defaults(mut input: FetchInput, config: &Config) -> FetchInput {
    input.user_agent.get_or_insert_with(|| config.user_agent.clone());
    input.timeout_seconds.get_or_insert(config.timeout_seconds);
    input.max_items.get_or_insert(config.max_items);
    input
}

fn print_output(output: &FeedOutput) -> Result<()> {
    let json = serde_json::to_string_pretty(output).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries only the JSON result
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = Args::parse();

    let config_path = match args.config.take() {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config: {}", config_path.display()))?;

    let input = match args.input.take() {
        Some(path) => read_input_file(&path)?,
        None => args.into_input(),
    };
    tracing::debug!(input = ?input, "Parsed fetch input");

    let request = match apply_config_defaults(input, &config).into_request() {
        Ok(request) => request,
        Err(e) => {
            let output = FeedOutput {
                error_kind: Some(ErrorKind::InvalidRequest),
                ..FeedOutput::failure(format!("Invalid request: {e}"))
            };
            print_output(&output)?;
            std::process::exit(1);
        }
    };

    let fetcher = FeedFetcher::new(&config, Arc::new(ProcessEnv));
    let output = FeedOutput::from(fetcher.fetch(&request).await);
    print_output(&output)?;

    if !output.success {
        std::process::exit(1);
    }
    Ok(())
}
