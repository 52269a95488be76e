//! Exposes the command line application.
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use url::Url;

use netcache_service::caching::{self, CACHE_VERSION, DataStream, FsBackend, MemoryBackend};
use netcache_service::config::Config;
use netcache_service::http_cache::HttpCache;
use netcache_service::metrics;
use netcache_service::service::{CacheService, ServiceBackend};
use netcache_service::transaction::{Admission, LoadFlags, RequestInfo, ResponseInfo};

use crate::logging;

/// The request a command operates on.
#[derive(Args, Debug, Clone)]
struct RequestArgs {
    /// The requested URL.
    url: Url,

    /// The request method.
    #[arg(long, short = 'X', default_value = "GET")]
    method: String,

    /// A request header, like `Accept-Language: de`. Can be given multiple times.
    #[arg(long = "header", short = 'H', value_name = "NAME: VALUE")]
    headers: Vec<String>,

    /// Identifies the request body of a `POST`.
    #[arg(long)]
    upload_id: Option<u64>,
}

impl RequestArgs {
    fn to_request(&self) -> Result<RequestInfo> {
        let mut request = RequestInfo::new(self.method.clone(), self.url.clone());
        for header in &self.headers {
            let (name, value) = parse_header(header)?;
            request = request.with_header(name, value);
        }
        if let Some(upload_id) = self.upload_id {
            request = request.with_upload_id(upload_id);
        }
        Ok(request)
    }
}

fn parse_header(header: &str) -> Result<(&str, &str)> {
    match header.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value.trim())),
        _ => bail!("invalid header `{header}`, expected `NAME: VALUE`"),
    }
}

/// netcache commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Print the cache key of a request and where its entry is stored.
    Key {
        #[command(flatten)]
        request: RequestArgs,
    },

    /// Run a request through the cache and print the response body.
    ///
    /// When the response has to be fetched, it is read from the file given with `--body`, and
    /// stored in the cache.
    Get {
        #[command(flatten)]
        request: RequestArgs,

        /// A file with the response body, standing in for the network.
        #[arg(long, value_name = "FILE")]
        body: Option<PathBuf>,

        /// The status code of a fetched response.
        #[arg(long, default_value_t = 200)]
        status: u16,

        /// Only use a cached response.
        #[arg(long, conflicts_with = "bypass")]
        only_from_cache: bool,

        /// Ignore a cached response, and replace it.
        #[arg(long)]
        bypass: bool,
    },

    /// Remove the cached response of a request.
    Doom {
        #[command(flatten)]
        request: RequestArgs,
    },

    /// Clean local caches.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(bin_name = "netcache", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded, the runtime is started further below.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    if let Command::Cleanup { dry_run } = cli.command {
        return caching::cleanup(config, dry_run).context("failed to clean up caches");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(async {
        let mut stdout = io::stdout().lock();
        match FsBackend::from_config(&config).context("failed to open the cache directory")? {
            Some(backend) => {
                backend
                    .clear_tmp()
                    .context("failed to clear the tmp directory")?;
                let cache = HttpCache::from_config(backend, &config);
                run(CacheService::spawn(cache), cli.command, &mut stdout).await
            }
            None => {
                tracing::warn!("No `cache_dir` configured, responses are only cached in memory");
                let cache = HttpCache::from_config(MemoryBackend::new(), &config);
                run(CacheService::spawn(cache), cli.command, &mut stdout).await
            }
        }
    })
}

async fn run<B: ServiceBackend>(
    service: CacheService<B>,
    command: Command,
    out: &mut impl Write,
) -> Result<()> {
    match command {
        Command::Key { request } => {
            let request = request.to_request()?;
            let key = service
                .with_cache(move |cache| cache.generate_cache_key(&request))
                .await?;
            writeln!(out, "{}", key.metadata())?;
            writeln!(out, "path: {}", key.cache_path(CACHE_VERSION))?;
        }
        Command::Doom { request } => {
            let request = request.to_request()?;
            let was_active = service
                .with_cache(move |cache| {
                    let key = cache.generate_cache_key(&request);
                    cache.doom_entry(&key)
                })
                .await?;
            tracing::info!(was_active, "Doomed cache entry");
        }
        Command::Get {
            request,
            body,
            status,
            only_from_cache,
            bypass,
        } => {
            let mut request = request.to_request()?;
            if only_from_cache {
                request = request.with_load_flags(LoadFlags::ONLY_FROM_CACHE);
            }
            if bypass {
                request = request.with_load_flags(LoadFlags::BYPASS_CACHE);
            }
            let response = get(&service, request, body.as_deref(), status).await?;
            out.write_all(&response)?;
        }
        Command::Cleanup { .. } => bail!("cleanup does not use the cache service"),
    }
    Ok(())
}

/// Runs `request` through the cache, returning the response body.
async fn get<B: ServiceBackend>(
    service: &CacheService<B>,
    request: RequestInfo,
    body: Option<&Path>,
    status: u16,
) -> Result<Vec<u8>> {
    let url = request.url.clone();
    let mut transaction = service
        .begin(request)
        .await
        .with_context(|| format!("failed to load `{url}`"))?;

    match transaction.admission() {
        Admission::Reader => {
            tracing::debug!(%url, "Serving from cache");
            Ok(transaction
                .read_to_end(DataStream::ResponseContent)
                .await?)
        }
        Admission::Writer => {
            // without revalidation, any complete stored response is usable
            match transaction.read_response_info().await {
                Ok(info) if !info.truncated => {
                    tracing::debug!(%url, status = info.status, "Serving from cache");
                    transaction.convert_to_reader().await?;
                    return Ok(transaction
                        .read_to_end(DataStream::ResponseContent)
                        .await?);
                }
                _ => {}
            }

            let content = fetch(body)?;
            tracing::debug!(%url, size = content.len(), "Storing response");
            let headers = vec![("Content-Length".to_owned(), content.len().to_string())];
            transaction
                .write_response_info(ResponseInfo::fresh(status, headers))
                .await?;
            transaction
                .write_data(DataStream::ResponseContent, 0, content.clone(), true)
                .await?;
            transaction.finish_writing(true).await?;
            Ok(content)
        }
        Admission::Bypass => {
            tracing::debug!(%url, "Not using the cache");
            fetch(body)
        }
        Admission::Pending => bail!("transaction for `{url}` was never admitted"),
    }
}

fn fetch(body: Option<&Path>) -> Result<Vec<u8>> {
    let Some(path) = body else {
        bail!("the response is not cached, and no `--body` was given");
    };
    fs::read(path).with_context(|| format!("failed to read `{}`", path.display()))
}
