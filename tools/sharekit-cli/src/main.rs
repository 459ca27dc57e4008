//! Command-line harness for the ShareKit offline worker.
//!
//! Provides commands for:
//! - Installing the worker (precaching the app shell from a live origin)
//! - Fetching paths through the worker, cache-first
//! - Uploading an image through the share target
//! - Reading back the stored image
//!
//! ## Usage
//!
//! ```bash
//! # Precache the app shell and keep state in ./state
//! sharekit --origin http://localhost:8080/ --data-dir state install
//!
//! # Served from the cache, no network needed
//! sharekit --origin http://localhost:8080/ --data-dir state fetch icon.png
//!
//! # Share an image, then read it back
//! sharekit --origin http://localhost:8080/ --data-dir state upload cat.png
//! sharekit --origin http://localhost:8080/ --data-dir state show-image --output out.png
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use http::{header, HeaderValue, Method};
use sharekit_cache::CacheStorage;
use sharekit_common::{init_logging, unix_millis, LogConfig};
use sharekit_idb::IDBFactory;
use sharekit_net::{Blob, Fetcher, FormData, LoaderConfig, NetworkFetcher, Request, Response};
use sharekit_sw::{
    decode_data_url, load_image, open_image_db, FetchDecision, ServiceWorker,
    ServiceWorkerContainer, WorkerConfig,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sharekit")]
#[command(about = "Drive the ShareKit offline worker from the command line")]
struct Cli {
    /// JSON worker configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Origin and path the worker controls (overrides the config scope)
    #[arg(long, global = true)]
    origin: Option<String>,

    /// Directory for cache and database snapshots
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the worker: precache the app shell and activate
    Install,

    /// Request a path (relative to the scope) through the worker
    Fetch {
        /// Path relative to the scope
        path: String,
        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
        /// Write the response body to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Upload an image through the share target
    Upload {
        /// Image file
        file: PathBuf,
        /// MIME type (guessed from the extension if omitted)
        #[arg(long)]
        mime: Option<String>,
    },

    /// Show the stored shared image
    ShowImage {
        /// Write the decoded image to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(LogConfig::from_flags(cli.verbose, cli.json_logs))
        .context("failed to initialize logging")?;

    let config = load_config(&cli).await?;
    let network: Arc<dyn Fetcher> = Arc::new(
        NetworkFetcher::new(LoaderConfig::default()).context("failed to create HTTP client")?,
    );
    let worker = build_worker(config, network.clone()).await?;

    match cli.command {
        Commands::Install => install(worker, network).await,
        Commands::Fetch {
            path,
            method,
            output,
        } => fetch(&worker, network.as_ref(), &path, &method, output.as_deref()).await,
        Commands::Upload { file, mime } => upload(&worker, &file, mime.as_deref()).await,
        Commands::ShowImage { output } => show_image(&worker, output.as_deref()).await,
    }
}

async fn load_config(cli: &Cli) -> Result<WorkerConfig> {
    let mut config = match cli.config {
        Some(ref path) => WorkerConfig::load(path).await?,
        None => WorkerConfig::default(),
    };
    if let Some(ref origin) = cli.origin {
        config = config.with_scope(origin.as_str());
    }
    if let Some(ref dir) = cli.data_dir {
        config = config.with_data_dir(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn build_worker(config: WorkerConfig, network: Arc<dyn Fetcher>) -> Result<ServiceWorker> {
    let (caches, idb) = match config.data_dir {
        Some(ref dir) => {
            let caches = CacheStorage::with_storage(dir)
                .await
                .with_context(|| format!("failed to load caches from {}", dir.display()))?;
            let (idb, _events) = IDBFactory::with_storage(&dir.join("idb"))
                .await
                .with_context(|| format!("failed to load databases from {}", dir.display()))?;
            (caches, idb)
        }
        None => {
            warn!("No data directory; state is discarded on exit");
            (CacheStorage::new(), IDBFactory::default())
        }
    };

    Ok(ServiceWorker::new(config, caches, network, idb)?)
}

async fn install(worker: ServiceWorker, network: Arc<dyn Fetcher>) -> Result<()> {
    let (container, _events) = ServiceWorkerContainer::new(network);
    let cache_name = worker.config().cache_name.clone();
    let caches = worker.caches().clone();

    let registration = container
        .register(worker)
        .await
        .context("install failed")?;

    println!("Scope:  {}", registration.scope);
    println!("Worker: #{} ({:?})", registration.worker_id.raw(), registration.state);

    let cache = caches.open(&cache_name).await?;
    let mut keys = cache.keys().await;
    keys.sort();
    println!("Cache {:?}:", cache_name);
    for key in keys {
        println!("  {}", key);
    }
    Ok(())
}

async fn fetch(
    worker: &ServiceWorker,
    network: &dyn Fetcher,
    path: &str,
    method: &str,
    output: Option<&Path>,
) -> Result<()> {
    let url = worker
        .scope()
        .join(path)
        .with_context(|| format!("invalid path {:?}", path))?;
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid method {:?}", method))?;

    let response = match worker.on_fetch(Request::new(method, url)) {
        FetchDecision::RespondWith(future) => future.await?,
        FetchDecision::Passthrough(request) => network.fetch(&request).await?,
    };

    print_response(&response);

    match output {
        Some(path) => {
            tokio::fs::write(path, &response.body)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Body written to: {}", path.display());
        }
        None => {
            if let Ok(text) = std::str::from_utf8(&response.body) {
                println!();
                println!("{}", text);
            }
        }
    }
    Ok(())
}

async fn upload(worker: &ServiceWorker, file: &Path, mime: Option<&str>) -> Result<()> {
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;

    let mime_type = match mime {
        Some(explicit) => explicit
            .parse::<mime::Mime>()
            .with_context(|| format!("invalid MIME type {:?}", explicit))?,
        None => mime_guess::from_path(file).first_or_octet_stream(),
    };
    if mime_type.type_() != mime::IMAGE {
        warn!(mime = %mime_type, "Uploading a non-image file");
    }

    let mut blob = Blob::new(mime_type.essence_str(), data);
    if let Some(name) = file.file_name().and_then(|n| n.to_str()) {
        blob = blob.with_name(name);
    }
    let size = blob.size();

    let mut form = FormData::new();
    form.append_file(&worker.config().image_field, blob);
    let (body, content_type) = form.to_multipart(&format!("----sharekit{}", unix_millis()));

    let request = Request::post(worker.scope().clone(), body).header(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)?,
    );

    let response = match worker.on_fetch(request) {
        FetchDecision::RespondWith(future) => future.await?,
        FetchDecision::Passthrough(request) => bail!("upload to {} was not intercepted", request.url),
    };

    info!(bytes = size, mime = %mime_type, "Image uploaded");
    print_response(&response);
    Ok(())
}

async fn show_image(worker: &ServiceWorker, output: Option<&Path>) -> Result<()> {
    let config = worker.config();
    let db = open_image_db(worker.idb(), &config.database).await?;

    let Some(record) = load_image(&db, config).await? else {
        println!("No image stored");
        return Ok(());
    };

    let (mime_type, data) = decode_data_url(&record.data)?;
    println!("Record: {}", record.id);
    println!("Type:   {}", mime_type);
    println!("Size:   {} bytes", data.len());

    if let Some(path) = output {
        tokio::fs::write(path, &data)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Image written to: {}", path.display());
    }
    Ok(())
}

fn print_response(response: &Response) {
    if response.is_network_error() {
        println!("Network error");
        return;
    }
    println!("HTTP {} {}", response.status, response.status_text);
    for (name, value) in response.headers.iter() {
        println!("{}: {}", name, String::from_utf8_lossy(value.as_bytes()));
    }
    println!("({} bytes)", response.body.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "sharekit",
            "fetch",
            "icon.png",
            "--origin",
            "http://localhost:8080/",
            "-X",
            "head",
        ])
        .unwrap();

        assert_eq!(cli.origin.as_deref(), Some("http://localhost:8080/"));
        match cli.command {
            Commands::Fetch { path, method, .. } => {
                assert_eq!(path, "icon.png");
                assert_eq!(method, "head");
            }
            _ => panic!("expected fetch"),
        }
    }

    #[tokio::test]
    async fn test_load_config_applies_overrides() {
        let cli = Cli::try_parse_from([
            "sharekit",
            "--origin",
            "https://example.com/app/",
            "--data-dir",
            "/tmp/sharekit",
            "install",
        ])
        .unwrap();

        let config = load_config(&cli).await.unwrap();
        assert_eq!(config.scope, "https://example.com/app/");
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/sharekit")));
    }
}
