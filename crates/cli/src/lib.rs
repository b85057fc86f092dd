use anyhow::{Context, Result};
use artcache_core::{
    CacheConfig, CancellationToken, DecodeParams, DirectoryBlobStore, DpiScale, ImageDecoder,
    ResourceManager, ScalingMode,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "artcache")]
#[command(about = "Resolve, decode and size cached artwork")]
pub struct Cli {
    /// TOML configuration file. Environment variables are used when absent.
    #[arg(long, global = true, env = "ARTCACHE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the recursive size of a directory as JSON.
    DirSize {
        #[arg(value_name = "PATH")]
        path: PathBuf,
        /// Count allocated disk space instead of file lengths.
        #[arg(long)]
        on_disk: bool,
    },
    /// Print where a source resolves to as JSON.
    Resolve {
        #[arg(value_name = "SOURCE")]
        source: String,
        /// Directory backing blob identifiers.
        #[arg(long, value_name = "DIR")]
        blob_dir: Option<PathBuf>,
    },
    /// Decode a source and print its dimensions and cache cost as JSON.
    Decode {
        #[arg(value_name = "SOURCE")]
        source: String,
        #[arg(long, value_name = "DIR")]
        blob_dir: Option<PathBuf>,
        #[arg(long)]
        max_width: Option<u32>,
        #[arg(long)]
        max_height: Option<u32>,
        /// Display scale applied to both bounds.
        #[arg(long)]
        dpi: Option<f64>,
        #[arg(long, default_value_t = ScalingMode::Unspecified)]
        scaling: ScalingMode,
        /// Write the decoded image as PNG.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Serialize)]
struct DirSizeOutput {
    path: String,
    on_disk: bool,
    size_bytes: u64,
}

#[derive(Debug, Serialize)]
struct ResolveOutput {
    source: String,
    kind: &'static str,
    path: Option<String>,
}

#[derive(Debug, Serialize)]
struct DecodeOutput {
    source: String,
    width: u32,
    height: u32,
    cost_bytes: usize,
    scaling: ScalingMode,
    output: Option<String>,
}

/// Install the stderr log subscriber. `RUST_LOG` overrides the `warn` default.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // A subscriber may already be installed when embedded in another binary.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    match cli.command {
        Commands::DirSize { path, on_disk } => {
            run_dir_size(cli.config.as_deref(), &path, on_disk)
        }
        Commands::Resolve { source, blob_dir } => {
            run_resolve(cli.config.as_deref(), &source, blob_dir.as_deref())
        }
        Commands::Decode {
            source,
            blob_dir,
            max_width,
            max_height,
            dpi,
            scaling,
            output,
        } => {
            let mut params = DecodeParams {
                max_width,
                max_height,
                scaling,
                ..DecodeParams::default()
            };
            if let Some(scale) = dpi {
                params.dpi = Some(DpiScale::uniform(scale));
            }
            run_decode(
                cli.config.as_deref(),
                &source,
                blob_dir.as_deref(),
                &params,
                output.as_deref(),
            )
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<CacheConfig> {
    match path {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => CacheConfig::from_env().context("invalid configuration in environment"),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

/// Build a manager, binding a blob store when one is given.
async fn build_manager(config: CacheConfig, blob_dir: Option<&Path>) -> Result<ResourceManager> {
    let manager = ResourceManager::new(config);

    if let Some(dir) = blob_dir {
        if !dir.is_dir() {
            anyhow::bail!("blob directory does not exist: {}", dir.display());
        }
        let store = DirectoryBlobStore::open(dir, Arc::new(ImageDecoder))
            .with_context(|| format!("failed to open blob directory {}", dir.display()))?;
        manager.bind_blob_store(Arc::new(store)).await;
    }

    Ok(manager)
}

fn print_json<T: Serialize>(payload: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(payload)?;
    println!("{json}");
    Ok(())
}

fn run_dir_size(config: Option<&Path>, path: &Path, on_disk: bool) -> Result<()> {
    if !path.is_dir() {
        anyhow::bail!("directory does not exist: {}", path.display());
    }

    let manager = ResourceManager::builder(load_config(config)?)
        .without_web_file_cache()
        .build();
    let size_bytes = manager.get_directory_size(path, on_disk, None)?;

    print_json(&DirSizeOutput {
        path: path.display().to_string(),
        on_disk,
        size_bytes,
    })
}

fn run_resolve(config: Option<&Path>, source: &str, blob_dir: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;

    runtime()?.block_on(async {
        let manager = build_manager(config, blob_dir).await?;
        let location = manager
            .pipeline()
            .resolver()
            .resolve(source)
            .with_context(|| format!("could not resolve '{source}'"))?;

        print_json(&ResolveOutput {
            source: source.to_string(),
            kind: location.kind(),
            path: location.path().map(|path| path.display().to_string()),
        })
    })
}

fn run_decode(
    config: Option<&Path>,
    source: &str,
    blob_dir: Option<&Path>,
    params: &DecodeParams,
    output: Option<&Path>,
) -> Result<()> {
    let config = load_config(config)?;

    runtime()?.block_on(async {
        let manager = build_manager(config, blob_dir).await?;
        let decoded = manager
            .pipeline()
            .try_get_async(source, true, params, &CancellationToken::new())
            .await
            .with_context(|| format!("failed to decode '{source}'"))?;

        if let Some(output) = output {
            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent)?;
            }
            decoded
                .pixels()
                .save_with_format(output, image::ImageFormat::Png)
                .with_context(|| format!("failed to write image to {}", output.display()))?;
        }

        print_json(&DecodeOutput {
            source: source.to_string(),
            width: decoded.width(),
            height: decoded.height(),
            cost_bytes: decoded.cost(),
            scaling: params.scaling,
            output: output.map(|path| path.display().to_string()),
        })
    })
}
