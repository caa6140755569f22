//! Shorts publisher
//!
//! One-shot CLI that:
//! 1. Resolves an upload credential for the bound channel (cached, refreshed,
//!    or newly authorized through interactive consent)
//! 2. Uploads a rendered short through a resumable session
//! 3. Writes run metrics to a textfile for the node exporter

mod cli;
mod config;
mod metrics;

use std::path::Path;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use youtube_auth::{CredentialManager, TokenCache, encode_identity};
use youtube_upload::{Uploader, VideoMetadata};

use crate::cli::{Cli, Command, UploadArgs};
use crate::config::Config;

const USER_AGENT: &str = concat!("shorts-publisher/", env!("CARGO_PKG_VERSION"));

/// Exit statuses, in the sysexits spirit for config errors.
const EXIT_FAILURE: u8 = 1;
const EXIT_MALFORMED_IDENTITY: u8 = 2;
const EXIT_AUTHORIZATION: u8 = 3;
const EXIT_UPLOAD: u8 = 4;
const EXIT_CONFIG: u8 = 78;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // JSON logs on stderr; stdout carries command output only
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "command failed");
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let Cli { config, command } = cli;
    let name = command.name();
    match command {
        Command::EncodeIdentity { input, output } => {
            run_encode_identity(&input, output.as_deref())
        }
        Command::Auth => {
            let run = RunContext::start(config.as_deref(), name)?;
            let result = run_auth(&run.config).await;
            run.finish(result)
        }
        Command::Upload(args) => {
            let run = RunContext::start(config.as_deref(), name)?;
            let result = run_upload(&run.config, &args).await;
            run.finish(result)
        }
    }
}

/// Loaded config and metrics for a command that talks to the provider.
struct RunContext {
    config: Config,
    prometheus: PrometheusHandle,
    command: &'static str,
    started: Instant,
}

impl RunContext {
    fn start(config_path: Option<&Path>, command: &'static str) -> Result<Self> {
        let config_path = Config::resolve_path(config_path);
        let config = Config::load(&config_path)
            .with_context(|| format!("loading config from {}", config_path.display()))?;
        info!(config = %config_path.display(), command, "starting shorts-publisher");

        let prometheus = metrics::install_recorder()?;
        Ok(Self {
            config,
            prometheus,
            command,
            started: Instant::now(),
        })
    }

    /// Record the run and flush the textfile; the command's result passes through.
    fn finish(self, result: Result<()>) -> Result<()> {
        metrics::record_run(
            self.command,
            result.is_ok(),
            self.started.elapsed().as_secs_f64(),
        );
        if let Some(path) = &self.config.metrics.textfile
            && let Err(e) = metrics::write_textfile(&self.prometheus, path)
        {
            // Losing metrics never changes the command's outcome
            warn!(error = %format!("{e:#}"), path = %path.display(), "failed to write metrics textfile");
        }
        result
    }
}

fn http_client(config: &Config) -> Result<reqwest::Client> {
    // Resumable uploads answer 308 without a Location; it must reach us
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(config.upload.timeout_secs))
        .build()
        .context("building HTTP client")
}

fn credential_manager(config: &Config, client: reqwest::Client) -> CredentialManager {
    CredentialManager::new(
        config.auth.identity_source(),
        TokenCache::new(config.auth.token_path.clone()),
        config.auth.consent_flow(),
        client,
    )
    .with_expiry_skew(config.auth.expiry_skew())
}

async fn run_auth(config: &Config) -> Result<()> {
    let client = http_client(config)?;
    let manager = credential_manager(config, client);
    let resolution = manager.resolve().await?;

    println!(
        "credential {} (expires at {} ms since epoch, token cache {})",
        resolution.outcome.label(),
        resolution.credential.expiry,
        manager.token_cache().path().display()
    );
    Ok(())
}

async fn run_upload(config: &Config, args: &UploadArgs) -> Result<()> {
    let metadata = build_metadata(config, args);
    // Bad metadata should fail before any interactive consent
    metadata.validate()?;

    let client = http_client(config)?;
    let manager = credential_manager(config, client.clone());
    let resolution = manager.resolve().await?;

    let uploader = Uploader::new(
        client,
        config.upload.endpoint.clone(),
        config.upload.chunk_size,
    )?
    .with_timeout(Duration::from_secs(config.upload.timeout_secs));

    let mut last_logged = 0u64;
    let video = uploader
        .upload(&resolution.credential, &args.file, &metadata, |progress| {
            let percent = progress.percent() as u64;
            if percent >= last_logged + 10 || progress.bytes_sent == progress.total {
                last_logged = percent;
                info!(
                    bytes_sent = progress.bytes_sent,
                    total = progress.total,
                    percent,
                    "upload progress"
                );
            }
        })
        .await?;

    info!(video_id = %video.id, "upload complete");
    println!("{}", video.id);
    Ok(())
}

/// Merge CLI arguments with the `[upload]` defaults.
fn build_metadata(config: &Config, args: &UploadArgs) -> VideoMetadata {
    let mut metadata = VideoMetadata::new(args.title.clone());
    metadata.description = args.description.clone();
    metadata.category_id = args
        .category
        .clone()
        .unwrap_or_else(|| config.upload.category.clone());
    metadata.tags = args.tags.clone();
    metadata.privacy_status = args.privacy.unwrap_or(config.upload.privacy_status);
    metadata
}

fn run_encode_identity(input: &Path, output: Option<&Path>) -> Result<()> {
    let json = std::fs::read_to_string(input)
        .with_context(|| format!("reading {}", input.display()))?;
    let encoded = encode_identity(&json)?;

    match output {
        Some(path) => {
            std::fs::write(path, format!("{encoded}\n"))
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "identity document written");
        }
        None => println!("{encoded}"),
    }
    Ok(())
}

/// Map a failed run to its process exit status.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<youtube_auth::Error>() {
        return match e {
            youtube_auth::Error::MalformedIdentity(_) => EXIT_MALFORMED_IDENTITY,
            youtube_auth::Error::Authorization(_) => EXIT_AUTHORIZATION,
            _ => EXIT_FAILURE,
        };
    }
    if err.downcast_ref::<youtube_upload::Error>().is_some() {
        return EXIT_UPLOAD;
    }
    if err.downcast_ref::<common::Error>().is_some() {
        return EXIT_CONFIG;
    }
    EXIT_FAILURE
}
