mod base_build;
mod base_lookup;
mod build;
mod publish;
mod source_lookup;
mod source_update;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;

use crate::config::load_user_config;
use crate::error::Result;
use crate::project::Project;
use crate::registry::HttpRegistryClient;
use crate::scope::run_scope;

const DEFAULT_LEVEL_FILTER: LevelFilter = LevelFilter::Warn;

/// A templated, content-addressed container image build tool.
#[derive(Debug, Parser)]
#[clap(about, long_about = None, version)]
pub struct Args {
    /// Set the logging level. One of [off|error|warn|info|debug|trace].
    /// Defaults to warn. You can also leave this unset and use the
    /// RUST_LOG env variable. See https://github.com/rust-cli/env_logger/
    #[clap(long = "log-level")]
    pub log_level: Option<LevelFilter>,

    /// Base directory of the project.
    #[clap(short = 'C', long = "base-dir", default_value = ".")]
    base_dir: PathBuf,

    /// Maximum concurrent build jobs; 0 means the machine's parallelism.
    #[clap(long = "build-jobs")]
    build_jobs: Option<usize>,

    /// Maximum concurrent push or pull jobs.
    #[clap(long = "push-jobs")]
    push_jobs: Option<usize>,

    /// Path to a containers-auth.json credentials file.
    #[clap(long = "auth-file")]
    auth_file: Option<PathBuf>,

    /// Disable registry certificate verification.
    #[clap(long = "insecure")]
    insecure: bool,

    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, Parser)]
pub enum Subcommand {
    /// Build and tag top-level images.
    Build(build::Build),

    /// Build base images, updating the cached build records.
    BaseBuild(base_build::BaseBuild),

    /// Print the resolved names of base images.
    BaseLookup(base_lookup::BaseLookup),

    /// Build images for every configured platform and publish them as
    /// multi-platform manifests.
    Publish(publish::Publish),

    /// Resolve a source image and print its digest.
    SourceLookup(source_lookup::SourceLookup),

    /// Refresh cached source image digests.
    SourceUpdate(source_update::SourceUpdate),

    /// Print version information.
    Version,
}

/// Entrypoint for the `bakesys` command line program. Returns the process
/// exit code.
pub async fn run(args: Args) -> Result<i32> {
    if matches!(args.subcommand, Subcommand::Version) {
        println!("bakesys {}", env!("CARGO_PKG_VERSION"));
        return Ok(0);
    }

    let mut user_config = load_user_config(&args.base_dir)?;
    if let Some(build_jobs) = args.build_jobs {
        user_config.build_jobs = build_jobs;
    }
    if let Some(push_jobs) = args.push_jobs {
        user_config.push_jobs = push_jobs;
    }
    if let Some(auth_file) = args.auth_file {
        user_config.auth_file = Some(auth_file);
    }
    if args.insecure {
        user_config.insecure = true;
    }
    user_config.validate()?;

    let registry = HttpRegistryClient::new(
        user_config.auth_file.as_deref(),
        user_config.insecure,
        user_config.cafile.as_deref(),
    )?;
    let project = Project::open(args.base_dir, user_config, Box::new(registry))?;

    run_scope(|_| async move {
        match args.subcommand {
            Subcommand::Build(command) => command.execute(project).await,
            Subcommand::BaseBuild(command) => command.execute(project).await,
            Subcommand::BaseLookup(command) => command.execute(project).await,
            Subcommand::Publish(command) => command.execute(project).await,
            Subcommand::SourceLookup(command) => command.execute(project).await,
            Subcommand::SourceUpdate(command) => command.execute(project).await,
            Subcommand::Version => Ok(0),
        }
    })
    .await
}

/// Use `level` if present, or else use `RUST_LOG` if present, or else use
/// a default.
pub fn init_logger(level: Option<LevelFilter>) {
    match (std::env::var(env_logger::DEFAULT_FILTER_ENV).ok(), level) {
        (Some(_), None) => {
            // RUST_LOG exists and level does not; use the environment variable.
            Builder::from_default_env().init();
        }
        _ => {
            // use provided log level or default for this crate only.
            Builder::new()
                .filter(
                    Some(env!("CARGO_CRATE_NAME")),
                    level.unwrap_or(DEFAULT_LEVEL_FILTER),
                )
                .init();
        }
    }
}

/// Split a `repo[:tag]` argument, defaulting the tag to `latest`.
pub(crate) fn split_source_argument(image: &str) -> (String, String) {
    let slash = image.rfind('/').map(|pos| pos + 1).unwrap_or(0);
    match image[slash..].find(':') {
        Some(colon) => (
            image[..slash + colon].to_string(),
            image[slash + colon + 1..].to_string(),
        ),
        None => (image.to_string(), "latest".to_string()),
    }
}

/// Resolve the platforms a command should operate on: the explicit list,
/// or every configured platform.
pub(crate) fn select_platforms(requested: &[String], project: &Arc<Project>) -> Vec<String> {
    if requested.is_empty() {
        project.config().platforms.clone()
    } else {
        requested
            .iter()
            .map(|platform| crate::arch::normalize_platform_string(platform))
            .collect()
    }
}
