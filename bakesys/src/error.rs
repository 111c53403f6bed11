/*!
Error types shared across the crate.

Every failure is classified into one of a small set of kinds so that the
command line entrypoint can map it to a distinct exit code. Variants carry
whatever structured context is useful for diagnosis; the template variant
additionally carries a secondary multi-line message with the template frame
chain.
*/

use std::path::PathBuf;

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Malformed or inconsistent project or user configuration.
    #[snafu(display("configuration error: {message}"))]
    Configuration { message: String },

    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse config file {}: {source}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Expansion or rendering of a template failed. `frames` holds the
    /// template frame chain for diagnosis and may be empty.
    #[snafu(display("template error: {message}"))]
    Template { message: String, frames: String },

    /// Invalid ignore pattern syntax or an unsupported file encountered
    /// while packaging a build context.
    #[snafu(display("context error: {message}"))]
    Context { message: String },

    #[snafu(display("failed to read context path {}: {source}", path.display()))]
    ContextRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Cycle detected, duplicate stage name, reference to an unknown stage.
    #[snafu(display("{message}"))]
    Graph { message: String },

    /// Source image cache miss while resolving with `check_only` set. Kept
    /// distinct from general registry failures so callers can decide to
    /// attempt a fetch instead.
    #[snafu(display("no source image cached for {image}"))]
    NoSourceImage { image: String },

    #[snafu(display("registry error: {message}"))]
    Registry { message: String },

    #[snafu(display("registry request to {url} failed: {source}"))]
    RegistryRequest { url: String, source: reqwest::Error },

    /// The external builder, tag, push, pull, or untag command failed.
    #[snafu(display("client error: {message}"))]
    Client { message: String },

    #[snafu(display("failed to access build data {}: {source}", path.display()))]
    StoreWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("build data {} is invalid: {source}", path.display()))]
    StoreParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("cancelled"))]
    Cancelled,

    /// Invariant violation; treat as a bug.
    #[snafu(display("internal error: {message}"))]
    Internal { message: String },
}

impl Error {
    /// Map the error kind to the process exit code reported by the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Configuration { .. }
            | Error::ConfigRead { .. }
            | Error::ConfigParse { .. }
            | Error::StoreWrite { .. }
            | Error::StoreParse { .. } => 3,
            Error::Template { .. } => 4,
            Error::Context { .. } | Error::ContextRead { .. } => 5,
            Error::Graph { .. } => 6,
            Error::NoSourceImage { .. } => 7,
            Error::Registry { .. } | Error::RegistryRequest { .. } => 8,
            Error::Client { .. } => 9,
            Error::Cancelled => 130,
            Error::Internal { .. } => 2,
        }
    }

    /// Additional diagnostic text printed after the error message, if any.
    pub fn secondary_message(&self) -> Option<&str> {
        match self {
            Error::Template { frames, .. } if !frames.is_empty() => Some(frames),
            _ => None,
        }
    }
}
