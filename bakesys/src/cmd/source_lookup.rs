use std::sync::Arc;

use clap::Parser;

use crate::cmd::split_source_argument;
use crate::error::Result;
use crate::project::Project;

/// Resolve source images and print their digests.
#[derive(Debug, Parser)]
pub struct SourceLookup {
    /// Source images to look up in repo[:tag] format.
    source: Vec<String>,

    /// Platform to look up. Defaults to the builder's platform.
    #[clap(long)]
    platform: Option<String>,

    /// Only print the digest of each source image.
    #[clap(long = "digest-only")]
    digest_only: bool,
}

impl SourceLookup {
    pub(crate) async fn execute(self, project: Arc<Project>) -> Result<i32> {
        let platform = match self.platform {
            Some(platform) => crate::arch::normalize_platform_string(&platform),
            None => project.default_platform().await?,
        };

        for image in &self.source {
            let (repo, tag) = split_source_argument(image);
            let digest = project
                .resolve_image(&repo, &tag, &platform, true, false)
                .await?;
            if self.digest_only {
                println!("{digest}");
            } else {
                println!("{repo}@{digest}");
            }
        }
        Ok(0)
    }
}
