use std::collections::BTreeSet;
use std::sync::Arc;

use clap::Parser;

use crate::cmd::{select_platforms, split_source_argument};
use crate::error::{Error, Result};
use crate::project::Project;

/// Refresh the cached digests of source images.
#[derive(Debug, Parser)]
pub struct SourceUpdate {
    /// Source images to update in repo[:tag] format.
    source: Vec<String>,

    /// Platform to update, can be given multiple times. Defaults to all
    /// configured platforms.
    #[clap(long)]
    platform: Vec<String>,

    /// Drop every cached source image digest first.
    #[clap(long)]
    clear: bool,
}

impl SourceUpdate {
    pub(crate) async fn execute(self, project: Arc<Project>) -> Result<i32> {
        if self.clear {
            project.update_store(|data| data.source.clear())?;
        }

        let source_images: BTreeSet<(String, String)> = self
            .source
            .iter()
            .map(|image| split_source_argument(image))
            .collect();
        let platforms = select_platforms(&self.platform, &project);

        for (repo, tag) in &source_images {
            for platform in &platforms {
                let previous = match project
                    .resolve_image(repo, tag, platform, true, false)
                    .await
                {
                    Ok(digest) => Some(digest),
                    Err(Error::NoSourceImage { .. }) => None,
                    Err(err) => return Err(err),
                };
                let updated = project
                    .resolve_image(repo, tag, platform, false, true)
                    .await?;

                println!("Updated {repo}:{tag} for {platform}");
                println!(
                    "  {} -> {updated}",
                    previous.as_deref().unwrap_or("(none)")
                );
            }
        }
        Ok(0)
    }
}
