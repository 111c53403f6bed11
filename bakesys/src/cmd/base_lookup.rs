use std::sync::Arc;

use clap::Parser;
use snafu::OptionExt;

use crate::error::{ConfigurationSnafu, Result};
use crate::project::Project;

/// Print the resolved repository names of cached base images.
#[derive(Debug, Parser)]
pub struct BaseLookup {
    /// Base image stage names to look up.
    image: Vec<String>,

    /// Profile to look up the base image for. Defaults to the default
    /// profile.
    #[clap(long)]
    profile: Option<String>,

    /// Platform to look up the base image of. Defaults to the builder's
    /// platform.
    #[clap(long)]
    platform: Option<String>,

    /// Only print the content-hash tag.
    #[clap(long = "tag-only")]
    tag_only: bool,
}

impl BaseLookup {
    pub(crate) async fn execute(self, project: Arc<Project>) -> Result<i32> {
        let profile = match self.profile {
            Some(profile) => profile,
            None => project.config().effective_default_profile()?.to_string(),
        };
        let platform = match self.platform {
            Some(platform) => crate::arch::normalize_platform_string(&platform),
            None => project.default_platform().await?,
        };

        for stage in &self.image {
            let record = project
                .with_store(|data| data.cached_base(&profile, stage, &platform).cloned())
                .context(ConfigurationSnafu {
                    message: format!(
                        "base image {stage} ({profile}, {platform}) has never been built"
                    ),
                })?;
            if self.tag_only {
                println!("{}", record.build_hash);
            } else {
                let name = project.base_image_name(
                    &profile,
                    stage,
                    &platform,
                    &record.build_hash,
                    Some(&record.image_digest),
                    false,
                )?;
                println!("{name}");
            }
        }
        Ok(0)
    }
}
