use std::collections::HashSet;
use std::sync::Arc;

use clap::Parser;
use snafu::ensure;

use crate::cmd::select_platforms;
use crate::error::{ConfigurationSnafu, Result};
use crate::images::ImageGraph;
use crate::project::Project;
use crate::render::StageData;

/// Build base images and record their content-addressed build results.
#[derive(Debug, Parser)]
pub struct BaseBuild {
    /// Base image stage names to build. Defaults to all base stages.
    image: Vec<String>,

    /// Profile to build, can be given multiple times. Defaults to all
    /// profiles.
    #[clap(long)]
    profile: Vec<String>,

    /// Platform to build, can be given multiple times. Defaults to all
    /// configured platforms.
    #[clap(long)]
    platform: Vec<String>,

    /// Refresh the digest of every source image first.
    #[clap(long = "update-sources")]
    update_sources: bool,

    /// Rotate the hash salt, forcing every base image to rebuild.
    #[clap(long = "update-salt")]
    update_salt: bool,

    /// Only verify that all requested base images are already built.
    #[clap(long = "check")]
    check: bool,
}

impl BaseBuild {
    pub(crate) async fn execute(self, project: Arc<Project>) -> Result<i32> {
        ensure!(
            !(self.check && self.update_sources),
            ConfigurationSnafu {
                message: "cannot pass --check and --update-sources together",
            }
        );
        if self.update_salt {
            project.rotate_salt()?;
        }

        let images: HashSet<&str> = self.image.iter().map(String::as_str).collect();
        let profiles: Vec<String> = if self.profile.is_empty() {
            project.config().profiles.keys().cloned().collect()
        } else {
            self.profile.clone()
        };
        let platforms = select_platforms(&self.platform, &project);

        // Render every (profile, platform) pair into one shared graph and
        // collect the base stages to build.
        let mut graph = ImageGraph::new();
        let mut stages: Vec<StageData> = Vec::new();
        for profile in &profiles {
            for platform in &platforms {
                let stage_mapping = project.render(&mut graph, profile, platform)?;
                stages.extend(stage_mapping.into_values().filter(|stage| {
                    stage.base_image.is_some()
                        && (images.is_empty() || images.contains(stage.name.as_str()))
                }));
            }
        }

        project
            .resolve_source_images(&mut graph, &stages, self.check, self.update_sources)
            .await?;
        project
            .resolve_base_images(&mut graph, &mut stages, true)
            .await?;

        let build_ops = project.plan(&mut graph, &stages)?;
        if self.check {
            if build_ops.is_empty() {
                return Ok(0);
            }
            println!("{} base image build operations needed", build_ops.len());
            return Ok(1);
        }

        project.build(graph, build_ops).await?;
        Ok(0)
    }
}
