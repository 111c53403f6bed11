use std::collections::HashSet;
use std::sync::Arc;

use clap::Parser;
use snafu::ensure;

use crate::arch::normalize_platform_string;
use crate::error::{GraphSnafu, Result};
use crate::images::ImageGraph;
use crate::project::Project;
use crate::render::StageData;

/// Build and tag top-level images for one profile and platform.
#[derive(Debug, Parser)]
pub struct Build {
    /// Stages to build. Defaults to every stage that has image or push
    /// names.
    image: Vec<String>,

    /// Profile to build. Defaults to the default profile.
    #[clap(long)]
    profile: Option<String>,

    /// Platform to build for. Defaults to the builder's platform.
    #[clap(long)]
    platform: Option<String>,
}

impl Build {
    pub(crate) async fn execute(self, project: Arc<Project>) -> Result<i32> {
        let profile = match self.profile {
            Some(profile) => profile,
            None => project.config().effective_default_profile()?.to_string(),
        };
        let platform = match self.platform {
            Some(platform) => normalize_platform_string(&platform),
            None => project.default_platform().await?,
        };

        let mut graph = ImageGraph::new();
        let stage_mapping = project.render(&mut graph, &profile, &platform)?;

        let requested: HashSet<&str> = self.image.iter().map(String::as_str).collect();
        for name in &requested {
            ensure!(
                stage_mapping.contains_key(*name),
                GraphSnafu {
                    message: format!("reference to unknown stage {name:?}"),
                }
            );
        }

        // Only stages with names anchor the build; everything else they
        // need is included implicitly through the graph.
        let mut stages: Vec<StageData> = stage_mapping
            .into_values()
            .filter(|stage| {
                !stage.config.image_names.is_empty() || !stage.config.push_names.is_empty()
            })
            .filter(|stage| requested.is_empty() || requested.contains(stage.name.as_str()))
            .collect();

        project
            .resolve_source_images(&mut graph, &stages, false, false)
            .await?;
        project
            .resolve_base_images(&mut graph, &mut stages, false)
            .await?;

        let build_ops = project.plan(&mut graph, &stages)?;
        project.build(graph, build_ops).await?;
        Ok(0)
    }
}
