use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use clap::Parser;
use snafu::{ensure, OptionExt};

use crate::cmd::select_platforms;
use crate::error::{ConfigurationSnafu, GraphSnafu, Result};
use crate::images::{ImageGraph, ImageNode, StageDesc};
use crate::project::Project;
use crate::render::StageData;
use crate::util::{format_simple, params};

/// Build stages for every requested platform and publish them, combining
/// per-platform images into multi-platform manifests.
#[derive(Debug, Parser)]
pub struct Publish {
    /// Images to publish. Use `stage=target` to override the push name for
    /// a stage, or `stage=` to push it under its default push name.
    image: Vec<String>,

    /// Profile to build. Defaults to the default profile.
    #[clap(long)]
    profile: Option<String>,

    /// Platform to publish for, can be given multiple times. Defaults to
    /// all configured platforms.
    #[clap(long)]
    platform: Vec<String>,
}

impl Publish {
    pub(crate) async fn execute(self, project: Arc<Project>) -> Result<i32> {
        let profile = match self.profile {
            Some(profile) => profile,
            None => project.config().effective_default_profile()?.to_string(),
        };
        let platforms = select_platforms(&self.platform, &project);

        // Render every platform into one shared graph, aggregating each
        // stage's per-platform images under a multi-platform node.
        let mut graph = ImageGraph::new();
        let mut multi_stages: BTreeMap<String, StageData> = BTreeMap::new();
        for platform in &platforms {
            let stage_mapping = project.render(&mut graph, &profile, platform)?;
            for (name, mut stage) in stage_mapping {
                // Publishing never assigns local-only names.
                stage.config.image_names.clear();

                match multi_stages.get_mut(&name) {
                    None => {
                        let descs: BTreeSet<StageDesc> = graph
                            .node(stage.image)
                            .stage_descs()
                            .into_iter()
                            .flatten()
                            .map(|desc| StageDesc {
                                platform: "*".to_string(),
                                ..desc.clone()
                            })
                            .collect();
                        let aggregate = graph.add(ImageNode::MultiPlatform {
                            stage_descs: descs,
                            images: vec![(platform.clone(), stage.image)],
                        });
                        stage.image = aggregate;
                        multi_stages.insert(name, stage);
                    }
                    Some(existing) => {
                        ensure!(
                            existing.config.push_names == stage.config.push_names,
                            ConfigurationSnafu {
                                message: format!(
                                    "push names must match across platforms for stage {name:?}"
                                ),
                            }
                        );
                        let ImageNode::MultiPlatform { images, .. } =
                            graph.node_mut(existing.image)
                        else {
                            return crate::error::InternalSnafu {
                                message: "publish stage is not a multi-platform node",
                            }
                            .fail();
                        };
                        images.push((platform.clone(), stage.image));
                    }
                }
            }
        }

        // A single-platform aggregate is just that platform's image.
        for stage in multi_stages.values_mut() {
            let ImageNode::MultiPlatform { images, .. } = graph.node(stage.image) else {
                continue;
            };
            if images.len() == 1 {
                stage.image = images[0].1;
            }
        }

        // Apply `stage=target` overrides and work out what to publish.
        let mut requested: BTreeSet<String> = BTreeSet::new();
        for image_arg in &self.image {
            let (stage_name, target) = match image_arg.split_once('=') {
                Some((stage_name, target)) => (stage_name, Some(target)),
                None => (image_arg.as_str(), None),
            };
            let stage = multi_stages.get_mut(stage_name).context(GraphSnafu {
                message: format!("reference to unknown stage {stage_name:?}"),
            })?;
            requested.insert(stage_name.to_string());
            if let Some(target) = target {
                let push_name = if target.is_empty() {
                    format_simple(
                        &project.config().stage_push_name,
                        &params([
                            ("stage", stage_name),
                            ("profile", profile.as_str()),
                            ("platform", "*"),
                        ]),
                    )?
                } else {
                    target.to_string()
                };
                stage.config.push_names = vec![push_name];
            }
        }

        // Only stages with push names are published explicitly; anything
        // else they need is included implicitly in the build graph.
        let mut stages: Vec<StageData> = multi_stages
            .into_values()
            .filter(|stage| !stage.config.push_names.is_empty())
            .filter(|stage| requested.is_empty() || requested.contains(&stage.name))
            .collect();
        ensure!(
            !stages.is_empty(),
            ConfigurationSnafu {
                message: "nothing to publish; no stage has push names",
            }
        );

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
