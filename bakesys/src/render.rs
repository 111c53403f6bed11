/*!
Build document rendering.

Template expansion itself is a pluggable black box behind
[`TemplateEngine`]; what this module owns is the line-oriented build
document the expansion produces. The parser turns it into a map of named
stages over the image graph, leaving name references (`FROM app`,
`COPY --from=assets ...`) as late [`Reference`] nodes that a post-pass
resolves against stages, contexts, `scratch`, and external images.

[`Reference`]: crate::images::ImageNode::Reference
*/

use std::collections::{BTreeMap, BTreeSet, HashSet};

use snafu::ensure;

use crate::config::{ProjectConfig, StageConfig};
use crate::error::{GraphSnafu, Result};
use crate::graph::{visit_graph, VisitAction};
use crate::images::{ImageGraph, ImageId, ImageNode, StageDesc};
use crate::util::{extract_command_flags, format_command_with_flags, format_simple, params};

/// Expands template text against a set of string variables.
pub trait TemplateEngine: Send + Sync {
    fn expand(&self, text: &str, vars: &BTreeMap<String, String>) -> Result<String>;
}

/// The built-in engine: `{name}` parameter substitution with `{{`/`}}`
/// escapes, the same grammar used for client commands.
pub struct SimpleTemplateEngine;

impl TemplateEngine for SimpleTemplateEngine {
    fn expand(&self, text: &str, vars: &BTreeMap<String, String>) -> Result<String> {
        format_simple(text, vars)
    }
}

/// A rendered build stage: its final image plus the configuration that
/// decides how the result is tagged and pushed. Contexts appear in the
/// stage map too, with an empty configuration.
#[derive(Clone, Debug)]
pub struct StageData {
    pub name: String,
    pub image: ImageId,
    pub config: StageConfig,
    /// The Base node wrapping this stage's image when the stage is a
    /// content-addressed base.
    pub base_image: Option<ImageId>,
}

/// Escape a literal path so it can be injected into an ignore pattern
/// list without being interpreted.
pub fn escape_pattern(path: &str) -> String {
    let mut result = String::with_capacity(path.len());
    for (idx, ch) in path.chars().enumerate() {
        match ch {
            '*' | '?' | '[' | ']' | '\\' => {
                result.push('\\');
                result.push(ch);
            }
            '!' | '#' if idx == 0 => {
                result.push('\\');
                result.push(ch);
            }
            _ => result.push(ch),
        }
    }
    result
}

/// Parse an expanded build document into stages. `contexts` maps context
/// names to their already-created Context nodes; they are folded into the
/// returned stage map so name references can reach them.
pub fn parse_document(
    graph: &mut ImageGraph,
    document: &str,
    config: &ProjectConfig,
    profile: &str,
    platform: &str,
    contexts: &BTreeMap<String, ImageId>,
) -> Result<BTreeMap<String, StageData>> {
    let mut stages: BTreeMap<String, StageData> = contexts
        .iter()
        .map(|(name, image)| {
            (
                name.clone(),
                StageData {
                    name: name.clone(),
                    image: *image,
                    config: StageConfig::default(),
                    base_image: None,
                },
            )
        })
        .collect();
    let mut stage_order: Vec<String> = Vec::new();
    let mut current: Option<(String, ImageId)> = None;

    let finish_stage = |graph: &mut ImageGraph,
                            stages: &mut BTreeMap<String, StageData>,
                            name: String,
                            image: ImageId|
     -> Result<()> {
        let stage_config = match config.stages.get(&name) {
            Some(stage_config) => stage_config.clone(),
            None => StageConfig {
                base: false,
                image_names: vec![format_simple(
                    &config.stage_image_name,
                    &params([
                        ("stage", name.as_str()),
                        ("profile", profile),
                        ("platform", platform),
                    ]),
                )?],
                push_names: Vec::new(),
            },
        };

        let (image, base_image) = if stage_config.base {
            let base = graph.add(ImageNode::Base {
                profile: profile.to_string(),
                stage: name.clone(),
                platform: platform.to_string(),
                image: Some(image),
                content_hash: None,
                digest: None,
            });
            (base, Some(base))
        } else {
            (image, None)
        };

        stages.insert(
            name.clone(),
            StageData {
                name,
                image,
                config: stage_config,
                base_image,
            },
        );
        Ok(())
    };

    for (idx, line) in crate::util::line_reader(document) {
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim_start()),
            None => (line.as_str(), ""),
        };

        if verb.eq_ignore_ascii_case("FROM") {
            if let Some((name, image)) = current.take() {
                finish_stage(graph, &mut stages, name, image)?;
            }

            let tokens: Vec<&str> = rest.split_whitespace().collect();
            let (reference, name) = match tokens.as_slice() {
                [reference, as_kw, name] if as_kw.eq_ignore_ascii_case("AS") => {
                    (*reference, *name)
                }
                _ => {
                    return GraphSnafu {
                        message: format!(
                            "line {}: FROM must name its stage with AS",
                            idx + 1
                        ),
                    }
                    .fail()
                }
            };
            ensure!(
                !stages.contains_key(name),
                GraphSnafu {
                    message: format!("Duplicate stage name {name:?}"),
                }
            );

            let root = graph.add(ImageNode::Reference {
                name: reference.to_string(),
            });
            stage_order.push(name.to_string());
            current = Some((name.to_string(), root));
            continue;
        }

        let Some((stage_name, parent)) = current.take() else {
            return GraphSnafu {
                message: format!("line {}: instruction before FROM", idx + 1),
            }
            .fail();
        };
        let desc = StageDesc {
            name: stage_name.clone(),
            profile: profile.to_string(),
            platform: platform.to_string(),
        };

        let image = if verb.eq_ignore_ascii_case("COPY") {
            let (stripped, mut flags) = extract_command_flags(rest);
            let from = flags.remove("from").unwrap_or_else(|| "default".to_string());
            let context = graph.add(ImageNode::Reference { name: from });
            graph.add(ImageNode::CopyCommand {
                stage_descs: [desc].into_iter().collect(),
                parent,
                context,
                args: format_command_with_flags(&stripped, &flags),
            })
        } else {
            graph.add(ImageNode::Command {
                stage_descs: [desc].into_iter().collect(),
                parent,
                command: verb.to_uppercase(),
                args: rest.to_string(),
            })
        };
        current = Some((stage_name, image));
    }

    if let Some((name, image)) = current.take() {
        finish_stage(graph, &mut stages, name, image)?;
    }

    ensure!(
        !stage_order.is_empty(),
        GraphSnafu {
            message: "build document defines no stages",
        }
    );
    Ok(stages)
}

/// Resolve every [`Reference`] node reachable from the stage images:
/// `scratch`, known stage and context names, then external `repo[:tag]`
/// image names, in that order of precedence.
///
/// [`Reference`]: crate::images::ImageNode::Reference
pub fn resolve_references(
    graph: &mut ImageGraph,
    stages: &mut BTreeMap<String, StageData>,
    platform: &str,
) -> Result<()> {
    let names: Vec<String> = stages.keys().cloned().collect();
    let roots: Vec<ImageId> = names.iter().map(|name| stages[name].image).collect();
    let targets: BTreeMap<String, ImageId> = stages
        .iter()
        .map(|(name, stage)| (name.clone(), stage.image))
        .collect();

    let new_roots = visit_graph(graph, &roots, |graph, image| {
        match graph.node(image) {
            ImageNode::Reference { name } => {
                let name = name.clone();
                let target = chase_reference(graph, &targets, &name, platform)?;
                Ok(VisitAction::Replace(target))
            }
            _ => Ok(VisitAction::Continue),
        }
    })?;

    for (name, root) in names.into_iter().zip(new_roots) {
        if let Some(stage) = stages.get_mut(&name) {
            stage.image = root;
        }
    }
    Ok(())
}

/// Resolve one reference name, following alias chains through other
/// references.
fn chase_reference(
    graph: &mut ImageGraph,
    targets: &BTreeMap<String, ImageId>,
    name: &str,
    platform: &str,
) -> Result<ImageId> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut name = name.to_string();
    loop {
        ensure!(
            seen.insert(name.clone()),
            GraphSnafu {
                message: "Cycle detected in graph",
            }
        );
        if name == "scratch" {
            return Ok(graph.add(ImageNode::Scratch {
                platform: platform.to_string(),
            }));
        }
        match targets.get(&name) {
            Some(target) => match graph.node(*target) {
                ImageNode::Reference { name: next } => name = next.clone(),
                _ => return Ok(*target),
            },
            None => {
                crate::registry::parse_image_name(&name).map_err(|_| {
                    GraphSnafu {
                        message: format!("reference to unknown stage {name:?}"),
                    }
                    .build()
                })?;

                // A digest-pinned reference arrives already resolved.
                if let Some((repo, digest)) = name.split_once('@') {
                    return Ok(graph.add(ImageNode::Source {
                        repo: repo.to_string(),
                        tag: "latest".to_string(),
                        platform: platform.to_string(),
                        digest: Some(digest.to_string()),
                    }));
                }

                let slash = name.rfind('/').map(|pos| pos + 1).unwrap_or(0);
                let (repo, tag) = match name[slash..].find(':') {
                    Some(colon) => (
                        name[..slash + colon].to_string(),
                        name[slash + colon + 1..].to_string(),
                    ),
                    None => (name.clone(), "latest".to_string()),
                };
                return Ok(graph.add(ImageNode::Source {
                    repo,
                    tag,
                    platform: platform.to_string(),
                    digest: None,
                }));
            }
        }
    }
}

/// Variables available to document and ignore-file expansion for one
/// (profile, platform) render.
pub fn render_vars(
    config: &ProjectConfig,
    profile: &str,
    platform: &str,
) -> Result<BTreeMap<String, String>> {
    let mut vars = config.profile_vars(profile)?.clone();
    vars.insert("profile".to_string(), profile.to_string());
    vars.insert("platform".to_string(), platform.to_string());
    Ok(vars)
}
