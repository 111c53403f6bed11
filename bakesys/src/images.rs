/*!
The image build graph.

Nodes live in an arena owned by [`ImageGraph`] and are identified by
[`ImageId`]; edges are ordered lists of ids stored on each node, with the
first dependency acting as the "primary" parent. Identity-keyed bookkeeping
(hash memos, remap tables, reverse edges) all keys on `ImageId`.

Most variants carry a set of stage descriptors recording which (stage,
profile, platform) renders produced them; canonicalization merges these
when duplicate nodes collapse.
*/

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::context::BuildContext;
use crate::error::{InternalSnafu, Result};
use crate::util;

/// Identity of a node within an [`ImageGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(usize);

/// Provenance marker: which stage of which (profile, platform) render
/// produced a node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageDesc {
    pub name: String,
    pub profile: String,
    pub platform: String,
}

#[derive(Clone, Debug)]
pub enum ImageNode {
    /// A single non-copy instruction applied to a parent image.
    Command {
        stage_descs: BTreeSet<StageDesc>,
        parent: ImageId,
        command: String,
        args: String,
    },
    /// A copy instruction whose file source is another image (a file
    /// context or a previous build result).
    CopyCommand {
        stage_descs: BTreeSet<StageDesc>,
        parent: ImageId,
        context: ImageId,
        args: String,
    },
    /// A root image composed purely of files from disk.
    Context {
        stage_descs: BTreeSet<StageDesc>,
        context: Arc<BuildContext>,
        platform: String,
    },
    /// An externally published image pinned by digest at resolve time.
    Source {
        repo: String,
        tag: String,
        platform: String,
        digest: Option<String>,
    },
    /// A cached, content-addressed build stage. `image` holds the inner
    /// build graph until resolution either collapses the node to its
    /// content-hash form or replaces it with the inner image.
    Base {
        profile: String,
        stage: String,
        platform: String,
        image: Option<ImageId>,
        content_hash: Option<String>,
        digest: Option<String>,
    },
    /// Publish-time aggregator mapping platforms to per-platform images.
    MultiPlatform {
        stage_descs: BTreeSet<StageDesc>,
        images: Vec<(String, ImageId)>,
    },
    /// The empty base image.
    Scratch { platform: String },
    /// A name reference produced by document parsing, resolved by a
    /// dedicated post-pass. Must not survive into resolution.
    Reference { name: String },
}

impl ImageNode {
    pub fn variant_tag(&self) -> &'static str {
        match self {
            ImageNode::Command { .. } => "Command",
            ImageNode::CopyCommand { .. } => "CopyCommand",
            ImageNode::Context { .. } => "Context",
            ImageNode::Source { .. } => "Source",
            ImageNode::Base { .. } => "Base",
            ImageNode::MultiPlatform { .. } => "MultiPlatform",
            ImageNode::Scratch { .. } => "Scratch",
            ImageNode::Reference { .. } => "Reference",
        }
    }

    pub fn stage_descs(&self) -> Option<&BTreeSet<StageDesc>> {
        match self {
            ImageNode::Command { stage_descs, .. }
            | ImageNode::CopyCommand { stage_descs, .. }
            | ImageNode::Context { stage_descs, .. }
            | ImageNode::MultiPlatform { stage_descs, .. } => Some(stage_descs),
            _ => None,
        }
    }

    fn stage_descs_mut(&mut self) -> Option<&mut BTreeSet<StageDesc>> {
        match self {
            ImageNode::Command { stage_descs, .. }
            | ImageNode::CopyCommand { stage_descs, .. }
            | ImageNode::Context { stage_descs, .. }
            | ImageNode::MultiPlatform { stage_descs, .. } => Some(stage_descs),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ImageGraph {
    nodes: Vec<ImageNode>,
}

impl ImageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: ImageNode) -> ImageId {
        self.nodes.push(node);
        ImageId(self.nodes.len() - 1)
    }

    pub fn node(&self, id: ImageId) -> &ImageNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: ImageId) -> &mut ImageNode {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ordered dependency list. The first entry is the primary parent;
    /// a copy command's second entry is its file source; a multi-platform
    /// node lists its children in platform order; a base node lists its
    /// inner image when it still has one.
    pub fn dependencies(&self, id: ImageId) -> Vec<ImageId> {
        match self.node(id) {
            ImageNode::Command { parent, .. } => vec![*parent],
            ImageNode::CopyCommand { parent, context, .. } => vec![*parent, *context],
            ImageNode::Base { image, .. } => image.iter().copied().collect(),
            ImageNode::MultiPlatform { images, .. } => {
                images.iter().map(|(_, image)| *image).collect()
            }
            ImageNode::Context { .. }
            | ImageNode::Source { .. }
            | ImageNode::Scratch { .. }
            | ImageNode::Reference { .. } => Vec::new(),
        }
    }

    /// Replace the dependency list; the length must match the variant's
    /// arity.
    pub fn set_dependencies(&mut self, id: ImageId, deps: &[ImageId]) -> Result<()> {
        let tag = self.node(id).variant_tag();
        let arity_error = || {
            InternalSnafu {
                message: format!("wrong dependency count for {tag} node"),
            }
            .build()
        };
        match self.node_mut(id) {
            ImageNode::Command { parent, .. } => {
                let [new_parent] = deps else {
                    return Err(arity_error());
                };
                *parent = *new_parent;
            }
            ImageNode::CopyCommand { parent, context, .. } => {
                let [new_parent, new_context] = deps else {
                    return Err(arity_error());
                };
                *parent = *new_parent;
                *context = *new_context;
            }
            ImageNode::Base { image, .. } => match (image.as_mut(), deps) {
                (Some(image), [new_image]) => *image = *new_image,
                (None, []) => {}
                _ => return Err(arity_error()),
            },
            ImageNode::MultiPlatform { images, .. } => {
                if images.len() != deps.len() {
                    return Err(arity_error());
                }
                for ((_, image), new_image) in images.iter_mut().zip(deps) {
                    *image = *new_image;
                }
            }
            ImageNode::Context { .. }
            | ImageNode::Source { .. }
            | ImageNode::Scratch { .. }
            | ImageNode::Reference { .. } => {
                if !deps.is_empty() {
                    return Err(arity_error());
                }
            }
        }
        Ok(())
    }

    /// The payload that identifies a node modulo its dependencies. With
    /// `symbolic` set, contexts and unresolved externals hash as their
    /// identifying parameters; otherwise their full content is read.
    pub fn local_hash_data(&self, id: ImageId, symbolic: bool) -> Result<Value> {
        match self.node(id) {
            ImageNode::Command { command, args, .. } => Ok(json!([command, args])),
            ImageNode::CopyCommand { context, args, .. } => {
                if !symbolic {
                    if let ImageNode::Context { context, .. } = self.node(*context) {
                        let patterns = copy_source_patterns(args);
                        if !patterns.is_empty() {
                            return Ok(json!(["COPY", args, context.partial_hash(&patterns)?]));
                        }
                    }
                }
                Ok(json!(["COPY", args]))
            }
            ImageNode::Context { context, platform, .. } => {
                let hash = if symbolic {
                    context.symbolic_hash()
                } else {
                    context.full_hash()?
                };
                Ok(json!([hash, platform]))
            }
            ImageNode::Source {
                repo,
                tag,
                platform,
                digest,
            } => {
                if symbolic {
                    Ok(json!([repo, tag, platform]))
                } else {
                    match digest {
                        Some(digest) => Ok(json!([digest])),
                        None => InternalSnafu {
                            message: format!("cannot hash unresolved source image {repo}:{tag}"),
                        }
                        .fail(),
                    }
                }
            }
            ImageNode::Base {
                profile,
                stage,
                platform,
                content_hash,
                ..
            } => {
                if symbolic {
                    Ok(json!([profile, stage, platform]))
                } else {
                    match content_hash {
                        Some(hash) => Ok(json!([hash])),
                        None => InternalSnafu {
                            message: format!("cannot hash unresolved base image {profile}/{stage}"),
                        }
                        .fail(),
                    }
                }
            }
            ImageNode::MultiPlatform { images, .. } => {
                let platforms: Vec<&str> =
                    images.iter().map(|(platform, _)| platform.as_str()).collect();
                Ok(json!(platforms))
            }
            ImageNode::Scratch { platform } => Ok(json!([platform])),
            ImageNode::Reference { name } => InternalSnafu {
                message: format!("unresolved reference {name:?} in graph"),
            }
            .fail(),
        }
    }

    /// Merge provenance from `from` into `into` when canonicalization
    /// collapses duplicate nodes.
    pub fn merge_into(&mut self, from: ImageId, into: ImageId) {
        if from == into {
            return;
        }
        let descs = match self.node(from).stage_descs() {
            Some(descs) => descs.clone(),
            None => return,
        };
        if let Some(target) = self.node_mut(into).stage_descs_mut() {
            target.extend(descs);
        }
    }

    pub fn add_stage_desc(&mut self, id: ImageId, desc: StageDesc) {
        if let Some(descs) = self.node_mut(id).stage_descs_mut() {
            descs.insert(desc);
        }
    }
}

/// Source path patterns named by a copy instruction's arguments: every
/// whitespace token except the trailing destination, with flags stripped.
fn copy_source_patterns(args: &str) -> Vec<String> {
    let (stripped, _) = util::extract_command_flags(args);
    let mut tokens: Vec<&str> = stripped.split_whitespace().collect();
    if tokens.len() < 2 {
        return Vec::new();
    }
    tokens.pop();
    tokens.into_iter().map(str::to_string).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn descs(name: &str) -> BTreeSet<StageDesc> {
        [StageDesc {
            name: name.to_string(),
            profile: "default".to_string(),
            platform: "linux/amd64".to_string(),
        }]
        .into_iter()
        .collect()
    }

    #[test]
    fn dependency_ordering() {
        let mut graph = ImageGraph::new();
        let source = graph.add(ImageNode::Source {
            repo: "alpine".to_string(),
            tag: "3".to_string(),
            platform: "linux/amd64".to_string(),
            digest: None,
        });
        let context = graph.add(ImageNode::Context {
            stage_descs: BTreeSet::new(),
            context: Arc::new(
                crate::context::BuildContext::new(None, Some(0o022), Vec::<&str>::new()).unwrap(),
            ),
            platform: "linux/amd64".to_string(),
        });
        let copy = graph.add(ImageNode::CopyCommand {
            stage_descs: descs("app"),
            parent: source,
            context,
            args: ". /src".to_string(),
        });
        let run = graph.add(ImageNode::Command {
            stage_descs: descs("app"),
            parent: copy,
            command: "RUN".to_string(),
            args: "make".to_string(),
        });

        assert_eq!(graph.dependencies(run), vec![copy]);
        assert_eq!(graph.dependencies(copy), vec![source, context]);
        assert!(graph.dependencies(source).is_empty());

        graph.set_dependencies(copy, &[run, context]).unwrap();
        assert_eq!(graph.dependencies(copy), vec![run, context]);
        assert!(graph.set_dependencies(copy, &[run]).is_err());
    }

    #[test]
    fn local_hash_payloads() {
        let mut graph = ImageGraph::new();
        let source = graph.add(ImageNode::Source {
            repo: "alpine".to_string(),
            tag: "3".to_string(),
            platform: "linux/amd64".to_string(),
            digest: None,
        });
        assert_eq!(
            graph.local_hash_data(source, true).unwrap(),
            serde_json::json!(["alpine", "3", "linux/amd64"])
        );
        assert!(graph.local_hash_data(source, false).is_err());

        if let ImageNode::Source { digest, .. } = graph.node_mut(source) {
            *digest = Some("sha256:abcd".to_string());
        }
        assert_eq!(
            graph.local_hash_data(source, false).unwrap(),
            serde_json::json!(["sha256:abcd"])
        );

        let base = graph.add(ImageNode::Base {
            profile: "default".to_string(),
            stage: "base".to_string(),
            platform: "linux/amd64".to_string(),
            image: None,
            content_hash: None,
            digest: None,
        });
        assert!(graph.local_hash_data(base, false).is_err());
        assert_eq!(
            graph.local_hash_data(base, true).unwrap(),
            serde_json::json!(["default", "base", "linux/amd64"])
        );

        let scratch = graph.add(ImageNode::Scratch {
            platform: "linux/arm64".to_string(),
        });
        assert_eq!(
            graph.local_hash_data(scratch, true).unwrap(),
            serde_json::json!(["linux/arm64"])
        );

        let reference = graph.add(ImageNode::Reference {
            name: "builder".to_string(),
        });
        assert!(graph.local_hash_data(reference, true).is_err());
    }

    #[test]
    fn merge_unions_stage_descs() {
        let mut graph = ImageGraph::new();
        let scratch = graph.add(ImageNode::Scratch {
            platform: "linux/amd64".to_string(),
        });
        let first = graph.add(ImageNode::Command {
            stage_descs: descs("one"),
            parent: scratch,
            command: "RUN".to_string(),
            args: "true".to_string(),
        });
        let second = graph.add(ImageNode::Command {
            stage_descs: descs("two"),
            parent: scratch,
            command: "RUN".to_string(),
            args: "true".to_string(),
        });

        graph.merge_into(second, first);
        let merged = graph.node(first).stage_descs().unwrap();
        assert_eq!(merged.len(), 2);
        let names: Vec<&str> = merged.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["one", "two"]);
    }

    #[test]
    fn copy_patterns_drop_destination_and_flags() {
        assert_eq!(
            copy_source_patterns("--chown=app a/b *.txt /dest"),
            vec!["a/b".to_string(), "*.txt".to_string()]
        );
        assert!(copy_source_patterns("/dest").is_empty());
        assert!(copy_source_patterns("").is_empty());
    }
}
