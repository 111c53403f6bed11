/*!
Build planning.

Turns rendered stages into a topologically ordered list of build
operations. Nodes with identical symbolic hashes are first collapsed onto a
single canonical node (merging their stage provenance), then consecutive
single-use nodes are folded into their dependant's chain so each operation
corresponds to one invocation of the external builder. Contexts used in
exactly one place are inlined into their consumer; base and source images
that carry no stage of their own are dropped since they represent no work.
*/

use std::collections::{HashMap, HashSet};

use snafu::OptionExt;

use crate::error::{InternalSnafu, Result};
use crate::graph::{hash_graph, visit_graph_post, VisitAction};
use crate::images::{ImageGraph, ImageId, ImageNode};
use crate::render::StageData;

/// One build work unit. The chain `image`, `image.parent`, ... up to but
/// not including `root` is built by a single builder invocation.
#[derive(Clone, Debug)]
pub struct BuildOperation {
    /// The resulting image of this operation.
    pub image: ImageId,
    /// The image the chain starts from.
    pub root: ImageId,
    /// Platform the operation builds for.
    pub platform: String,
    /// Context delivered as the build's input stream, when the operation's
    /// single context could be folded in.
    pub inline_context: Option<ImageId>,
    /// Stages whose result this operation is.
    pub stages: Vec<StageData>,
    /// Indices of predecessor operations in the returned plan.
    pub dependencies: Vec<usize>,
}

/// Plan the build of `stages`. Only stages carrying image or push names
/// anchor the plan; anything else reachable from them is built implicitly.
/// The returned operations are topologically sorted (dependencies first).
pub fn plan(graph: &mut ImageGraph, stages: &[StageData]) -> Result<Vec<BuildOperation>> {
    let mut stage_data: Vec<StageData> = stages
        .iter()
        .filter(|stage| !stage.config.image_names.is_empty() || !stage.config.push_names.is_empty())
        .cloned()
        .collect();
    let roots: Vec<ImageId> = stage_data.iter().map(|stage| stage.image).collect();
    let hash_mapping = hash_graph(graph, &roots, "", true)?;

    // Collapse nodes with identical hashes onto one canonical node and
    // record reverse edges. An edge is primary when it is its parent's
    // first dependency and the parent is not a multi-platform aggregator.
    let mut canonical: HashMap<String, ImageId> = HashMap::new();
    let mut reverse: HashMap<ImageId, HashSet<(bool, ImageId)>> = HashMap::new();
    let new_roots = visit_graph_post(
        graph,
        &roots,
        |graph, image| {
            let hash = hash_mapping.get(&image).context(InternalSnafu {
                message: "node missing from hash mapping",
            })?;
            match canonical.get(hash).copied() {
                Some(canon) if canon != image => {
                    graph.merge_into(image, canon);
                    Ok(VisitAction::Replace(canon))
                }
                Some(_) => Ok(VisitAction::Continue),
                None => {
                    canonical.insert(hash.clone(), image);
                    Ok(VisitAction::Continue)
                }
            }
        },
        |graph, image| {
            let is_aggregator = matches!(graph.node(image), ImageNode::MultiPlatform { .. });
            for (idx, dep) in graph.dependencies(image).into_iter().enumerate() {
                reverse
                    .entry(dep)
                    .or_default()
                    .insert((idx == 0 && !is_aggregator, image));
            }
            Ok(())
        },
    )?;

    let mut stages_by_image: HashMap<ImageId, Vec<StageData>> = HashMap::new();
    for (stage, new_root) in stage_data.iter_mut().zip(&new_roots) {
        stage.image = *new_root;
        stages_by_image
            .entry(*new_root)
            .or_default()
            .push(stage.clone());
    }

    // Group nodes into operations in post-order. A node folds into its
    // dependant's chain iff it carries no stage, is not an aggregator, and
    // has exactly one reverse edge which is primary.
    let mut ops: Vec<BuildOperation> = Vec::new();
    let mut op_by_image: HashMap<ImageId, usize> = HashMap::new();
    let mut ctx_dependants: HashMap<usize, HashSet<usize>> = HashMap::new();
    let mut other_dependants: HashMap<usize, HashSet<usize>> = HashMap::new();

    visit_graph_post(
        graph,
        &new_roots,
        |_, _| Ok(VisitAction::Continue),
        |graph, image| {
            let empty = HashSet::new();
            let dependants = reverse.get(&image).unwrap_or(&empty);
            let stages_here = stages_by_image.get(&image).cloned().unwrap_or_default();
            let is_aggregator = matches!(graph.node(image), ImageNode::MultiPlatform { .. });
            if stages_here.is_empty()
                && !is_aggregator
                && dependants.len() == 1
                && dependants.iter().all(|(primary, _)| *primary)
            {
                // Mid-chain image; folds into its dependant's operation.
                return Ok(());
            }

            let missing_op = || {
                InternalSnafu {
                    message: "predecessor operation missing during grouping",
                }
                .build()
            };

            let mut root = image;
            let mut ctx_deps: HashSet<usize> = HashSet::new();
            let mut other_deps: HashSet<usize> = HashSet::new();
            loop {
                if let Some(&op) = op_by_image.get(&root) {
                    other_deps.insert(op);
                    break;
                }
                if let ImageNode::CopyCommand { parent, context, .. } = graph.node(root) {
                    let (parent, context) = (*parent, *context);
                    ctx_deps.insert(*op_by_image.get(&context).ok_or_else(missing_op)?);
                    root = parent;
                    continue;
                }
                let deps = graph.dependencies(root);
                if deps.is_empty() {
                    break;
                }
                for dep in &deps[1..] {
                    other_deps.insert(*op_by_image.get(dep).ok_or_else(missing_op)?);
                }
                root = deps[0];
            }

            let platform = match graph.node(root) {
                ImageNode::Context { platform, .. }
                | ImageNode::Source { platform, .. }
                | ImageNode::Base { platform, .. }
                | ImageNode::Scratch { platform } => platform.clone(),
                _ => op_by_image
                    .get(&root)
                    .map(|&op| ops[op].platform.clone())
                    .unwrap_or_default(),
            };

            let index = ops.len();
            for dep in &ctx_deps {
                ctx_dependants.entry(*dep).or_default().insert(index);
            }
            for dep in &other_deps {
                other_dependants.entry(*dep).or_default().insert(index);
            }
            let mut dependencies: Vec<usize> = ctx_deps.union(&other_deps).copied().collect();
            dependencies.sort_unstable();
            ops.push(BuildOperation {
                image,
                root,
                platform,
                inline_context: None,
                stages: stages_here,
                dependencies,
            });
            op_by_image.insert(image, index);
            Ok(())
        },
    )?;

    // Remove no-work operations and inline single-use contexts.
    let mut removed: HashSet<usize> = HashSet::new();
    for index in 0..ops.len() {
        match graph.node(ops[index].image) {
            ImageNode::Base { .. } | ImageNode::Source { .. } if ops[index].stages.is_empty() => {
                removed.insert(index);
            }
            ImageNode::Context { .. } => {
                if other_dependants.contains_key(&index) {
                    continue;
                }
                let Some(dependants) = ctx_dependants.get(&index) else {
                    continue;
                };
                if dependants.len() != 1 {
                    continue;
                }
                let dependant = *dependants.iter().next().context(InternalSnafu {
                    message: "empty dependant set",
                })?;
                if ops[dependant].inline_context.is_none() {
                    ops[dependant].inline_context = Some(ops[index].image);
                    removed.insert(index);
                }
            }
            _ => {}
        }
    }

    // Drop removed operations, remapping dependency indices.
    let mut remap: HashMap<usize, usize> = HashMap::new();
    let mut result = Vec::with_capacity(ops.len() - removed.len());
    for (index, mut op) in ops.into_iter().enumerate() {
        if removed.contains(&index) {
            continue;
        }
        op.dependencies = op
            .dependencies
            .iter()
            .filter(|dep| !removed.contains(dep))
            .map(|dep| remap[dep])
            .collect();
        remap.insert(index, result.len());
        result.push(op);
    }
    Ok(result)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::StageConfig;
    use crate::context::BuildContext;
    use crate::images::StageDesc;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    const PLATFORM: &str = "linux/amd64";

    fn descs(name: &str) -> BTreeSet<StageDesc> {
        [StageDesc {
            name: name.to_string(),
            profile: "default".to_string(),
            platform: PLATFORM.to_string(),
        }]
        .into_iter()
        .collect()
    }

    fn source(graph: &mut ImageGraph, repo: &str) -> ImageId {
        graph.add(ImageNode::Source {
            repo: repo.to_string(),
            tag: "latest".to_string(),
            platform: PLATFORM.to_string(),
            digest: Some(format!("sha256:{repo}")),
        })
    }

    fn command(graph: &mut ImageGraph, name: &str, parent: ImageId, args: &str) -> ImageId {
        graph.add(ImageNode::Command {
            stage_descs: descs(name),
            parent,
            command: "RUN".to_string(),
            args: args.to_string(),
        })
    }

    fn context_node(graph: &mut ImageGraph) -> ImageId {
        graph.add(ImageNode::Context {
            stage_descs: BTreeSet::new(),
            context: Arc::new(BuildContext::new(None, Some(0o022), Vec::<&str>::new()).unwrap()),
            platform: PLATFORM.to_string(),
        })
    }

    fn stage(name: &str, image: ImageId) -> StageData {
        StageData {
            name: name.to_string(),
            image,
            config: StageConfig {
                base: false,
                image_names: vec![name.to_string()],
                push_names: Vec::new(),
            },
            base_image: None,
        }
    }

    #[test]
    fn linear_chain_is_one_operation() {
        let mut graph = ImageGraph::new();
        let root = source(&mut graph, "alpine");
        let first = command(&mut graph, "app", root, "one");
        let second = command(&mut graph, "app", first, "two");

        let ops = plan(&mut graph, &[stage("app", second)]).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].image, second);
        assert_eq!(ops[0].root, root);
        assert_eq!(ops[0].platform, PLATFORM);
        assert!(ops[0].dependencies.is_empty());
        assert_eq!(ops[0].stages.len(), 1);
    }

    #[test]
    fn identical_stages_merge_into_one_operation() {
        let mut graph = ImageGraph::new();
        let root_a = source(&mut graph, "alpine");
        let tip_a = command(&mut graph, "one", root_a, "same");
        let root_b = source(&mut graph, "alpine");
        let tip_b = command(&mut graph, "two", root_b, "same");

        let ops = plan(&mut graph, &[stage("one", tip_a), stage("two", tip_b)]).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].stages.len(), 2);

        // Provenance from both renders survives on the canonical node.
        let descs = graph.node(ops[0].image).stage_descs().unwrap();
        let names: Vec<&str> = descs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["one", "two"]);
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let mut graph = ImageGraph::new();
        let root_a = source(&mut graph, "alpine");
        let tip_a = command(&mut graph, "one", root_a, "same");
        let root_b = source(&mut graph, "alpine");
        let tip_b = command(&mut graph, "two", root_b, "same");

        let stages = [stage("one", tip_a), stage("two", tip_b)];
        let first = plan(&mut graph, &stages).unwrap();
        let again: Vec<StageData> = first.iter().flat_map(|op| op.stages.clone()).collect();
        let second = plan(&mut graph, &again).unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].image, second[0].image);
        assert_eq!(first[0].root, second[0].root);
    }

    #[test]
    fn shared_tail_gets_its_own_operation() {
        let mut graph = ImageGraph::new();
        let root = source(&mut graph, "alpine");
        let shared = command(&mut graph, "shared", root, "common");
        let tip_a = command(&mut graph, "one", shared, "a");
        let tip_b = command(&mut graph, "two", shared, "b");

        let ops = plan(&mut graph, &[stage("one", tip_a), stage("two", tip_b)]).unwrap();
        assert_eq!(ops.len(), 3);

        // The shared node has two reverse edges so it cannot fold.
        let shared_op = ops
            .iter()
            .position(|op| op.image == shared)
            .expect("shared operation present");
        for op in &ops {
            if op.image != shared {
                assert_eq!(op.dependencies, vec![shared_op]);
                assert_eq!(op.root, shared);
            }
        }
    }

    #[test]
    fn single_use_context_is_inlined() {
        let mut graph = ImageGraph::new();
        let scratch = graph.add(ImageNode::Scratch {
            platform: PLATFORM.to_string(),
        });
        let ctx = context_node(&mut graph);
        let copy = graph.add(ImageNode::CopyCommand {
            stage_descs: descs("app"),
            parent: scratch,
            context: ctx,
            args: ". /".to_string(),
        });

        let ops = plan(&mut graph, &[stage("app", copy)]).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].inline_context, Some(ctx));
        assert!(ops[0].dependencies.is_empty());
    }

    #[test]
    fn shared_context_is_not_inlined() {
        let mut graph = ImageGraph::new();
        let scratch = graph.add(ImageNode::Scratch {
            platform: PLATFORM.to_string(),
        });
        let ctx = context_node(&mut graph);
        let copy_a = graph.add(ImageNode::CopyCommand {
            stage_descs: descs("one"),
            parent: scratch,
            context: ctx,
            args: "a /a".to_string(),
        });
        let copy_b = graph.add(ImageNode::CopyCommand {
            stage_descs: descs("two"),
            parent: scratch,
            context: ctx,
            args: "b /b".to_string(),
        });

        let ops = plan(&mut graph, &[stage("one", copy_a), stage("two", copy_b)]).unwrap();
        assert_eq!(ops.len(), 3);
        let ctx_op = ops
            .iter()
            .position(|op| op.image == ctx)
            .expect("context operation kept");
        for op in &ops {
            assert!(op.inline_context.is_none());
            if op.image != ctx {
                assert_eq!(op.dependencies, vec![ctx_op]);
            }
        }
    }

    #[test]
    fn sources_without_stages_are_pruned() {
        let mut graph = ImageGraph::new();
        let root = source(&mut graph, "alpine");
        let other = source(&mut graph, "tools");
        let copy = graph.add(ImageNode::CopyCommand {
            stage_descs: descs("app"),
            parent: root,
            context: other,
            args: "/bin/tool /bin/tool".to_string(),
        });

        let ops = plan(&mut graph, &[stage("app", copy)]).unwrap();
        // The copy source is an external image: no operation, no dependency.
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].image, copy);
        assert_eq!(ops[0].root, root);
        assert!(ops[0].dependencies.is_empty());
        assert!(ops[0].inline_context.is_none());
    }

    #[test]
    fn multi_platform_children_never_fold() {
        let mut graph = ImageGraph::new();
        let amd = source(&mut graph, "amd");
        let tip_amd = command(&mut graph, "app", amd, "build");
        let arm = source(&mut graph, "arm");
        let tip_arm = command(&mut graph, "app", arm, "build-arm");
        let aggregate = graph.add(ImageNode::MultiPlatform {
            stage_descs: descs("app"),
            images: vec![
                ("linux/amd64".to_string(), tip_amd),
                ("linux/arm64".to_string(), tip_arm),
            ],
        });

        let mut aggregate_stage = stage("app", aggregate);
        aggregate_stage.config.image_names.clear();
        aggregate_stage.config.push_names = vec!["registry.example.com/app".to_string()];

        let ops = plan(&mut graph, &[aggregate_stage]).unwrap();
        assert_eq!(ops.len(), 3);
        let last = ops.last().unwrap();
        assert_eq!(last.image, aggregate);
        assert_eq!(last.dependencies.len(), 2);

        // Children kept their own operations even though each has a single
        // reverse edge.
        assert!(ops.iter().any(|op| op.image == tip_amd));
        assert!(ops.iter().any(|op| op.image == tip_arm));
    }

    #[test]
    fn operations_are_topologically_ordered() {
        let mut graph = ImageGraph::new();
        let root = source(&mut graph, "alpine");
        let shared = command(&mut graph, "shared", root, "common");
        let mid = command(&mut graph, "mid", shared, "mid");
        let tip = command(&mut graph, "tip", mid, "tip");

        let ops = plan(
            &mut graph,
            &[stage("shared", shared), stage("mid", mid), stage("tip", tip)],
        )
        .unwrap();
        assert_eq!(ops.len(), 3);
        for (index, op) in ops.iter().enumerate() {
            for dep in &op.dependencies {
                assert!(*dep < index);
            }
        }
    }
}
