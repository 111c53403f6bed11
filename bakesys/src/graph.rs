/*!
Graph traversal and hashing.

A single iterative algorithm provides pre-order visitation with node
substitution, optional post-order callbacks, cycle detection, and automatic
deduplication of shared nodes. The recursive hasher is layered on top of the
post-order callback.
*/

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};

use crate::error::{GraphSnafu, Result};
use crate::hashing::hash_value;
use crate::images::{ImageGraph, ImageId};

/// Outcome of a pre-order visit.
pub enum VisitAction {
    /// Keep the node and traverse its dependencies.
    Continue,
    /// Substitute the node; edges into it are rewritten and traversal
    /// continues into the substitute.
    Replace(ImageId),
    /// Do not traverse into the subtree rooted at this node. The node is
    /// not recorded as visited and will be offered again if reached along
    /// another path.
    Skip,
}

/// Traverse the graph from `roots` in pre-order, calling `pre` once per
/// unique node. Substitutions returned by `pre` are recorded and applied to
/// every subsequent edge into the substituted node. Returns the updated
/// root list in input order. A cycle is a fatal graph error.
pub fn visit_graph<Pre>(graph: &mut ImageGraph, roots: &[ImageId], mut pre: Pre) -> Result<Vec<ImageId>>
where
    Pre: FnMut(&mut ImageGraph, ImageId) -> Result<VisitAction>,
{
    visit_inner(graph, roots, &mut pre, None)
}

/// Like [`visit_graph`], additionally calling `post` for each node after
/// all of its dependencies have been processed.
pub fn visit_graph_post<Pre, Post>(
    graph: &mut ImageGraph,
    roots: &[ImageId],
    mut pre: Pre,
    mut post: Post,
) -> Result<Vec<ImageId>>
where
    Pre: FnMut(&mut ImageGraph, ImageId) -> Result<VisitAction>,
    Post: FnMut(&mut ImageGraph, ImageId) -> Result<()>,
{
    let post: PostFn<'_> = &mut post;
    visit_inner(graph, roots, &mut pre, Some(post))
}

type PreFn<'a> = &'a mut dyn FnMut(&mut ImageGraph, ImageId) -> Result<VisitAction>;
type PostFn<'a> = &'a mut dyn FnMut(&mut ImageGraph, ImageId) -> Result<()>;

fn visit_inner(
    graph: &mut ImageGraph,
    roots: &[ImageId],
    pre: PreFn<'_>,
    mut post: Option<PostFn<'_>>,
) -> Result<Vec<ImageId>> {
    struct Frame {
        image: Option<ImageId>,
        deps: Option<Vec<ImageId>>,
        dep_idx: usize,
    }

    let mut stack = vec![Frame {
        image: None,
        deps: Some(roots.to_vec()),
        dep_idx: 0,
    }];
    let mut on_stack: HashSet<ImageId> = HashSet::new();
    let mut remapped: HashMap<ImageId, ImageId> = HashMap::new();

    loop {
        let top = stack.len() - 1;
        if stack[top].deps.is_none() {
            let image = stack[top]
                .image
                .expect("non-root frame always carries an image");
            let new_image = match pre(graph, image)? {
                VisitAction::Continue => image,
                VisitAction::Replace(new_image) => new_image,
                VisitAction::Skip => {
                    stack.pop();
                    continue;
                }
            };

            remapped.insert(image, new_image);
            stack[top].image = Some(new_image);
            stack[top].deps = Some(graph.dependencies(new_image));
            on_stack.insert(new_image);

            // Rewrite the edge in the parent frame that led here.
            if top > 0 {
                let parent_idx = stack[top - 1].dep_idx - 1;
                if let Some(parent_deps) = stack[top - 1].deps.as_mut() {
                    parent_deps[parent_idx] = new_image;
                }
            }
        }

        let mut next_dep = None;
        {
            let frame = &mut stack[top];
            let deps = frame.deps.as_mut().expect("frame deps populated above");
            while next_dep.is_none() && frame.dep_idx < deps.len() {
                let dep = deps[frame.dep_idx];
                if on_stack.contains(&dep) {
                    return GraphSnafu {
                        message: "Cycle detected in graph",
                    }
                    .fail();
                }
                match remapped.get(&dep) {
                    Some(replacement) => deps[frame.dep_idx] = *replacement,
                    None => next_dep = Some(dep),
                }
                frame.dep_idx += 1;
            }
        }

        match next_dep {
            Some(dep) => stack.push(Frame {
                image: Some(dep),
                deps: None,
                dep_idx: 0,
            }),
            None => {
                if stack.len() == 1 {
                    let frame = stack.pop().expect("root frame present");
                    return Ok(frame.deps.unwrap_or_default());
                }
                let frame = stack.pop().expect("non-empty stack");
                let image = frame.image.expect("completed frame carries an image");
                let deps = frame.deps.unwrap_or_default();
                graph.set_dependencies(image, &deps)?;
                on_stack.remove(&image);
                if let Some(post) = post.as_mut() {
                    post(graph, image)?;
                }
            }
        }
    }
}

/// Compute the recursive hash of every node reachable from `roots`:
/// `hash(node) = hash([salt, tag, local_hash_data, hash(dep), ...])`,
/// memoized per node.
pub fn hash_graph(
    graph: &mut ImageGraph,
    roots: &[ImageId],
    salt: &str,
    symbolic: bool,
) -> Result<HashMap<ImageId, String>> {
    let mut hashes: HashMap<ImageId, String> = HashMap::new();
    visit_graph_post(
        graph,
        roots,
        |_, _| Ok(VisitAction::Continue),
        |graph, image| {
            let mut items = vec![
                json!(salt),
                json!(graph.node(image).variant_tag()),
                graph.local_hash_data(image, symbolic)?,
            ];
            for dep in graph.dependencies(image) {
                items.push(json!(hashes[&dep]));
            }
            hashes.insert(image, hash_value(&Value::Array(items)));
            Ok(())
        },
    )?;
    Ok(hashes)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::images::ImageNode;
    use std::collections::BTreeSet;

    fn command(graph: &mut ImageGraph, parent: ImageId, args: &str) -> ImageId {
        graph.add(ImageNode::Command {
            stage_descs: BTreeSet::new(),
            parent,
            command: "RUN".to_string(),
            args: args.to_string(),
        })
    }

    fn source(graph: &mut ImageGraph, repo: &str) -> ImageId {
        graph.add(ImageNode::Source {
            repo: repo.to_string(),
            tag: "latest".to_string(),
            platform: "linux/amd64".to_string(),
            digest: Some(format!("sha256:{repo}")),
        })
    }

    #[test]
    fn self_cycle_detected() {
        let mut graph = ImageGraph::new();
        let base = source(&mut graph, "a");
        let node = command(&mut graph, base, "x");
        graph.set_dependencies(node, &[node]).unwrap();

        let mut visits = 0;
        let mut post_calls = 0;
        let err = visit_graph_post(
            &mut graph,
            &[node],
            |_, _| {
                visits += 1;
                Ok(VisitAction::Continue)
            },
            |_, _| {
                post_calls += 1;
                Ok(())
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("Cycle detected in graph"));
        assert_eq!(visits, 1);
        assert_eq!(post_calls, 0);
    }

    #[test]
    fn deep_cycle_detected() {
        let mut graph = ImageGraph::new();
        let mut chain = vec![source(&mut graph, "root")];
        for _ in 0..9 {
            let prev = *chain.last().unwrap();
            let copy = graph.add(ImageNode::CopyCommand {
                stage_descs: BTreeSet::new(),
                parent: prev,
                context: prev,
                args: "hello".to_string(),
            });
            chain.push(copy);
        }

        // Overlapping edges in a DAG are fine and each node is visited once.
        let mut visits = 0;
        let result = visit_graph(&mut graph, &chain.clone(), |_, _| {
            visits += 1;
            Ok(VisitAction::Continue)
        })
        .unwrap();
        assert_eq!(result, chain);
        assert_eq!(visits, 10);

        // Pointing an edge back up the chain is a cycle.
        graph
            .set_dependencies(chain[2], &[chain[1], chain[6]])
            .unwrap();
        let err = visit_graph(&mut graph, &chain, |_, _| Ok(VisitAction::Continue)).unwrap_err();
        assert!(err.to_string().contains("Cycle detected in graph"));
    }

    #[test]
    fn replacement_rewrites_edges() {
        let mut graph = ImageGraph::new();
        let old = source(&mut graph, "old");
        let new = source(&mut graph, "new");
        let left = command(&mut graph, old, "left");
        let right = command(&mut graph, old, "right");

        let roots = visit_graph(&mut graph, &[left, right, old], |_, id| {
            if id == old {
                Ok(VisitAction::Replace(new))
            } else {
                Ok(VisitAction::Continue)
            }
        })
        .unwrap();

        assert_eq!(roots, vec![left, right, new]);
        assert_eq!(graph.dependencies(left), vec![new]);
        assert_eq!(graph.dependencies(right), vec![new]);
    }

    #[test]
    fn pre_and_post_order() {
        // nodes[0] -> [nodes[4], nodes[1]]
        // nodes[1] -> [nodes[4], nodes[2]]
        // nodes[2] -> [nodes[3]]
        let mut graph = ImageGraph::new();
        let n4 = source(&mut graph, "n4");
        let n3 = source(&mut graph, "n3");
        let n2 = command(&mut graph, n3, "n2");
        let n1 = graph.add(ImageNode::CopyCommand {
            stage_descs: BTreeSet::new(),
            parent: n4,
            context: n2,
            args: "n1".to_string(),
        });
        let n0 = graph.add(ImageNode::CopyCommand {
            stage_descs: BTreeSet::new(),
            parent: n4,
            context: n1,
            args: "n0".to_string(),
        });

        let mut pre_order = Vec::new();
        let mut post_order = Vec::new();
        visit_graph_post(
            &mut graph,
            &[n0],
            |_, id| {
                pre_order.push(id);
                Ok(VisitAction::Continue)
            },
            |_, id| {
                post_order.push(id);
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(pre_order, vec![n0, n4, n1, n2, n3]);
        assert_eq!(post_order, vec![n4, n3, n2, n1, n0]);
    }

    #[test]
    fn skip_subtree() {
        let mut graph = ImageGraph::new();
        let leaf = source(&mut graph, "leaf");
        let mid = command(&mut graph, leaf, "mid");
        let top = command(&mut graph, mid, "top");

        let mut visited = Vec::new();
        visit_graph(&mut graph, &[top], |_, id| {
            visited.push(id);
            if id == mid {
                Ok(VisitAction::Skip)
            } else {
                Ok(VisitAction::Continue)
            }
        })
        .unwrap();
        assert_eq!(visited, vec![top, mid]);
    }

    #[test]
    fn substitution_can_generate_subtrees() {
        // Each visited placeholder is replaced by a node with two deeper
        // placeholders, generating a complete binary tree of depth 6.
        let mut graph = ImageGraph::new();
        let root = source(&mut graph, "depth-0");

        fn depth_of(graph: &ImageGraph, id: ImageId) -> u32 {
            match graph.node(id) {
                ImageNode::Source { repo, .. } => repo
                    .strip_prefix("depth-")
                    .and_then(|d| d.parse().ok())
                    .unwrap_or(0),
                _ => unreachable!("test graph only holds sources and copies"),
            }
        }

        let result = visit_graph(&mut graph, &[root], |graph, id| {
            let depth = match graph.node(id) {
                ImageNode::Source { .. } => depth_of(graph, id),
                _ => return Ok(VisitAction::Continue),
            };
            if depth >= 6 {
                return Ok(VisitAction::Continue);
            }
            let left = source(graph, &format!("depth-{}", depth + 1));
            let right = source(graph, &format!("depth-{}", depth + 1));
            let replacement = graph.add(ImageNode::CopyCommand {
                stage_descs: BTreeSet::new(),
                parent: left,
                context: right,
                args: format!("level {depth}"),
            });
            Ok(VisitAction::Replace(replacement))
        })
        .unwrap();
        assert_eq!(result.len(), 1);
        assert_ne!(result[0], root);

        // Re-walking the generated graph visits every node exactly once:
        // 63 copy nodes plus 64 leaves... except generated children are
        // themselves replaced on visit, so count by a plain traversal.
        let mut visits = 0;
        visit_graph(&mut graph, &result, |_, _| {
            visits += 1;
            Ok(VisitAction::Continue)
        })
        .unwrap();
        assert_eq!(visits, 2u32.pow(7) - 1);
    }

    #[test]
    fn hashes_are_recursive_and_salted() {
        let mut graph = ImageGraph::new();
        let base = source(&mut graph, "base");
        let first = command(&mut graph, base, "step");
        let second = command(&mut graph, first, "step");

        let hashes = hash_graph(&mut graph, &[second], "", true).unwrap();
        assert_eq!(hashes.len(), 3);
        // Same payload, different parents: hashes differ.
        assert_ne!(hashes[&first], hashes[&second]);

        let salted = hash_graph(&mut graph, &[second], "salt", true).unwrap();
        assert_ne!(hashes[&second], salted[&second]);

        // Identical subgraphs hash identically.
        let base2 = source(&mut graph, "base");
        let first2 = command(&mut graph, base2, "step");
        let more = hash_graph(&mut graph, &[first2], "", true).unwrap();
        assert_eq!(hashes[&first], more[&first2]);
    }
}
