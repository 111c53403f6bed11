/*!
Source and base image resolution.

Source images are pinned to a manifest digest: the cached digest is used
when present, otherwise the registry is consulted and the digest matching
the requested platform is selected and persisted. Base images have their
salted content hash computed from their inner build graph; a cached build
hash that matches collapses the node to its content-addressed form (the
pull path), a mismatch dereferences it to the inner image and schedules a
push of the rebuilt base (the rebuild path).
*/

use snafu::{ensure, OptionExt};

use crate::arch::{normalize_platform, normalize_platform_string};
use crate::error::{
    ConfigurationSnafu, InternalSnafu, NoSourceImageSnafu, RegistrySnafu, Result,
};
use crate::graph::{hash_graph, visit_graph, VisitAction};
use crate::images::{ImageGraph, ImageId, ImageNode};
use crate::project::Project;
use crate::registry::{parse_image_name, Manifest};
use crate::render::StageData;
use crate::store::BaseRecord;

impl Project {
    /// Resolve the manifest digest of `repo:tag` for a platform.
    ///
    /// The cached digest wins unless `force_update` is set. With
    /// `check_only` set, a cache miss fails with the no-source-image kind
    /// instead of contacting the registry.
    pub async fn resolve_image(
        &self,
        repo: &str,
        tag: &str,
        platform: &str,
        check_only: bool,
        force_update: bool,
    ) -> Result<String> {
        if !force_update {
            let cached = self.with_store(|data| {
                data.cached_source_digest(repo, tag, platform)
                    .map(str::to_string)
            });
            if let Some(digest) = cached {
                return Ok(digest);
            }
        }
        ensure!(
            !check_only,
            NoSourceImageSnafu {
                image: format!("{repo}:{tag}"),
            }
        );

        let wanted = normalize_platform_string(platform);
        let image_ref = parse_image_name(&format!("{repo}:{tag}"))?;
        let descriptor = self
            .registry()
            .ref_lookup(&image_ref)
            .await?
            .context(RegistrySnafu {
                message: format!("source image {repo}:{tag} not found"),
            })?;

        let digest = match self.registry().manifest_download(&image_ref).await? {
            Manifest::V1 { architecture } => {
                let actual = normalize_platform("linux", &architecture, "");
                ensure!(
                    actual == wanted,
                    RegistrySnafu {
                        message: format!(
                            "wrong architecture for {repo}:{tag}: wanted {wanted}, found {actual}"
                        ),
                    }
                );
                descriptor.digest
            }
            Manifest::V2 { config } => {
                let blob = self.registry().blob_download(&image_ref, &config.digest).await?;
                let value: serde_json::Value = serde_json::from_slice(&blob).map_err(|err| {
                    RegistrySnafu {
                        message: format!("malformed image config for {repo}:{tag}: {err}"),
                    }
                    .build()
                })?;
                let field = |name: &str| {
                    value
                        .get(name)
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string()
                };
                let actual =
                    normalize_platform(&field("os"), &field("architecture"), &field("variant"));
                ensure!(
                    actual == wanted,
                    RegistrySnafu {
                        message: format!(
                            "wrong architecture for {repo}:{tag}: wanted {wanted}, found {actual}"
                        ),
                    }
                );
                descriptor.digest
            }
            Manifest::List { manifests } => manifests
                .iter()
                .find(|entry| {
                    entry
                        .platform
                        .as_ref()
                        .map(|p| p.normalized() == wanted)
                        .unwrap_or(false)
                })
                .map(|entry| entry.digest.clone())
                .context(RegistrySnafu {
                    message: format!("no matching platform {wanted} for {repo}:{tag}"),
                })?,
        };

        self.update_store(|data| data.set_source_digest(repo, tag, platform, &digest))?;
        log::info!("resolved {repo}:{tag} for {platform} to {digest}");
        Ok(digest)
    }

    /// Fill in the digest of every unresolved source image reachable from
    /// `stages`.
    pub async fn resolve_source_images(
        &self,
        graph: &mut ImageGraph,
        stages: &[StageData],
        check_only: bool,
        force_update: bool,
    ) -> Result<()> {
        let roots: Vec<ImageId> = stages.iter().map(|stage| stage.image).collect();
        let mut pending: Vec<(ImageId, String, String, String)> = Vec::new();
        visit_graph(graph, &roots, |graph, image| {
            if let ImageNode::Source {
                repo,
                tag,
                platform,
                digest: None,
            } = graph.node(image)
            {
                pending.push((image, repo.clone(), tag.clone(), platform.clone()));
            }
            Ok(VisitAction::Continue)
        })?;

        for (image, repo, tag, platform) in pending {
            let resolved = self
                .resolve_image(&repo, &tag, &platform, check_only, force_update)
                .await?;
            if let ImageNode::Source { digest, .. } = graph.node_mut(image) {
                *digest = Some(resolved);
            }
        }
        Ok(())
    }

    /// Resolve every base stage in `stages` and rewrite base nodes across
    /// the stage graphs.
    ///
    /// With `dereference` set the content hash is recomputed from the inner
    /// image (requiring resolved sources) and the registry is consulted for
    /// an existing build; without it, a cached content hash is required.
    pub async fn resolve_base_images(
        &self,
        graph: &mut ImageGraph,
        stages: &mut [StageData],
        dereference: bool,
    ) -> Result<()> {
        let salt = self.hash_salt();

        if dereference {
            for index in 0..stages.len() {
                let Some(base_id) = stages[index].base_image else {
                    continue;
                };
                let ImageNode::Base {
                    profile,
                    stage,
                    platform,
                    image,
                    ..
                } = graph.node(base_id)
                else {
                    return InternalSnafu {
                        message: "stage base image is not a base node",
                    }
                    .fail();
                };
                let (profile, stage, platform, inner) =
                    (profile.clone(), stage.clone(), platform.clone(), *image);
                let inner = inner.context(InternalSnafu {
                    message: format!("base image {profile}/{stage} has no build graph"),
                })?;
                let hashes = hash_graph(graph, &[inner], &salt, false)?;
                let content_hash = hashes.get(&inner).cloned().context(InternalSnafu {
                    message: "hash mapping missing base image root",
                })?;

                // An object already stored under this content hash counts
                // as a cache hit, whoever built it.
                let name =
                    self.base_image_name(&profile, &stage, &platform, &content_hash, None, false)?;
                if let Some(descriptor) =
                    self.registry().ref_lookup(&parse_image_name(&name)?).await?
                {
                    self.update_store(|data| {
                        data.set_base(
                            &profile,
                            &stage,
                            &platform,
                            BaseRecord {
                                build_hash: content_hash.clone(),
                                image_digest: descriptor.digest.clone(),
                            },
                        )
                    })?;
                }

                let cached_digest = self.with_store(|data| {
                    data.cached_base(&profile, &stage, &platform)
                        .filter(|record| record.build_hash == content_hash)
                        .map(|record| record.image_digest.clone())
                });
                if let ImageNode::Base {
                    content_hash: node_hash,
                    digest,
                    ..
                } = graph.node_mut(base_id)
                {
                    *node_hash = Some(content_hash);
                    *digest = cached_digest;
                }
            }
        }

        // Rewrite base nodes across all stage graphs: collapse cache hits
        // to their content-hash form, dereference misses to their inner
        // image and schedule a push of the rebuilt base.
        let roots: Vec<ImageId> = stages.iter().map(|stage| stage.image).collect();
        let mut push_additions: Vec<(ImageId, String)> = Vec::new();
        let new_roots = visit_graph(graph, &roots, |graph, image| {
            let ImageNode::Base {
                profile,
                stage,
                platform,
                image: inner,
                content_hash,
                ..
            } = graph.node(image)
            else {
                return Ok(VisitAction::Continue);
            };
            let Some(inner) = *inner else {
                // Already collapsed.
                return Ok(VisitAction::Continue);
            };
            let (profile, stage, platform) = (profile.clone(), stage.clone(), platform.clone());
            let content_hash = content_hash.clone();
            let cached = self.with_store(|data| data.cached_base(&profile, &stage, &platform).cloned());

            match content_hash {
                // Freshly hashed base stage: a matching cached build
                // collapses to the pull path, anything else rebuilds.
                Some(content_hash) => {
                    let cache_hit = cached
                        .as_ref()
                        .map(|record| record.build_hash == content_hash)
                        .unwrap_or(false);
                    if cache_hit {
                        if let ImageNode::Base { image, .. } = graph.node_mut(image) {
                            *image = None;
                        }
                        Ok(VisitAction::Continue)
                    } else {
                        let push_name = self.base_image_name(
                            &profile,
                            &stage,
                            &platform,
                            &content_hash,
                            None,
                            false,
                        )?;
                        push_additions.push((image, push_name));
                        Ok(VisitAction::Replace(inner))
                    }
                }
                // A base referenced without being rehashed must already be
                // cached; it always takes the pull path.
                None => {
                    let record = cached.context(ConfigurationSnafu {
                        message: format!(
                            "base image {stage} ({profile}, {platform}) has never been built; \
                             run base-build first"
                        ),
                    })?;
                    if let ImageNode::Base {
                        image,
                        content_hash,
                        digest,
                        ..
                    } = graph.node_mut(image)
                    {
                        *image = None;
                        *content_hash = Some(record.build_hash);
                        *digest = Some(record.image_digest);
                    }
                    Ok(VisitAction::Continue)
                }
            }
        })?;

        for (stage, new_root) in stages.iter_mut().zip(new_roots) {
            stage.image = new_root;
        }
        for (base_id, push_name) in push_additions {
            let stage = stages
                .iter_mut()
                .find(|stage| stage.base_image == Some(base_id))
                .context(InternalSnafu {
                    message: "rebuilt base image has no owning stage",
                })?;
            if !stage.config.push_names.contains(&push_name) {
                stage.config.push_names.push(push_name);
            }
        }
        Ok(())
    }
}
