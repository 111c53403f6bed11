/*!
The coordinator.

[`Project`] owns the project configuration, the build-data store, the
registry client, and the template engine, and exposes the high-level
lifecycle: render a (profile, platform) into stages, resolve source and
base images, plan, and build. It is shared behind an `Arc` so executor
tasks and completion callbacks can reach it.
*/

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use snafu::{OptionExt, ResultExt};

use crate::config::{
    ContextConfig, ProjectConfig, UserConfig, BUILD_DATA_NAME, PROJECT_CONFIG_NAME,
    USER_CONFIG_NAME,
};
use crate::context::BuildContext;
use crate::error::{
    ConfigReadSnafu, ConfigurationSnafu, InternalSnafu, RegistrySnafu, Result, TemplateSnafu,
};
use crate::executor::{BuildExecutor, CompleteCallback};
use crate::graph::hash_graph;
use crate::images::{ImageGraph, ImageId, ImageNode};
use crate::output::OutputStreamer;
use crate::plan::BuildOperation;
use crate::registry::{parse_image_name, Registry};
use crate::render::{
    escape_pattern, parse_document, render_vars, resolve_references, SimpleTemplateEngine,
    StageData, TemplateEngine,
};
use crate::store::{BuildData, BuildDataStore};
use crate::util::{format_simple, params};

pub struct Project {
    base_dir: PathBuf,
    config: ProjectConfig,
    user_config: UserConfig,
    store: Mutex<BuildDataStore>,
    registry: Box<dyn Registry>,
    engine: Box<dyn TemplateEngine>,
    output: OutputStreamer,
}

impl Project {
    /// Open the project rooted at `base_dir`.
    pub fn open(
        base_dir: impl Into<PathBuf>,
        user_config: UserConfig,
        registry: Box<dyn Registry>,
    ) -> Result<Arc<Self>> {
        let base_dir = base_dir.into();
        let config = crate::config::load_project_config(&base_dir)?;
        let store = BuildDataStore::load(&base_dir)?;
        Ok(Arc::new(Self {
            output: OutputStreamer::new(user_config.color),
            engine: Box::new(SimpleTemplateEngine),
            base_dir,
            config,
            user_config,
            store: Mutex::new(store),
            registry,
        }))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn user_config(&self) -> &UserConfig {
        &self.user_config
    }

    pub fn registry(&self) -> &dyn Registry {
        self.registry.as_ref()
    }

    pub fn output(&self) -> &OutputStreamer {
        &self.output
    }

    pub fn with_store<R>(&self, read: impl FnOnce(&BuildData) -> R) -> R {
        read(self.store.lock().unwrap().data())
    }

    /// Mutate and persist the build data. The store lock serializes
    /// writers.
    pub fn update_store<R>(&self, mutate: impl FnOnce(&mut BuildData) -> R) -> Result<R> {
        self.store.lock().unwrap().update(mutate)
    }

    pub fn hash_salt(&self) -> String {
        self.store.lock().unwrap().hash_salt().to_string()
    }

    pub fn rotate_salt(&self) -> Result<()> {
        self.store.lock().unwrap().rotate_salt()
    }

    /// Render all contexts and stages for one (profile, platform) into the
    /// graph.
    pub fn render(
        &self,
        graph: &mut ImageGraph,
        profile: &str,
        platform: &str,
    ) -> Result<BTreeMap<String, StageData>> {
        let vars = render_vars(&self.config, profile, platform)?;

        let mut contexts = BTreeMap::new();
        for (name, context_config) in &self.config.contexts {
            let image = self.render_context(graph, name, context_config, &vars, platform)?;
            contexts.insert(name.clone(), image);
        }

        let path = self.base_dir.join(&self.config.build_file);
        let text = std::fs::read_to_string(&path).context(ConfigReadSnafu { path: path.clone() })?;
        let document = self.engine.expand(&text, &vars).map_err(|err| {
            TemplateSnafu {
                message: format!("failed to render build document: {err}"),
                frames: format!("  at {}", path.display()),
            }
            .build()
        })?;

        let mut stages = parse_document(graph, &document, &self.config, profile, platform, &contexts)?;
        resolve_references(graph, &mut stages, platform)?;
        Ok(stages)
    }

    fn render_context(
        &self,
        graph: &mut ImageGraph,
        name: &str,
        context_config: &ContextConfig,
        vars: &BTreeMap<String, String>,
        platform: &str,
    ) -> Result<ImageId> {
        let ignore_text = match &context_config.ignore {
            Some(text) => text.clone(),
            None => {
                let ignore_file = context_config
                    .ignore_file
                    .clone()
                    .unwrap_or_else(|| ".dockerignore".to_string());
                match std::fs::read_to_string(self.base_dir.join(&ignore_file)) {
                    Ok(text) => text,
                    Err(err)
                        if err.kind() == std::io::ErrorKind::NotFound
                            && context_config.ignore_file.is_none() =>
                    {
                        String::new()
                    }
                    Err(_) => {
                        return ConfigurationSnafu {
                            message: format!("missing ignore file {ignore_file:?}"),
                        }
                        .fail()
                    }
                }
            }
        };
        let ignore_text = self.engine.expand(&ignore_text, vars).map_err(|err| {
            TemplateSnafu {
                message: format!("failed to render ignore patterns for context {name:?}: {err}"),
                frames: String::new(),
            }
            .build()
        })?;

        // The project's own files never enter a context.
        let mut lines: Vec<String> = ignore_text.lines().map(str::to_string).collect();
        for forced in [
            PROJECT_CONFIG_NAME,
            USER_CONFIG_NAME,
            BUILD_DATA_NAME,
            self.config.build_file.as_str(),
        ] {
            lines.push(escape_pattern(forced));
        }

        let context = BuildContext::new(
            Some(context_config.resolved_base_dir(&self.base_dir)?),
            context_config.umask_bits()?,
            lines.iter().map(String::as_str),
        )?;
        Ok(graph.add(ImageNode::Context {
            stage_descs: BTreeSet::new(),
            context: Arc::new(context),
            platform: platform.to_string(),
        }))
    }

    /// Plan the build of the given stages.
    pub fn plan(&self, graph: &mut ImageGraph, stages: &[StageData]) -> Result<Vec<BuildOperation>> {
        crate::plan::plan(graph, stages)
    }

    /// Execute a plan. Base-image completions are recorded in the build
    /// data as they finish.
    pub async fn build(
        self: &Arc<Self>,
        graph: ImageGraph,
        build_ops: Vec<BuildOperation>,
    ) -> Result<()> {
        let executor = Arc::new(BuildExecutor::new(Arc::clone(self))?);
        let graph = Arc::new(graph);
        let build_ops = Arc::new(build_ops);

        let callback: CompleteCallback = {
            let project = Arc::clone(self);
            let graph = Arc::clone(&graph);
            let build_ops = Arc::clone(&build_ops);
            Arc::new(move |index, primary_tag| {
                let project = Arc::clone(&project);
                let graph = Arc::clone(&graph);
                let build_ops = Arc::clone(&build_ops);
                Box::pin(async move {
                    project
                        .operation_complete(&graph, &build_ops[index], primary_tag)
                        .await
                })
            })
        };

        executor.build(graph, build_ops, Some(callback)).await
    }

    async fn operation_complete(
        &self,
        graph: &ImageGraph,
        op: &BuildOperation,
        _primary_tag: String,
    ) -> Result<()> {
        for stage in &op.stages {
            let Some(base_id) = stage.base_image else {
                continue;
            };
            let ImageNode::Base {
                profile,
                stage: stage_name,
                platform,
                content_hash: Some(content_hash),
                ..
            } = graph.node(base_id)
            else {
                continue;
            };

            let name = self.base_image_name(profile, stage_name, platform, content_hash, None, false)?;
            let image_ref = parse_image_name(&name)?;
            let descriptor = self
                .registry
                .ref_lookup(&image_ref)
                .await?
                .context(RegistrySnafu {
                    message: format!("could not look up pushed base image {name}"),
                })?;
            self.update_store(|data| {
                data.set_base(
                    profile,
                    stage_name,
                    platform,
                    crate::store::BaseRecord {
                        build_hash: content_hash.clone(),
                        image_digest: descriptor.digest.clone(),
                    },
                )
            })?;
            log::info!("recorded base image {name} as {}", descriptor.digest);
        }
        Ok(())
    }

    /// The repository-qualified name of a base image, either tagged by its
    /// content hash or pinned by digest when one is known and requested.
    pub fn base_image_name(
        &self,
        profile: &str,
        stage: &str,
        platform: &str,
        content_hash: &str,
        digest: Option<&str>,
        use_digest: bool,
    ) -> Result<String> {
        let template = self.config.base_image_repo.as_ref().context(ConfigurationSnafu {
            message: "base_image_repo must be configured to use base images",
        })?;
        let repo = format_simple(
            template,
            &params([("stage", stage), ("profile", profile), ("platform", platform)]),
        )?;
        match digest {
            Some(digest) if use_digest => Ok(format!("{repo}@{digest}")),
            _ => Ok(format!("{repo}:{content_hash}")),
        }
    }

    /// Name a base image node.
    pub(crate) fn base_image_name_for(
        &self,
        graph: &ImageGraph,
        image: ImageId,
        use_digest: bool,
    ) -> Result<String> {
        let ImageNode::Base {
            profile,
            stage,
            platform,
            content_hash,
            digest,
            ..
        } = graph.node(image)
        else {
            return InternalSnafu {
                message: "expected a base image node",
            }
            .fail();
        };
        let content_hash = content_hash.as_ref().context(InternalSnafu {
            message: format!("unresolved base image {profile}/{stage} during naming"),
        })?;
        self.base_image_name(profile, stage, platform, content_hash, digest.as_deref(), use_digest)
    }

    /// The salted content hash of a subgraph; this is what keys base images
    /// in the shared repository.
    pub fn content_hash(&self, graph: &mut ImageGraph, image: ImageId) -> Result<String> {
        let salt = self.hash_salt();
        let hashes = hash_graph(graph, &[image], &salt, false)?;
        hashes.get(&image).cloned().context(InternalSnafu {
            message: "hash mapping missing its root",
        })
    }

    /// The platform built when the caller does not pick one: the builder's
    /// probe output when configured, otherwise this machine's platform.
    pub async fn default_platform(self: &Arc<Self>) -> Result<String> {
        let executor = BuildExecutor::new(Arc::clone(self))?;
        let probed = executor.platform().await?;
        if probed.is_empty() {
            Ok(crate::arch::client_platform())
        } else {
            Ok(crate::arch::normalize_platform_string(&probed))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::registry::{Descriptor, ImageRef, Manifest, ManifestList};
    use futures::future::BoxFuture;
    use futures::FutureExt;

    /// A registry that knows nothing; lookups miss and everything else
    /// fails.
    pub(crate) struct NullRegistry;

    impl Registry for NullRegistry {
        fn ref_lookup<'a>(
            &'a self,
            _image: &'a ImageRef,
        ) -> BoxFuture<'a, Result<Option<Descriptor>>> {
            async { Ok(None) }.boxed()
        }

        fn manifest_download<'a>(&'a self, image: &'a ImageRef) -> BoxFuture<'a, Result<Manifest>> {
            let message = format!("no manifest for {image}");
            async move { RegistrySnafu { message }.fail() }.boxed()
        }

        fn blob_download<'a>(
            &'a self,
            image: &'a ImageRef,
            _digest: &'a str,
        ) -> BoxFuture<'a, Result<Vec<u8>>> {
            let message = format!("no blobs for {image}");
            async move { RegistrySnafu { message }.fail() }.boxed()
        }

        fn manifest_write<'a>(
            &'a self,
            _image: &'a ImageRef,
            _manifest: &'a ManifestList,
        ) -> BoxFuture<'a, Result<()>> {
            async { Ok(()) }.boxed()
        }

        fn ref_delete<'a>(&'a self, _image: &'a ImageRef) -> BoxFuture<'a, Result<bool>> {
            async { Ok(false) }.boxed()
        }
    }

    /// A project over a temporary directory with default configuration.
    pub(crate) fn project_fixture(dir: &Path) -> Arc<Project> {
        Project::open(dir, UserConfig::default(), Box::new(NullRegistry)).unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::test_support::project_fixture;
    use super::*;

    fn write_project(dir: &Path, config: &str, document: &str) {
        std::fs::write(dir.join(PROJECT_CONFIG_NAME), config).unwrap();
        std::fs::write(dir.join("build.tpl"), document).unwrap();
    }

    #[test]
    fn render_produces_stages_and_contexts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.txt"), b"data").unwrap();
        write_project(
            dir.path(),
            "",
            "FROM alpine:3 AS build\nRUN make {mode}\nFROM scratch AS app\nCOPY --from=build /out /app\n",
        );
        std::fs::write(
            dir.path().join(PROJECT_CONFIG_NAME),
            r#"
            [profiles.default]
            mode = "release"
            "#,
        )
        .unwrap();

        let project = project_fixture(dir.path());
        let mut graph = ImageGraph::new();
        let stages = project.render(&mut graph, "default", "linux/amd64").unwrap();

        // The default context plus both stages.
        assert!(stages.contains_key("default"));
        assert!(stages.contains_key("build"));
        assert!(stages.contains_key("app"));

        let ImageNode::Command { args, .. } = graph.node(stages["build"].image) else {
            panic!("expected command node");
        };
        assert_eq!(args, "make release");
        assert_eq!(stages["app"].config.image_names, vec!["app"]);
    }

    #[test]
    fn render_rejects_unknown_template_parameters() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path(), "", "FROM alpine AS app\nRUN {missing}\n");
        let project = project_fixture(dir.path());
        let mut graph = ImageGraph::new();
        let err = project
            .render(&mut graph, "default", "linux/amd64")
            .unwrap_err();
        assert!(err.to_string().contains("template"));
        assert!(err.secondary_message().is_some());
    }

    #[test]
    fn project_files_are_force_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path(), "", "FROM alpine:3 AS app\nRUN true\n");
        std::fs::write(dir.path().join("kept.txt"), b"kept").unwrap();

        let project = project_fixture(dir.path());
        let mut graph = ImageGraph::new();
        let stages = project.render(&mut graph, "default", "linux/amd64").unwrap();

        let ImageNode::Context { context, .. } = graph.node(stages["default"].image) else {
            panic!("expected context node");
        };
        assert!(context.ignored(PROJECT_CONFIG_NAME));
        assert!(context.ignored(BUILD_DATA_NAME));
        assert!(context.ignored("build.tpl"));
        assert!(!context.ignored("kept.txt"));
    }

    #[test]
    fn base_image_naming() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PROJECT_CONFIG_NAME),
            r#"base_image_repo = "registry.example.com/cache/{stage}-{profile}""#,
        )
        .unwrap();
        let project = project_fixture(dir.path());

        assert_eq!(
            project
                .base_image_name("default", "base-os", "linux/amd64", "cafe", None, false)
                .unwrap(),
            "registry.example.com/cache/base-os-default:cafe"
        );
        assert_eq!(
            project
                .base_image_name(
                    "default",
                    "base-os",
                    "linux/amd64",
                    "cafe",
                    Some("sha256:feed"),
                    true
                )
                .unwrap(),
            "registry.example.com/cache/base-os-default@sha256:feed"
        );
        // Without a digest the content-hash form is used even when a digest
        // was requested.
        assert_eq!(
            project
                .base_image_name("default", "base-os", "linux/amd64", "cafe", None, true)
                .unwrap(),
            "registry.example.com/cache/base-os-default:cafe"
        );
    }

    #[test]
    fn base_image_repo_is_required() {
        let dir = tempfile::tempdir().unwrap();
        let project = project_fixture(dir.path());
        assert!(project
            .base_image_name("default", "base-os", "linux/amd64", "cafe", None, false)
            .is_err());
    }
}
