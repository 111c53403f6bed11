/*!
Build execution.

Carries each planned operation through pre-pull, build, local tagging, and
pushes, driving the configured external client commands. Three semaphores
bound build, push/pull, and tag concurrency. All operation tasks are
spawned up front; each waits on its predecessors' completion events, which
fire as soon as a dependency's image is locally tagged (its pushes may
still be in flight). Multi-platform aggregates skip the builder entirely
and publish a manifest list instead. Operations with no requested tag get a
transient tag that is removed at teardown.
*/

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use snafu::{ensure, OptionExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::{watch, Semaphore};

use crate::arch::split_platform;
use crate::config::{ClientCommand, ClientConfig};
use crate::context::{BuildContext, ExtraFile};
use crate::error::{
    ClientSnafu, ConfigurationSnafu, Error, InternalSnafu, RegistrySnafu, Result,
};
use crate::images::{ImageGraph, ImageId, ImageNode};
use crate::output::OutputStream;
use crate::pipe::SyncToAsyncPipe;
use crate::plan::BuildOperation;
use crate::project::Project;
use crate::registry::{parse_image_name, Descriptor, ManifestList, ManifestPlatform};
use crate::scope::run_scope;
use crate::util::params;

const TRANSIENT_PREFIX: &str = "bakesys";
const CONTEXT_DOCUMENT: &str = "FROM scratch\nCOPY . /\n";

/// Completion callback invoked per finished operation with the operation's
/// index and primary tag.
pub type CompleteCallback =
    Arc<dyn Fn(usize, String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

type SharedPull = Shared<BoxFuture<'static, std::result::Result<(), Arc<Error>>>>;

/// A build operation rendered to the concrete inputs the client commands
/// need.
#[derive(Clone, Debug)]
pub(crate) struct RenderedOp {
    /// Build document passed to the builder.
    pub document: String,
    /// Ordered tag plan; `true` marks tags that are also pushed.
    pub tags: Vec<(String, bool)>,
    /// Tag the image is initially built as; transient when no tag was
    /// requested.
    pub primary_tag: String,
    /// Title for the operation's output stream.
    pub title: String,
    /// Set when the operation creates no new image (aggregates, aliases of
    /// externals); such operations do not register in the tag map.
    pub build_empty: bool,
}

pub struct BuildExecutor {
    project: Arc<Project>,
    client: ClientConfig,
    sem_build: Semaphore,
    sem_push: Semaphore,
    sem_tag: Semaphore,
    build_retry: u32,
    push_retry: u32,
    empty_context: Arc<BuildContext>,
}

impl BuildExecutor {
    pub fn new(project: Arc<Project>) -> Result<Self> {
        let user_config = project.user_config();
        let client = user_config.resolved_client();
        let executor = Self {
            client,
            sem_build: Semaphore::new(user_config.effective_build_jobs()),
            sem_push: Semaphore::new(user_config.push_jobs),
            sem_tag: Semaphore::new(user_config.tag_jobs),
            build_retry: user_config.build_retry,
            push_retry: user_config.push_retry,
            empty_context: Arc::new(BuildContext::new(None, None, Vec::<&str>::new())?),
            project,
        };
        Ok(executor)
    }

    /// Build every operation, tagging and pushing results. Operations must
    /// be topologically sorted. `complete` runs after each operation
    /// finishes its tags and pushes.
    pub async fn build(
        self: &Arc<Self>,
        graph: Arc<ImageGraph>,
        ops: Arc<Vec<BuildOperation>>,
        complete: Option<CompleteCallback>,
    ) -> Result<()> {
        let (rendered, tag_map) = self.render_build_ops(&graph, &ops)?;
        let rendered = Arc::new(rendered);
        let tag_map = Arc::new(tag_map);
        let transients: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let pulls: Arc<tokio::sync::Mutex<HashMap<String, SharedPull>>> =
            Arc::new(tokio::sync::Mutex::new(HashMap::new()));

        let executor = Arc::clone(self);
        let result = run_scope(|scope| {
            let transients = Arc::clone(&transients);
            async move {
                let mut senders = Vec::with_capacity(ops.len());
                let mut receivers = Vec::with_capacity(ops.len());
                for _ in 0..ops.len() {
                    let (sender, receiver) = watch::channel(false);
                    senders.push(sender);
                    receivers.push(receiver);
                }

                let mut pending = FuturesUnordered::new();
                for (index, sender) in senders.into_iter().enumerate() {
                    let dep_events: Vec<watch::Receiver<bool>> = ops[index]
                        .dependencies
                        .iter()
                        .map(|dep| receivers[*dep].clone())
                        .collect();
                    let handle = scope.spawn_with(
                        Self::run_operation(
                            Arc::clone(&executor),
                            Arc::clone(&graph),
                            Arc::clone(&ops),
                            Arc::clone(&rendered),
                            Arc::clone(&tag_map),
                            Arc::clone(&transients),
                            Arc::clone(&pulls),
                            index,
                            dep_events,
                            sender,
                            complete.clone(),
                        ),
                        false,
                        true,
                    );
                    pending.push(handle.join());
                }

                while let Some(result) = pending.next().await {
                    result?;
                }
                Ok(())
            }
        })
        .await;

        // Transient tags are removed whether or not the build succeeded;
        // cleanup failures never mask an in-flight error.
        let transients = std::mem::take(&mut *transients.lock().unwrap());
        for image in transients {
            if let Err(err) = self.untag_image(&image).await {
                log::warn!("failed to remove transient tag {image}: {err}");
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_operation(
        executor: Arc<Self>,
        graph: Arc<ImageGraph>,
        ops: Arc<Vec<BuildOperation>>,
        rendered: Arc<Vec<RenderedOp>>,
        tag_map: Arc<HashMap<ImageId, String>>,
        transients: Arc<Mutex<Vec<String>>>,
        pulls: Arc<tokio::sync::Mutex<HashMap<String, SharedPull>>>,
        index: usize,
        dep_events: Vec<watch::Receiver<bool>>,
        done: watch::Sender<bool>,
        complete: Option<CompleteCallback>,
    ) -> Result<()> {
        for mut event in dep_events {
            while !*event.borrow() {
                event.changed().await.map_err(|_| Error::Cancelled)?;
            }
        }

        let op = &ops[index];
        let rendered_op = &rendered[index];

        match graph.node(op.image) {
            ImageNode::MultiPlatform { images, .. } => {
                executor
                    .build_multi_platform(
                        &rendered_op.tags,
                        &tag_map,
                        &rendered_op.title,
                        images,
                    )
                    .await?;
                let _ = done.send(true);
            }
            node => {
                if let ImageNode::Context { context, platform, .. } = node {
                    executor
                        .client_build(
                            &rendered_op.primary_tag,
                            platform,
                            CONTEXT_DOCUMENT,
                            &rendered_op.title,
                            Some(Arc::clone(context)),
                            &BTreeSet::new(),
                        )
                        .await?;
                } else {
                    let (remote_deps, local_deps) =
                        executor.collect_chain_deps(&graph, op, &tag_map)?;
                    if executor.client.pull.is_some() {
                        for (image, title) in remote_deps {
                            executor
                                .shared_pull(Arc::clone(&pulls), image, title)
                                .await?;
                        }
                    }
                    let inline_context = match op.inline_context {
                        Some(context_image) => match graph.node(context_image) {
                            ImageNode::Context { context, .. } => Some(Arc::clone(context)),
                            _ => {
                                return InternalSnafu {
                                    message: "inline context is not a context image",
                                }
                                .fail()
                            }
                        },
                        None => None,
                    };
                    executor
                        .client_build(
                            &rendered_op.primary_tag,
                            &op.platform,
                            &rendered_op.document,
                            &rendered_op.title,
                            inline_context,
                            &local_deps,
                        )
                        .await?;
                }
                let _ = done.send(true);

                if rendered_op.tags.is_empty() {
                    transients
                        .lock()
                        .unwrap()
                        .push(rendered_op.primary_tag.clone());
                }
                for (tag, push) in &rendered_op.tags {
                    if tag != &rendered_op.primary_tag {
                        executor.tag_image(&rendered_op.primary_tag, tag).await?;
                    }
                    if *push {
                        executor.push_image(tag, &rendered_op.title).await?;
                    }
                }
            }
        }

        if let Some(complete) = complete {
            complete(index, rendered_op.primary_tag.clone()).await?;
        }
        Ok(())
    }

    /// Await a pull through the shared dedup map, creating the underlying
    /// pull future on first use.
    async fn shared_pull(
        self: &Arc<Self>,
        pulls: Arc<tokio::sync::Mutex<HashMap<String, SharedPull>>>,
        image: String,
        title: String,
    ) -> Result<()> {
        let shared = {
            let mut pulls = pulls.lock().await;
            match pulls.get(&image) {
                Some(shared) => shared.clone(),
                None => {
                    let executor = Arc::clone(self);
                    let pull_image = image.clone();
                    let shared: SharedPull = async move {
                        executor
                            .pull_image(&pull_image, &title)
                            .await
                            .map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    pulls.insert(image, shared.clone());
                    shared
                }
            }
        };
        shared.await.map_err(|err| {
            ClientSnafu {
                message: format!("pull failed: {err}"),
            }
            .build()
        })
    }

    /// Render each operation into its build document, tag plan, primary
    /// tag, and title. Also returns the image-to-tag map used to reference
    /// the results of other operations.
    pub(crate) fn render_build_ops(
        &self,
        graph: &ImageGraph,
        ops: &[BuildOperation],
    ) -> Result<(Vec<RenderedOp>, HashMap<ImageId, String>)> {
        let titles = compute_titles(graph, ops);
        let mut rendered = Vec::with_capacity(ops.len());
        let mut tag_map: HashMap<ImageId, String> = HashMap::new();

        for (op, title) in ops.iter().zip(titles) {
            let mut tags: Vec<(String, bool)> = Vec::new();
            for stage in &op.stages {
                for name in &stage.config.image_names {
                    if !tags.iter().any(|(tag, _)| tag == name) {
                        tags.push((name.clone(), false));
                    }
                }
                for name in &stage.config.push_names {
                    match tags.iter_mut().find(|(tag, _)| tag == name) {
                        Some((_, push)) => *push = true,
                        None => tags.push((name.clone(), true)),
                    }
                }
            }

            if matches!(graph.node(op.image), ImageNode::MultiPlatform { .. }) {
                rendered.push(RenderedOp {
                    document: "# multi-platform image".to_string(),
                    primary_tag: tags
                        .first()
                        .map(|(tag, _)| tag.clone())
                        .unwrap_or_default(),
                    tags,
                    title,
                    build_empty: true,
                });
                continue;
            }

            let primary_tag = match tags.first() {
                Some((tag, _)) => tag.clone(),
                None => format!("{TRANSIENT_PREFIX}-{}", uuid::Uuid::new_v4()),
            };

            if matches!(graph.node(op.image), ImageNode::Context { .. }) {
                tag_map.insert(op.image, primary_tag.clone());
                rendered.push(RenderedOp {
                    document: "# shared context image".to_string(),
                    tags,
                    primary_tag,
                    title,
                    build_empty: false,
                });
                continue;
            }

            let mut lines = Vec::new();
            let mut image = op.image;
            while image != op.root {
                match graph.node(image) {
                    ImageNode::Command {
                        command,
                        args,
                        parent,
                        ..
                    } => {
                        lines.push(format!("{command} {args}"));
                        image = *parent;
                    }
                    ImageNode::CopyCommand {
                        parent,
                        context,
                        args,
                        ..
                    } => {
                        if op.inline_context == Some(*context) {
                            lines.push(format!("COPY {args}"));
                        } else {
                            lines.push(format!(
                                "COPY --from={} {args}",
                                self.name_image(graph, *context, &tag_map)?
                            ));
                        }
                        image = *parent;
                    }
                    _ => {
                        return InternalSnafu {
                            message: "unexpected image variant during rendering",
                        }
                        .fail()
                    }
                }
            }

            let build_empty = lines.is_empty();
            lines.push(format!("FROM {}", self.name_image(graph, image, &tag_map)?));
            if let Some(syntax) = self.project.config().document_syntax.as_ref() {
                lines.push(format!("# syntax={syntax}"));
            }
            lines.reverse();

            if !build_empty {
                tag_map.insert(op.image, primary_tag.clone());
            }
            rendered.push(RenderedOp {
                document: lines.join("\n"),
                tags,
                primary_tag,
                title,
                build_empty,
            });
        }
        Ok((rendered, tag_map))
    }

    /// Name an image for use in a build document or client command: a tag
    /// from a previous operation, a digest-pinned source, a base image
    /// repository reference, or the literal `scratch`.
    fn name_image(
        &self,
        graph: &ImageGraph,
        image: ImageId,
        tag_map: &HashMap<ImageId, String>,
    ) -> Result<String> {
        if let Some(tag) = tag_map.get(&image) {
            return Ok(tag.clone());
        }
        match graph.node(image) {
            ImageNode::Source { repo, digest, .. } => {
                let digest = digest.as_ref().context(InternalSnafu {
                    message: format!("unresolved source image {repo} during rendering"),
                })?;
                Ok(format!("{repo}@{digest}"))
            }
            ImageNode::Base { .. } => self.project.base_image_name_for(graph, image, true),
            ImageNode::Scratch { .. } => Ok("scratch".to_string()),
            _ => InternalSnafu {
                message: "unexpected image variant during rendering",
            }
            .fail(),
        }
    }

    /// Split the images a chain references into remote images (pulled
    /// up-front) and locally built dependencies (passed to the builder).
    fn collect_chain_deps(
        &self,
        graph: &ImageGraph,
        op: &BuildOperation,
        tag_map: &HashMap<ImageId, String>,
    ) -> Result<(BTreeMap<String, String>, BTreeSet<String>)> {
        let mut remote = BTreeMap::new();
        let mut local = BTreeSet::new();

        let title_image = |image: ImageId| -> String {
            match graph.node(image) {
                ImageNode::Base {
                    stage,
                    profile,
                    platform,
                    ..
                } => format!("{stage}:{profile}:{platform}"),
                ImageNode::Source {
                    repo,
                    tag,
                    platform,
                    ..
                } => format!("{repo}:{tag}:{platform}"),
                _ => String::new(),
            }
        };
        let mut record = |graph: &ImageGraph,
                          remote: &mut BTreeMap<String, String>,
                          local: &mut BTreeSet<String>,
                          image: ImageId|
         -> Result<()> {
            let name = self.name_image(graph, image, tag_map)?;
            match graph.node(image) {
                ImageNode::Base { .. } | ImageNode::Source { .. } => {
                    remote.insert(name, title_image(image));
                }
                ImageNode::Scratch { .. } => {}
                _ => {
                    local.insert(name);
                }
            }
            Ok(())
        };

        let mut image = op.image;
        while image != op.root {
            match graph.node(image) {
                ImageNode::Command { parent, .. } => image = *parent,
                ImageNode::CopyCommand { parent, context, .. } => {
                    let (parent, context) = (*parent, *context);
                    if op.inline_context != Some(context) {
                        record(graph, &mut remote, &mut local, context)?;
                    }
                    image = parent;
                }
                _ => {
                    return InternalSnafu {
                        message: "unexpected image variant during rendering",
                    }
                    .fail()
                }
            }
        }
        record(graph, &mut remote, &mut local, image)?;
        Ok((remote, local))
    }

    /// Publish a multi-platform aggregate: push every per-platform image
    /// under a platform-suffixed tag, then write a manifest list combining
    /// their descriptors. Every tag must be a push tag.
    async fn build_multi_platform(
        &self,
        tags: &[(String, bool)],
        tag_map: &HashMap<ImageId, String>,
        title: &str,
        images: &[(String, ImageId)],
    ) -> Result<()> {
        ensure!(
            !tags.is_empty() && tags.iter().all(|(_, push)| *push),
            ConfigurationSnafu {
                message: "multi-platform images only support push tags",
            }
        );

        for (tag, _) in tags {
            let image_ref = parse_image_name(tag)?;
            let descriptors =
                futures::future::try_join_all(images.iter().map(|(platform, sub_image)| {
                    let sub_ref = image_ref.with_reference(format!(
                        "{}-{}",
                        image_ref.reference,
                        platform.replace('/', "-")
                    ));
                    async move {
                        let sub_tag = tag_map.get(sub_image).context(InternalSnafu {
                            message: "multi-platform child has no tag",
                        })?;
                        let sub_name = sub_ref.to_string();
                        self.tag_image(sub_tag, &sub_name).await?;
                        self.push_image(&sub_name, &format!("{title}:{platform}"))
                            .await?;
                        let descriptor = self
                            .project
                            .registry()
                            .ref_lookup(&sub_ref)
                            .await?
                            .context(RegistrySnafu {
                                message: format!(
                                    "could not look up pushed image {sub_name} on registry"
                                ),
                            })?;
                        Ok::<_, Error>((platform.as_str(), descriptor))
                    }
                }))
                .await?;

            let manifests = descriptors
                .into_iter()
                .map(|(platform, descriptor)| {
                    let (os, architecture, variant) = split_platform(platform);
                    Descriptor {
                        platform: Some(ManifestPlatform {
                            os,
                            architecture,
                            variant,
                        }),
                        ..descriptor
                    }
                })
                .collect();
            self.project
                .registry()
                .manifest_write(&image_ref, &ManifestList::new(manifests))
                .await?;
            self.project
                .output()
                .start_stream(title)
                .write_str(&format!("Wrote multi-platform image {image_ref}"));
        }
        Ok(())
    }

    /// Run the client build command, streaming the context archive (with
    /// the build document embedded as `Dockerfile`) into its stdin.
    async fn client_build(
        &self,
        tag: &str,
        platform: &str,
        document: &str,
        title: &str,
        context: Option<Arc<BuildContext>>,
        dependencies: &BTreeSet<String>,
    ) -> Result<()> {
        let _permit = self.sem_build.acquire().await.map_err(closed_semaphore)?;
        let stream = self.project.output().start_stream(title);
        let context = context.unwrap_or_else(|| Arc::clone(&self.empty_context));
        let dependencies = dependencies
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        let build_params = params([
            ("image", tag),
            ("platform", platform),
            ("dependencies", dependencies.as_str()),
        ]);

        for attempt in 0..=self.build_retry {
            let pipe = SyncToAsyncPipe::new();
            let writer_pipe = pipe.clone();
            let writer_context = Arc::clone(&context);
            let document_data = document.as_bytes().to_vec();
            let writer = tokio::task::spawn_blocking(move || {
                let result = writer_context.write_archive(
                    writer_pipe.writer(),
                    false,
                    &[ExtraFile {
                        name: "Dockerfile".to_string(),
                        mode: 0o444,
                        data: document_data,
                    }],
                );
                writer_pipe.close();
                result
            });

            let run = self.run_client_command(
                &self.client.build,
                &build_params,
                false,
                Some(&stream),
                Some(pipe),
            );
            let (writer_result, run_result) = tokio::join!(writer, run);

            match run_result {
                Ok(_) => {
                    // The builder succeeded; archive errors other than the
                    // builder closing its input early are still fatal.
                    match writer_result {
                        Ok(result) => result?,
                        Err(join_err) => {
                            return InternalSnafu {
                                message: format!("archive writer failed: {join_err}"),
                            }
                            .fail()
                        }
                    }
                    return Ok(());
                }
                Err(err) => {
                    stream.write_str(&format!(
                        "Build failed on attempt {}/{}",
                        attempt + 1,
                        self.build_retry + 1
                    ));
                    if attempt == self.build_retry {
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn tag_image(&self, source_image: &str, target_image: &str) -> Result<()> {
        let _permit = self.sem_tag.acquire().await.map_err(closed_semaphore)?;
        self.run_client_command(
            &self.client.tag,
            &params([("source_image", source_image), ("target_image", target_image)]),
            false,
            None,
            None,
        )
        .await?;
        Ok(())
    }

    pub(crate) async fn untag_image(&self, image: &str) -> Result<()> {
        let _permit = self.sem_tag.acquire().await.map_err(closed_semaphore)?;
        self.run_client_command(
            &self.client.untag,
            &params([("image", image)]),
            false,
            None,
            None,
        )
        .await?;
        Ok(())
    }

    pub(crate) async fn pull_image(&self, image: &str, title: &str) -> Result<()> {
        let pull = self.client.pull.as_ref().context(InternalSnafu {
            message: "pull command not configured",
        })?;
        let _permit = self.sem_push.acquire().await.map_err(closed_semaphore)?;
        let stream = self.project.output().start_stream(title);
        self.retry_push_command(pull, &params([("image", image)]), &stream, "Pull")
            .await
    }

    pub(crate) async fn push_image(&self, image: &str, title: &str) -> Result<()> {
        let _permit = self.sem_push.acquire().await.map_err(closed_semaphore)?;
        let stream = self.project.output().start_stream(title);
        self.retry_push_command(&self.client.push, &params([("image", image)]), &stream, "Push")
            .await
    }

    async fn retry_push_command(
        &self,
        command: &ClientCommand,
        command_params: &BTreeMap<String, String>,
        stream: &OutputStream,
        what: &str,
    ) -> Result<()> {
        for attempt in 0..=self.push_retry {
            match self
                .run_client_command(command, command_params, false, Some(stream), None)
                .await
            {
                Ok(_) => return Ok(()),
                Err(err) => {
                    stream.write_str(&format!(
                        "{what} failed on attempt {}/{}",
                        attempt + 1,
                        self.push_retry + 1
                    ));
                    if attempt == self.push_retry {
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    /// The builder's native platform, or an empty string when no probe
    /// command is configured. The output is not normalized here.
    pub async fn platform(&self) -> Result<String> {
        let Some(command) = self.client.platform.as_ref() else {
            return Ok(String::new());
        };
        let output = self
            .run_client_command(command, &BTreeMap::new(), true, None, None)
            .await?;
        String::from_utf8(output)
            .map(|text| text.trim().to_string())
            .map_err(|_| {
                ClientSnafu {
                    message: "failed to decode builder platform",
                }
                .build()
            })
    }

    /// Spawn a rendered client command, streaming its output line by line
    /// and feeding `input` into its stdin when provided.
    async fn run_client_command(
        &self,
        command: &ClientCommand,
        command_params: &BTreeMap<String, String>,
        capture: bool,
        stream: Option<&OutputStream>,
        input: Option<SyncToAsyncPipe>,
    ) -> Result<Vec<u8>> {
        let (args, environment) = command.render(command_params)?;
        ensure!(
            !args.is_empty(),
            InternalSnafu {
                message: "client command rendered to an empty argv",
            }
        );

        let mut child = tokio::process::Command::new(&args[0])
            .args(&args[1..])
            .envs(environment)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                ClientSnafu {
                    message: format!("failed to spawn {:?}: {err}", args[0]),
                }
                .build()
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        let copy_stdout = async {
            let mut collected = Vec::new();
            if let Some(stdout) = stdout {
                let mut reader = tokio::io::BufReader::new(stdout);
                let mut line = Vec::new();
                while let Ok(n) = reader.read_until(b'\n', &mut line).await {
                    if n == 0 {
                        break;
                    }
                    if capture {
                        collected.extend_from_slice(&line);
                    }
                    if let Some(stream) = stream {
                        stream.write(&line, false);
                    }
                    line.clear();
                }
            }
            collected
        };
        let copy_stderr = async {
            if let Some(stderr) = stderr {
                let mut reader = tokio::io::BufReader::new(stderr);
                let mut line = Vec::new();
                while let Ok(n) = reader.read_until(b'\n', &mut line).await {
                    if n == 0 {
                        break;
                    }
                    if let Some(stream) = stream {
                        stream.write(&line, true);
                    }
                    line.clear();
                }
            }
        };
        let copy_stdin = async {
            if let (Some(mut stdin), Some(pipe)) = (stdin, input.as_ref()) {
                loop {
                    let chunk = match pipe.read().await {
                        Ok(chunk) => chunk,
                        Err(err) => {
                            log::warn!("context pipe read failed: {err}");
                            break;
                        }
                    };
                    if chunk.is_empty() {
                        break;
                    }
                    if stdin.write_all(&chunk).await.is_err() {
                        log::warn!("process exited before finishing its input");
                        break;
                    }
                }
                let _ = stdin.shutdown().await;
                pipe.close();
            }
        };

        let (collected, (), (), status) =
            tokio::join!(copy_stdout, copy_stderr, copy_stdin, child.wait());
        let status = status.map_err(|err| {
            ClientSnafu {
                message: format!("failed to wait for {:?}: {err}", args[0]),
            }
            .build()
        })?;
        ensure!(
            status.success(),
            ClientSnafu {
                message: format!("client command failed: {}", args.join(" ")),
            }
        );
        Ok(collected)
    }
}

fn closed_semaphore(_: tokio::sync::AcquireError) -> Error {
    InternalSnafu {
        message: "executor semaphore closed",
    }
    .build()
}

#[derive(Default)]
struct TitleTrie(BTreeMap<String, TitleTrie>);

impl TitleTrie {
    fn insert(&mut self, parts: &[String]) {
        let mut node = self;
        for part in parts {
            node = node.0.entry(part.clone()).or_default();
        }
    }
}

fn construct_title(trie: &TitleTrie, seps: &[char], depth: usize) -> String {
    if trie.0.is_empty() {
        return String::new();
    }
    let sep = seps[depth.min(seps.len() - 1)];
    let children: Vec<(String, String)> = trie
        .0
        .iter()
        .map(|(key, child)| (key.clone(), construct_title(child, seps, depth + 1)))
        .collect();
    let join_one = |key: &str, value: &str| {
        if value.is_empty() {
            key.to_string()
        } else {
            format!("{key}{sep}{value}")
        }
    };

    if children.len() == 1 {
        return join_one(&children[0].0, &children[0].1);
    }
    let distinct: HashSet<&String> = children.iter().map(|(_, value)| value).collect();
    if distinct.len() == 1 {
        let keys: Vec<&str> = children.iter().map(|(key, _)| key.as_str()).collect();
        return join_one(&format!("{{{}}}", keys.join(",")), &children[0].1);
    }
    children
        .iter()
        .map(|(key, value)| format!("{{{}}}", join_one(key, value)))
        .collect::<Vec<_>>()
        .join(",")
}

/// Derive a user-facing title per operation from its stage provenance.
/// Profiles and platforms only appear when more than one is in play.
pub(crate) fn compute_titles(graph: &ImageGraph, ops: &[BuildOperation]) -> Vec<String> {
    let mut all_profiles = BTreeSet::new();
    let mut all_platforms = BTreeSet::new();
    for op in ops {
        if let Some(descs) = graph.node(op.image).stage_descs() {
            for desc in descs {
                all_profiles.insert(desc.profile.clone());
                all_platforms.insert(desc.platform.clone());
            }
        }
    }

    let seps: &[char] = if all_profiles.len() > 1 {
        &[':', ':', '/']
    } else {
        &[':', '/']
    };

    ops.iter()
        .map(|op| {
            let is_aggregator = matches!(graph.node(op.image), ImageNode::MultiPlatform { .. });
            let mut trie = TitleTrie::default();
            for desc in graph.node(op.image).stage_descs().into_iter().flatten() {
                let mut parts = vec![desc.name.clone()];
                if all_profiles.len() > 1 {
                    parts.push(desc.profile.clone());
                }
                if all_platforms.len() > 1 && !is_aggregator {
                    let (os, arch, variant) = split_platform(&desc.platform);
                    parts.push(os);
                    if variant.is_empty() {
                        parts.push(arch);
                    } else {
                        parts.push(format!("{arch}/{variant}"));
                    }
                }
                trie.insert(&parts);
            }
            if trie.0.is_empty() {
                "intermediate".to_string()
            } else {
                construct_title(&trie, seps, 0)
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::StageConfig;
    use crate::images::StageDesc;
    use crate::plan::plan;
    use crate::project::test_support::project_fixture;
    use crate::render::StageData;
    use std::path::Path;

    const PLATFORM: &str = "linux/amd64";

    fn descs(name: &str, platform: &str) -> std::collections::BTreeSet<StageDesc> {
        [StageDesc {
            name: name.to_string(),
            profile: "default".to_string(),
            platform: platform.to_string(),
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

    fn stage(name: &str, image: ImageId, push: bool) -> StageData {
        StageData {
            name: name.to_string(),
            image,
            config: StageConfig {
                base: false,
                image_names: vec![name.to_string()],
                push_names: if push { vec![format!("registry.example.com/{name}")] } else { Vec::new() },
            },
            base_image: None,
        }
    }

    fn executor(dir: &Path) -> Arc<BuildExecutor> {
        Arc::new(BuildExecutor::new(project_fixture(dir)).unwrap())
    }

    #[test]
    fn documents_render_in_execution_order() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());

        let mut graph = ImageGraph::new();
        let root = source(&mut graph, "alpine");
        let first = graph.add(ImageNode::Command {
            stage_descs: descs("app", PLATFORM),
            parent: root,
            command: "RUN".to_string(),
            args: "make".to_string(),
        });
        let second = graph.add(ImageNode::Command {
            stage_descs: descs("app", PLATFORM),
            parent: first,
            command: "ENV".to_string(),
            args: "MODE=release".to_string(),
        });

        let ops = plan(&mut graph, &[stage("app", second, false)]).unwrap();
        let (rendered, tag_map) = executor.render_build_ops(&graph, &ops).unwrap();

        assert_eq!(rendered.len(), 1);
        assert_eq!(
            rendered[0].document,
            "FROM alpine@sha256:alpine\nRUN make\nENV MODE=release"
        );
        assert_eq!(rendered[0].primary_tag, "app");
        assert_eq!(rendered[0].tags, vec![("app".to_string(), false)]);
        assert!(!rendered[0].build_empty);
        assert_eq!(rendered[0].title, "app");
        assert_eq!(tag_map.get(&ops[0].image), Some(&"app".to_string()));
    }

    #[test]
    fn copy_references_other_operations_by_tag() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());

        let mut graph = ImageGraph::new();
        let builder_root = source(&mut graph, "golang");
        let builder_tip = graph.add(ImageNode::Command {
            stage_descs: descs("builder", PLATFORM),
            parent: builder_root,
            command: "RUN".to_string(),
            args: "go build".to_string(),
        });
        let scratch = graph.add(ImageNode::Scratch {
            platform: PLATFORM.to_string(),
        });
        let copy = graph.add(ImageNode::CopyCommand {
            stage_descs: descs("app", PLATFORM),
            parent: scratch,
            context: builder_tip,
            args: "/out/app /app".to_string(),
        });

        let ops = plan(
            &mut graph,
            &[stage("builder", builder_tip, false), stage("app", copy, false)],
        )
        .unwrap();
        let (rendered, _) = executor.render_build_ops(&graph, &ops).unwrap();

        let builder_index = ops.iter().position(|op| op.image == builder_tip).unwrap();
        let app_index = ops.iter().position(|op| op.image == copy).unwrap();
        assert_eq!(
            rendered[builder_index].document,
            "FROM golang@sha256:golang\nRUN go build"
        );
        assert_eq!(
            rendered[app_index].document,
            "FROM scratch\nCOPY --from=builder /out/app /app"
        );
        assert_eq!(ops[app_index].dependencies, vec![builder_index]);
    }

    #[test]
    fn operations_without_tags_get_transient_primaries() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());

        let mut graph = ImageGraph::new();
        let root = source(&mut graph, "alpine");
        let shared = graph.add(ImageNode::Command {
            stage_descs: std::collections::BTreeSet::new(),
            parent: root,
            command: "RUN".to_string(),
            args: "common".to_string(),
        });
        let tip_a = graph.add(ImageNode::Command {
            stage_descs: descs("one", PLATFORM),
            parent: shared,
            command: "RUN".to_string(),
            args: "a".to_string(),
        });
        let tip_b = graph.add(ImageNode::Command {
            stage_descs: descs("two", PLATFORM),
            parent: shared,
            command: "RUN".to_string(),
            args: "b".to_string(),
        });

        let ops = plan(
            &mut graph,
            &[stage("one", tip_a, false), stage("two", tip_b, false)],
        )
        .unwrap();
        let (rendered, tag_map) = executor.render_build_ops(&graph, &ops).unwrap();

        let shared_index = ops.iter().position(|op| op.image == shared).unwrap();
        assert!(rendered[shared_index].tags.is_empty());
        assert!(rendered[shared_index]
            .primary_tag
            .starts_with("bakesys-"));
        assert_eq!(rendered[shared_index].title, "intermediate");

        // Dependants reference the shared image through its transient tag.
        for (index, op) in ops.iter().enumerate() {
            if index != shared_index {
                assert!(rendered[index]
                    .document
                    .starts_with(&format!("FROM {}", rendered[shared_index].primary_tag)));
                let _ = op;
            }
        }
        assert_eq!(
            tag_map.get(&shared),
            Some(&rendered[shared_index].primary_tag)
        );
    }

    #[test]
    fn tag_plan_orders_and_merges() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());

        let mut graph = ImageGraph::new();
        let root = source(&mut graph, "alpine");
        let tip = graph.add(ImageNode::Command {
            stage_descs: descs("app", PLATFORM),
            parent: root,
            command: "RUN".to_string(),
            args: "x".to_string(),
        });

        let mut stage_data = stage("app", tip, false);
        stage_data.config.image_names =
            vec!["app:latest".to_string(), "app:dev".to_string()];
        stage_data.config.push_names =
            vec!["app:dev".to_string(), "registry.example.com/app".to_string()];

        let ops = plan(&mut graph, &[stage_data]).unwrap();
        let (rendered, _) = executor.render_build_ops(&graph, &ops).unwrap();

        // Image names first in order, then push names; a tag listed both
        // ways stays in place but becomes a push tag.
        assert_eq!(
            rendered[0].tags,
            vec![
                ("app:latest".to_string(), false),
                ("app:dev".to_string(), true),
                ("registry.example.com/app".to_string(), true),
            ]
        );
        assert_eq!(rendered[0].primary_tag, "app:latest");
    }

    #[test]
    fn multi_platform_operations_render_empty() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());

        let mut graph = ImageGraph::new();
        let amd_root = source(&mut graph, "amd");
        let amd = graph.add(ImageNode::Command {
            stage_descs: descs("app", "linux/amd64"),
            parent: amd_root,
            command: "RUN".to_string(),
            args: "build".to_string(),
        });
        let arm_root = source(&mut graph, "arm");
        let arm = graph.add(ImageNode::Command {
            stage_descs: descs("app", "linux/arm64"),
            parent: arm_root,
            command: "RUN".to_string(),
            args: "build arm".to_string(),
        });
        let aggregate = graph.add(ImageNode::MultiPlatform {
            stage_descs: descs("app", "*"),
            images: vec![
                ("linux/amd64".to_string(), amd),
                ("linux/arm64".to_string(), arm),
            ],
        });

        let mut aggregate_stage = stage("app", aggregate, true);
        aggregate_stage.config.image_names.clear();

        let ops = plan(&mut graph, &[aggregate_stage]).unwrap();
        let (rendered, tag_map) = executor.render_build_ops(&graph, &ops).unwrap();

        let aggregate_index = ops.iter().position(|op| op.image == aggregate).unwrap();
        assert!(rendered[aggregate_index].build_empty);
        assert_eq!(
            rendered[aggregate_index].primary_tag,
            "registry.example.com/app"
        );
        assert!(!tag_map.contains_key(&aggregate));

        // The per-platform children carry transient tags.
        for (index, op) in ops.iter().enumerate() {
            if index != aggregate_index {
                assert!(rendered[index].primary_tag.starts_with("bakesys-"));
                assert!(tag_map.contains_key(&op.image));
            }
        }
    }

    #[test]
    fn chain_deps_split_remote_and_local() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());

        let mut graph = ImageGraph::new();
        let builder_root = source(&mut graph, "golang");
        let builder_tip = graph.add(ImageNode::Command {
            stage_descs: descs("builder", PLATFORM),
            parent: builder_root,
            command: "RUN".to_string(),
            args: "go build".to_string(),
        });
        let app_root = source(&mut graph, "alpine");
        let copy = graph.add(ImageNode::CopyCommand {
            stage_descs: descs("app", PLATFORM),
            parent: app_root,
            context: builder_tip,
            args: "/out/app /app".to_string(),
        });

        let ops = plan(
            &mut graph,
            &[stage("builder", builder_tip, false), stage("app", copy, false)],
        )
        .unwrap();
        let (_, tag_map) = executor.render_build_ops(&graph, &ops).unwrap();

        let app_op = ops.iter().find(|op| op.image == copy).unwrap();
        let (remote, local) = executor
            .collect_chain_deps(&graph, app_op, &tag_map)
            .unwrap();

        // The chain root is an external image, the copy source is another
        // operation's result.
        assert_eq!(
            remote.get("alpine@sha256:alpine").map(String::as_str),
            Some("alpine:latest:linux/amd64")
        );
        assert!(local.contains("builder"));
    }

    #[test]
    fn titles_include_profile_and_platform_when_varied() {
        let dir = tempfile::tempdir().unwrap();
        let _ = executor(dir.path());

        let mut graph = ImageGraph::new();
        let root = source(&mut graph, "alpine");
        let mut node = |name: &str, platform: &str| {
            graph.add(ImageNode::Command {
                stage_descs: descs(name, platform),
                parent: root,
                command: "RUN".to_string(),
                args: format!("{name}-{platform}"),
            })
        };
        let amd = node("app", "linux/amd64");
        let arm = node("app", "linux/arm64");

        let ops = vec![
            BuildOperation {
                image: amd,
                root,
                platform: "linux/amd64".to_string(),
                inline_context: None,
                stages: Vec::new(),
                dependencies: Vec::new(),
            },
            BuildOperation {
                image: arm,
                root,
                platform: "linux/arm64".to_string(),
                inline_context: None,
                stages: Vec::new(),
                dependencies: Vec::new(),
            },
        ];
        let titles = compute_titles(&graph, &ops);
        assert_eq!(titles, vec!["app:linux/amd64", "app:linux/arm64"]);

        // With one platform in play the suffix disappears.
        let single = vec![BuildOperation {
            image: amd,
            root,
            platform: "linux/amd64".to_string(),
            inline_context: None,
            stages: Vec::new(),
            dependencies: Vec::new(),
        }];
        assert_eq!(compute_titles(&graph, &single), vec!["app"]);
    }

    #[test]
    fn title_grouping_brackets_shared_suffixes() {
        let mut trie = TitleTrie::default();
        trie.insert(&["one".to_string()]);
        trie.insert(&["two".to_string()]);
        assert_eq!(construct_title(&trie, &[':', '/'], 0), "{one,two}");

        let mut trie = TitleTrie::default();
        trie.insert(&["one".to_string(), "linux".to_string(), "amd64".to_string()]);
        trie.insert(&["two".to_string(), "linux".to_string(), "amd64".to_string()]);
        assert_eq!(
            construct_title(&trie, &[':', '/'], 0),
            "{one,two}:linux/amd64"
        );

        let mut trie = TitleTrie::default();
        trie.insert(&["one".to_string(), "linux".to_string(), "amd64".to_string()]);
        trie.insert(&["two".to_string(), "linux".to_string(), "arm64".to_string()]);
        assert_eq!(
            construct_title(&trie, &[':', '/'], 0),
            "{one:linux/amd64},{two:linux/arm64}"
        );
    }
}
