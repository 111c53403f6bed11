/*!
Project and user configuration.

The project configuration (`bakesys.toml` at the build root) describes the
build: platforms, profiles, contexts, stages, and naming templates. The
user configuration (`~/.bakesys.toml` merged with `<root>/.bakesys.toml`)
describes the environment: client commands, concurrency limits, retries,
and registry access. Both are TOML deserialized with serde and validated by
hand after loading.
*/

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use snafu::{ensure, ResultExt};

use crate::error::{ConfigParseSnafu, ConfigReadSnafu, ConfigurationSnafu, Result};
use crate::util::{format_simple, params};

pub const PROJECT_CONFIG_NAME: &str = "bakesys.toml";
pub const USER_CONFIG_NAME: &str = ".bakesys.toml";
pub const BUILD_DATA_NAME: &str = ".bakesysdata.json";

/// Configuration of a named build context.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextConfig {
    /// Base directory of the context, relative to the build root. May not
    /// point above the build root.
    pub base_dir: String,
    /// Umask as a three digit octal string, or unset to pass file modes
    /// through unchanged.
    pub umask: Option<String>,
    /// File to load ignore patterns from. When neither this nor `ignore`
    /// is set, `.dockerignore` is loaded if present.
    pub ignore_file: Option<String>,
    /// Inline ignore patterns; takes precedence over `ignore_file`.
    pub ignore: Option<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            base_dir: ".".to_string(),
            umask: Some("022".to_string()),
            ignore_file: None,
            ignore: None,
        }
    }
}

impl ContextConfig {
    pub fn umask_bits(&self) -> Result<Option<u32>> {
        match &self.umask {
            None => Ok(None),
            Some(text) => {
                let bits = u32::from_str_radix(text, 8).map_err(|_| {
                    ConfigurationSnafu {
                        message: format!("umask {text:?} is not an octal string"),
                    }
                    .build()
                })?;
                ensure!(
                    bits <= 0o777,
                    ConfigurationSnafu {
                        message: format!("umask {text:?} out of range"),
                    }
                );
                Ok(Some(bits))
            }
        }
    }

    /// Resolve and validate the context base directory against the build
    /// root.
    pub fn resolved_base_dir(&self, build_root: &Path) -> Result<PathBuf> {
        let rel = Path::new(&self.base_dir);
        ensure!(
            !rel.is_absolute(),
            ConfigurationSnafu {
                message: format!("context base_dir {:?} must be relative", self.base_dir),
            }
        );
        let mut depth: i32 = 0;
        for component in rel.components() {
            match component {
                Component::Normal(_) => depth += 1,
                Component::ParentDir => depth -= 1,
                Component::CurDir => {}
                _ => {
                    return ConfigurationSnafu {
                        message: format!("context base_dir {:?} is invalid", self.base_dir),
                    }
                    .fail()
                }
            }
            ensure!(
                depth >= 0,
                ConfigurationSnafu {
                    message: format!(
                        "context base_dir {:?} points above the build root",
                        self.base_dir
                    ),
                }
            );
        }
        Ok(build_root.join(rel))
    }

    fn validate(&self, name: &str) -> Result<()> {
        self.umask_bits().map_err(|err| {
            ConfigurationSnafu {
                message: format!("context {name:?}: {err}"),
            }
            .build()
        })?;
        Ok(())
    }
}

/// Configuration for a named build stage.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageConfig {
    /// Whether the stage is a content-addressed base image.
    pub base: bool,
    /// Image names to tag locally. Must be empty for base stages.
    pub image_names: Vec<String>,
    /// Image names to tag and push. Must be empty for base stages.
    pub push_names: Vec<String>,
}

impl StageConfig {
    fn validate(&self, name: &str) -> Result<()> {
        ensure!(
            !self.base || (self.image_names.is_empty() && self.push_names.is_empty()),
            ConfigurationSnafu {
                message: format!("stage {name:?}: base stages cannot carry image or push names"),
            }
        );
        Ok(())
    }
}

/// One external client command: argv plus an environment overlay, both
/// subject to `{param}` substitution when rendered.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientCommand {
    pub args: Vec<String>,
    pub environment: BTreeMap<String, String>,
}

impl ClientCommand {
    fn new(args: &[&str]) -> Self {
        Self {
            args: args.iter().map(|s| s.to_string()).collect(),
            environment: BTreeMap::new(),
        }
    }

    fn with_environment(mut self, env: &[(&str, &str)]) -> Self {
        self.environment = env
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        self
    }

    /// Render argv and environment against the given parameters.
    pub fn render(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<(Vec<String>, BTreeMap<String, String>)> {
        let mut args = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            args.push(format_simple(arg, params)?);
        }
        let mut environment = BTreeMap::new();
        for (key, value) in &self.environment {
            environment.insert(key.clone(), format_simple(value, params)?);
        }
        Ok((args, environment))
    }

    fn validate(&self, name: &str, param_names: &[&str]) -> Result<()> {
        ensure!(
            !self.args.is_empty(),
            ConfigurationSnafu {
                message: format!("client command {name:?} has no arguments"),
            }
        );
        let dummy: BTreeMap<String, String> = param_names
            .iter()
            .map(|key| (key.to_string(), String::new()))
            .collect();
        self.render(&dummy).map_err(|err| {
            ConfigurationSnafu {
                message: format!("client command {name:?} is invalid: {err}"),
            }
            .build()
        })?;
        Ok(())
    }
}

/// The set of commands used to drive the external container builder. The
/// defaults cover vanilla docker and podman; anything else can be wired in
/// through the user configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Build from a tar stream on stdin. Parameters: `image`, `platform`,
    /// `dependencies`.
    pub build: ClientCommand,
    /// Parameters: `source_image`, `target_image`.
    pub tag: ClientCommand,
    /// Optional explicit pull. Parameter: `image`. Without it, pulling is
    /// left to the builder.
    pub pull: Option<ClientCommand>,
    /// Parameter: `image`.
    pub push: ClientCommand,
    /// Remove a local tag. Parameter: `image`.
    pub untag: ClientCommand,
    /// Optional probe printing the builder's native platform.
    pub platform: Option<ClientCommand>,
}

impl ClientConfig {
    pub fn docker() -> Self {
        Self {
            build: ClientCommand::new(&["docker", "build", "--tag", "{image}", "-"])
                .with_environment(&[("DOCKER_DEFAULT_PLATFORM", "{platform}")]),
            tag: ClientCommand::new(&["docker", "tag", "{source_image}", "{target_image}"]),
            pull: Some(ClientCommand::new(&["docker", "pull", "{image}"])),
            push: ClientCommand::new(&["docker", "push", "{image}"]),
            untag: ClientCommand::new(&["docker", "rmi", "{image}"]),
            platform: Some(ClientCommand::new(&[
                "docker",
                "info",
                "--format",
                "{{{{ .OSType }}}}/{{{{ .Architecture }}}}",
            ])),
        }
    }

    pub fn podman() -> Self {
        Self {
            build: ClientCommand::new(&["podman", "build", "--tag", "{image}", "-"]),
            tag: ClientCommand::new(&["podman", "tag", "{source_image}", "{target_image}"]),
            pull: Some(ClientCommand::new(&["podman", "pull", "{image}"])),
            push: ClientCommand::new(&["podman", "push", "{image}"]),
            untag: ClientCommand::new(&["podman", "rmi", "{image}"]),
            platform: Some(ClientCommand::new(&[
                "podman",
                "info",
                "--format",
                "{{{{ .Version.OsArch }}}}",
            ])),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.build
            .validate("build", &["image", "platform", "dependencies"])?;
        self.tag.validate("tag", &["source_image", "target_image"])?;
        if let Some(pull) = &self.pull {
            pull.validate("pull", &["image"])?;
        }
        self.push.validate("push", &["image"])?;
        self.untag.validate("untag", &["image"])?;
        if let Some(platform) = &self.platform {
            platform.validate("platform", &[])?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    #[default]
    Docker,
    Podman,
}

/// User settings controlling how builds run on this machine.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UserConfig {
    /// Selects the built-in client command set when `client` is unset.
    pub client_type: ClientType,
    /// Explicit client commands; overrides `client_type`.
    pub client: Option<ClientConfig>,
    /// Maximum concurrent builds. Zero means the machine's parallelism.
    pub build_jobs: usize,
    /// Maximum concurrent push or pull jobs.
    pub push_jobs: usize,
    /// Maximum concurrent tag jobs.
    pub tag_jobs: usize,
    /// Extra build attempts after a failure.
    pub build_retry: u32,
    /// Extra push/pull attempts after a failure.
    pub push_retry: u32,
    /// Path to a containers-auth.json credentials file. Default search
    /// paths are used when unset.
    pub auth_file: Option<PathBuf>,
    /// Disable registry certificate verification.
    pub insecure: bool,
    /// Additional PEM CA bundle to trust when contacting registries.
    pub cafile: Option<PathBuf>,
    /// Colorize output stream titles.
    pub color: bool,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            client_type: ClientType::Docker,
            client: None,
            build_jobs: 0,
            push_jobs: 4,
            tag_jobs: 8,
            build_retry: 0,
            push_retry: 2,
            auth_file: None,
            insecure: false,
            cafile: None,
            color: true,
        }
    }
}

impl UserConfig {
    /// The effective client command set.
    pub fn resolved_client(&self) -> ClientConfig {
        match &self.client {
            Some(client) => client.clone(),
            None => match self.client_type {
                ClientType::Docker => ClientConfig::docker(),
                ClientType::Podman => ClientConfig::podman(),
            },
        }
    }

    pub fn effective_build_jobs(&self) -> usize {
        if self.build_jobs == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.build_jobs
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.push_jobs > 0,
            ConfigurationSnafu {
                message: "push_jobs must be positive",
            }
        );
        ensure!(
            self.tag_jobs > 0,
            ConfigurationSnafu {
                message: "tag_jobs must be positive",
            }
        );
        self.resolved_client().validate()
    }
}

/// Project-wide build settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    /// Template for the repository where base images are stored. Parameters
    /// `stage`, `profile`, and `platform`; must not include a tag, the
    /// content hash is used as the tag.
    pub base_image_repo: Option<String>,
    /// Template for the default image name of a stage.
    pub stage_image_name: String,
    /// Template for the default push name of a stage.
    pub stage_push_name: String,
    /// Build document template, relative to the build root.
    pub build_file: String,
    /// Optional syntax directive line emitted at the top of rendered build
    /// documents.
    pub document_syntax: Option<String>,
    /// Platforms base images are built for.
    pub platforms: Vec<String>,
    /// Profile name to template variables.
    pub profiles: BTreeMap<String, BTreeMap<String, String>>,
    /// Profile used when none is requested; defaults to the first profile.
    pub default_profile: String,
    /// Named build contexts referenced from the build document.
    pub contexts: BTreeMap<String, ContextConfig>,
    /// Per-stage configuration overrides.
    pub stages: BTreeMap<String, StageConfig>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            base_image_repo: None,
            stage_image_name: "{stage}".to_string(),
            stage_push_name: "{stage}".to_string(),
            build_file: "build.tpl".to_string(),
            document_syntax: None,
            platforms: vec!["linux/amd64".to_string()],
            profiles: [("default".to_string(), BTreeMap::new())].into_iter().collect(),
            default_profile: String::new(),
            contexts: [("default".to_string(), ContextConfig::default())]
                .into_iter()
                .collect(),
            stages: BTreeMap::new(),
        }
    }
}

impl ProjectConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.platforms.is_empty(),
            ConfigurationSnafu {
                message: "platforms cannot be empty",
            }
        );
        ensure!(
            !self.profiles.is_empty(),
            ConfigurationSnafu {
                message: "profiles cannot be empty",
            }
        );
        ensure!(
            !self.profiles.keys().any(String::is_empty),
            ConfigurationSnafu {
                message: "profile names cannot be empty",
            }
        );
        for (profile, data) in &self.profiles {
            for reserved in ["profile", "platform"] {
                ensure!(
                    !data.contains_key(reserved),
                    ConfigurationSnafu {
                        message: format!("profile {profile:?} cannot set reserved key {reserved:?}"),
                    }
                );
            }
        }
        ensure!(
            self.default_profile.is_empty() || self.profiles.contains_key(&self.default_profile),
            ConfigurationSnafu {
                message: format!("default_profile {:?} does not exist", self.default_profile),
            }
        );
        for (name, context) in &self.contexts {
            context.validate(name)?;
        }
        for (name, stage) in &self.stages {
            stage.validate(name)?;
            ensure!(
                !self.contexts.contains_key(name),
                ConfigurationSnafu {
                    message: format!("stage {name:?} collides with a context name"),
                }
            );
        }

        // Naming templates must render against their parameter sets.
        let dummy = params([("stage", ""), ("profile", ""), ("platform", "")]);
        for (what, template) in [
            ("stage_image_name", Some(&self.stage_image_name)),
            ("stage_push_name", Some(&self.stage_push_name)),
            ("base_image_repo", self.base_image_repo.as_ref()),
        ] {
            if let Some(template) = template {
                format_simple(template, &dummy).map_err(|err| {
                    ConfigurationSnafu {
                        message: format!("{what} template is invalid: {err}"),
                    }
                    .build()
                })?;
            }
        }
        Ok(())
    }

    /// The profile to use when the caller did not pick one.
    pub fn effective_default_profile(&self) -> Result<&str> {
        if !self.default_profile.is_empty() {
            return Ok(&self.default_profile);
        }
        self.profiles
            .keys()
            .next()
            .map(String::as_str)
            .ok_or_else(|| {
                ConfigurationSnafu {
                    message: "profiles cannot be empty",
                }
                .build()
            })
    }

    pub fn profile_vars(&self, profile: &str) -> Result<&BTreeMap<String, String>> {
        self.profiles.get(profile).ok_or_else(|| {
            ConfigurationSnafu {
                message: format!("profile {profile:?} does not exist"),
            }
            .build()
        })
    }
}

/// Load the project configuration from the build root. A missing file
/// yields the default configuration.
pub fn load_project_config(build_root: &Path) -> Result<ProjectConfig> {
    let path = build_root.join(PROJECT_CONFIG_NAME);
    let config = match std::fs::read_to_string(&path) {
        Ok(text) => {
            toml::from_str(&text).context(ConfigParseSnafu { path: path.clone() })?
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            log::warn!("{} not found, using default project config", path.display());
            ProjectConfig::default()
        }
        Err(err) => return Err(err).context(ConfigReadSnafu { path }),
    };
    config.validate()?;
    Ok(config)
}

/// Load the user configuration, merging the home directory file with the
/// build root file (the build root wins per top-level field).
pub fn load_user_config(build_root: &Path) -> Result<UserConfig> {
    let mut merged = toml::Table::new();
    let mut paths = Vec::new();
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(PathBuf::from(home).join(USER_CONFIG_NAME));
    }
    paths.push(build_root.join(USER_CONFIG_NAME));

    for path in paths {
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let table: toml::Table =
                    toml::from_str(&text).context(ConfigParseSnafu { path: path.clone() })?;
                for (key, value) in table {
                    merged.insert(key, value);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err).context(ConfigReadSnafu { path }),
        }
    }

    let config: UserConfig = merged.try_into().map_err(|err| {
        ConfigurationSnafu {
            message: format!("failed to load user config: {err}"),
        }
        .build()
    })?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_configs_validate() {
        ProjectConfig::default().validate().unwrap();
        UserConfig::default().validate().unwrap();
        ClientConfig::docker().validate().unwrap();
        ClientConfig::podman().validate().unwrap();
    }

    #[test]
    fn umask_parsing() {
        let mut context = ContextConfig::default();
        assert_eq!(context.umask_bits().unwrap(), Some(0o022));
        context.umask = Some("777".to_string());
        assert_eq!(context.umask_bits().unwrap(), Some(0o777));
        context.umask = Some("1777".to_string());
        assert!(context.umask_bits().is_err());
        context.umask = Some("9".to_string());
        assert!(context.umask_bits().is_err());
        context.umask = None;
        assert_eq!(context.umask_bits().unwrap(), None);
    }

    #[test]
    fn base_dir_stays_under_root() {
        let root = Path::new("/project");
        let mut context = ContextConfig::default();
        assert_eq!(context.resolved_base_dir(root).unwrap(), root.join("."));
        context.base_dir = "sub/dir".to_string();
        assert_eq!(
            context.resolved_base_dir(root).unwrap(),
            root.join("sub/dir")
        );
        context.base_dir = "sub/../other".to_string();
        context.resolved_base_dir(root).unwrap();
        context.base_dir = "../escape".to_string();
        assert!(context.resolved_base_dir(root).is_err());
        context.base_dir = "/absolute".to_string();
        assert!(context.resolved_base_dir(root).is_err());
    }

    #[test]
    fn base_stages_cannot_be_tagged() {
        let config: ProjectConfig = toml::from_str(
            r#"
            [stages.base-os]
            base = true
            image_names = ["nope"]
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn client_command_rendering() {
        let command = ClientCommand {
            args: vec!["docker".into(), "build".into(), "--tag".into(), "{image}".into()],
            environment: [("DOCKER_DEFAULT_PLATFORM".to_string(), "{platform}".to_string())]
                .into_iter()
                .collect(),
        };
        let (args, env) = command
            .render(&params([("image", "app:1"), ("platform", "linux/arm64")]))
            .unwrap();
        assert_eq!(args, vec!["docker", "build", "--tag", "app:1"]);
        assert_eq!(env["DOCKER_DEFAULT_PLATFORM"], "linux/arm64");

        let bad = ClientCommand {
            args: vec!["docker".into(), "{unknown}".into()],
            environment: BTreeMap::new(),
        };
        assert!(bad.validate("build", &["image"]).is_err());
    }

    #[test]
    fn reserved_profile_keys_rejected() {
        let config: ProjectConfig = toml::from_str(
            r#"
            [profiles.default]
            platform = "oops"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn user_config_merge_prefers_build_root() {
        let home = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            home.path().join(USER_CONFIG_NAME),
            "push_jobs = 2\ntag_jobs = 3\n",
        )
        .unwrap();
        std::fs::write(root.path().join(USER_CONFIG_NAME), "push_jobs = 9\n").unwrap();

        let prev_home = std::env::var_os("HOME");
        std::env::set_var("HOME", home.path());
        let config = load_user_config(root.path()).unwrap();
        match prev_home {
            Some(value) => std::env::set_var("HOME", value),
            None => std::env::remove_var("HOME"),
        }

        assert_eq!(config.push_jobs, 9);
        assert_eq!(config.tag_jobs, 3);
    }
}
