/*!
Container registry access.

The rest of the crate consumes registries through the [`Registry`] trait:
manifest lookup and download, blob download, manifest-list publication, and
ref deletion. [`HttpRegistryClient`] implements it over the distribution
HTTP protocol with bearer-token authentication and credentials loaded from
a containers-auth.json file.
*/

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt};

use crate::error::{RegistryRequestSnafu, RegistrySnafu, Result};

pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

pub const MEDIA_TYPE_DOCKER_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_DOCKER_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";

const ACCEPT_MANIFESTS: &str = concat!(
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.oci.image.index.v1+json, ",
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.docker.distribution.manifest.v1+json"
);

/// The platform block attached to manifest-list entries and image configs.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ManifestPlatform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
}

impl ManifestPlatform {
    /// Normalized `os/arch[/variant]` string for this platform.
    pub fn normalized(&self) -> String {
        crate::arch::normalize_platform(&self.os, &self.architecture, &self.variant)
    }
}

/// A content descriptor: what an object is, its digest, and its size.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<ManifestPlatform>,
}

/// The manifest shapes the resolver distinguishes.
#[derive(Clone, Debug)]
pub enum Manifest {
    /// Single-arch schema-1 manifest carrying a bare architecture.
    V1 { architecture: String },
    /// Single-arch schema-2 manifest whose platform lives in the config
    /// blob.
    V2 { config: Descriptor },
    /// A manifest list / image index.
    List { manifests: Vec<Descriptor> },
}

impl Manifest {
    /// Classify and parse raw manifest bytes.
    pub fn parse(data: &[u8]) -> Result<Manifest> {
        let value: serde_json::Value = serde_json::from_slice(data).map_err(|err| {
            RegistrySnafu {
                message: format!("malformed manifest: {err}"),
            }
            .build()
        })?;

        if value.get("schemaVersion").and_then(|v| v.as_u64()) == Some(1) {
            let architecture = value
                .get("architecture")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            return Ok(Manifest::V1 { architecture });
        }

        if let Some(manifests) = value.get("manifests") {
            let manifests: Vec<Descriptor> =
                serde_json::from_value(manifests.clone()).map_err(|err| {
                    RegistrySnafu {
                        message: format!("malformed manifest list: {err}"),
                    }
                    .build()
                })?;
            return Ok(Manifest::List { manifests });
        }

        if let Some(config) = value.get("config") {
            let config: Descriptor = serde_json::from_value(config.clone()).map_err(|err| {
                RegistrySnafu {
                    message: format!("malformed manifest config: {err}"),
                }
                .build()
            })?;
            return Ok(Manifest::V2 { config });
        }

        RegistrySnafu {
            message: "unrecognized manifest format",
        }
        .fail()
    }
}

/// A manifest list document ready to publish.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    pub schema_version: u32,
    pub media_type: String,
    pub manifests: Vec<Descriptor>,
}

impl ManifestList {
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: MEDIA_TYPE_DOCKER_LIST.to_string(),
            manifests,
        }
    }
}

/// A parsed image reference: registry, repository, and either a tag or a
/// digest.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub registry: String,
    pub repo: String,
    /// Tag or digest; digests contain a `:`.
    pub reference: String,
}

impl ImageRef {
    pub fn is_digest(&self) -> bool {
        self.reference.contains(':')
    }

    pub fn with_reference(&self, reference: impl Into<String>) -> ImageRef {
        ImageRef {
            registry: self.registry.clone(),
            repo: self.repo.clone(),
            reference: reference.into(),
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = if self.registry == DEFAULT_REGISTRY {
            "docker.io"
        } else {
            &self.registry
        };
        let separator = if self.is_digest() { "@" } else { ":" };
        write!(f, "{registry}/{}{separator}{}", self.repo, self.reference)
    }
}

/// Parse an image name like `alpine:3`, `ghcr.io/org/app@sha256:...`, or
/// `localhost:5000/app`.
pub fn parse_image_name(name: &str) -> Result<ImageRef> {
    ensure!(
        !name.is_empty(),
        RegistrySnafu {
            message: "empty image name",
        }
    );

    let (rest, reference) = match name.split_once('@') {
        Some((rest, digest)) => {
            ensure!(
                digest.contains(':'),
                RegistrySnafu {
                    message: format!("invalid digest in image name {name:?}"),
                }
            );
            (rest, digest.to_string())
        }
        None => {
            let slash = name.rfind('/').map(|pos| pos + 1).unwrap_or(0);
            match name[slash..].find(':') {
                Some(colon) => (
                    &name[..slash + colon],
                    name[slash + colon + 1..].to_string(),
                ),
                None => (name, "latest".to_string()),
            }
        }
    };

    let (registry, repo) = match rest.split_once('/') {
        Some((first, remainder))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), remainder.to_string())
        }
        Some(_) => (DEFAULT_REGISTRY.to_string(), rest.to_string()),
        None => (DEFAULT_REGISTRY.to_string(), format!("library/{rest}")),
    };
    ensure!(
        !repo.is_empty() && !reference.is_empty(),
        RegistrySnafu {
            message: format!("invalid image name {name:?}"),
        }
    );

    Ok(ImageRef {
        registry,
        repo,
        reference,
    })
}

/// Registry capabilities the build pipeline consumes.
pub trait Registry: Send + Sync {
    /// Look up a manifest reference, returning its descriptor or `None`
    /// when absent.
    fn ref_lookup<'a>(&'a self, image: &'a ImageRef) -> BoxFuture<'a, Result<Option<Descriptor>>>;

    /// Download and classify the manifest behind a reference.
    fn manifest_download<'a>(&'a self, image: &'a ImageRef) -> BoxFuture<'a, Result<Manifest>>;

    /// Download a blob by digest from an image's repository.
    fn blob_download<'a>(
        &'a self,
        image: &'a ImageRef,
        digest: &'a str,
    ) -> BoxFuture<'a, Result<Vec<u8>>>;

    /// Publish a manifest list at a reference.
    fn manifest_write<'a>(
        &'a self,
        image: &'a ImageRef,
        manifest: &'a ManifestList,
    ) -> BoxFuture<'a, Result<()>>;

    /// Delete a reference; returns whether anything was deleted.
    fn ref_delete<'a>(&'a self, image: &'a ImageRef) -> BoxFuture<'a, Result<bool>>;
}

/// Credentials loaded from a containers-auth.json file. Values are the raw
/// base64 `user:password` strings, passed through verbatim as HTTP basic
/// credentials.
#[derive(Debug, Default)]
pub struct CredentialStore {
    auths: HashMap<String, String>,
}

impl CredentialStore {
    /// Load credentials. An explicitly configured file must exist; default
    /// search paths are optional.
    pub fn load(auth_file: Option<&Path>) -> Result<Self> {
        let mut paths: Vec<(PathBuf, bool)> = Vec::new();
        match auth_file {
            Some(path) => paths.push((path.to_path_buf(), true)),
            None => {
                if let Some(runtime_dir) = std::env::var_os("XDG_RUNTIME_DIR") {
                    paths.push((PathBuf::from(runtime_dir).join("containers/auth.json"), false));
                }
                if let Some(home) = std::env::var_os("HOME") {
                    paths.push((PathBuf::from(home).join(".docker/config.json"), false));
                }
            }
        }

        let mut auths = HashMap::new();
        for (path, required) in paths {
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound && !required => continue,
                Err(err) => {
                    return RegistrySnafu {
                        message: format!("could not open auth file {}: {err}", path.display()),
                    }
                    .fail()
                }
            };
            let value: serde_json::Value = serde_json::from_str(&text).map_err(|err| {
                RegistrySnafu {
                    message: format!("malformed auth file {}: {err}", path.display()),
                }
                .build()
            })?;
            if let Some(entries) = value.get("auths").and_then(|v| v.as_object()) {
                for (registry, entry) in entries {
                    if let Some(auth) = entry.get("auth").and_then(|v| v.as_str()) {
                        auths.entry(normalize_auth_key(registry)).or_insert_with(|| auth.to_string());
                    }
                }
            }
        }
        Ok(Self { auths })
    }

    fn lookup(&self, registry: &str) -> Option<&str> {
        if let Some(auth) = self.auths.get(registry) {
            return Some(auth);
        }
        if registry == DEFAULT_REGISTRY {
            for alias in ["docker.io", "index.docker.io"] {
                if let Some(auth) = self.auths.get(alias) {
                    return Some(auth);
                }
            }
        }
        None
    }
}

fn normalize_auth_key(registry: &str) -> String {
    // Keys in docker config files sometimes carry a scheme or trailing
    // path, e.g. "https://index.docker.io/v1/".
    let key = registry
        .strip_prefix("https://")
        .or_else(|| registry.strip_prefix("http://"))
        .unwrap_or(registry);
    key.split('/').next().unwrap_or(key).to_string()
}

lazy_static! {
    static ref CHALLENGE_FIELD: Regex =
        Regex::new(r#"(\w+)="([^"]*)""#).expect("challenge regex is valid");
}

/// HTTP implementation of [`Registry`].
pub struct HttpRegistryClient {
    http: reqwest::Client,
    credentials: CredentialStore,
    tokens: tokio::sync::Mutex<HashMap<String, String>>,
}

impl HttpRegistryClient {
    pub fn new(
        auth_file: Option<&Path>,
        insecure: bool,
        cafile: Option<&Path>,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(cafile) = cafile {
            let pem = std::fs::read(cafile).map_err(|err| {
                RegistrySnafu {
                    message: format!("could not read CA file {}: {err}", cafile.display()),
                }
                .build()
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|err| {
                RegistrySnafu {
                    message: format!("invalid CA file {}: {err}", cafile.display()),
                }
                .build()
            })?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder.build().map_err(|err| {
            RegistrySnafu {
                message: format!("failed to construct HTTP client: {err}"),
            }
            .build()
        })?;
        Ok(Self {
            http,
            credentials: CredentialStore::load(auth_file)?,
            tokens: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    fn manifest_url(image: &ImageRef) -> String {
        format!(
            "https://{}/v2/{}/manifests/{}",
            image.registry, image.repo, image.reference
        )
    }

    fn blob_url(image: &ImageRef, digest: &str) -> String {
        format!(
            "https://{}/v2/{}/blobs/{digest}",
            image.registry, image.repo
        )
    }

    /// Issue a request, performing the bearer-token dance on a 401.
    async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        image: &ImageRef,
        scope_action: &str,
        body: Option<(String, Vec<u8>)>,
    ) -> Result<reqwest::Response> {
        let scope = format!("repository:{}:{}", image.repo, scope_action);
        let token_key = format!("{}|{scope}", image.registry);

        let build_request = |token: Option<&str>| {
            let mut request = self.http.request(method.clone(), url);
            request = request.header(reqwest::header::ACCEPT, ACCEPT_MANIFESTS);
            if let Some((content_type, data)) = &body {
                request = request
                    .header(reqwest::header::CONTENT_TYPE, content_type.clone())
                    .body(data.clone());
            }
            match token {
                Some(token) => request.header(
                    reqwest::header::AUTHORIZATION,
                    format!("Bearer {token}"),
                ),
                None => match self.credentials.lookup(&image.registry) {
                    Some(auth) => request.header(
                        reqwest::header::AUTHORIZATION,
                        format!("Basic {auth}"),
                    ),
                    None => request,
                },
            }
        };

        let cached = self.tokens.lock().await.get(&token_key).cloned();
        let response = build_request(cached.as_deref())
            .send()
            .await
            .context(RegistryRequestSnafu { url })?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        let token = self.fetch_token(&challenge, &scope, image).await?;
        self.tokens
            .lock()
            .await
            .insert(token_key, token.clone());

        build_request(Some(&token))
            .send()
            .await
            .context(RegistryRequestSnafu { url })
    }

    async fn fetch_token(&self, challenge: &str, scope: &str, image: &ImageRef) -> Result<String> {
        ensure!(
            challenge.trim_start().to_lowercase().starts_with("bearer"),
            RegistrySnafu {
                message: format!(
                    "registry {} requires unsupported authentication",
                    image.registry
                ),
            }
        );
        let fields: HashMap<String, String> = CHALLENGE_FIELD
            .captures_iter(challenge)
            .map(|captures| (captures[1].to_lowercase(), captures[2].to_string()))
            .collect();
        let realm = fields.get("realm").context(RegistrySnafu {
            message: format!("bearer challenge from {} has no realm", image.registry),
        })?;

        let mut url = url::Url::parse(realm).map_err(|err| {
            RegistrySnafu {
                message: format!("invalid auth realm {realm:?}: {err}"),
            }
            .build()
        })?;
        if let Some(service) = fields.get("service") {
            url.query_pairs_mut().append_pair("service", service);
        }
        url.query_pairs_mut().append_pair("scope", scope);

        let mut request = self.http.get(url.clone());
        if let Some(auth) = self.credentials.lookup(&image.registry) {
            request = request.header(reqwest::header::AUTHORIZATION, format!("Basic {auth}"));
        }
        let response = request.send().await.context(RegistryRequestSnafu {
            url: url.to_string(),
        })?;
        ensure!(
            response.status().is_success(),
            RegistrySnafu {
                message: format!(
                    "token request for {} failed with status {}",
                    image.registry,
                    response.status()
                ),
            }
        );
        let body: serde_json::Value = response.json().await.context(RegistryRequestSnafu {
            url: url.to_string(),
        })?;
        body.get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .context(RegistrySnafu {
                message: format!("token response from {} had no token", image.registry),
            })
    }

    async fn lookup_impl(&self, image: &ImageRef) -> Result<Option<Descriptor>> {
        let url = Self::manifest_url(image);
        let response = self
            .request(reqwest::Method::HEAD, &url, image, "pull", None)
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        ensure!(
            response.status().is_success(),
            RegistrySnafu {
                message: format!("lookup of {image} failed with status {}", response.status()),
            }
        );

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let digest = header("docker-content-digest").context(RegistrySnafu {
            message: format!("lookup of {image} returned no content digest"),
        })?;
        Ok(Some(Descriptor {
            media_type: header("content-type").unwrap_or_default(),
            digest,
            size: header("content-length")
                .and_then(|value| value.parse().ok())
                .unwrap_or(0),
            platform: None,
        }))
    }

    async fn download_impl(&self, image: &ImageRef) -> Result<Manifest> {
        let url = Self::manifest_url(image);
        let response = self
            .request(reqwest::Method::GET, &url, image, "pull", None)
            .await?;
        ensure!(
            response.status().is_success(),
            RegistrySnafu {
                message: format!(
                    "manifest download of {image} failed with status {}",
                    response.status()
                ),
            }
        );
        let data = response
            .bytes()
            .await
            .context(RegistryRequestSnafu { url })?;
        Manifest::parse(&data)
    }

    async fn blob_impl(&self, image: &ImageRef, digest: &str) -> Result<Vec<u8>> {
        let url = Self::blob_url(image, digest);
        let response = self
            .request(reqwest::Method::GET, &url, image, "pull", None)
            .await?;
        ensure!(
            response.status().is_success(),
            RegistrySnafu {
                message: format!(
                    "blob download {digest} from {} failed with status {}",
                    image.repo,
                    response.status()
                ),
            }
        );
        Ok(response
            .bytes()
            .await
            .context(RegistryRequestSnafu { url })?
            .to_vec())
    }

    async fn write_impl(&self, image: &ImageRef, manifest: &ManifestList) -> Result<()> {
        let url = Self::manifest_url(image);
        let data = serde_json::to_vec(manifest).map_err(|err| {
            RegistrySnafu {
                message: format!("failed to serialize manifest list: {err}"),
            }
            .build()
        })?;
        let response = self
            .request(
                reqwest::Method::PUT,
                &url,
                image,
                "pull,push",
                Some((manifest.media_type.clone(), data)),
            )
            .await?;
        ensure!(
            response.status().is_success(),
            RegistrySnafu {
                message: format!(
                    "manifest write to {image} failed with status {}",
                    response.status()
                ),
            }
        );
        Ok(())
    }

    async fn delete_impl(&self, image: &ImageRef) -> Result<bool> {
        let url = Self::manifest_url(image);
        let response = self
            .request(reqwest::Method::DELETE, &url, image, "pull,push", None)
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        ensure!(
            response.status().is_success(),
            RegistrySnafu {
                message: format!("delete of {image} failed with status {}", response.status()),
            }
        );
        Ok(true)
    }
}

impl Registry for HttpRegistryClient {
    fn ref_lookup<'a>(&'a self, image: &'a ImageRef) -> BoxFuture<'a, Result<Option<Descriptor>>> {
        Box::pin(self.lookup_impl(image))
    }

    fn manifest_download<'a>(&'a self, image: &'a ImageRef) -> BoxFuture<'a, Result<Manifest>> {
        Box::pin(self.download_impl(image))
    }

    fn blob_download<'a>(
        &'a self,
        image: &'a ImageRef,
        digest: &'a str,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(self.blob_impl(image, digest))
    }

    fn manifest_write<'a>(
        &'a self,
        image: &'a ImageRef,
        manifest: &'a ManifestList,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.write_impl(image, manifest))
    }

    fn ref_delete<'a>(&'a self, image: &'a ImageRef) -> BoxFuture<'a, Result<bool>> {
        Box::pin(self.delete_impl(image))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn image_name_parsing() {
        let image = parse_image_name("alpine").unwrap();
        assert_eq!(image.registry, DEFAULT_REGISTRY);
        assert_eq!(image.repo, "library/alpine");
        assert_eq!(image.reference, "latest");
        assert!(!image.is_digest());

        let image = parse_image_name("alpine:3.18").unwrap();
        assert_eq!(image.repo, "library/alpine");
        assert_eq!(image.reference, "3.18");

        let image = parse_image_name("org/app:v1").unwrap();
        assert_eq!(image.registry, DEFAULT_REGISTRY);
        assert_eq!(image.repo, "org/app");

        let image = parse_image_name("ghcr.io/org/app:v1").unwrap();
        assert_eq!(image.registry, "ghcr.io");
        assert_eq!(image.repo, "org/app");

        let image = parse_image_name("localhost:5000/app").unwrap();
        assert_eq!(image.registry, "localhost:5000");
        assert_eq!(image.repo, "app");
        assert_eq!(image.reference, "latest");

        let image = parse_image_name("ghcr.io/org/app@sha256:abcd").unwrap();
        assert!(image.is_digest());
        assert_eq!(image.reference, "sha256:abcd");
        assert_eq!(image.to_string(), "ghcr.io/org/app@sha256:abcd");

        assert_eq!(
            parse_image_name("alpine:3").unwrap().to_string(),
            "docker.io/library/alpine:3"
        );

        assert!(parse_image_name("").is_err());
        assert!(parse_image_name("app@nodigest").is_err());
    }

    #[test]
    fn with_reference_rewrites_tag() {
        let image = parse_image_name("ghcr.io/org/app:v1").unwrap();
        let sub = image.with_reference("v1-linux-arm64");
        assert_eq!(sub.to_string(), "ghcr.io/org/app:v1-linux-arm64");
    }

    #[test]
    fn manifest_classification() {
        let v1 = Manifest::parse(br#"{"schemaVersion": 1, "architecture": "amd64"}"#).unwrap();
        assert!(matches!(v1, Manifest::V1 { architecture } if architecture == "amd64"));

        let v2 = Manifest::parse(
            br#"{
                "schemaVersion": 2,
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "config": {"mediaType": "application/vnd.docker.container.image.v1+json",
                           "digest": "sha256:1234", "size": 100}
            }"#,
        )
        .unwrap();
        assert!(matches!(v2, Manifest::V2 { config } if config.digest == "sha256:1234"));

        let list = Manifest::parse(
            br#"{
                "schemaVersion": 2,
                "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
                "manifests": [
                    {"mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                     "digest": "sha256:aa", "size": 1,
                     "platform": {"os": "linux", "architecture": "arm64", "variant": "v8"}}
                ]
            }"#,
        )
        .unwrap();
        match list {
            Manifest::List { manifests } => {
                assert_eq!(manifests.len(), 1);
                let platform = manifests[0].platform.as_ref().unwrap();
                assert_eq!(platform.normalized(), "linux/arm64");
            }
            _ => panic!("expected manifest list"),
        }

        assert!(Manifest::parse(b"{}").is_err());
        assert!(Manifest::parse(b"not json").is_err());
    }

    #[test]
    fn manifest_list_serialization() {
        let list = ManifestList::new(vec![Descriptor {
            media_type: MEDIA_TYPE_DOCKER_V2.to_string(),
            digest: "sha256:aa".to_string(),
            size: 42,
            platform: Some(ManifestPlatform {
                os: "linux".to_string(),
                architecture: "amd64".to_string(),
                variant: String::new(),
            }),
        }]);
        let value = serde_json::to_value(&list).unwrap();
        assert_eq!(value["schemaVersion"], 2);
        assert_eq!(value["mediaType"], MEDIA_TYPE_DOCKER_LIST);
        assert_eq!(value["manifests"][0]["digest"], "sha256:aa");
        assert_eq!(value["manifests"][0]["platform"]["os"], "linux");
        // Empty variants are omitted entirely.
        assert!(value["manifests"][0]["platform"]
            .as_object()
            .unwrap()
            .get("variant")
            .is_none());
    }

    #[test]
    fn auth_key_normalization() {
        assert_eq!(normalize_auth_key("https://index.docker.io/v1/"), "index.docker.io");
        assert_eq!(normalize_auth_key("ghcr.io"), "ghcr.io");
        assert_eq!(normalize_auth_key("http://localhost:5000"), "localhost:5000");
    }

    #[test]
    fn credential_lookup_aliases() {
        let mut store = CredentialStore::default();
        store
            .auths
            .insert("index.docker.io".to_string(), "Zm9vOmJhcg==".to_string());
        store.auths.insert("ghcr.io".to_string(), "YWJjOjEyMw==".to_string());

        assert_eq!(store.lookup(DEFAULT_REGISTRY), Some("Zm9vOmJhcg=="));
        assert_eq!(store.lookup("ghcr.io"), Some("YWJjOjEyMw=="));
        assert_eq!(store.lookup("quay.io"), None);
    }

    #[test]
    fn challenge_parsing() {
        let fields: HashMap<String, String> = CHALLENGE_FIELD
            .captures_iter(
                r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
            )
            .map(|captures| (captures[1].to_lowercase(), captures[2].to_string()))
            .collect();
        assert_eq!(fields["realm"], "https://auth.docker.io/token");
        assert_eq!(fields["service"], "registry.docker.io");
    }
}
