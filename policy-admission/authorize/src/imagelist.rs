use super::Authorize;
use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use policy_admission_core::{Filter, ObjectKind, ResourceCache, Violation};
use policy_admission_k8s::{AdmitObject, ClusterClient};
use serde::Deserialize;
use std::{collections::HashSet, sync::Arc, time::Duration};

pub(crate) const NAME: &str = "imagelist";

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default, rename_all = "camelCase")]
struct Config {
    ignore_namespaces: Vec<String>,

    /// Failures to fetch or verify the list are tolerated by default;
    /// a broken endpoint should not block the whole cluster.
    ignore_on_failure: bool,

    /// Endpoint serving the allow-list document.
    endpoint: String,

    /// Seconds the fetched document is cached for.
    cache_ttl_secs: u64,

    /// Request deadline in seconds.
    timeout_secs: u64,

    /// Base64 ed25519 public key; set to require a document signature.
    public_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ignore_namespaces: Vec::new(),
            ignore_on_failure: true,
            endpoint: String::new(),
            cache_ttl_secs: 300,
            timeout_secs: 2,
            public_key: None,
        }
    }
}

/// The allow-list document served by the endpoint. The optional
/// signature covers the newline-joined image list.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Document {
    images: Vec<String>,
    #[serde(default)]
    signature: Option<String>,
}

/// Requires every container image to appear in an externally published
/// allow-list, fetched with a deadline and memoised in the shared cache.
pub(crate) struct ImageList {
    config: Config,
    http: reqwest::Client,
    public_key: Option<VerifyingKey>,
}

impl ImageList {
    pub(crate) fn from_file(path: &str) -> Result<Self> {
        Self::from_config(super::read_config(path)?)
    }

    fn from_config(config: Config) -> Result<Self> {
        if config.endpoint.is_empty() {
            bail!("imagelist requires an endpoint");
        }
        let public_key = config
            .public_key
            .as_deref()
            .map(parse_public_key)
            .transpose()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("unable to build http client")?;
        Ok(Self {
            config,
            http,
            public_key,
        })
    }

    async fn fetch_list(&self, cache: &ResourceCache) -> Result<Arc<HashSet<String>>> {
        let key = format!("imagelist/{}", self.config.endpoint);
        if let Some(images) = cache.get::<HashSet<String>>(&key) {
            return Ok(images);
        }

        let document: Document = self
            .http
            .get(&self.config.endpoint)
            .send()
            .await
            .context("unable to fetch image allow-list")?
            .error_for_status()
            .context("image allow-list endpoint returned an error")?
            .json()
            .await
            .context("image allow-list document is malformed")?;

        if let Some(public_key) = &self.public_key {
            verify_document(public_key, &document)?;
        }

        let images = Arc::new(document.images.into_iter().collect::<HashSet<_>>());
        cache.insert(
            key,
            images.clone(),
            Duration::from_secs(self.config.cache_ttl_secs),
        );
        Ok(images)
    }
}

#[async_trait::async_trait]
impl Authorize for ImageList {
    fn name(&self) -> &'static str {
        NAME
    }

    fn filter_on(&self) -> Filter {
        Filter {
            kind: ObjectKind::Pod,
            ignore_namespaces: self.config.ignore_namespaces.clone(),
            ignore_on_failure: self.config.ignore_on_failure,
        }
    }

    async fn admit(
        &self,
        _client: &dyn ClusterClient,
        cache: &ResourceCache,
        object: &AdmitObject,
    ) -> Vec<Violation> {
        let Some(spec) = object.as_pod().and_then(|pod| pod.spec.as_ref()) else {
            return Vec::new();
        };

        let images = match self.fetch_list(cache).await {
            Ok(images) => images,
            Err(error) => return vec![Violation::internal(NAME, format!("{error:#}"))],
        };

        let mut errs = Vec::new();
        for (i, container) in spec.init_containers.iter().flatten().enumerate() {
            check_image(&images, &format!("spec.initContainers[{i}]"), container, &mut errs);
        }
        for (i, container) in spec.containers.iter().enumerate() {
            check_image(&images, &format!("spec.containers[{i}]"), container, &mut errs);
        }
        errs
    }
}

fn check_image(
    images: &HashSet<String>,
    path: &str,
    container: &policy_admission_k8s::Container,
    errs: &mut Vec<Violation>,
) {
    let image = container.image.as_deref().unwrap_or_default();
    if !images.contains(image) {
        errs.push(Violation::forbidden(
            format!("{path}.image"),
            image,
            "image is not present in the cluster allow-list",
        ));
    }
}

fn parse_public_key(encoded: &str) -> Result<VerifyingKey> {
    let bytes = BASE64
        .decode(encoded)
        .context("public key is not valid base64")?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("public key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&bytes).context("public key is not a valid ed25519 key")
}

fn verify_document(public_key: &VerifyingKey, document: &Document) -> Result<()> {
    let Some(signature) = document.signature.as_deref() else {
        bail!("image allow-list document is unsigned");
    };
    let signature = Signature::from_slice(
        &BASE64
            .decode(signature)
            .context("document signature is not valid base64")?,
    )
    .context("document signature is malformed")?;
    let message = document.images.join("\n");
    public_key
        .verify(message.as_bytes(), &signature)
        .context("image allow-list signature does not verify")
}
