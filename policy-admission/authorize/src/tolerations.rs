use super::{namespace_cached, Authorize};
use anyhow::Result;
use policy_admission_core::{Filter, ObjectKind, ResourceCache, Violation};
use policy_admission_k8s::{AdmitObject, ClusterClient, Toleration};
use serde::Deserialize;

pub(crate) const NAME: &str = "tolerations";

/// Namespace annotation replacing the default whitelist with a JSON
/// list of patterns.
const DEFAULT_ANNOTATION: &str = "admission.io/tolerations";

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default, rename_all = "camelCase")]
struct Config {
    ignore_namespaces: Vec<String>,
    ignore_on_failure: bool,
    annotation: String,

    /// Whitelist applied when a namespace declares none. Empty permits
    /// any toleration.
    default_whitelist: Vec<TolerationPattern>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ignore_namespaces: Vec::new(),
            ignore_on_failure: false,
            annotation: DEFAULT_ANNOTATION.to_string(),
            default_whitelist: Vec::new(),
        }
    }
}

/// A whitelist entry; an empty field matches any value.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default, rename_all = "camelCase")]
struct TolerationPattern {
    key: String,
    operator: String,
    value: String,
    effect: String,
}

impl TolerationPattern {
    fn matches(&self, toleration: &Toleration) -> bool {
        fn field(pattern: &str, value: Option<&str>) -> bool {
            pattern.is_empty() || Some(pattern) == value
        }
        field(&self.key, toleration.key.as_deref())
            && field(&self.operator, toleration.operator.as_deref())
            && field(&self.value, toleration.value.as_deref())
            && field(&self.effect, toleration.effect.as_deref())
    }
}

/// Restricts the taint tolerations a pod may declare, per namespace.
pub(crate) struct Tolerations {
    config: Config,
}

impl Tolerations {
    pub(crate) fn from_file(path: &str) -> Result<Self> {
        let config = super::read_config(path)?;
        Ok(Self { config })
    }
}

#[async_trait::async_trait]
impl Authorize for Tolerations {
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
        client: &dyn ClusterClient,
        cache: &ResourceCache,
        object: &AdmitObject,
    ) -> Vec<Violation> {
        let tolerations = object
            .as_pod()
            .and_then(|pod| pod.spec.as_ref())
            .and_then(|spec| spec.tolerations.as_deref())
            .unwrap_or_default();
        if tolerations.is_empty() {
            return Vec::new();
        }

        let whitelist = match self.whitelist_for(client, cache, object.namespace()).await {
            Ok(whitelist) => whitelist,
            Err(violation) => return vec![violation],
        };
        if whitelist.is_empty() {
            return Vec::new();
        }

        let mut errs = Vec::new();
        for (i, toleration) in tolerations.iter().enumerate() {
            if !whitelist.iter().any(|pattern| pattern.matches(toleration)) {
                errs.push(Violation::forbidden(
                    format!("spec.tolerations[{i}]"),
                    describe(toleration),
                    "toleration is not permitted in this namespace",
                ));
            }
        }
        errs
    }
}

impl Tolerations {
    async fn whitelist_for(
        &self,
        client: &dyn ClusterClient,
        cache: &ResourceCache,
        name: &str,
    ) -> Result<Vec<TolerationPattern>, Violation> {
        if name.is_empty() {
            return Ok(self.config.default_whitelist.clone());
        }
        let namespace = namespace_cached(client, cache, name)
            .await
            .map_err(|error| Violation::internal(NAME, format!("{error:#}")))?;
        let Some(document) = namespace
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(&self.config.annotation))
        else {
            return Ok(self.config.default_whitelist.clone());
        };
        serde_json::from_str(document).map_err(|error| {
            Violation::internal(
                NAME,
                format!("invalid tolerations annotation on namespace {name}: {error}"),
            )
        })
    }
}

fn describe(toleration: &Toleration) -> String {
    format!(
        "{}={}:{}",
        toleration.key.as_deref().unwrap_or_default(),
        toleration.value.as_deref().unwrap_or_default(),
        toleration.effect.as_deref().unwrap_or_default(),
    )
}
