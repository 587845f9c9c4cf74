use super::{namespace_cached, Authorize};
use anyhow::Result;
use policy_admission_core::{Filter, ObjectKind, ResourceCache, Violation};
use policy_admission_k8s::{AdmitObject, ClusterClient};
use serde::Deserialize;

pub(crate) const NAME: &str = "namespaces";

/// Default annotation carrying a namespace's constraints document.
const DEFAULT_ANNOTATION: &str = "admission.io/constraints";

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default, rename_all = "camelCase")]
struct Config {
    ignore_namespaces: Vec<String>,
    ignore_on_failure: bool,

    /// Object kind this instance applies to. Register the module once
    /// per kind to cover pods, services and ingresses.
    kind: ObjectKind,

    /// Annotation on the target namespace holding the constraints
    /// document.
    annotation: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ignore_namespaces: Vec::new(),
            ignore_on_failure: false,
            kind: ObjectKind::Pod,
            annotation: DEFAULT_ANNOTATION.to_string(),
        }
    }
}

/// The JSON document a namespace declares under its constraints
/// annotation.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default, rename_all = "camelCase")]
struct Constraints {
    required_labels: Vec<String>,
    denied_annotations: Vec<String>,
}

/// Enforces the constraints a namespace declares through its
/// annotation on every object submitted into it.
pub(crate) struct Namespaces {
    config: Config,
}

impl Namespaces {
    pub(crate) fn from_file(path: &str) -> Result<Self> {
        let config = super::read_config(path)?;
        Ok(Self { config })
    }
}

#[async_trait::async_trait]
impl Authorize for Namespaces {
    fn name(&self) -> &'static str {
        NAME
    }

    fn filter_on(&self) -> Filter {
        Filter {
            kind: self.config.kind,
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
        let name = object.namespace();
        if name.is_empty() {
            return Vec::new();
        }

        let namespace = match namespace_cached(client, cache, name).await {
            Ok(namespace) => namespace,
            Err(error) => return vec![Violation::internal(NAME, format!("{error:#}"))],
        };

        let Some(document) = namespace
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(&self.config.annotation))
        else {
            return Vec::new();
        };

        let constraints: Constraints = match serde_json::from_str(document) {
            Ok(constraints) => constraints,
            Err(error) => {
                return vec![Violation::internal(
                    NAME,
                    format!("invalid constraints annotation on namespace {name}: {error}"),
                )]
            }
        };

        let mut errs = Vec::new();
        for label in &constraints.required_labels {
            if !object.labels().contains_key(label) {
                errs.push(Violation::required(
                    format!("metadata.labels.{label}"),
                    "label is required by the namespace policy",
                ));
            }
        }
        for key in &constraints.denied_annotations {
            if let Some(value) = object.annotations().get(key) {
                errs.push(Violation::forbidden(
                    format!("metadata.annotations.{key}"),
                    value,
                    "annotation is denied by the namespace policy",
                ));
            }
        }
        errs
    }
}
