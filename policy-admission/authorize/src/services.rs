use super::{namespace_cached, Authorize};
use anyhow::Result;
use policy_admission_core::{Filter, ObjectKind, ResourceCache, Violation};
use policy_admission_k8s::{AdmitObject, ClusterClient};
use serde::Deserialize;

pub(crate) const NAME: &str = "services";

/// Namespace annotation extending the allowed service types.
const DEFAULT_ANNOTATION: &str = "admission.io/service-types";

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default, rename_all = "camelCase")]
struct Config {
    ignore_namespaces: Vec<String>,
    ignore_on_failure: bool,

    /// Service types permitted cluster-wide.
    allowed_types: Vec<String>,

    /// Comma-separated namespace annotation granting extra types.
    annotation: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ignore_namespaces: Vec::new(),
            ignore_on_failure: false,
            allowed_types: vec!["ClusterIP".to_string(), "NodePort".to_string()],
            annotation: DEFAULT_ANNOTATION.to_string(),
        }
    }
}

/// Restricts the service types a namespace may expose; the cluster-wide
/// allow-list can be widened per namespace through an annotation.
pub(crate) struct Services {
    config: Config,
}

impl Services {
    pub(crate) fn from_file(path: &str) -> Result<Self> {
        let config = super::read_config(path)?;
        Ok(Self { config })
    }
}

#[async_trait::async_trait]
impl Authorize for Services {
    fn name(&self) -> &'static str {
        NAME
    }

    fn filter_on(&self) -> Filter {
        Filter {
            kind: ObjectKind::Service,
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
        let Some(service) = object.as_service() else {
            return Vec::new();
        };
        let service_type = service
            .spec
            .as_ref()
            .and_then(|spec| spec.type_.as_deref())
            .unwrap_or("ClusterIP");

        if self.config.allowed_types.iter().any(|t| t == service_type) {
            return Vec::new();
        }

        // The namespace may have been granted the type explicitly.
        let name = object.namespace();
        if !name.is_empty() {
            let namespace = match namespace_cached(client, cache, name).await {
                Ok(namespace) => namespace,
                Err(error) => return vec![Violation::internal(NAME, format!("{error:#}"))],
            };
            let granted = namespace
                .metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(&self.config.annotation))
                .map(|types| {
                    types
                        .split(',')
                        .any(|t| t.trim().eq_ignore_ascii_case(service_type))
                })
                .unwrap_or(false);
            if granted {
                return Vec::new();
            }
        }

        vec![Violation::not_supported(
            "spec.type",
            service_type,
            "service type is not permitted in this namespace",
        )]
    }
}
