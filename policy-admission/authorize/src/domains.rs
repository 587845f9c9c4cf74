use super::{host_in_domain, namespace_cached, Authorize};
use anyhow::Result;
use policy_admission_core::{Filter, ObjectKind, ResourceCache, Violation};
use policy_admission_k8s::{AdmitObject, ClusterClient};
use serde::Deserialize;

pub(crate) const NAME: &str = "domains";

/// Namespace annotation listing the DNS domains its ingresses may
/// claim, comma-separated.
const DEFAULT_ANNOTATION: &str = "admission.io/domains";

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default, rename_all = "camelCase")]
struct Config {
    ignore_namespaces: Vec<String>,
    ignore_on_failure: bool,
    annotation: String,

    /// Domains granted to namespaces that declare none.
    default_domains: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ignore_namespaces: Vec::new(),
            ignore_on_failure: false,
            annotation: DEFAULT_ANNOTATION.to_string(),
            default_domains: Vec::new(),
        }
    }
}

/// Requires every ingress host to sit inside one of the DNS domains
/// whitelisted for its namespace.
pub(crate) struct Domains {
    config: Config,
}

impl Domains {
    pub(crate) fn from_file(path: &str) -> Result<Self> {
        let config = super::read_config(path)?;
        Ok(Self { config })
    }
}

#[async_trait::async_trait]
impl Authorize for Domains {
    fn name(&self) -> &'static str {
        NAME
    }

    fn filter_on(&self) -> Filter {
        Filter {
            kind: ObjectKind::Ingress,
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
        let rules = object
            .as_ingress()
            .and_then(|ingress| ingress.spec.as_ref())
            .and_then(|spec| spec.rules.as_deref())
            .unwrap_or_default();
        if !rules.iter().any(|rule| rule.host.is_some()) {
            return Vec::new();
        }

        let domains = match self.domains_for(client, cache, object.namespace()).await {
            Ok(domains) => domains,
            Err(violation) => return vec![violation],
        };

        let mut errs = Vec::new();
        for (i, rule) in rules.iter().enumerate() {
            let Some(host) = rule.host.as_deref() else {
                continue;
            };
            if !domains.iter().any(|domain| host_in_domain(host, domain)) {
                errs.push(Violation::forbidden(
                    format!("spec.rules[{i}].host"),
                    host,
                    "host is not within the namespace's whitelisted domains",
                ));
            }
        }
        errs
    }
}

impl Domains {
    async fn domains_for(
        &self,
        client: &dyn ClusterClient,
        cache: &ResourceCache,
        name: &str,
    ) -> Result<Vec<String>, Violation> {
        if name.is_empty() {
            return Ok(self.config.default_domains.clone());
        }
        let namespace = namespace_cached(client, cache, name)
            .await
            .map_err(|error| Violation::internal(NAME, format!("{error:#}")))?;
        let domains = namespace
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(&self.config.annotation))
            .map(|domains| {
                domains
                    .split(',')
                    .map(|domain| domain.trim().to_string())
                    .filter(|domain| !domain.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| self.config.default_domains.clone());
        Ok(domains)
    }
}
