use super::{host_in_domain, Authorize};
use anyhow::Result;
use policy_admission_core::{Filter, ObjectKind, ResourceCache, Violation};
use policy_admission_k8s::{AdmitObject, ClusterClient};
use serde::Deserialize;
use std::collections::BTreeMap;

pub(crate) const NAME: &str = "kubecertmanager";

const CLUSTER_ISSUER_ANNOTATION: &str = "cert-manager.io/cluster-issuer";
const LEGACY_ACME_ANNOTATION: &str = "kubernetes.io/tls-acme";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default, rename_all = "camelCase")]
struct Config {
    ignore_namespaces: Vec<String>,
    ignore_on_failure: bool,

    /// DNS zones certificates may be requested for.
    delegated_domains: Vec<String>,
}

/// Constrains ingresses that request certificates through cert-manager
/// to hostnames inside the delegated zones.
pub(crate) struct KubeCertManager {
    config: Config,
}

impl KubeCertManager {
    pub(crate) fn from_file(path: &str) -> Result<Self> {
        let config = super::read_config(path)?;
        Ok(Self { config })
    }
}

fn requests_certificate(annotations: &BTreeMap<String, String>) -> bool {
    annotations.contains_key(CLUSTER_ISSUER_ANNOTATION)
        || annotations
            .get(LEGACY_ACME_ANNOTATION)
            .is_some_and(|enabled| enabled == "true")
}

#[async_trait::async_trait]
impl Authorize for KubeCertManager {
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
        _client: &dyn ClusterClient,
        _cache: &ResourceCache,
        object: &AdmitObject,
    ) -> Vec<Violation> {
        if !requests_certificate(object.annotations()) {
            return Vec::new();
        }

        let rules = object
            .as_ingress()
            .and_then(|ingress| ingress.spec.as_ref())
            .and_then(|spec| spec.rules.as_deref())
            .unwrap_or_default();

        let mut errs = Vec::new();
        for (i, rule) in rules.iter().enumerate() {
            let Some(host) = rule.host.as_deref() else {
                continue;
            };
            if !self
                .config
                .delegated_domains
                .iter()
                .any(|domain| host_in_domain(host, domain))
            {
                errs.push(Violation::forbidden(
                    format!("spec.rules[{i}].host"),
                    host,
                    "host is outside the delegated certificate zones",
                ));
            }
        }
        errs
    }
}
