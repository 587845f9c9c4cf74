use super::Authorize;
use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use policy_admission_core::{Filter, ObjectKind, ResourceCache, Violation};
use policy_admission_k8s::{AdmitObject, ClusterClient, Container};
use serde::Deserialize;

pub(crate) const NAME: &str = "images";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default, rename_all = "camelCase")]
struct Config {
    ignore_namespaces: Vec<String>,
    ignore_on_failure: bool,

    /// Glob patterns an image must match one of. Empty allows any image.
    allowed_images: Vec<String>,

    /// Pull policies a container may request. Empty allows any.
    allowed_pull_policies: Vec<String>,
}

/// Validates container images against a glob allow-list, optionally
/// constraining the image pull policy as well.
pub(crate) struct Images {
    config: Config,
    allowed: GlobSet,
}

impl Images {
    pub(crate) fn from_file(path: &str) -> Result<Self> {
        Self::from_config(super::read_config(path)?)
    }

    fn from_config(config: Config) -> Result<Self> {
        let mut allowed = GlobSetBuilder::new();
        for pattern in &config.allowed_images {
            let glob =
                Glob::new(pattern).with_context(|| format!("invalid image pattern {pattern}"))?;
            allowed.add(glob);
        }
        let allowed = allowed.build().context("unable to compile image patterns")?;
        Ok(Self { config, allowed })
    }

    fn check_container(&self, path: &str, container: &Container, errs: &mut Vec<Violation>) {
        let image = container.image.as_deref().unwrap_or_default();
        if !self.config.allowed_images.is_empty() && !self.allowed.is_match(image) {
            errs.push(Violation::invalid(
                format!("{path}.image"),
                image,
                "image does not match any allowed pattern",
            ));
        }

        if !self.config.allowed_pull_policies.is_empty() {
            if let Some(policy) = container.image_pull_policy.as_deref() {
                if !self.config.allowed_pull_policies.iter().any(|p| p == policy) {
                    errs.push(Violation::not_supported(
                        format!("{path}.imagePullPolicy"),
                        policy,
                        "image pull policy is not in the allowed set",
                    ));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Authorize for Images {
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
        _cache: &ResourceCache,
        object: &AdmitObject,
    ) -> Vec<Violation> {
        let mut errs = Vec::new();
        let Some(spec) = object.as_pod().and_then(|pod| pod.spec.as_ref()) else {
            return errs;
        };

        for (i, container) in spec.init_containers.iter().flatten().enumerate() {
            self.check_container(&format!("spec.initContainers[{i}]"), container, &mut errs);
        }
        for (i, container) in spec.containers.iter().enumerate() {
            self.check_container(&format!("spec.containers[{i}]"), container, &mut errs);
        }
        errs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeClient;
    use serde_json::json;

    fn pod(containers: serde_json::Value) -> AdmitObject {
        AdmitObject::decode(
            ObjectKind::Pod,
            serde_json::from_value(json!({
                "metadata": {"name": "web", "namespace": "apps"},
                "spec": {"containers": containers},
            }))
            .unwrap(),
        )
        .unwrap()
    }

    async fn admit(config: &str, containers: serde_json::Value) -> Vec<Violation> {
        let authorizer = Images::from_config(serde_yaml::from_str(config).unwrap()).unwrap();
        authorizer
            .admit(&FakeClient::empty(), &ResourceCache::new(), &pod(containers))
            .await
    }

    #[tokio::test]
    async fn accepts_matching_image() {
        let errs = admit(
            "allowedImages: [\"quay.io/ok/*\"]\n",
            json!([{"name": "app", "image": "quay.io/ok/app:1"}]),
        )
        .await;
        assert!(errs.is_empty());
    }

    #[tokio::test]
    async fn denies_unmatched_image() {
        let errs = admit(
            "allowedImages: [\"quay.io/ok/*\"]\n",
            json!([{"name": "app", "image": "docker.io/evil/app:1"}]),
        )
        .await;
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].field, "spec.containers[0].image");
        assert_eq!(errs[0].bad_value, "docker.io/evil/app:1");
    }

    #[tokio::test]
    async fn empty_allow_list_admits_everything() {
        let errs = admit("{}", json!([{"name": "app", "image": "anything:latest"}])).await;
        assert!(errs.is_empty());
    }

    #[tokio::test]
    async fn constrains_pull_policy() {
        let errs = admit(
            "allowedPullPolicies: [Always]\n",
            json!([{"name": "app", "image": "a", "imagePullPolicy": "IfNotPresent"}]),
        )
        .await;
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].field, "spec.containers[0].imagePullPolicy");
    }

    #[tokio::test]
    async fn checks_init_containers() {
        let errs = admit(
            "allowedImages: [\"quay.io/ok/*\"]\n",
            json!([{"name": "app", "image": "quay.io/ok/app:1"}]),
        )
        .await;
        assert!(errs.is_empty());

        let authorizer = Images::from_config(
            serde_yaml::from_str("allowedImages: [\"quay.io/ok/*\"]\n").unwrap(),
        )
        .unwrap();
        let object = AdmitObject::decode(
            ObjectKind::Pod,
            serde_json::from_value(json!({
                "metadata": {"name": "web", "namespace": "apps"},
                "spec": {
                    "initContainers": [{"name": "setup", "image": "docker.io/evil/init:1"}],
                    "containers": [{"name": "app", "image": "quay.io/ok/app:1"}],
                },
            }))
            .unwrap(),
        )
        .unwrap();
        let errs = authorizer
            .admit(&FakeClient::empty(), &ResourceCache::new(), &object)
            .await;
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].field, "spec.initContainers[0].image");
    }

    #[test]
    fn invalid_pattern_is_a_construction_error() {
        let config: Config = serde_yaml::from_str("allowedImages: [\"a[\"]\n").unwrap();
        assert!(Images::from_config(config).is_err());
    }
}
