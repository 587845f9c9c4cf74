use crate::{Ingress, Namespace, Pod, Service};
use anyhow::{Context, Result};
use kube::{api::ObjectMeta, core::DynamicObject};
use policy_admission_core::ObjectKind;
use std::collections::BTreeMap;

static EMPTY: BTreeMap<String, String> = BTreeMap::new();

/// A review payload decoded into the typed representation for its kind.
///
/// Created once per request and handed read-only to every applicable
/// authorizer; the namespace is force-set from the review envelope
/// before dispatch since the embedded bytes may be inconsistent for
/// Create operations.
#[derive(Clone, Debug)]
pub enum AdmitObject {
    Pod(Box<Pod>),
    Namespace(Box<Namespace>),
    Ingress(Box<Ingress>),
    Service(Box<Service>),
}

impl AdmitObject {
    /// Decodes the raw review object. Unknown fields in the payload are
    /// ignored by the typed decoders; a malformed payload is a hard
    /// error that aborts the review.
    pub fn decode(kind: ObjectKind, obj: DynamicObject) -> Result<Self> {
        let value = serde_json::to_value(&obj).context("unable to re-encode review object")?;
        let decoded = match kind {
            ObjectKind::Pod => Self::Pod(
                serde_json::from_value(value).context("unable to decode Pod from review")?,
            ),
            ObjectKind::Namespace => Self::Namespace(
                serde_json::from_value(value).context("unable to decode Namespace from review")?,
            ),
            ObjectKind::Ingress => Self::Ingress(
                serde_json::from_value(value).context("unable to decode Ingress from review")?,
            ),
            ObjectKind::Service => Self::Service(
                serde_json::from_value(value).context("unable to decode Service from review")?,
            ),
        };
        Ok(decoded)
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Pod(_) => ObjectKind::Pod,
            Self::Namespace(_) => ObjectKind::Namespace,
            Self::Ingress(_) => ObjectKind::Ingress,
            Self::Service(_) => ObjectKind::Service,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn generate_name(&self) -> &str {
        self.metadata().generate_name.as_deref().unwrap_or_default()
    }

    /// The name, falling back to the generate-name prefix for objects
    /// that have not been named yet.
    pub fn display_name(&self) -> &str {
        let name = self.name();
        if name.is_empty() {
            self.generate_name()
        } else {
            name
        }
    }

    pub fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.metadata_mut().namespace = Some(namespace.to_string());
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        self.metadata().annotations.as_ref().unwrap_or(&EMPTY)
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        self.metadata().labels.as_ref().unwrap_or(&EMPTY)
    }

    pub fn as_pod(&self) -> Option<&Pod> {
        match self {
            Self::Pod(pod) => Some(pod),
            _ => None,
        }
    }

    pub fn as_namespace(&self) -> Option<&Namespace> {
        match self {
            Self::Namespace(ns) => Some(ns),
            _ => None,
        }
    }

    pub fn as_ingress(&self) -> Option<&Ingress> {
        match self {
            Self::Ingress(ingress) => Some(ingress),
            _ => None,
        }
    }

    pub fn as_service(&self) -> Option<&Service> {
        match self {
            Self::Service(service) => Some(service),
            _ => None,
        }
    }

    fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Pod(pod) => &pod.metadata,
            Self::Namespace(ns) => &ns.metadata,
            Self::Ingress(ingress) => &ingress.metadata,
            Self::Service(service) => &service.metadata,
        }
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::Pod(pod) => &mut pod.metadata,
            Self::Namespace(ns) => &mut ns.metadata,
            Self::Ingress(ingress) => &mut ingress.metadata,
            Self::Service(service) => &mut service.metadata,
        }
    }
}
