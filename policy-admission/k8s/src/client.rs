use crate::{AdmitObject, Event, EventSource, Namespace, ObjectReference, Time};
use anyhow::{Context, Result};
use chrono::Utc;
use kube::api::{Api, ObjectMeta, PostParams};
use std::time::Duration;
use tokio::time;

/// Upper bound on any single orchestrator call made during a review.
pub const RESOURCE_TIMEOUT: Duration = Duration::from_secs(2);

/// Reason attached to denial events.
pub const DENIED_REASON: &str = "PolicyDenied";

const COMPONENT: &str = "policy-admission";

/// The narrow client surface the authorizers need. Injectable so the
/// pipeline can be exercised without a cluster.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetches namespace metadata. Callers memoise results through the
    /// resource cache under `namespace/<name>`.
    async fn get_namespace(&self, name: &str) -> Result<Namespace>;

    /// Records a cluster event. Best effort.
    async fn create_event(&self, namespace: &str, event: Event) -> Result<()>;
}

/// `ClusterClient` backed by the in-cluster (or kubeconfig) client.
/// Every call is bounded by [`RESOURCE_TIMEOUT`] so a slow apiserver
/// degrades into an internal violation instead of stalling the review.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: kube::Client,
}

impl KubeClusterClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_namespace(&self, name: &str) -> Result<Namespace> {
        let api = Api::<Namespace>::all(self.client.clone());
        let namespace = time::timeout(RESOURCE_TIMEOUT, api.get(name))
            .await
            .with_context(|| format!("timed out fetching namespace {name}"))?
            .with_context(|| format!("unable to fetch namespace {name}"))?;
        Ok(namespace)
    }

    async fn create_event(&self, namespace: &str, event: Event) -> Result<()> {
        let api = Api::<Event>::namespaced(self.client.clone(), namespace);
        time::timeout(RESOURCE_TIMEOUT, api.create(&PostParams::default(), &event))
            .await
            .context("timed out creating event")?
            .context("unable to create event")?;
        Ok(())
    }
}

/// Builds the event recorded when a review is denied.
pub fn denial_event(object: &AdmitObject, message: &str) -> Event {
    let now = Time(Utc::now());
    let namespace = object.namespace();
    Event {
        metadata: ObjectMeta {
            generate_name: Some(format!("{COMPONENT}.")),
            ..Default::default()
        },
        involved_object: ObjectReference {
            kind: Some(object.kind().to_string()),
            name: Some(object.display_name().to_string()),
            namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
            ..Default::default()
        },
        message: Some(message.to_string()),
        reason: Some(DENIED_REASON.to_string()),
        type_: Some("Warning".to_string()),
        source: Some(EventSource {
            component: Some(COMPONENT.to_string()),
            ..Default::default()
        }),
        count: Some(1),
        first_timestamp: Some(now.clone()),
        last_timestamp: Some(now),
        ..Default::default()
    }
}
