use crate::{
    metrics::{ACTION_ACCEPT, ACTION_DENY},
    Admission, Metrics,
};
use anyhow::{bail, Result};
use kube::core::{admission::AdmissionRequest, DynamicObject};
use policy_admission_authorize::{new_authorizer, Authorize, Reloadable};
use policy_admission_core::{Filter, ObjectKind, ResourceCache, Violation};
use policy_admission_k8s::{AdmitObject, ClusterClient, Event, Namespace};
use prometheus_client::registry::Registry;
use serde_json::{json, Value};
use std::{
    io::Write,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

type Review = kube::core::admission::AdmissionReview<DynamicObject>;

// === test doubles ===

#[derive(Default)]
struct FakeClient {
    namespaces: Vec<Namespace>,
    events: Mutex<Vec<(String, Event)>>,
    fail_events: bool,
}

impl FakeClient {
    fn recorded_events(&self) -> Vec<(String, Event)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ClusterClient for FakeClient {
    async fn get_namespace(&self, name: &str) -> Result<Namespace> {
        match self
            .namespaces
            .iter()
            .find(|ns| ns.metadata.name.as_deref() == Some(name))
        {
            Some(ns) => Ok(ns.clone()),
            None => bail!("namespace {name} not found"),
        }
    }

    async fn create_event(&self, namespace: &str, event: Event) -> Result<()> {
        if self.fail_events {
            bail!("events are unavailable");
        }
        self.events
            .lock()
            .unwrap()
            .push((namespace.to_string(), event));
        Ok(())
    }
}

/// Authorizer double that counts invocations, records the namespaces it
/// was shown and returns a fixed verdict.
struct Probe {
    name: &'static str,
    filter: Filter,
    violations: Vec<Violation>,
    panics: bool,
    calls: AtomicUsize,
    namespaces_seen: Mutex<Vec<String>>,
}

impl Probe {
    fn accepting(name: &'static str, kind: ObjectKind) -> Self {
        Self::new(name, Filter::new(kind), Vec::new())
    }

    fn denying(name: &'static str, kind: ObjectKind, violations: Vec<Violation>) -> Self {
        Self::new(name, Filter::new(kind), violations)
    }

    fn new(name: &'static str, filter: Filter, violations: Vec<Violation>) -> Self {
        Self {
            name,
            filter,
            violations,
            panics: false,
            calls: AtomicUsize::new(0),
            namespaces_seen: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Authorize for Probe {
    fn name(&self) -> &'static str {
        self.name
    }

    fn filter_on(&self) -> Filter {
        self.filter.clone()
    }

    async fn admit(
        &self,
        _client: &dyn ClusterClient,
        _cache: &ResourceCache,
        object: &AdmitObject,
    ) -> Vec<Violation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.namespaces_seen
            .lock()
            .unwrap()
            .push(object.namespace().to_string());
        if self.panics {
            panic!("probe asked to panic");
        }
        self.violations.clone()
    }
}

// === harness ===

struct Harness {
    admission: Admission,
    metrics: Metrics,
    client: Arc<FakeClient>,
}

impl Harness {
    fn new(modules: Vec<Arc<dyn Authorize>>) -> Self {
        Self::with_client(modules, FakeClient::default(), false)
    }

    fn with_client(
        modules: Vec<Arc<dyn Authorize>>,
        client: FakeClient,
        enable_events: bool,
    ) -> Self {
        let metrics = Metrics::register(&mut <Registry>::default());
        let client = Arc::new(client);
        let admission = Admission::new(
            client.clone(),
            ResourceCache::new(),
            modules,
            metrics.clone(),
            "kube-admission".to_string(),
            enable_events,
            false,
        )
        .expect("admission must build");
        Self {
            admission,
            metrics,
            client,
        }
    }
}

fn request(kind: &str, namespace: Option<&str>, object: Value) -> AdmissionRequest<DynamicObject> {
    let review: Review = serde_json::from_value(json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "review-1",
            "kind": {"group": "", "version": "v1", "kind": kind},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "namespace": namespace,
            "operation": "CREATE",
            "userInfo": {"username": "kubelet"},
            "object": object,
        },
    }))
    .expect("review must parse");
    review.try_into().expect("request must be present")
}

fn pod_request(namespace: &str, spec: Value) -> AdmissionRequest<DynamicObject> {
    request(
        "Pod",
        Some(namespace),
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "web", "namespace": namespace},
            "spec": spec,
        }),
    )
}

fn write_config(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file.sync_all().unwrap();
    path.to_str().unwrap().to_string()
}

// === scenarios ===

#[tokio::test]
async fn s1_accepts_conforming_pod() {
    let dir = tempfile::tempdir().unwrap();
    let sc = write_config(&dir, "sc.yaml", "runAsNonRoot: true\n");
    let images = write_config(&dir, "images.yaml", "allowedImages: [\"quay.io/ok/*\"]\n");

    let harness = Harness::new(vec![
        new_authorizer("securitycontext", &sc).unwrap(),
        new_authorizer("images", &images).unwrap(),
    ]);

    let rsp = harness
        .admission
        .evaluate(pod_request(
            "apps",
            json!({
                "securityContext": {"runAsNonRoot": true},
                "containers": [{"name": "app", "image": "quay.io/ok/app:1"}],
            }),
        ))
        .await
        .unwrap();

    assert!(rsp.allowed);
    assert!(rsp.result.message.is_empty());
    assert_eq!(harness.metrics.total_count(ACTION_ACCEPT), 1);
    assert_eq!(
        harness.metrics.authorizer_count("securitycontext", ACTION_ACCEPT),
        1
    );
    assert_eq!(harness.metrics.authorizer_count("images", ACTION_ACCEPT), 1);
}

#[tokio::test]
async fn s2_denies_privileged_pod() {
    let harness = Harness::new(vec![new_authorizer("securitycontext", "").unwrap()]);

    let rsp = harness
        .admission
        .evaluate(pod_request(
            "apps",
            json!({
                "containers": [{"name": "app", "securityContext": {"privileged": true}}],
            }),
        ))
        .await
        .unwrap();

    assert!(!rsp.allowed);
    assert_eq!(rsp.result.code, 403);
    assert_eq!(rsp.result.reason, "Forbidden");
    assert!(rsp
        .result
        .message
        .contains("containers[0].securityContext.privileged=true"));
    assert!(rsp.result.message.contains("privileged"));
    assert_eq!(harness.metrics.total_count(ACTION_DENY), 1);
}

#[tokio::test]
async fn s3_first_denial_wins() {
    let dir = tempfile::tempdir().unwrap();
    let images = write_config(&dir, "images.yaml", "allowedImages: [\"quay.io/ok/*\"]\n");

    let second = Arc::new(Probe::denying(
        "securitycontext",
        ObjectKind::Pod,
        vec![Violation::invalid("spec.hostNetwork", true, "not allowed")],
    ));
    let harness = Harness::new(vec![
        new_authorizer("images", &images).unwrap(),
        second.clone(),
    ]);

    let rsp = harness
        .admission
        .evaluate(pod_request(
            "apps",
            json!({
                "hostNetwork": true,
                "containers": [{"name": "app", "image": "docker.io/evil/app:1"}],
            }),
        ))
        .await
        .unwrap();

    assert!(!rsp.allowed);
    assert!(rsp.result.message.contains("spec.containers[0].image"));
    assert!(!rsp.result.message.contains("hostNetwork"));
    assert_eq!(second.calls(), 0);
    assert_eq!(
        harness.metrics.authorizer_count("securitycontext", ACTION_DENY),
        0
    );
}

#[tokio::test]
async fn s4_internal_failure_is_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    // Nothing listens on this port; the fetch fails fast and the module
    // tolerates internal failures by default.
    let imagelist = write_config(
        &dir,
        "imagelist.yaml",
        "endpoint: http://127.0.0.1:1/images\n",
    );

    let harness = Harness::new(vec![new_authorizer("imagelist", &imagelist).unwrap()]);

    let rsp = harness
        .admission
        .evaluate(pod_request(
            "apps",
            json!({"containers": [{"name": "app", "image": "quay.io/ok/app:1"}]}),
        ))
        .await
        .unwrap();

    assert!(rsp.allowed);
    assert_eq!(harness.metrics.authorizer_count("imagelist", ACTION_DENY), 1);
    assert_eq!(harness.metrics.total_count(ACTION_ACCEPT), 1);
}

#[tokio::test]
async fn s5_unsupported_kind_is_an_engine_error() {
    let probe = Arc::new(Probe::accepting("probe", ObjectKind::Pod));
    let harness = Harness::new(vec![probe.clone()]);

    let body = serde_json::to_vec(&json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "review-1",
            "kind": {"group": "apps", "version": "v1", "kind": "DaemonSet"},
            "resource": {"group": "apps", "version": "v1", "resource": "daemonsets"},
            "namespace": "apps",
            "operation": "CREATE",
            "userInfo": {"username": "kubelet"},
            "object": {"metadata": {"name": "ds"}},
        },
    }))
    .unwrap();

    let rsp = harness.admission.serve(body.into()).await.unwrap();
    assert_eq!(rsp.status(), 500);
    assert_eq!(harness.metrics.error_count(), 1);
    assert_eq!(probe.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn s6_reload_swaps_the_policy() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "images.yaml", "allowedImages: [\"a/*\"]\n");

    let inner = new_authorizer("images", &path).unwrap();
    let reloadable = Arc::new(Reloadable::spawn(inner, &path, move |p| {
        new_authorizer("images", p)
    }));
    let harness = Harness::new(vec![reloadable.clone()]);

    let accept = harness
        .admission
        .evaluate(pod_request(
            "apps",
            json!({"containers": [{"name": "app", "image": "a/x"}]}),
        ))
        .await
        .unwrap();
    assert!(accept.allowed);

    write_config(&dir, "images.yaml", "allowedImages: [\"b/*\"]\n");
    for _ in 0..100 {
        if reloadable.version() >= 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
    assert!(reloadable.version() >= 1, "reload did not happen");

    let deny = harness
        .admission
        .evaluate(pod_request(
            "apps",
            json!({"containers": [{"name": "app", "image": "a/x"}]}),
        ))
        .await
        .unwrap();
    assert!(!deny.allowed);

    let accept = harness
        .admission
        .evaluate(pod_request(
            "apps",
            json!({"containers": [{"name": "app", "image": "b/y"}]}),
        ))
        .await
        .unwrap();
    assert!(accept.allowed);
}

// === dispatch invariants ===

#[tokio::test]
async fn evaluation_is_deterministic() {
    let probe = Arc::new(Probe::accepting("probe", ObjectKind::Pod));
    let harness = Harness::new(vec![probe.clone()]);

    let spec = json!({"containers": [{"name": "app", "image": "a/x"}]});
    let first = harness
        .admission
        .evaluate(pod_request("apps", spec.clone()))
        .await
        .unwrap();
    let second = harness
        .admission
        .evaluate(pod_request("apps", spec))
        .await
        .unwrap();

    assert_eq!(first.allowed, second.allowed);
    // Exactly once per review.
    assert_eq!(probe.calls(), 2);
}

#[tokio::test]
async fn kind_filter_excludes_authorizers() {
    let probe = Arc::new(Probe::accepting("services-only", ObjectKind::Service));
    let harness = Harness::new(vec![probe.clone()]);

    let rsp = harness
        .admission
        .evaluate(pod_request("apps", json!({"containers": []})))
        .await
        .unwrap();

    assert!(rsp.allowed);
    assert_eq!(probe.calls(), 0);
}

#[tokio::test]
async fn namespace_filter_excludes_authorizers() {
    let probe = Arc::new(Probe::new(
        "probe",
        Filter {
            ignore_namespaces: vec!["kube-system".to_string()],
            ..Filter::new(ObjectKind::Pod)
        },
        vec![Violation::invalid("spec", "x", "would deny")],
    ));
    let harness = Harness::new(vec![probe.clone()]);

    let rsp = harness
        .admission
        .evaluate(pod_request("kube-system", json!({"containers": []})))
        .await
        .unwrap();

    assert!(rsp.allowed);
    assert_eq!(probe.calls(), 0);
}

#[tokio::test]
async fn internal_tolerance_requires_every_violation_internal() {
    let tolerated = Arc::new(Probe::new(
        "tolerated",
        Filter {
            ignore_on_failure: true,
            ..Filter::new(ObjectKind::Pod)
        },
        vec![Violation::internal("tolerated", "backend down")],
    ));
    let harness = Harness::new(vec![tolerated.clone()]);
    let rsp = harness
        .admission
        .evaluate(pod_request("apps", json!({"containers": []})))
        .await
        .unwrap();
    assert!(rsp.allowed);
    assert_eq!(harness.metrics.authorizer_count("tolerated", ACTION_DENY), 1);

    let mixed = Arc::new(Probe::new(
        "mixed",
        Filter {
            ignore_on_failure: true,
            ..Filter::new(ObjectKind::Pod)
        },
        vec![
            Violation::internal("mixed", "backend down"),
            Violation::invalid("spec.hostPID", true, "not allowed"),
        ],
    ));
    let harness = Harness::new(vec![mixed]);
    let rsp = harness
        .admission
        .evaluate(pod_request("apps", json!({"containers": []})))
        .await
        .unwrap();
    assert!(!rsp.allowed);

    let fatal = Arc::new(Probe::new(
        "fatal",
        Filter::new(ObjectKind::Pod),
        vec![Violation::internal("fatal", "backend down")],
    ));
    let harness = Harness::new(vec![fatal]);
    let rsp = harness
        .admission
        .evaluate(pod_request("apps", json!({"containers": []})))
        .await
        .unwrap();
    // Without ignore_on_failure the internal failure denies.
    assert!(!rsp.allowed);
    assert!(rsp.result.message.contains("backend down"));
}

#[tokio::test]
async fn authorizers_see_the_envelope_namespace() {
    let probe = Arc::new(Probe::accepting("probe", ObjectKind::Pod));
    let harness = Harness::new(vec![probe.clone()]);

    harness
        .admission
        .evaluate(request(
            "Pod",
            Some("authoritative"),
            json!({
                "metadata": {"name": "web", "namespace": "embedded"},
                "spec": {"containers": []},
            }),
        ))
        .await
        .unwrap();

    assert_eq!(
        *probe.namespaces_seen.lock().unwrap(),
        vec!["authoritative".to_string()]
    );
}

#[tokio::test]
async fn panicking_authorizer_is_an_internal_violation() {
    let mut probe = Probe::accepting("flaky", ObjectKind::Pod);
    probe.panics = true;
    probe.filter.ignore_on_failure = true;
    let probe = Arc::new(probe);
    let after = Arc::new(Probe::accepting("after", ObjectKind::Pod));

    let harness = Harness::new(vec![probe, after.clone()]);
    let rsp = harness
        .admission
        .evaluate(pod_request("apps", json!({"containers": []})))
        .await
        .unwrap();

    // Tolerated as internal; the pipeline continues.
    assert!(rsp.allowed);
    assert_eq!(after.calls(), 1);
    assert_eq!(harness.metrics.authorizer_count("flaky", ACTION_DENY), 1);

    let mut probe = Probe::accepting("flaky", ObjectKind::Pod);
    probe.panics = true;
    let harness = Harness::new(vec![Arc::new(probe)]);
    let rsp = harness
        .admission
        .evaluate(pod_request("apps", json!({"containers": []})))
        .await
        .unwrap();
    assert!(!rsp.allowed);
    assert!(rsp.result.message.contains("panicked"));
}

#[tokio::test]
async fn decode_failure_is_an_engine_error() {
    let harness = Harness::new(vec![Arc::new(Probe::accepting("probe", ObjectKind::Pod))]);
    let err = harness
        .admission
        .evaluate(request(
            "Pod",
            Some("apps"),
            json!({"metadata": {"name": "web"}, "spec": {"containers": "nope"}}),
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Pod"));
}

// === denial events ===

#[tokio::test]
async fn denials_record_events_in_the_review_namespace() {
    let deny = Arc::new(Probe::denying(
        "deny",
        ObjectKind::Pod,
        vec![Violation::invalid("spec", "x", "denied")],
    ));
    let harness = Harness::with_client(vec![deny], FakeClient::default(), true);

    harness
        .admission
        .evaluate(pod_request("apps", json!({"containers": []})))
        .await
        .unwrap();

    let events = harness.client.recorded_events();
    assert_eq!(events.len(), 1);
    let (namespace, event) = &events[0];
    assert_eq!(namespace, "apps");
    assert_eq!(event.reason.as_deref(), Some("PolicyDenied"));
    assert!(event.message.as_deref().unwrap().contains("denied"));
}

#[tokio::test]
async fn cluster_scoped_denials_fall_back_to_the_event_namespace() {
    let deny = Arc::new(Probe::denying(
        "deny",
        ObjectKind::Namespace,
        vec![Violation::invalid("metadata", "x", "denied")],
    ));
    let harness = Harness::with_client(vec![deny], FakeClient::default(), true);

    harness
        .admission
        .evaluate(request(
            "Namespace",
            None,
            json!({"metadata": {"name": "team-a"}}),
        ))
        .await
        .unwrap();

    let events = harness.client.recorded_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "kube-admission");
}

#[tokio::test]
async fn event_failures_do_not_change_the_verdict() {
    let deny = Arc::new(Probe::denying(
        "deny",
        ObjectKind::Pod,
        vec![Violation::invalid("spec", "x", "denied")],
    ));
    let client = FakeClient {
        fail_events: true,
        ..Default::default()
    };
    let harness = Harness::with_client(vec![deny], client, true);

    let rsp = harness
        .admission
        .evaluate(pod_request("apps", json!({"containers": []})))
        .await
        .unwrap();
    assert!(!rsp.allowed);
}
