use crate::metrics::{Metrics, ACTION_ACCEPT, ACTION_DENY};
use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use futures::{future, FutureExt};
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    response::Status,
    DynamicObject,
};
use policy_admission_authorize::Authorize;
use policy_admission_core::{join_details, ObjectKind, ResourceCache, Violation};
use policy_admission_k8s::{denial_event, AdmitObject, ClusterClient};
use std::{panic::AssertUnwindSafe, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

type Review = AdmissionReview<DynamicObject>;
type Body = http_body_util::Full<Bytes>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

/// The admission endpoint: decodes review envelopes, dispatches them
/// through the registered authorizers in order and shapes the verdict.
#[derive(Clone)]
pub struct Admission {
    inner: Arc<Inner>,
}

struct Inner {
    client: Arc<dyn ClusterClient>,
    cache: ResourceCache,
    authorizers: Vec<Arc<dyn Authorize>>,
    metrics: Metrics,

    /// Fallback namespace for denial events on cluster-scoped objects.
    event_namespace: String,
    enable_events: bool,
    log_reviews: bool,
}

/// The aggregated outcome of one review.
struct Verdict {
    allowed: bool,
    message: String,
    object: AdmitObject,
}

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() == http::Method::GET && req.uri().path() == "/health" {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::OK)
                    .body(Body::from(Bytes::from_static(b"ok")))
                    .expect("health response must be valid"),
            ));
        }

        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            let bytes = req.into_body().collect().await?.to_bytes();
            admission.serve(bytes).await
        })
    }
}

impl Admission {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        cache: ResourceCache,
        authorizers: Vec<Arc<dyn Authorize>>,
        metrics: Metrics,
        event_namespace: String,
        enable_events: bool,
        log_reviews: bool,
    ) -> Result<Self> {
        if authorizers.is_empty() {
            bail!("no authorizers defined");
        }
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                cache,
                authorizers,
                metrics,
                event_namespace,
                enable_events,
                log_reviews,
            }),
        })
    }

    /// Handles one review payload. Decode failures and unsupported
    /// kinds surface as HTTP 5xx so the orchestrator sees an errored
    /// webhook rather than a verdict.
    pub(crate) async fn serve(&self, bytes: Bytes) -> Result<Response<Body>, Error> {
        let review: Review = match serde_json::from_slice(&bytes) {
            Ok(review) => review,
            Err(err) => {
                return Ok(self.engine_error(&anyhow!(err).context("failed to parse review body")))
            }
        };
        trace!(?review);

        let req: AdmissionRequest<DynamicObject> = match review.try_into() {
            Ok(req) => req,
            Err(err) => return Ok(self.engine_error(&anyhow!(err).context("invalid review"))),
        };

        match self.evaluate(req).await {
            Ok(rsp) => {
                debug!(?rsp);
                json_response(rsp.into_review())
            }
            Err(err) => Ok(self.engine_error(&err)),
        }
    }

    /// Evaluates one decoded review against the registered authorizers.
    /// A returned error means no verdict could be produced at all.
    pub(crate) async fn evaluate(
        &self,
        req: AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionResponse> {
        let rsp = AdmissionResponse::from(&req);

        let uid = req.uid.clone();
        let operation = req.operation.clone();
        let kind: ObjectKind = req.kind.kind.parse()?;
        let namespace = req.namespace.unwrap_or_default();
        let object = req
            .object
            .ok_or_else(|| anyhow!("admission request has no object"))?;
        let mut object = AdmitObject::decode(kind, object)?;
        // The envelope is authoritative for the namespace; the embedded
        // bytes may be inconsistent for Create.
        object.set_namespace(&namespace);

        let verdict = self.authorize(kind, &namespace, object).await;
        if verdict.allowed {
            self.inner.metrics.inc_total(ACTION_ACCEPT);
            if self.inner.log_reviews {
                info!(
                    %uid,
                    operation = ?operation,
                    %kind,
                    name = %verdict.object.display_name(),
                    %namespace,
                    "object is authorized for execution",
                );
            }
            return Ok(rsp);
        }

        self.inner.metrics.inc_total(ACTION_DENY);
        if self.inner.log_reviews {
            warn!(
                %uid,
                operation = ?operation,
                %kind,
                error = %verdict.message,
                name = %verdict.object.display_name(),
                %namespace,
                "authorization for object execution denied",
            );
        }
        if self.inner.enable_events {
            self.record_denial(&verdict.object, &verdict.message).await;
        }

        let mut rsp = rsp;
        rsp.allowed = false;
        rsp.result = Status::failure(&verdict.message, "Forbidden")
            .with_code(http::StatusCode::FORBIDDEN.as_u16());
        Ok(rsp)
    }

    /// Runs the authorizers in registration order, stopping at the
    /// first denial that is not an ignorable internal failure.
    async fn authorize(&self, kind: ObjectKind, namespace: &str, object: AdmitObject) -> Verdict {
        for authorizer in &self.inner.authorizers {
            let filter = authorizer.filter_on();
            if filter.kind != kind {
                continue;
            }
            if filter.ignores(namespace) {
                warn!(
                    name = %object.display_name(),
                    %namespace,
                    authorizer = %authorizer.name(),
                    "authorizer is ignored on this namespace",
                );
                continue;
            }

            let errs = self.admit_one(authorizer, &object).await;
            if errs.is_empty() {
                self.inner
                    .metrics
                    .inc_authorizer(authorizer.name(), ACTION_ACCEPT);
                continue;
            }
            self.inner
                .metrics
                .inc_authorizer(authorizer.name(), ACTION_DENY);

            if filter.ignore_on_failure && errs.iter().all(Violation::is_internal) {
                for violation in &errs {
                    warn!(
                        error = %violation.detail,
                        name = %object.display_name(),
                        %namespace,
                        authorizer = %authorizer.name(),
                        "internal authorizer error, skipping its verdict",
                    );
                }
                continue;
            }

            return Verdict {
                allowed: false,
                message: join_details(&errs),
                object,
            };
        }

        Verdict {
            allowed: true,
            message: String::new(),
            object,
        }
    }

    /// Invokes a single authorizer, always observing its latency and
    /// converting a panic into an internal violation.
    async fn admit_one(&self, authorizer: &Arc<dyn Authorize>, object: &AdmitObject) -> Vec<Violation> {
        let start = tokio::time::Instant::now();
        let result = AssertUnwindSafe(authorizer.admit(
            &*self.inner.client,
            &self.inner.cache,
            object,
        ))
        .catch_unwind()
        .await;
        self.inner
            .metrics
            .observe_latency(authorizer.name(), start.elapsed().as_secs_f64());

        match result {
            Ok(errs) => errs,
            Err(_) => {
                warn!(authorizer = %authorizer.name(), "authorizer panicked during evaluation");
                vec![Violation::internal(
                    authorizer.name(),
                    "authorizer panicked during evaluation",
                )]
            }
        }
    }

    async fn record_denial(&self, object: &AdmitObject, message: &str) {
        let namespace = match object.namespace() {
            "" => self.inner.event_namespace.as_str(),
            namespace => namespace,
        };
        let event = denial_event(object, message);
        if let Err(error) = self.inner.client.create_event(namespace, event).await {
            warn!(%error, %namespace, "unable to record denial event");
        }
    }

    fn engine_error(&self, err: &anyhow::Error) -> Response<Body> {
        error!(error = %format!("{err:#}"), "unable to handle admission review");
        self.inner.metrics.inc_error();
        Response::builder()
            .status(http::StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from(Bytes::from(format!("{err:#}"))))
            .expect("error response must be valid")
    }
}

fn json_response(rsp: Review) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}
