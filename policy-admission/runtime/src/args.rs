use crate::{admission::Admission, metrics::Metrics};
use anyhow::{bail, Context, Result};
use clap::Parser;
use policy_admission_authorize as authorize;
use policy_admission_core::ResourceCache;
use policy_admission_k8s::KubeClusterClient;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[clap(
    name = "policy-admission",
    about = "An admission webhook enforcing security policy on cluster workloads"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "policy_admission=info,warn",
        env = "POLICY_ADMISSION_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Authorizers to enable, as name=path pairs. The path may be
    /// omitted to use a module's built-in defaults.
    #[clap(long = "authorizer", value_name = "NAME=PATH")]
    authorizers: Vec<AuthorizerSpec>,

    /// Namespace denial events fall back to for cluster-scoped objects.
    #[clap(long, default_value = "kube-admission", env = "KUBE_NAMESPACE")]
    namespace: String,

    /// Log each admission review as it is processed.
    #[clap(long, env = "ENABLE_LOGGING")]
    enable_logging: bool,

    /// Record a cluster event for each denial.
    #[clap(long, env = "ENABLE_EVENTS")]
    enable_events: bool,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            server,
            admin,
            authorizers,
            namespace,
            enable_logging,
            enable_events,
        } = self;

        if authorizers.is_empty() {
            bail!("no authorizers configured; pass at least one --authorizer");
        }

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(&mut prom);

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(Some(server))
            .build()
            .await?;

        let mut modules = Vec::with_capacity(authorizers.len());
        for AuthorizerSpec { name, path } in &authorizers {
            let authorizer = authorize::new(name, path, true)
                .with_context(|| format!("unable to enable authorizer {name}"))?;
            let filter = authorizer.filter_on();
            info!(
                authorizer = %authorizer.name(),
                kind = %filter.kind,
                ignored = %filter.ignore_namespaces.join(","),
                "enabling authorizer",
            );
            modules.push(authorizer);
        }

        let client = Arc::new(KubeClusterClient::new(runtime.client()));
        let admission = Admission::new(
            client,
            ResourceCache::new(),
            modules,
            metrics,
            namespace,
            enable_events,
            enable_logging,
        )?;

        let runtime = runtime.spawn_server(move || admission);

        // Block on the shutdown signal, then wait for background tasks
        // to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("aborted");
        }

        Ok(())
    }
}

#[derive(Clone, Debug)]
struct AuthorizerSpec {
    name: String,
    path: String,
}

impl std::str::FromStr for AuthorizerSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, path) = s.split_once('=').unwrap_or((s, ""));
        if name.is_empty() {
            bail!("authorizer name must not be empty");
        }
        if path.contains('=') {
            bail!("authorizer must be name=path");
        }
        Ok(Self {
            name: name.to_string(),
            path: path.to_string(),
        })
    }
}
