#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod domains;
mod imagelist;
mod images;
mod kubecertmanager;
mod namespaces;
mod reload;
mod securitycontext;
mod services;
mod tolerations;

pub use self::reload::Reloadable;

use anyhow::{bail, Context, Result};
use policy_admission_core::{Filter, ResourceCache, Violation};
use policy_admission_k8s::{AdmitObject, ClusterClient, Namespace};
use std::{sync::Arc, time::Duration};

/// TTL applied to memoised namespace lookups.
const NAMESPACE_TTL: Duration = Duration::from_secs(60);

/// A named policy module evaluating one object kind.
///
/// Implementations are immutable once constructed and safe to call
/// concurrently; any violation list they return is aggregated by the
/// dispatch engine.
#[async_trait::async_trait]
pub trait Authorize: Send + Sync {
    /// Lowercase identifier, unique across modules.
    fn name(&self) -> &'static str;

    /// Which reviews this module wants to see.
    fn filter_on(&self) -> Filter;

    /// Evaluates the object, returning every violation found. An empty
    /// list admits the object.
    async fn admit(
        &self,
        client: &dyn ClusterClient,
        cache: &ResourceCache,
        object: &AdmitObject,
    ) -> Vec<Violation>;
}

/// Builds the module registered under `name` from its configuration
/// file. An empty path selects the module's built-in defaults.
pub fn new_authorizer(name: &str, path: &str) -> Result<Arc<dyn Authorize>> {
    let authorizer: Arc<dyn Authorize> = match name {
        domains::NAME => Arc::new(domains::Domains::from_file(path)?),
        imagelist::NAME => Arc::new(imagelist::ImageList::from_file(path)?),
        images::NAME => Arc::new(images::Images::from_file(path)?),
        kubecertmanager::NAME => Arc::new(kubecertmanager::KubeCertManager::from_file(path)?),
        namespaces::NAME => Arc::new(namespaces::Namespaces::from_file(path)?),
        securitycontext::NAME => Arc::new(securitycontext::SecurityContext::from_file(path)?),
        services::NAME => Arc::new(services::Services::from_file(path)?),
        tolerations::NAME => Arc::new(tolerations::Tolerations::from_file(path)?),
        unknown => bail!("unknown authorizer: {unknown}"),
    };
    Ok(authorizer)
}

/// Builds an authorizer, optionally wrapped so edits to its
/// configuration file hot-swap the live instance.
pub fn new(name: &str, path: &str, reloadable: bool) -> Result<Arc<dyn Authorize>> {
    let inner = new_authorizer(name, path)?;
    if !reloadable || path.is_empty() {
        return Ok(inner);
    }
    let module = name.to_string();
    Ok(Arc::new(Reloadable::spawn(inner, path, move |p| {
        new_authorizer(&module, p)
    })))
}

/// Loads a module configuration document, rejecting unknown fields.
fn read_config<T>(path: &str) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if path.is_empty() {
        return Ok(T::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read configuration file {path}"))?;
    serde_yaml::from_str(&text).with_context(|| format!("unable to parse configuration file {path}"))
}

/// Fetches namespace metadata through the shared cache.
async fn namespace_cached(
    client: &dyn ClusterClient,
    cache: &ResourceCache,
    name: &str,
) -> Result<Arc<Namespace>> {
    let key = format!("namespace/{name}");
    if let Some(namespace) = cache.get::<Namespace>(&key) {
        return Ok(namespace);
    }
    let namespace = Arc::new(client.get_namespace(name).await?);
    cache.insert(key, namespace.clone(), NAMESPACE_TTL);
    Ok(namespace)
}

/// Whether `host` sits at or under `domain`. A leading `*.` on the host
/// claims the whole zone beneath it.
fn host_in_domain(host: &str, domain: &str) -> bool {
    let host = host.strip_prefix("*.").unwrap_or(host);
    host == domain || host.ends_with(&format!(".{domain}"))
}
