use super::Authorize;
use anyhow::Result;
use policy_admission_core::{Filter, ObjectKind, ResourceCache, Violation};
use policy_admission_k8s::{AdmitObject, ClusterClient, Container, PodSpec, Volume};
use serde::Deserialize;

pub(crate) const NAME: &str = "securitycontext";

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default, rename_all = "camelCase")]
struct Config {
    ignore_namespaces: Vec<String>,
    ignore_on_failure: bool,

    /// Require every container to assert a non-root identity.
    run_as_non_root: bool,

    /// Inclusive bounds on `runAsUser` when one is requested.
    min_run_as_user: Option<i64>,
    max_run_as_user: Option<i64>,

    /// Capabilities a container may add. Empty forbids all additions.
    allowed_capabilities: Vec<String>,

    /// Capabilities every container must drop.
    required_drop_capabilities: Vec<String>,

    allow_privileged: bool,
    allow_host_network: bool,
    allow_host_pid: bool,
    allow_host_ipc: bool,

    /// Volume types pods may mount. Empty allows all.
    allowed_volume_types: Vec<String>,

    /// Require a read-only root filesystem.
    read_only_root_filesystem: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ignore_namespaces: vec!["kube-system".to_string()],
            ignore_on_failure: false,
            run_as_non_root: false,
            min_run_as_user: None,
            max_run_as_user: None,
            allowed_capabilities: Vec::new(),
            required_drop_capabilities: Vec::new(),
            allow_privileged: false,
            allow_host_network: false,
            allow_host_pid: false,
            allow_host_ipc: false,
            allowed_volume_types: Vec::new(),
            read_only_root_filesystem: false,
        }
    }
}

/// Enforces pod security-context allow-lists: privilege, host
/// namespaces, user identity, capabilities and volume types.
pub(crate) struct SecurityContext {
    config: Config,
}

impl SecurityContext {
    pub(crate) fn from_file(path: &str) -> Result<Self> {
        let config = super::read_config(path)?;
        Ok(Self { config })
    }

    fn check_pod(&self, spec: &PodSpec, errs: &mut Vec<Violation>) {
        if spec.host_network.unwrap_or(false) && !self.config.allow_host_network {
            errs.push(Violation::forbidden(
                "spec.hostNetwork",
                true,
                "host network namespace is not allowed",
            ));
        }
        if spec.host_pid.unwrap_or(false) && !self.config.allow_host_pid {
            errs.push(Violation::forbidden(
                "spec.hostPID",
                true,
                "host PID namespace is not allowed",
            ));
        }
        if spec.host_ipc.unwrap_or(false) && !self.config.allow_host_ipc {
            errs.push(Violation::forbidden(
                "spec.hostIPC",
                true,
                "host IPC namespace is not allowed",
            ));
        }

        if !self.config.allowed_volume_types.is_empty() {
            for (i, volume) in spec.volumes.iter().flatten().enumerate() {
                let kind = volume_type(volume);
                if !self.config.allowed_volume_types.iter().any(|v| v == kind) {
                    errs.push(Violation::not_supported(
                        format!("spec.volumes[{i}]"),
                        kind,
                        "volume type is not in the allowed set",
                    ));
                }
            }
        }
    }

    fn check_container(
        &self,
        path: &str,
        container: &Container,
        pod_spec: &PodSpec,
        errs: &mut Vec<Violation>,
    ) {
        let sc = container.security_context.as_ref();
        let pod_sc = pod_spec.security_context.as_ref();

        if sc.and_then(|sc| sc.privileged).unwrap_or(false) && !self.config.allow_privileged {
            errs.push(Violation::invalid(
                format!("{path}.securityContext.privileged"),
                true,
                "privileged containers are not allowed",
            ));
        }

        // Container settings win over the pod-level security context.
        let run_as_non_root = sc
            .and_then(|sc| sc.run_as_non_root)
            .or_else(|| pod_sc.and_then(|sc| sc.run_as_non_root));
        if self.config.run_as_non_root && run_as_non_root != Some(true) {
            errs.push(Violation::invalid(
                format!("{path}.securityContext.runAsNonRoot"),
                run_as_non_root.unwrap_or(false),
                "containers must run as non-root",
            ));
        }

        let run_as_user = sc
            .and_then(|sc| sc.run_as_user)
            .or_else(|| pod_sc.and_then(|sc| sc.run_as_user));
        if let Some(uid) = run_as_user {
            let below = self.config.min_run_as_user.is_some_and(|min| uid < min);
            let above = self.config.max_run_as_user.is_some_and(|max| uid > max);
            if below || above {
                errs.push(Violation::invalid(
                    format!("{path}.securityContext.runAsUser"),
                    uid,
                    "runAsUser is outside the allowed range",
                ));
            }
        }

        let capabilities = sc.and_then(|sc| sc.capabilities.as_ref());
        for cap in capabilities.and_then(|c| c.add.as_deref()).unwrap_or_default() {
            if !self.config.allowed_capabilities.iter().any(|c| c == cap) {
                errs.push(Violation::not_supported(
                    format!("{path}.securityContext.capabilities.add"),
                    cap,
                    "capability is not in the allowed set",
                ));
            }
        }
        let dropped = capabilities.and_then(|c| c.drop.as_ref());
        for cap in &self.config.required_drop_capabilities {
            if !dropped.is_some_and(|d| d.iter().any(|c| c == cap)) {
                errs.push(Violation::required(
                    format!("{path}.securityContext.capabilities.drop"),
                    format!("capability {cap} must be dropped"),
                ));
            }
        }

        if self.config.read_only_root_filesystem
            && sc.and_then(|sc| sc.read_only_root_filesystem) != Some(true)
        {
            errs.push(Violation::invalid(
                format!("{path}.securityContext.readOnlyRootFilesystem"),
                false,
                "root filesystem must be read-only",
            ));
        }
    }
}

#[async_trait::async_trait]
impl Authorize for SecurityContext {
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

        self.check_pod(spec, &mut errs);
        for (i, container) in spec.init_containers.iter().flatten().enumerate() {
            self.check_container(&format!("spec.initContainers[{i}]"), container, spec, &mut errs);
        }
        for (i, container) in spec.containers.iter().enumerate() {
            self.check_container(&format!("spec.containers[{i}]"), container, spec, &mut errs);
        }
        errs
    }
}

fn volume_type(volume: &Volume) -> &'static str {
    if volume.config_map.is_some() {
        "configMap"
    } else if volume.secret.is_some() {
        "secret"
    } else if volume.empty_dir.is_some() {
        "emptyDir"
    } else if volume.host_path.is_some() {
        "hostPath"
    } else if volume.persistent_volume_claim.is_some() {
        "persistentVolumeClaim"
    } else if volume.projected.is_some() {
        "projected"
    } else if volume.downward_api.is_some() {
        "downwardAPI"
    } else if volume.nfs.is_some() {
        "nfs"
    } else if volume.csi.is_some() {
        "csi"
    } else if volume.ephemeral.is_some() {
        "ephemeral"
    } else {
        "unknown"
    }
}
