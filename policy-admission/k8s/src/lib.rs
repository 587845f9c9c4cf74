#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod client;
mod object;

pub use self::client::{
    denial_event, ClusterClient, KubeClusterClient, DENIED_REASON, RESOURCE_TIMEOUT,
};
pub use self::object::AdmitObject;

pub use k8s_openapi::api::{
    core::v1::{
        Capabilities, Container, Event, EventSource, Namespace, ObjectReference, Pod,
        PodSecurityContext, PodSpec, SecurityContext, Service, ServiceSpec, Toleration, Volume,
    },
    networking::v1::{Ingress, IngressRule, IngressSpec, IngressTLS},
};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
pub use kube::{
    api::{Api, ObjectMeta, PostParams, Resource, ResourceExt},
    core::{admission, DynamicObject},
    Client,
};
