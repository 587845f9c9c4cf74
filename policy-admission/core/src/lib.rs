#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cache;
mod violation;

pub use self::cache::ResourceCache;
pub use self::violation::{join_details, ErrorKind, Violation};

use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// The object kinds the admission pipeline knows how to decode. Reviews
/// for anything else are rejected before any authorizer runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
pub enum ObjectKind {
    Pod,
    Namespace,
    Ingress,
    Service,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unsupported object kind: {0}")]
pub struct UnsupportedKind(pub String);

impl std::str::FromStr for ObjectKind {
    type Err = UnsupportedKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pod" => Ok(Self::Pod),
            "Namespace" => Ok(Self::Namespace),
            "Ingress" => Ok(Self::Ingress),
            "Service" => Ok(Self::Service),
            kind => Err(UnsupportedKind(kind.to_string())),
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pod => "Pod".fmt(f),
            Self::Namespace => "Namespace".fmt(f),
            Self::Ingress => "Ingress".fmt(f),
            Self::Service => "Service".fmt(f),
        }
    }
}

/// Declares which reviews an authorizer wants to see.
#[derive(Clone, Debug)]
pub struct Filter {
    /// The single object kind this authorizer evaluates.
    pub kind: ObjectKind,

    /// Namespaces whose objects bypass this authorizer entirely.
    pub ignore_namespaces: Vec<String>,

    /// When set, a verdict consisting solely of `Internal` violations is
    /// discarded and the review proceeds as if accepted.
    pub ignore_on_failure: bool,
}

impl Filter {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            ignore_namespaces: Vec::new(),
            ignore_on_failure: false,
        }
    }

    pub fn ignores(&self, namespace: &str) -> bool {
        self.ignore_namespaces.iter().any(|ns| ns == namespace)
    }
}
