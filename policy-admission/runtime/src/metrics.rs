use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::{
    metrics::{counter::Counter, family::Family},
    registry::{Registry, Unit},
};

pub(crate) const ACTION_ACCEPT: &str = "accept";
pub(crate) const ACTION_DENY: &str = "deny";

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ActionLabels {
    action: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct AuthorizerActionLabels {
    authorizer: String,
    action: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct AuthorizerLabels {
    authorizer: String,
}

/// Counters and histograms for the admission pipeline, exposed through
/// the admin server's Prometheus endpoint.
#[derive(Clone, Debug)]
pub struct Metrics {
    total: Family<ActionLabels, Counter>,
    errors: Counter,
    authorizer_action: Family<AuthorizerActionLabels, Counter>,
    authorizer_latency: Family<AuthorizerLabels, Histogram>,
}

impl Metrics {
    pub fn register(reg: &mut Registry) -> Self {
        let total = Family::<ActionLabels, Counter>::default();
        reg.register(
            "admission",
            "Total number of reviews processed by the admission pipeline",
            total.clone(),
        );

        let errors = Counter::default();
        reg.register(
            "admission_errors",
            "Total number of reviews the pipeline could not evaluate",
            errors.clone(),
        );

        let authorizer_action = Family::<AuthorizerActionLabels, Counter>::default();
        reg.register(
            "admission_authorizer_action",
            "Total number of verdicts returned, by authorizer",
            authorizer_action.clone(),
        );

        let authorizer_latency = Family::<AuthorizerLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5])
        });
        reg.register_with_unit(
            "admission_authorizer_latency",
            "Distribution of per-authorizer evaluation latency",
            Unit::Seconds,
            authorizer_latency.clone(),
        );

        Self {
            total,
            errors,
            authorizer_action,
            authorizer_latency,
        }
    }

    pub(crate) fn inc_total(&self, action: &'static str) {
        self.total.get_or_create(&ActionLabels { action }).inc();
    }

    pub(crate) fn inc_error(&self) {
        self.errors.inc();
    }

    pub(crate) fn inc_authorizer(&self, authorizer: &str, action: &'static str) {
        self.authorizer_action
            .get_or_create(&AuthorizerActionLabels {
                authorizer: authorizer.to_string(),
                action,
            })
            .inc();
    }

    pub(crate) fn observe_latency(&self, authorizer: &str, seconds: f64) {
        self.authorizer_latency
            .get_or_create(&AuthorizerLabels {
                authorizer: authorizer.to_string(),
            })
            .observe(seconds);
    }

    #[cfg(test)]
    pub(crate) fn total_count(&self, action: &'static str) -> u64 {
        self.total.get_or_create(&ActionLabels { action }).get()
    }

    #[cfg(test)]
    pub(crate) fn error_count(&self) -> u64 {
        self.errors.get()
    }

    #[cfg(test)]
    pub(crate) fn authorizer_count(&self, authorizer: &str, action: &'static str) -> u64 {
        self.authorizer_action
            .get_or_create(&AuthorizerActionLabels {
                authorizer: authorizer.to_string(),
                action,
            })
            .get()
    }
}
