use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct AgentMetrics {
    cycles: Family<CycleLabels, Counter>,
    rules: Gauge,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct CycleLabels {
    outcome: &'static str,
}

/// How a poll cycle ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Enforced,
    Unchanged,
    PollError,
    EnforceError,
}

// === impl AgentMetrics ===

impl AgentMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let cycles = Family::<CycleLabels, Counter>::default();
        reg.register(
            "cycles",
            "Total number of poll cycles by outcome",
            cycles.clone(),
        );
        let rules = Gauge::default();
        reg.register(
            "rules",
            "Number of rules in the attached policy chain",
            rules.clone(),
        );
        Self { cycles, rules }
    }

    pub(crate) fn cycle(&self, outcome: Outcome) {
        self.cycles
            .get_or_create(&CycleLabels {
                outcome: outcome.as_str(),
            })
            .inc();
    }

    pub(crate) fn enforced(&self, rules: usize) {
        self.rules.set(i64::try_from(rules).unwrap_or(i64::MAX));
    }

    #[cfg(test)]
    #[allow(dead_code)]
    pub(crate) fn cycles(&self, outcome: Outcome) -> u64 {
        self.cycles
            .get_or_create(&CycleLabels {
                outcome: outcome.as_str(),
            })
            .get()
    }
}

// === impl Outcome ===

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Enforced => "enforced",
            Self::Unchanged => "unchanged",
            Self::PollError => "poll_error",
            Self::EnforceError => "enforce_error",
        }
    }
}
