use crate::Store;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(Store);

pub fn register(reg: &mut Registry, store: Store) {
    reg.register_collector(Box::new(Instrumented(store)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let stats = match self.0.stats() {
            Ok(stats) => stats,
            Err(error) => {
                tracing::warn!(%error, "Failed to read store statistics");
                return Ok(());
            }
        };
        let max_tag = self.0.tag_width().max_tag();

        let policies = encoder.encode_descriptor(
            "policies",
            "The number of policies in the store",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(stats.policies as i64).encode(policies)?;

        let groups = encoder.encode_descriptor(
            "groups",
            "The number of groups holding a tag",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(stats.groups as i64).encode(groups)?;

        let utilization = encoder.encode_descriptor(
            "tag_utilization",
            "The fraction of the tag space that is allocated",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(stats.groups as f64 / f64::from(max_tag)).encode(utilization)?;

        Ok(())
    }
}
