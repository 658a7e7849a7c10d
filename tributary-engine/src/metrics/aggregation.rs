use std::collections::HashMap;
use std::time::SystemTime;

use crate::models::{AttributeKey, Attributes, Gauge, Metric, Number, Point, Sum, Temporality};

/// How an instrument's measurements are folded into a stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Aggregator {
    /// Measurements are increments (synchronous counters).
    DeltaSum,
    /// Measurements are running totals (observable counters).
    CumulativeSum,
    LastValue,
}

impl Aggregator {
    fn input_temporality(self) -> Option<Temporality> {
        match self {
            Aggregator::DeltaSum => Some(Temporality::Delta),
            Aggregator::CumulativeSum => Some(Temporality::Cumulative),
            Aggregator::LastValue => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StreamDescriptor {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) unit: String,
    pub(crate) aggregator: Aggregator,
}

/// Converts a sum value between temporalities given the last cumulative value
/// this reader reported. Returns the value to report and the new cumulative
/// state.
pub(crate) fn convert(
    input: Temporality,
    output: Temporality,
    value: Number,
    previous: Option<Number>,
) -> (Number, Option<Number>) {
    match (input, output) {
        (Temporality::Delta, Temporality::Delta) => (value, previous),
        (Temporality::Cumulative, Temporality::Cumulative) => (value, Some(value)),
        (Temporality::Cumulative, Temporality::Delta) => {
            let delta = match previous {
                Some(previous) => value - previous,
                None => value,
            };
            (delta, Some(value))
        }
        (Temporality::Delta, Temporality::Cumulative) => {
            let total = match previous {
                Some(previous) => previous + value,
                None => value,
            };
            (total, Some(total))
        }
    }
}

#[derive(Debug)]
struct Stream {
    attributes: Attributes,
    value: Number,
    updated: bool,
    previous: Option<Number>,
    start_time: SystemTime,
}

/// One reader's view of every instrument: its own running values, so that
/// collecting for one reader never disturbs another.
#[derive(Debug)]
pub(crate) struct Aggregation {
    temporality: Temporality,
    streams: HashMap<usize, HashMap<AttributeKey, Stream>>,
    last_collect: SystemTime,
}

impl Aggregation {
    pub(crate) fn new(temporality: Temporality) -> Aggregation {
        Aggregation {
            temporality,
            streams: HashMap::new(),
            last_collect: SystemTime::now(),
        }
    }

    pub(crate) fn temporality(&self) -> Temporality {
        self.temporality
    }

    /// Adds an increment from a synchronous counter.
    pub(crate) fn add(&mut self, instrument: usize, attributes: &Attributes, value: Number) {
        let stream = self.stream(instrument, attributes);
        stream.value = stream.value + value;
        stream.updated = true;
    }

    /// Replaces the value with an observation from a callback.
    pub(crate) fn observe(&mut self, instrument: usize, attributes: &Attributes, value: Number) {
        let stream = self.stream(instrument, attributes);
        stream.value = value;
        stream.updated = true;
    }

    fn stream(&mut self, instrument: usize, attributes: &Attributes) -> &mut Stream {
        self.streams
            .entry(instrument)
            .or_default()
            .entry(AttributeKey(attributes.clone()))
            .or_insert_with(|| Stream {
                attributes: attributes.clone(),
                value: Number::I64(0),
                updated: false,
                previous: None,
                start_time: SystemTime::now(),
            })
    }

    /// Produces the points for this collection cycle. `descriptors` is
    /// indexed by instrument id.
    pub(crate) fn collect(&mut self, descriptors: &[StreamDescriptor]) -> Vec<Metric> {
        let now = SystemTime::now();
        let output = self.temporality;
        let mut metrics = Vec::new();

        for (instrument, streams) in &mut self.streams {
            let Some(descriptor) = descriptors.get(*instrument) else {
                continue;
            };

            for stream in streams.values_mut() {
                let point = match descriptor.aggregator.input_temporality() {
                    None => stream.updated.then(|| {
                        Point::Gauge(Gauge {
                            time: now,
                            value: stream.value,
                        })
                    }),
                    Some(input) => {
                        // a cumulative reader keeps reporting a counter's
                        // total even without new increments
                        let report = stream.updated
                            || (input == Temporality::Delta && output == Temporality::Cumulative);

                        report.then(|| {
                            let (value, previous) =
                                convert(input, output, stream.value, stream.previous);
                            stream.previous = previous;

                            let start_time = match output {
                                Temporality::Cumulative => stream.start_time,
                                Temporality::Delta => stream.start_time.max(self.last_collect),
                            };

                            Point::Sum(Sum {
                                temporality: output,
                                is_monotonic: true,
                                start_time,
                                time: now,
                                value,
                            })
                        })
                    }
                };

                if descriptor.aggregator == Aggregator::DeltaSum {
                    stream.value = Number::I64(0);
                }
                stream.updated = false;

                if let Some(point) = point {
                    metrics.push(Metric {
                        name: descriptor.name.clone(),
                        description: descriptor.description.clone(),
                        unit: descriptor.unit.clone(),
                        attributes: stream.attributes.clone(),
                        point,
                    });
                }
            }
        }

        self.last_collect = now;
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Value;

    fn descriptor(aggregator: Aggregator) -> StreamDescriptor {
        StreamDescriptor {
            name: "stream".to_owned(),
            description: String::new(),
            unit: String::new(),
            aggregator,
        }
    }

    #[test]
    fn temporality_conversion() {
        use Temporality::{Cumulative, Delta};

        let n = Number::I64;

        assert_eq!(convert(Delta, Delta, n(4), None), (n(4), None));
        assert_eq!(convert(Cumulative, Cumulative, n(9), Some(n(4))), (n(9), Some(n(9))));
        assert_eq!(convert(Cumulative, Delta, n(9), Some(n(4))), (n(5), Some(n(9))));
        assert_eq!(convert(Cumulative, Delta, n(9), None), (n(9), Some(n(9))));
        assert_eq!(convert(Delta, Cumulative, n(3), Some(n(4))), (n(7), Some(n(7))));
    }

    #[test]
    fn delta_sum_resets_between_collections() {
        let descriptors = [descriptor(Aggregator::DeltaSum)];
        let attributes = Attributes::new();
        let mut aggregation = Aggregation::new(Temporality::Delta);

        aggregation.add(0, &attributes, Number::I64(3));
        aggregation.add(0, &attributes, Number::I64(4));

        let metrics = aggregation.collect(&descriptors);
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].point.value(), Number::I64(7));

        assert!(aggregation.collect(&descriptors).is_empty());
    }

    #[test]
    fn cumulative_reader_keeps_reporting_totals() {
        let descriptors = [descriptor(Aggregator::DeltaSum)];
        let attributes = Attributes::new();
        let mut aggregation = Aggregation::new(Temporality::Cumulative);

        aggregation.add(0, &attributes, Number::I64(3));
        assert_eq!(aggregation.collect(&descriptors)[0].point.value(), Number::I64(3));

        aggregation.add(0, &attributes, Number::I64(4));
        assert_eq!(aggregation.collect(&descriptors)[0].point.value(), Number::I64(7));

        assert_eq!(aggregation.collect(&descriptors)[0].point.value(), Number::I64(7));
    }

    #[test]
    fn gauges_are_never_converted() {
        let descriptors = [descriptor(Aggregator::LastValue)];
        let attributes = Attributes::new();
        let mut aggregation = Aggregation::new(Temporality::Delta);

        aggregation.observe(0, &attributes, Number::F64(21.5));
        aggregation.observe(0, &attributes, Number::F64(22.0));

        let metrics = aggregation.collect(&descriptors);
        assert!(matches!(
            metrics[0].point,
            Point::Gauge(Gauge { value: Number::F64(v), .. }) if v == 22.0
        ));
    }

    #[test]
    fn attribute_sets_are_separate_streams() {
        let descriptors = [descriptor(Aggregator::DeltaSum)];
        let get = Attributes::from_iter([("method".to_owned(), Value::from("GET"))]);
        let put = Attributes::from_iter([("method".to_owned(), Value::from("PUT"))]);
        let mut aggregation = Aggregation::new(Temporality::Delta);

        aggregation.add(0, &get, Number::I64(1));
        aggregation.add(0, &put, Number::I64(2));
        aggregation.add(0, &get, Number::I64(1));

        let mut values: Vec<_> = aggregation
            .collect(&descriptors)
            .into_iter()
            .map(|metric| (metric.attributes["method"].to_string(), metric.point.value()))
            .collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(
            values,
            vec![
                ("GET".to_owned(), Number::I64(2)),
                ("PUT".to_owned(), Number::I64(2))
            ]
        );
    }
}
