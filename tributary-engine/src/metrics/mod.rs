//! A small measurement source: instruments record into a `Meter`, and every
//! reader registered on the meter keeps its own aggregation of them.

mod aggregation;
mod view;

use std::fmt::{Debug, Error as FmtError, Formatter};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::models::{Attributes, Metric, Number, Temporality};
use crate::reader::Collect;
use crate::worker::lock;

use aggregation::{Aggregation, Aggregator, StreamDescriptor};

pub use view::View;

type Callback = Box<dyn Fn(&mut Observer) + Send + Sync>;

struct Instrument {
    descriptor: StreamDescriptor,
    callback: Option<Callback>,
}

struct MeterInner {
    views: Vec<View>,
    instruments: RwLock<Vec<Arc<Instrument>>>,
    readers: RwLock<Vec<Arc<Mutex<Aggregation>>>>,
}

impl MeterInner {
    fn instruments(&self) -> RwLockReadGuard<'_, Vec<Arc<Instrument>>> {
        self.instruments.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn readers(&self) -> RwLockReadGuard<'_, Vec<Arc<Mutex<Aggregation>>>> {
        self.readers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn readers_mut(&self) -> RwLockWriteGuard<'_, Vec<Arc<Mutex<Aggregation>>>> {
        self.readers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(
        &self,
        name: String,
        description: String,
        unit: String,
        aggregator: Aggregator,
        callback: Option<Callback>,
    ) -> usize {
        let (name, description) = match self.views.iter().find(|view| view.matches(&name)) {
            Some(view) => view.apply(&name, &description),
            None => (name, description),
        };

        let mut instruments = self.instruments.write().unwrap_or_else(PoisonError::into_inner);
        instruments.push(Arc::new(Instrument {
            descriptor: StreamDescriptor {
                name,
                description,
                unit,
                aggregator,
            },
            callback,
        }));

        instruments.len() - 1
    }
}

/// Creates instruments and hands out reader handles.
///
/// Clones share the same instruments and readers.
#[derive(Clone)]
pub struct Meter {
    inner: Arc<MeterInner>,
}

impl Default for Meter {
    fn default() -> Meter {
        Meter::new()
    }
}

impl Debug for Meter {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Meter")
            .field("views", &self.inner.views)
            .field("instruments", &self.inner.instruments().len())
            .field("readers", &self.inner.readers().len())
            .finish()
    }
}

impl Meter {
    pub fn new() -> Meter {
        Meter::builder().build()
    }

    pub fn builder() -> MeterBuilder {
        MeterBuilder { views: Vec::new() }
    }

    /// Registers a new reader. Measurements recorded from now on are
    /// aggregated separately for it, reported with the given temporality.
    pub fn register_reader(&self, temporality: Temporality) -> ReaderHandle {
        let aggregation = Arc::new(Mutex::new(Aggregation::new(temporality)));
        self.inner.readers_mut().push(aggregation.clone());

        ReaderHandle {
            meter: self.inner.clone(),
            aggregation,
        }
    }

    /// A monotonic counter whose `add` calls are increments.
    pub fn counter(&self, name: impl Into<String>) -> InstrumentBuilder<'_, Counter> {
        InstrumentBuilder::new(self, name.into(), Aggregator::DeltaSum, None)
    }

    /// A monotonic counter whose callback reports the running total.
    pub fn observable_counter(
        &self,
        name: impl Into<String>,
        callback: impl Fn(&mut Observer) + Send + Sync + 'static,
    ) -> InstrumentBuilder<'_, ObservableCounter> {
        InstrumentBuilder::new(
            self,
            name.into(),
            Aggregator::CumulativeSum,
            Some(Box::new(callback)),
        )
    }

    /// A gauge whose callback reports the current value.
    pub fn observable_gauge(
        &self,
        name: impl Into<String>,
        callback: impl Fn(&mut Observer) + Send + Sync + 'static,
    ) -> InstrumentBuilder<'_, ObservableGauge> {
        InstrumentBuilder::new(
            self,
            name.into(),
            Aggregator::LastValue,
            Some(Box::new(callback)),
        )
    }
}

pub struct MeterBuilder {
    views: Vec<View>,
}

impl MeterBuilder {
    pub fn with_view(mut self, view: View) -> MeterBuilder {
        self.views.push(view);
        self
    }

    pub fn build(self) -> Meter {
        Meter {
            inner: Arc::new(MeterInner {
                views: self.views,
                instruments: RwLock::new(Vec::new()),
                readers: RwLock::new(Vec::new()),
            }),
        }
    }
}

pub struct InstrumentBuilder<'a, T> {
    meter: &'a Meter,
    name: String,
    description: String,
    unit: String,
    aggregator: Aggregator,
    callback: Option<Callback>,
    _kind: PhantomData<fn() -> T>,
}

impl<'a, T> InstrumentBuilder<'a, T> {
    fn new(
        meter: &'a Meter,
        name: String,
        aggregator: Aggregator,
        callback: Option<Callback>,
    ) -> InstrumentBuilder<'a, T> {
        InstrumentBuilder {
            meter,
            name,
            description: String::new(),
            unit: String::new(),
            aggregator,
            callback,
            _kind: PhantomData,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> InstrumentBuilder<'a, T> {
        self.description = description.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> InstrumentBuilder<'a, T> {
        self.unit = unit.into();
        self
    }

    fn register(self) -> (Arc<MeterInner>, usize, String) {
        let name = self.name.clone();
        let id = self.meter.inner.register(
            self.name,
            self.description,
            self.unit,
            self.aggregator,
            self.callback,
        );

        (self.meter.inner.clone(), id, name)
    }
}

impl InstrumentBuilder<'_, Counter> {
    pub fn build(self) -> Counter {
        let (meter, id, _) = self.register();
        Counter { meter, id }
    }
}

impl InstrumentBuilder<'_, ObservableCounter> {
    pub fn build(self) -> ObservableCounter {
        let (_, _, name) = self.register();
        ObservableCounter { name }
    }
}

impl InstrumentBuilder<'_, ObservableGauge> {
    pub fn build(self) -> ObservableGauge {
        let (_, _, name) = self.register();
        ObservableGauge { name }
    }
}

#[derive(Clone)]
pub struct Counter {
    meter: Arc<MeterInner>,
    id: usize,
}

impl Debug for Counter {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Counter").field("id", &self.id).finish()
    }
}

impl Counter {
    /// Records an increment for every registered reader. Negative values are
    /// ignored since the counter is monotonic.
    pub fn add(&self, value: impl Into<Number>, attributes: &Attributes) {
        let value = value.into();
        if value.as_f64() < 0.0 {
            tracing::warn!("ignoring negative increment {value:?} on a monotonic counter");
            return;
        }

        for reader in self.meter.readers().iter() {
            lock(reader).add(self.id, attributes, value);
        }
    }
}

/// Handle to a registered observable counter. Its callback runs whenever a
/// reader collects.
#[derive(Debug, Clone)]
pub struct ObservableCounter {
    name: String,
}

impl ObservableCounter {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Handle to a registered observable gauge.
#[derive(Debug, Clone)]
pub struct ObservableGauge {
    name: String,
}

impl ObservableGauge {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Passed to observable instrument callbacks to report values.
#[derive(Debug, Default)]
pub struct Observer {
    observations: Vec<(Number, Attributes)>,
}

impl Observer {
    pub fn observe(&mut self, value: impl Into<Number>, attributes: &Attributes) {
        self.observations.push((value.into(), attributes.clone()));
    }
}

/// One reader's access to a `Meter`. Collecting runs the observable callbacks
/// and reports this reader's aggregation only.
pub struct ReaderHandle {
    meter: Arc<MeterInner>,
    aggregation: Arc<Mutex<Aggregation>>,
}

impl Debug for ReaderHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("ReaderHandle")
            .field("temporality", &lock(&self.aggregation).temporality())
            .finish()
    }
}

impl ReaderHandle {
    pub fn temporality(&self) -> Temporality {
        lock(&self.aggregation).temporality()
    }
}

// a dropped reader stops receiving measurements
impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.meter
            .readers_mut()
            .retain(|reader| !Arc::ptr_eq(reader, &self.aggregation));
    }
}

impl Collect for ReaderHandle {
    fn collect(&self) -> Vec<Metric> {
        let instruments = self.meter.instruments().clone();

        // callbacks run without holding the aggregation lock, since they may
        // record to synchronous instruments themselves
        let mut observed = Vec::new();
        for (id, instrument) in instruments.iter().enumerate() {
            if let Some(callback) = &instrument.callback {
                let mut observer = Observer::default();
                callback(&mut observer);
                observed.push((id, observer.observations));
            }
        }

        let descriptors: Vec<StreamDescriptor> = instruments
            .iter()
            .map(|instrument| instrument.descriptor.clone())
            .collect();

        let mut aggregation = lock(&self.aggregation);
        for (id, observations) in observed {
            for (value, attributes) in observations {
                aggregation.observe(id, &attributes, value);
            }
        }

        aggregation.collect(&descriptors)
    }
}
