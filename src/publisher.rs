use crate::bus::{paths, AttributeSet, AttributeValue, BusError, BusHandle, DeviceBus, ServiceSchema};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("the service is not registered on the bus")]
    NotRegistered,
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Owns the bus registration and the last value written to every path.
///
/// Only paths whose value differs from the last published one are sent, and
/// `/UpdateIndex` moves on only when something was sent.
pub struct Publisher<B: DeviceBus> {
    bus: B,
    schema: ServiceSchema,
    handle: Option<BusHandle>,
    published: AttributeSet,
}

impl<B: DeviceBus> Publisher<B> {
    pub fn new(bus: B, schema: ServiceSchema) -> Self {
        let published = schema.paths.clone();
        Self {
            bus,
            schema,
            handle: None,
            published,
        }
    }

    /// Registers the service and replays the full published tree, so a
    /// re-registration after a lost attachment shows the last known values.
    pub fn register(&mut self) -> Result<&BusHandle, BusError> {
        self.handle = None;
        let handle = self.bus.register(&self.schema)?;
        self.bus.publish(&handle, &self.published)?;
        info!(
            service = handle.service_name(),
            generation = handle.generation(),
            paths = self.published.len(),
            "Registered on bus"
        );
        Ok(self.handle.insert(handle))
    }

    /// True while a handle exists and the bus still reports it attached.
    pub fn is_registered(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| self.bus.is_attached(handle))
    }

    /// Publishes the values that changed. Returns how many paths changed,
    /// not counting `/UpdateIndex`.
    pub fn publish(&mut self, values: &AttributeSet) -> Result<usize, PublishError> {
        let handle = match &self.handle {
            Some(handle) if self.bus.is_attached(handle) => handle,
            _ => return Err(PublishError::NotRegistered),
        };

        if let Some(path) = values.keys().find(|path| !self.schema.declares(path)) {
            return Err(BusError::UndeclaredPath(path.clone()).into());
        }

        let mut delta: AttributeSet = values
            .iter()
            .filter(|(path, value)| self.published.get(*path) != Some(*value))
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect();
        let changed = delta.len();
        if changed == 0 {
            return Ok(0);
        }

        let index = match self.published.get(paths::UPDATE_INDEX) {
            Some(AttributeValue::Int(index)) => (index + 1) % 256,
            _ => 0,
        };
        delta.insert(paths::UPDATE_INDEX.to_string(), AttributeValue::Int(index));

        self.bus.publish(handle, &delta)?;
        debug!(changed, update_index = index, "Published");
        self.published.extend(delta);
        Ok(changed)
    }

    /// Last value written for `path`, or its declared value before that.
    pub fn value(&self, path: &str) -> Option<&AttributeValue> {
        self.published.get(path)
    }

    pub fn published(&self) -> &AttributeSet {
        &self.published
    }

    pub fn handle(&self) -> Option<&BusHandle> {
        self.handle.as_ref()
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }
}
