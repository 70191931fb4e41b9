use chrono::{DateTime, Duration, Utc};

use crate::types::{BoilerReading, DesiredState, Source};

#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue<T> {
    pub value: T,
    pub last_updated: DateTime<Utc>,
    pub source: Source,
}

impl<T> CachedValue<T> {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_updated)
    }

    /// Usable for control decisions: no older than `threshold`.
    pub fn is_fresh(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.age(now) <= threshold
    }
}

/// A value type that lives in exactly one cache slot.
pub trait Cached: Sized {
    const SOURCE: Source;

    fn slot(cache: &StateCache) -> &Option<CachedValue<Self>>;
    fn slot_mut(cache: &mut StateCache) -> &mut Option<CachedValue<Self>>;
}

impl Cached for BoilerReading {
    const SOURCE: Source = Source::Telemetry;

    fn slot(cache: &StateCache) -> &Option<CachedValue<Self>> {
        &cache.telemetry
    }

    fn slot_mut(cache: &mut StateCache) -> &mut Option<CachedValue<Self>> {
        &mut cache.telemetry
    }
}

impl Cached for DesiredState {
    const SOURCE: Source = Source::Hub;

    fn slot(cache: &StateCache) -> &Option<CachedValue<Self>> {
        &cache.hub
    }

    fn slot_mut(cache: &mut StateCache) -> &mut Option<CachedValue<Self>> {
        &mut cache.hub
    }
}

/// Last-known-good value per source.
#[derive(Debug, Clone, Default)]
pub struct StateCache {
    telemetry: Option<CachedValue<BoilerReading>>,
    hub: Option<CachedValue<DesiredState>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the slot for `T` unless the cached sample is newer.
    /// Returns false when `value` was dropped as out of order.
    pub fn put<T: Cached>(&mut self, value: T, at: DateTime<Utc>) -> bool {
        let slot = T::slot_mut(self);
        if slot.as_ref().is_some_and(|existing| existing.last_updated > at) {
            return false;
        }
        *slot = Some(CachedValue {
            value,
            last_updated: at,
            source: T::SOURCE,
        });
        true
    }

    pub fn get<T: Cached>(&self) -> Option<&CachedValue<T>> {
        T::slot(self).as_ref()
    }

    /// The cached value if it is still within `threshold`, else `None`
    /// (unknown).
    pub fn fresh<T: Cached>(&self, now: DateTime<Utc>, threshold: Duration) -> Option<&T> {
        self.get::<T>()
            .filter(|cached| cached.is_fresh(now, threshold))
            .map(|cached| &cached.value)
    }
}
