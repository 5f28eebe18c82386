//! Process-wide component registry.
//!
//! Maps `(kind, name)` to an implementation. Interface conformance is checked by
//! the type system: a [`Component`] variant can only hold an implementation of
//! the matching trait, and `register` rejects a variant filed under the wrong
//! kind. Reads and writes are sharded through `DashMap` and never go through a
//! run's controller.

use crate::engine::middleware::Middleware;
use crate::errors::RegistryError;
use crate::metrics_api::Metric;
use crate::plugins::{Broadcaster, Processor, Reporter, Store};
use dashmap::DashMap;
use lazy_static::lazy_static;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

lazy_static! {
    static ref GLOBAL: Arc<ComponentRegistry> = Arc::new(ComponentRegistry::new());
}

/// The process-wide registry.
pub fn global() -> Arc<ComponentRegistry> {
    GLOBAL.clone()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComponentKind {
    Reporter,
    Store,
    Broadcaster,
    Processor,
    Middleware,
    Metric,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 6] = [
        Self::Reporter,
        Self::Store,
        Self::Broadcaster,
        Self::Processor,
        Self::Middleware,
        Self::Metric,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reporter => "reporter",
            Self::Store => "store",
            Self::Broadcaster => "broadcaster",
            Self::Processor => "processor",
            Self::Middleware => "middleware",
            Self::Metric => "metric",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| RegistryError::UnknownKind { kind: s.to_string() })
    }
}

#[derive(Clone)]
pub enum Component {
    Reporter(Arc<dyn Reporter>),
    Store(Arc<dyn Store>),
    Broadcaster(Arc<dyn Broadcaster>),
    Processor(Arc<dyn Processor>),
    Middleware(Arc<dyn Middleware>),
    Metric(Arc<dyn Metric>),
}

impl Component {
    pub fn kind(&self) -> ComponentKind {
        match self {
            Self::Reporter(_) => ComponentKind::Reporter,
            Self::Store(_) => ComponentKind::Store,
            Self::Broadcaster(_) => ComponentKind::Broadcaster,
            Self::Processor(_) => ComponentKind::Processor,
            Self::Middleware(_) => ComponentKind::Middleware,
            Self::Metric(_) => ComponentKind::Metric,
        }
    }

    /// The implementation's own name.
    pub fn name(&self) -> &str {
        match self {
            Self::Reporter(c) => c.name(),
            Self::Store(c) => c.name(),
            Self::Broadcaster(c) => c.name(),
            Self::Processor(c) => c.name(),
            Self::Middleware(c) => c.name(),
            Self::Metric(c) => c.name(),
        }
    }

    fn same_impl(&self, other: &Component) -> bool {
        fn addr<T: ?Sized>(a: &Arc<T>) -> *const u8 {
            Arc::as_ptr(a) as *const u8
        }
        let ptr = |c: &Component| match c {
            Self::Reporter(a) => addr(a),
            Self::Store(a) => addr(a),
            Self::Broadcaster(a) => addr(a),
            Self::Processor(a) => addr(a),
            Self::Middleware(a) => addr(a),
            Self::Metric(a) => addr(a),
        };
        self.kind() == other.kind() && std::ptr::eq(ptr(self), ptr(other))
    }

    pub fn into_metric(self) -> Option<Arc<dyn Metric>> {
        match self {
            Self::Metric(m) => Some(m),
            _ => None,
        }
    }

    pub fn into_reporter(self) -> Option<Arc<dyn Reporter>> {
        match self {
            Self::Reporter(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_store(self) -> Option<Arc<dyn Store>> {
        match self {
            Self::Store(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_broadcaster(self) -> Option<Arc<dyn Broadcaster>> {
        match self {
            Self::Broadcaster(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_processor(self) -> Option<Arc<dyn Processor>> {
        match self {
            Self::Processor(p) => Some(p),
            _ => None,
        }
    }

    pub fn into_middleware(self) -> Option<Arc<dyn Middleware>> {
        match self {
            Self::Middleware(m) => Some(m),
            _ => None,
        }
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.name())
    }
}

#[derive(Default)]
pub struct ComponentRegistry {
    entries: DashMap<(ComponentKind, String), Component>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the component's own name.
    pub fn register(&self, kind: ComponentKind, component: Component) -> Result<(), RegistryError> {
        self.check(kind, &component)?;
        let name = component.name().to_string();
        self.insert(kind, name, component);
        Ok(())
    }

    /// Register under the component's own name and additionally under `alias`.
    pub fn register_as(
        &self,
        kind: ComponentKind,
        alias: &str,
        component: Component,
    ) -> Result<(), RegistryError> {
        self.check(kind, &component)?;
        if alias.trim().is_empty() {
            return Err(RegistryError::Load {
                name: component.name().to_string(),
                reason: "alias must not be empty".into(),
            });
        }
        let name = component.name().to_string();
        self.insert(kind, name, component.clone());
        self.insert(kind, alias.to_string(), component);
        Ok(())
    }

    /// Register by kind name, e.g. from configuration. Unknown kinds are rejected.
    pub fn register_kind(&self, kind: &str, component: Component) -> Result<(), RegistryError> {
        self.register(kind.parse()?, component)
    }

    pub fn lookup(&self, kind: ComponentKind, name: &str) -> Result<Component, RegistryError> {
        self.entries
            .get(&(kind, name.to_string()))
            .map(|e| e.value().clone())
            .ok_or_else(|| RegistryError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            })
    }

    pub fn metric(&self, name: &str) -> Result<Arc<dyn Metric>, RegistryError> {
        match self.lookup(ComponentKind::Metric, name)? {
            Component::Metric(metric) => Ok(metric),
            other => Err(RegistryError::MissingCapability {
                name: name.to_string(),
                expected: ComponentKind::Metric.to_string(),
                found: other.kind().to_string(),
            }),
        }
    }

    /// All distinct implementations registered for `kind`, ordered by name.
    /// An implementation registered under an alias appears once.
    pub fn list(&self, kind: ComponentKind) -> Vec<Component> {
        let mut found: Vec<(String, Component)> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == kind)
            .map(|e| (e.key().1.clone(), e.value().clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out: Vec<Component> = Vec::new();
        for (_, component) in found {
            if !out.iter().any(|c| c.same_impl(&component)) {
                out.push(component);
            }
        }
        out
    }

    /// Remove everything. Intended for test isolation.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check(&self, kind: ComponentKind, component: &Component) -> Result<(), RegistryError> {
        if component.kind() != kind {
            return Err(RegistryError::MissingCapability {
                name: component.name().to_string(),
                expected: kind.to_string(),
                found: component.kind().to_string(),
            });
        }
        if component.name().trim().is_empty() {
            return Err(RegistryError::Load {
                name: String::new(),
                reason: format!("{} has an empty name", kind),
            });
        }
        Ok(())
    }

    fn insert(&self, kind: ComponentKind, name: String, component: Component) {
        match self.entries.entry((kind, name)) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                if e.get().same_impl(&component) {
                    return;
                }
                tracing::debug!(kind = %kind, name = %e.key().1, "replacing registered component");
                e.insert(component);
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(component);
            }
        }
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}
