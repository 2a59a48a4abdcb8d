// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Service environment handed to every fiber a runtime starts.
//!
//! A `Context` is an immutable map from service type to instance. Adding a
//! service produces a new context; existing holders keep their snapshot.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type Service = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Default)]
pub struct Context {
    services: Arc<HashMap<TypeId, (&'static str, Service)>>,
}

impl Context {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A copy of this context with `service` added, replacing any existing
    /// service of the same type.
    pub fn add<T: Send + Sync + 'static>(&self, service: T) -> Context {
        let mut services = (*self.services).clone();
        services.insert(
            TypeId::of::<T>(),
            (std::any::type_name::<T>(), Arc::new(service)),
        );
        Context {
            services: Arc::new(services),
        }
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let (_, service) = self.services.get(&TypeId::of::<T>())?;
        service.clone().downcast::<T>().ok()
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<T>())
    }

    /// Merge `that` over `self`; services in `that` win.
    pub fn merge(&self, that: &Context) -> Context {
        let mut services = (*self.services).clone();
        services.extend(that.services.iter().map(|(k, v)| (*k, v.clone())));
        Context {
            services: Arc::new(services),
        }
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

// Identity, not structure: two contexts are equal when they share storage.
impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.services, &other.services)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.services.values().map(|(name, _)| *name).collect();
        names.sort_unstable();
        f.debug_struct("Context").field("services", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Port(u16);

    #[derive(Debug, PartialEq)]
    struct Name(&'static str);

    #[test]
    fn add_and_get() {
        let ctx = Context::empty().add(Port(8080)).add(Name("svc"));
        assert_eq!(*ctx.get::<Port>().unwrap(), Port(8080));
        assert_eq!(*ctx.get::<Name>().unwrap(), Name("svc"));
        assert!(ctx.get::<u64>().is_none());
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn add_leaves_original_untouched() {
        let base = Context::empty().add(Port(1));
        let next = base.add(Port(2));
        assert_eq!(*base.get::<Port>().unwrap(), Port(1));
        assert_eq!(*next.get::<Port>().unwrap(), Port(2));
        assert_ne!(base, next);
        assert_eq!(base, base.clone());
    }

    #[test]
    fn merge_prefers_right() {
        let left = Context::empty().add(Port(1)).add(Name("left"));
        let right = Context::empty().add(Port(2));
        let merged = left.merge(&right);
        assert_eq!(*merged.get::<Port>().unwrap(), Port(2));
        assert_eq!(*merged.get::<Name>().unwrap(), Name("left"));
    }
}
