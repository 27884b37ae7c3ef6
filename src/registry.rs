//! Window property registry
//!
//! Associates a native window with the dispatch target that receives its
//! events. The association lives on the native side as a window property
//! holding an opaque token; the registry owns the targets keyed by token.
//! A window that has already been destroyed on the server side cannot be
//! bound, and looking up an unbound window simply yields nothing.

use crate::event::DispatchTarget;
use crate::handle::{Atom, WindowHandle};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, warn};

/// Property name used when the caller does not negotiate one
pub const DEFAULT_BINDING_PROPERTY: &str = "_NWD_DISPATCH_TARGET";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PropertyError {
    #[error("window {0} does not exist")]
    BadWindow(WindowHandle),

    #[error("property request failed: {0}")]
    Platform(String),
}

/// Per-window property storage provided by the window system
pub trait PropertyStore {
    fn set_property(&mut self, window: WindowHandle, name: Atom, value: u64) -> Result<(), PropertyError>;

    /// `Ok(None)` when the property is not set on the window
    fn get_property(&mut self, window: WindowHandle, name: Atom) -> Result<Option<u64>, PropertyError>;

    fn delete_property(&mut self, window: WindowHandle, name: Atom) -> Result<(), PropertyError>;
}

/// Window-handle to dispatch-target association
pub struct WindowRegistry<S: PropertyStore> {
    store: S,
    property: Atom,
    targets: HashMap<u64, Box<dyn DispatchTarget>>,
    // Mirror of the native property, so targets can be released after the
    // window itself is gone.
    tokens: HashMap<WindowHandle, u64>,
    next_token: u64,
}

impl<S: PropertyStore> WindowRegistry<S> {
    pub fn new(store: S, property: Atom) -> Self {
        Self {
            store,
            property,
            targets: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 1,
        }
    }

    /// Attach `target` to `window`, replacing any previous binding.
    ///
    /// Returns false (after logging) when the window no longer exists.
    pub fn bind(&mut self, window: WindowHandle, target: Box<dyn DispatchTarget>) -> bool {
        if window.is_none() {
            warn!("Refusing to bind a dispatch target to the null window");
            return false;
        }

        let token = self.next_token;
        match self.store.set_property(window, self.property, token) {
            Ok(()) => {}
            Err(e) => {
                warn!("Could not bind {}: {}", window, e);
                return false;
            }
        }
        self.next_token += 1;

        if let Some(old) = self.tokens.insert(window, token) {
            debug!("Replacing binding of {} (token {})", window, old);
            self.targets.remove(&old);
        }
        self.targets.insert(token, target);
        debug!("Bound {} to token {}", window, token);
        true
    }

    /// Find the dispatch target for `window` by reading its property
    pub fn lookup(&mut self, window: WindowHandle) -> Option<&mut dyn DispatchTarget> {
        let token = match self.store.get_property(window, self.property) {
            Ok(Some(token)) => token,
            Ok(None) => return None,
            Err(e) => {
                debug!("Property lookup on {} failed: {}", window, e);
                return None;
            }
        };
        match self.targets.get_mut(&token) {
            Some(target) => {
                let target: &mut dyn DispatchTarget = target.as_mut();
                Some(target)
            }
            None => {
                debug!("{} carries stale token {}", window, token);
                None
            }
        }
    }

    /// Remove the binding of `window`. Calling it again is harmless.
    pub fn unbind(&mut self, window: WindowHandle) -> Option<Box<dyn DispatchTarget>> {
        let token = self.tokens.remove(&window)?;
        match self.store.delete_property(window, self.property) {
            Ok(()) => {}
            // Destroyed windows lose their properties with them
            Err(PropertyError::BadWindow(_)) => {}
            Err(e) => warn!("Could not clear binding property on {}: {}", window, e),
        }
        debug!("Unbound {} (token {})", window, token);
        self.targets.remove(&token)
    }

    pub fn is_bound(&self, window: WindowHandle) -> bool {
        self.tokens.contains_key(&window)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }
}

/// Property store kept in process memory, with explicit window lifetimes
#[derive(Debug, Default)]
pub struct MemoryPropertyStore {
    live: HashSet<WindowHandle>,
    properties: HashMap<(WindowHandle, Atom), u64>,
}

impl MemoryPropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_window(&mut self, window: WindowHandle) {
        self.live.insert(window);
    }

    /// Destroy a window together with all its properties
    pub fn destroy_window(&mut self, window: WindowHandle) {
        self.live.remove(&window);
        self.properties.retain(|(w, _), _| *w != window);
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    fn check(&self, window: WindowHandle) -> Result<(), PropertyError> {
        if self.live.contains(&window) {
            Ok(())
        } else {
            Err(PropertyError::BadWindow(window))
        }
    }
}

impl PropertyStore for MemoryPropertyStore {
    fn set_property(&mut self, window: WindowHandle, name: Atom, value: u64) -> Result<(), PropertyError> {
        self.check(window)?;
        self.properties.insert((window, name), value);
        Ok(())
    }

    fn get_property(&mut self, window: WindowHandle, name: Atom) -> Result<Option<u64>, PropertyError> {
        self.check(window)?;
        Ok(self.properties.get(&(window, name)).copied())
    }

    fn delete_property(&mut self, window: WindowHandle, name: Atom) -> Result<(), PropertyError> {
        self.check(window)?;
        self.properties.remove(&(window, name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::testing::{Call, Recorder};

    const PROP: Atom = Atom::from_raw(300);

    fn registry_with(windows: &[u32]) -> WindowRegistry<MemoryPropertyStore> {
        let mut store = MemoryPropertyStore::new();
        for &w in windows {
            store.create_window(WindowHandle::from_raw(w));
        }
        WindowRegistry::new(store, PROP)
    }

    #[test]
    fn test_bind_and_lookup() {
        let mut registry = registry_with(&[10]);
        let w = WindowHandle::from_raw(10);
        let (target, calls) = Recorder::new(true);
        assert!(registry.bind(w, Box::new(target)));

        registry.lookup(w).unwrap().on_focus_changed(true);
        assert_eq!(*calls.borrow(), vec![Call::Focus(true)]);
    }

    #[test]
    fn test_lookup_unbound_is_absent() {
        let mut registry = registry_with(&[10]);
        assert!(registry.lookup(WindowHandle::from_raw(10)).is_none());
        assert!(registry.lookup(WindowHandle::from_raw(99)).is_none());
    }

    #[test]
    fn test_bind_dead_window_fails_silently() {
        let mut registry = registry_with(&[]);
        let (target, _) = Recorder::new(true);
        assert!(!registry.bind(WindowHandle::from_raw(5), Box::new(target)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unbind_twice_is_idempotent() {
        let mut registry = registry_with(&[10, 11]);
        let w = WindowHandle::from_raw(10);
        let (a, _) = Recorder::new(true);
        let (b, _) = Recorder::new(true);
        registry.bind(w, Box::new(a));
        registry.bind(WindowHandle::from_raw(11), Box::new(b));

        assert!(registry.unbind(w).is_some());
        let after_first = (registry.len(), registry.store().property_count(), registry.is_bound(w));
        assert!(registry.unbind(w).is_none());
        let after_second = (registry.len(), registry.store().property_count(), registry.is_bound(w));
        assert_eq!(after_first, after_second);
        assert_eq!(after_second, (1, 1, false));
    }

    #[test]
    fn test_rebind_replaces_target() {
        let mut registry = registry_with(&[10]);
        let w = WindowHandle::from_raw(10);
        let (old, old_calls) = Recorder::new(true);
        let (new, new_calls) = Recorder::new(true);
        registry.bind(w, Box::new(old));
        registry.bind(w, Box::new(new));
        assert_eq!(registry.len(), 1);

        registry.lookup(w).unwrap().on_destroyed();
        assert!(old_calls.borrow().is_empty());
        assert_eq!(*new_calls.borrow(), vec![Call::Destroyed]);
    }

    #[test]
    fn test_unbind_after_window_destroyed_releases_target() {
        let mut registry = registry_with(&[10]);
        let w = WindowHandle::from_raw(10);
        let (target, _) = Recorder::new(true);
        registry.bind(w, Box::new(target));
        registry.store_mut().destroy_window(w);

        assert!(registry.unbind(w).is_some());
        assert!(registry.is_empty());
    }
}
