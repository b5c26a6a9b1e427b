//! Process-wide named singletons.
//!
//! The identity, policy, and conntrack tables are shared by every filter
//! instance and every worker thread. Each is constructed at most once per
//! process; all callers receive the same instance.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const CONNTRACK: &str = "conntrack-tables";
pub const HOST_TABLE: &str = "host-identity-table";
pub const PREFIX_TABLE: &str = "prefix-identity-table";
pub const POLICY_STORE: &str = "policy-store";
pub const IDENTITY_RESOLVER: &str = "identity-resolver";

pub struct Registry {
    entries: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the named singleton, constructing it with `f` if this is
    /// the first caller. The entry lock is held across construction so
    /// racing creators resolve to a single winner.
    pub fn get_or_create<T, F>(&self, name: &str, f: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Arc<T>,
    {
        let mut entries = self.entries.lock().expect("registry lock");
        let entry = entries
            .entry(name.to_string())
            .or_insert_with(|| {
                let created: Arc<dyn Any + Send + Sync> = f();
                created
            })
            .clone();
        match entry.downcast::<T>() {
            Ok(value) => value,
            Err(_) => panic!("singleton {} already registered with another type", name),
        }
    }

    /// Returns the named singleton only if it already exists.
    pub fn get<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let entries = self.entries.lock().expect("registry lock");
        entries
            .get(name)
            .and_then(|entry| entry.clone().downcast::<T>().ok())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::Registry;

    #[test]
    fn creates_once() {
        let registry = Registry::new();
        let a = registry.get_or_create("n", || Arc::new(7usize));
        let b = registry.get_or_create("n", || Arc::new(8usize));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*b, 7);
    }

    #[test]
    fn get_does_not_create() {
        let registry = Registry::new();
        assert_eq!(registry.get::<usize>("n"), None);
        registry.get_or_create("n", || Arc::new(7usize));
        assert_eq!(registry.get::<usize>("n"), Some(Arc::new(7usize)));
    }

    #[test]
    fn races_resolve_to_a_single_winner() {
        let registry = Arc::new(Registry::new());
        let created = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let created = created.clone();
            handles.push(thread::spawn(move || {
                registry.get_or_create("n", move || {
                    created.fetch_add(1, Ordering::SeqCst);
                    Arc::new(7usize)
                })
            }));
        }
        for handle in handles {
            assert_eq!(*handle.join().unwrap(), 7);
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }
}
