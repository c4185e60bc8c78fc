//! Lock domain
//!
//! Two kinds of lock with a fixed acquisition order:
//! - the global lock, held briefly for registry mutation (packages and error
//!   handlers lock through aliases of it)
//! - one optional lock per hash table, chosen by type: `HashTable` has none,
//!   `SharedHashTable` owns one
//!
//! A thread never takes a global lock while holding a table lock, and never
//! holds two table locks at once. Locks are not reentrant. Each thread tracks
//! what it holds, so violations are reported as `LockError` before blocking.
//! Global locks are tracked per domain: holding one runtime's global lock
//! says nothing about another's.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

thread_local! {
    /// Ids of the domains whose global lock this thread holds
    static HELD_GLOBALS: RefCell<Vec<u64>> = RefCell::new(Vec::new());
    static HELD_TABLE: Cell<Option<u64>> = Cell::new(None);
}

static NEXT_DOMAIN_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

/// A lock in the domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockName {
    Global,
    /// Alias of the global lock
    Package,
    /// Alias of the global lock
    ErrorHandler,
    Table(u64),
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockName::Global => write!(f, "global lock"),
            LockName::Package => write!(f, "package lock"),
            LockName::ErrorHandler => write!(f, "error-handler lock"),
            LockName::Table(id) => write!(f, "hash table {} lock", id),
        }
    }
}

/// Lock acquisition refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("Lock order violation: {requested} requested while holding {held}")]
    OrderViolation { held: LockName, requested: LockName },

    #[error("{0} is already held by this thread")]
    Reentrant(LockName),
}

/// Registries behind the global lock
pub struct LockDomain<T> {
    id: u64,
    global: Mutex<T>,
}

impl<T> LockDomain<T> {
    pub fn new(registry: T) -> Self {
        Self {
            id: NEXT_DOMAIN_ID.fetch_add(1, Ordering::Relaxed),
            global: Mutex::new(registry),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the calling thread holds this domain's global lock
    pub fn is_held(&self) -> bool {
        HELD_GLOBALS.with(|held| held.borrow().contains(&self.id))
    }

    pub fn global(&self) -> Result<GlobalGuard<'_, T>, LockError> {
        self.acquire(LockName::Global)
    }

    pub fn package_lock(&self) -> Result<GlobalGuard<'_, T>, LockError> {
        self.acquire(LockName::Package)
    }

    pub fn error_handler_lock(&self) -> Result<GlobalGuard<'_, T>, LockError> {
        self.acquire(LockName::ErrorHandler)
    }

    fn acquire(&self, name: LockName) -> Result<GlobalGuard<'_, T>, LockError> {
        if self.is_held() {
            return Err(LockError::Reentrant(name));
        }
        if let Some(table) = HELD_TABLE.with(Cell::get) {
            return Err(LockError::OrderViolation {
                held: LockName::Table(table),
                requested: name,
            });
        }
        // A panic while holding the lock leaves the registries usable.
        let guard = self.global.lock().unwrap_or_else(|e| e.into_inner());
        HELD_GLOBALS.with(|held| held.borrow_mut().push(self.id));
        Ok(GlobalGuard {
            guard,
            name,
            domain: self.id,
        })
    }

    /// Consume the domain, returning the registries
    pub fn into_inner(self) -> T {
        self.global.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

/// Holder of the global lock
pub struct GlobalGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    name: LockName,
    domain: u64,
}

impl<T> GlobalGuard<'_, T> {
    /// The alias this guard was taken through
    pub fn name(&self) -> LockName {
        self.name
    }
}

impl<T> Deref for GlobalGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for GlobalGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for GlobalGuard<'_, T> {
    fn drop(&mut self) {
        HELD_GLOBALS.with(|held| held.borrow_mut().retain(|id| *id != self.domain));
    }
}

/// Hash table confined to one thread; no lock, no overhead
#[derive(Debug, Clone)]
pub struct HashTable<K, V> {
    map: HashMap<K, V>,
}

impl<K: Eq + Hash, V> HashTable<K, V> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.map.insert(key, value)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.map.get_mut(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter()
    }

    /// Give the table its own lock so it can be shared between threads
    pub fn into_shared(self) -> SharedHashTable<K, V> {
        SharedHashTable::from_map(self.map)
    }
}

impl<K: Eq + Hash, V> Default for HashTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash table with a private lock
#[derive(Debug)]
pub struct SharedHashTable<K, V> {
    id: u64,
    map: Mutex<HashMap<K, V>>,
}

impl<K: Eq + Hash, V> SharedHashTable<K, V> {
    pub fn new() -> Self {
        Self::from_map(HashMap::new())
    }

    fn from_map(map: HashMap<K, V>) -> Self {
        Self {
            id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
            map: Mutex::new(map),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Take this table's lock
    pub fn lock(&self) -> Result<TableGuard<'_, K, V>, LockError> {
        if let Some(held) = HELD_TABLE.with(Cell::get) {
            let requested = LockName::Table(self.id);
            return Err(if held == self.id {
                LockError::Reentrant(requested)
            } else {
                LockError::OrderViolation {
                    held: LockName::Table(held),
                    requested,
                }
            });
        }
        let guard = self.map.lock().unwrap_or_else(|e| e.into_inner());
        HELD_TABLE.with(|held| held.set(Some(self.id)));
        Ok(TableGuard { guard })
    }

    pub fn insert(&self, key: K, value: V) -> Result<Option<V>, LockError> {
        Ok(self.lock()?.insert(key, value))
    }

    pub fn get(&self, key: &K) -> Result<Option<V>, LockError>
    where
        V: Clone,
    {
        Ok(self.lock()?.get(key).cloned())
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>, LockError> {
        Ok(self.lock()?.remove(key))
    }

    /// Apply `f` to the entry for `key`, inserting `V::default()` first if absent
    pub fn update<R>(&self, key: K, f: impl FnOnce(&mut V) -> R) -> Result<R, LockError>
    where
        V: Default,
    {
        Ok(f(self.lock()?.entry(key).or_default()))
    }

    pub fn len(&self) -> Result<usize, LockError> {
        Ok(self.lock()?.len())
    }

    /// Drop the lock; the caller takes the table back to one thread
    pub fn into_inner(self) -> HashTable<K, V> {
        HashTable {
            map: self.map.into_inner().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

impl<K: Eq + Hash, V> Default for SharedHashTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Holder of one table lock
pub struct TableGuard<'a, K, V> {
    guard: MutexGuard<'a, HashMap<K, V>>,
}

impl<K, V> Deref for TableGuard<'_, K, V> {
    type Target = HashMap<K, V>;

    fn deref(&self) -> &HashMap<K, V> {
        &self.guard
    }
}

impl<K, V> DerefMut for TableGuard<'_, K, V> {
    fn deref_mut(&mut self) -> &mut HashMap<K, V> {
        &mut self.guard
    }
}

impl<K, V> Drop for TableGuard<'_, K, V> {
    fn drop(&mut self) {
        HELD_TABLE.with(|held| held.set(None));
    }
}
