//! Credential store used by the login and registration pages.
//!
//! The store itself is an external capability: anything implementing
//! [`CredentialStore`] can back it. Requests borrow one of a fixed number of
//! handles from [`StorePool`] for the duration of a single request, so at
//! most `pool size` requests touch the store at once; the rest wait.

use crate::error::{LumenError, LumenResult};
use crate::pool::Semaphore;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// One live handle to the backing store.
pub trait StoreConnection: Send {
    /// All known `(username, password)` pairs.
    fn query_users(&mut self) -> LumenResult<Vec<(String, String)>>;

    fn insert_user(&mut self, name: &str, password: &str) -> LumenResult<()>;
}

/// Factory for store handles.
pub trait CredentialStore: Send + Sync {
    fn connect(&self) -> LumenResult<Box<dyn StoreConnection>>;
}

/// Process-local store, optionally persisted as `name:password` lines.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    users: Mutex<Vec<(String, String)>>,
    file: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users<I, N, P>(users: I) -> Self
    where
        I: IntoIterator<Item = (N, P)>,
        N: Into<String>,
        P: Into<String>,
    {
        let users = users
            .into_iter()
            .map(|(n, p)| (n.into(), p.into()))
            .collect();
        Self {
            inner: Arc::new(MemoryInner {
                users: Mutex::new(users),
                file: None,
            }),
        }
    }

    /// Load users from `path` (created on first registration if missing).
    pub fn open(path: impl Into<PathBuf>) -> LumenResult<Self> {
        let path = path.into();
        let mut users = Vec::new();
        if path.exists() {
            for (lineno, line) in fs::read_to_string(&path)?.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match line.split_once(':') {
                    Some((name, password)) => users.push((name.to_string(), password.to_string())),
                    None => warn!(path = %path.display(), line = lineno + 1, "skipping malformed user entry"),
                }
            }
        }
        info!(path = %path.display(), users = users.len(), "credential file loaded");
        Ok(Self {
            inner: Arc::new(MemoryInner {
                users: Mutex::new(users),
                file: Some(path),
            }),
        })
    }
}

impl CredentialStore for MemoryStore {
    fn connect(&self) -> LumenResult<Box<dyn StoreConnection>> {
        Ok(Box::new(MemoryConnection {
            inner: self.inner.clone(),
        }))
    }
}

struct MemoryConnection {
    inner: Arc<MemoryInner>,
}

impl StoreConnection for MemoryConnection {
    fn query_users(&mut self) -> LumenResult<Vec<(String, String)>> {
        Ok(self.inner.users.lock().clone())
    }

    fn insert_user(&mut self, name: &str, password: &str) -> LumenResult<()> {
        if name.is_empty() || name.contains(':') || name.contains('\n') || password.contains('\n') {
            return Err(LumenError::Store(format!("invalid username {:?}", name)));
        }
        let mut users = self.inner.users.lock();
        if users.iter().any(|(n, _)| n == name) {
            return Err(LumenError::Store(format!("user {:?} already exists", name)));
        }
        if let Some(path) = &self.inner.file {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(file, "{}:{}", name, password)?;
        }
        users.push((name.to_string(), password.to_string()));
        Ok(())
    }
}

/// Fixed-size pool of store handles.
pub struct StorePool {
    free: Mutex<Vec<Box<dyn StoreConnection>>>,
    available: Semaphore,
}

impl StorePool {
    /// Eagerly open `size` handles.
    pub fn connect(store: &dyn CredentialStore, size: usize) -> LumenResult<Self> {
        if size == 0 {
            return Err(LumenError::Config("store pool size must be positive".into()));
        }
        let mut free = Vec::with_capacity(size);
        for _ in 0..size {
            free.push(store.connect()?);
        }
        Ok(Self {
            free: Mutex::new(free),
            available: Semaphore::new(size),
        })
    }

    /// Borrow a handle, blocking until one is free. Returned on drop.
    pub fn acquire(&self) -> PooledConn<'_> {
        self.available.wait();
        // A permit guarantees a handle is parked in `free`.
        let conn = self.free.lock().pop();
        PooledConn { pool: self, conn }
    }

    pub fn idle(&self) -> usize {
        self.available.available()
    }
}

/// Scoped borrow of a store handle.
pub struct PooledConn<'a> {
    pool: &'a StorePool,
    conn: Option<Box<dyn StoreConnection>>,
}

impl Deref for PooledConn<'_> {
    type Target = dyn StoreConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_deref().expect("pooled handle present until drop")
    }
}

impl DerefMut for PooledConn<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_deref_mut().expect("pooled handle present until drop")
    }
}

impl Drop for PooledConn<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.free.lock().push(conn);
            self.pool.available.post();
        }
    }
}

/// Outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    Taken,
    Failed,
}

/// In-memory username → password table, hydrated from the store at startup.
#[derive(Default)]
pub struct UserTable {
    users: RwLock<HashMap<String, String>>,
}

impl UserTable {
    pub fn load(pool: &StorePool) -> LumenResult<Self> {
        let rows = pool.acquire().query_users()?;
        info!(users = rows.len(), "user table hydrated");
        Ok(Self {
            users: RwLock::new(rows.into_iter().collect()),
        })
    }

    pub fn verify(&self, name: &str, password: &str) -> bool {
        self.users.read().get(name).is_some_and(|p| p.as_str() == password)
    }

    /// Insert into the store and the table under one write lock, so two
    /// concurrent registrations of the same name cannot both succeed.
    pub fn register(&self, pool: &StorePool, name: &str, password: &str) -> Registration {
        let mut users = self.users.write();
        if users.contains_key(name) {
            return Registration::Taken;
        }
        let mut conn = pool.acquire();
        match conn.insert_user(name, password) {
            Ok(()) => {
                users.insert(name.to_string(), password.to_string());
                Registration::Created
            }
            Err(e) => {
                warn!(error = %e, "registration insert failed");
                Registration::Failed
            }
        }
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }
}
