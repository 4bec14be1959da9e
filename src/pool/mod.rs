//! Cross-process exclusive resource pool.
//!
//! The pool lives in a directory holding a JSON data file, with the free
//! resources and the open leases, and a sibling lock file. Every
//! read-modify-write of the data file happens while holding an exclusive
//! advisory lock on the lock file, so independent processes sharing the
//! directory never hand the same resource to two holders. Rewrites go through a temporary file renamed into place, so a
//! reader never observes a half-written set.
//!
//! Every checkout also records a [`Lease`]. Until the lease ends or outlives
//! the pool's lease TTL, [`ResourcePool::reclaim`] treats the resource as held
//! even when no backend node reports it yet. That covers the gap between a
//! holder taking a resource and attaching it to something a backend can see.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::io;
use std::marker::PhantomData;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::{DateTime, Utc};
use fslock::LockFile;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File holding the serialised set of free resources.
pub const DATA_FILE_NAME: &str = "resources.json";

/// Lock file guarding every access to [`DATA_FILE_NAME`].
pub const LOCK_FILE_NAME: &str = "resources.lockfile";

const TEMP_FILE_NAME: &str = "resources.json.tmp";

/// How long a checkout protects a resource from reclamation by default.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30 * 60);

/// A resource that can be checked out of a [`ResourcePool`].
///
/// Resources are stored keyed by [`Resource::resource_id`]; two resources with
/// the same id are the same resource as far as the pool is concerned.
pub trait Resource: Clone + Debug + Serialize + DeserializeOwned {
    /// Stable identifier used as the pool key.
    fn resource_id(&self) -> String;
}

/// Errors raised by the resource pool.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PoolError {
    /// Raised when the backing store cannot be read or written.
    #[error("resource pool storage unavailable at {path}: {message}")]
    StorageUnavailable {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the pool directory or its data is malformed.
    #[error("corrupt resource pool at {path}: {message}")]
    CorruptPool {
        /// Path holding the malformed state.
        path: Utf8PathBuf,
        /// Description of what is wrong.
        message: String,
    },
}

/// Record of a checked-out resource.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Lease {
    /// Id of the leased resource.
    pub resource_id: String,
    /// Holder named at checkout, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
    /// When the resource left the free set.
    pub acquired_at: DateTime<Utc>,
}

impl Lease {
    /// Whether the lease still protects its resource at `now`.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return true;
        };
        now.signed_duration_since(self.acquired_at) < ttl
    }
}

/// Handle on a pool directory.
///
/// Handles are cheap; any number of them, in any number of processes, may
/// point at the same directory.
#[derive(Clone, Debug)]
pub struct ResourcePool<R> {
    dir: Utf8PathBuf,
    lease_ttl: Duration,
    _resource: PhantomData<fn() -> R>,
}

/// Contents of the data file.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
struct PoolState<R> {
    free: BTreeMap<String, R>,
    leases: BTreeMap<String, Lease>,
}

impl<R> Default for PoolState<R> {
    fn default() -> Self {
        Self {
            free: BTreeMap::new(),
            leases: BTreeMap::new(),
        }
    }
}

impl<R: Resource> ResourcePool<R> {
    /// Opens the pool at `dir`, creating an empty pool when the directory is
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::CorruptPool`] when `dir` exists but lacks the data
    /// or lock file, and [`PoolError::StorageUnavailable`] on I/O failure.
    pub fn open(dir: impl Into<Utf8PathBuf>) -> Result<Self, PoolError> {
        let pool = Self {
            dir: dir.into(),
            lease_ttl: DEFAULT_LEASE_TTL,
            _resource: PhantomData,
        };

        match Dir::open_ambient_dir(&pool.dir, ambient_authority()) {
            Ok(existing) => pool.check_layout(&existing)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => pool.initialise()?,
            Err(err) => return Err(storage_error(&pool.dir, &err)),
        }

        Ok(pool)
    }

    /// Overrides how long a checkout shields its resource from
    /// [`Self::reclaim`].
    #[must_use]
    pub const fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Directory backing this pool.
    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Atomically removes and returns one free resource, leasing it without
    /// naming a holder.
    ///
    /// The lowest id is chosen, but callers must not rely on any particular
    /// order across processes.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError`] when the store cannot be read or written.
    pub fn acquire(&self) -> Result<Option<R>, PoolError> {
        self.checkout(None)
    }

    /// Like [`Self::acquire`], recording `holder` on the lease so it can be
    /// ended with [`Self::end_leases`].
    ///
    /// # Errors
    ///
    /// Returns [`PoolError`] when the store cannot be read or written.
    pub fn acquire_for(&self, holder: &str) -> Result<Option<R>, PoolError> {
        self.checkout(Some(holder))
    }

    /// Atomically returns resources to the pool and ends their leases. A
    /// resource whose id is already free replaces the stored copy.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError`] when the store cannot be read or written.
    pub fn release(&self, resources: &[R]) -> Result<(), PoolError> {
        self.with_lock(|dir| {
            let mut state = self.load(dir)?;
            for resource in resources {
                let id = resource.resource_id();
                state.leases.remove(&id);
                state.free.insert(id, resource.clone());
            }
            self.persist(dir, &state)
        })
    }

    /// Ends every lease recorded for `holder` without freeing the resources,
    /// and returns how many ended.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError`] when the store cannot be read or written.
    pub fn end_leases(&self, holder: &str) -> Result<usize, PoolError> {
        self.with_lock(|dir| {
            let mut state = self.load(dir)?;
            let before = state.leases.len();
            state
                .leases
                .retain(|_, lease| lease.holder.as_deref() != Some(holder));
            let ended = before - state.leases.len();
            if ended > 0 {
                self.persist(dir, &state)?;
            }
            Ok(ended)
        })
    }

    /// Returns a snapshot of the free resources, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError`] when the store cannot be read.
    pub fn free_resources(&self) -> Result<Vec<R>, PoolError> {
        self.with_lock(|dir| Ok(self.load(dir)?.free.into_values().collect()))
    }

    /// Returns the leases that still shield their resources, ordered by
    /// resource id.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError`] when the store cannot be read.
    pub fn live_leases(&self) -> Result<Vec<Lease>, PoolError> {
        let now = Utc::now();
        self.with_lock(|dir| {
            Ok(self
                .load(dir)?
                .leases
                .into_values()
                .filter(|lease| lease.is_live(now, self.lease_ttl))
                .collect())
        })
    }

    /// Returns every member of `universe` that is not free, not listed in
    /// `held` and not under a live lease, in a single critical section, and
    /// reports what was reclaimed.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError`] when the store cannot be read or written.
    pub fn reclaim(&self, universe: &[R], held: &BTreeSet<String>) -> Result<Vec<R>, PoolError> {
        let now = Utc::now();
        self.with_lock(|dir| {
            let mut state = self.load(dir)?;
            let orphans: Vec<R> = universe
                .iter()
                .filter(|resource| {
                    let id = resource.resource_id();
                    !state.free.contains_key(&id)
                        && !held.contains(&id)
                        && !state
                            .leases
                            .get(&id)
                            .is_some_and(|lease| lease.is_live(now, self.lease_ttl))
                })
                .cloned()
                .collect();

            if orphans.is_empty() {
                return Ok(orphans);
            }

            for orphan in &orphans {
                let id = orphan.resource_id();
                state.leases.remove(&id);
                state.free.insert(id, orphan.clone());
            }
            self.persist(dir, &state)?;
            Ok(orphans)
        })
    }

    fn checkout(&self, holder: Option<&str>) -> Result<Option<R>, PoolError> {
        self.with_lock(|dir| {
            let mut state = self.load(dir)?;
            let Some((id, resource)) = state.free.pop_first() else {
                return Ok(None);
            };
            state.leases.insert(
                id.clone(),
                Lease {
                    resource_id: id,
                    holder: holder.map(str::to_owned),
                    acquired_at: Utc::now(),
                },
            );
            self.persist(dir, &state)?;
            Ok(Some(resource))
        })
    }

    fn initialise(&self) -> Result<(), PoolError> {
        Dir::create_ambient_dir_all(&self.dir, ambient_authority())
            .map_err(|err| storage_error(&self.dir, &err))?;

        // Another process may have raced us through creation; only seed the
        // data file when nobody has yet.
        self.with_lock(|dir| {
            if exists(dir, &self.dir, DATA_FILE_NAME)? {
                return Ok(());
            }
            self.persist(dir, &PoolState::default())
        })
    }

    fn check_layout(&self, dir: &Dir) -> Result<(), PoolError> {
        for name in [DATA_FILE_NAME, LOCK_FILE_NAME] {
            if !exists(dir, &self.dir, name)? {
                return Err(PoolError::CorruptPool {
                    path: self.dir.clone(),
                    message: format!("directory exists but {name} is missing; not a resource pool"),
                });
            }
        }
        Ok(())
    }

    fn with_lock<T>(
        &self,
        critical: impl FnOnce(&Dir) -> Result<T, PoolError>,
    ) -> Result<T, PoolError> {
        let lock_path = self.dir.join(LOCK_FILE_NAME);
        let mut lock =
            LockFile::open(lock_path.as_str()).map_err(|err| storage_error(&lock_path, &err))?;
        lock.lock().map_err(|err| storage_error(&lock_path, &err))?;

        let outcome = Dir::open_ambient_dir(&self.dir, ambient_authority())
            .map_err(|err| storage_error(&self.dir, &err))
            .and_then(|dir| critical(&dir));

        // Dropping the handle releases the advisory lock on every path.
        drop(lock);
        outcome
    }

    fn load(&self, dir: &Dir) -> Result<PoolState<R>, PoolError> {
        let data_path = self.dir.join(DATA_FILE_NAME);
        let contents = dir.read_to_string(DATA_FILE_NAME).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                PoolError::CorruptPool {
                    path: data_path.clone(),
                    message: String::from("data file is missing"),
                }
            } else {
                storage_error(&data_path, &err)
            }
        })?;

        serde_json::from_str(&contents).map_err(|err| PoolError::CorruptPool {
            path: data_path,
            message: err.to_string(),
        })
    }

    fn persist(&self, dir: &Dir, state: &PoolState<R>) -> Result<(), PoolError> {
        let data_path = self.dir.join(DATA_FILE_NAME);
        let rendered =
            serde_json::to_string_pretty(state).map_err(|err| PoolError::CorruptPool {
                path: data_path.clone(),
                message: err.to_string(),
            })?;

        dir.write(TEMP_FILE_NAME, rendered)
            .map_err(|err| storage_error(&self.dir.join(TEMP_FILE_NAME), &err))?;
        dir.rename(TEMP_FILE_NAME, dir, DATA_FILE_NAME)
            .map_err(|err| storage_error(&data_path, &err))
    }
}

fn exists(dir: &Dir, root: &Utf8Path, name: &str) -> Result<bool, PoolError> {
    dir.try_exists(name)
        .map_err(|err| storage_error(&root.join(name), &err))
}

fn storage_error(path: &Utf8Path, err: &impl ToString) -> PoolError {
    PoolError::StorageUnavailable {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
