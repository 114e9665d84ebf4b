//! Kinship store: resource-kind metadata cache and the owner-tree resolver built on it

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod cache;
pub mod resolver;

pub use cache::{KindCache, KindState};
pub use resolver::OwnerResolver;

/// Critical sections never panic mid-update, so a poisoned lock still holds consistent data.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }
