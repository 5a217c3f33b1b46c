//! AGP/GART memory bookkeeping.
//!
//! The aperture mechanism itself (reserving host pages and wiring them into
//! GPU-visible address space) belongs to an external back-end injected via
//! [`AgpBackend`]; this crate is the per-device ledger on top of it: which
//! regions exist, which are bound, and at what aperture offset. These are
//! setup-time operations, so one coarse mutex over the whole ledger is
//! enough; lookup by handle is a linear scan over a region count that stays
//! in the single digits to low tens.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Key naming an allocation inside the back-end. The public handle is
/// `key + 1` so that handle `0` can mean "invalid" unambiguously.
pub type BackendKey = u64;

/// Static and usage information reported by the back-end for the INFO query.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AgpInfo {
    pub version_major: u8,
    pub version_minor: u8,
    pub aperture_base: u64,
    pub aperture_size: u64,
    pub memory_allowed: u64,
    pub memory_used: u64,
    pub id_vendor: u16,
    pub id_device: u16,
}

/// External aperture back-end collaborator.
pub trait AgpBackend: Send + Sync {
    fn acquire(&self) -> Result<(), AgpError>;
    fn release(&self);
    fn enable(&self, mode: u32) -> Result<(), AgpError>;
    /// Reserves `pages` pages of the given memory type; returns the
    /// back-end key.
    fn allocate(&self, pages: usize, mem_type: u32) -> Result<BackendKey, AgpError>;
    fn free(&self, key: BackendKey);
    /// Maps the allocation at `offset` into the aperture; returns the bound
    /// address (`aperture_base + offset`, always nonzero).
    fn bind(&self, key: BackendKey, offset: u64) -> Result<u64, AgpError>;
    fn unbind(&self, key: BackendKey) -> Result<(), AgpError>;
    fn info(&self) -> AgpInfo;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgpError {
    #[error("AGP already acquired")]
    AlreadyAcquired,
    #[error("AGP not acquired")]
    NotAcquired,
    #[error("zero-page AGP allocation")]
    ZeroPages,
    #[error("unknown AGP handle {0}")]
    UnknownHandle(u64),
    #[error("AGP region already bound")]
    AlreadyBound,
    #[error("AGP back-end out of memory")]
    NoMemory,
    #[error("AGP back-end failure: {0}")]
    Backend(String),
}

/// One allocated aperture region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgpRegion {
    /// Public handle (`backend key + 1`; never 0).
    pub handle: u64,
    /// Allocation size in pages.
    pub pages: usize,
    pub mem_type: u32,
    /// Bound aperture address; `0` while unmapped.
    pub bound: u64,
    key: BackendKey,
}

#[derive(Debug, Default)]
struct AgpState {
    acquired: bool,
    mode: Option<u32>,
    /// Newest-first region ledger.
    regions: Vec<AgpRegion>,
}

/// The per-device AGP ledger.
pub struct AgpManager {
    backend: Arc<dyn AgpBackend>,
    state: Mutex<AgpState>,
}

impl std::fmt::Debug for AgpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgpManager")
            .field("state", &self.state.lock().unwrap())
            .finish()
    }
}

impl AgpManager {
    pub fn new(backend: Arc<dyn AgpBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(AgpState::default()),
        }
    }

    pub fn acquire(&self) -> Result<(), AgpError> {
        let mut state = self.state.lock().unwrap();
        if state.acquired {
            return Err(AgpError::AlreadyAcquired);
        }
        self.backend.acquire()?;
        state.acquired = true;
        Ok(())
    }

    pub fn release(&self) -> Result<(), AgpError> {
        let mut state = self.state.lock().unwrap();
        if !state.acquired {
            return Err(AgpError::NotAcquired);
        }
        self.backend.release();
        state.acquired = false;
        state.mode = None;
        Ok(())
    }

    pub fn enable(&self, mode: u32) -> Result<(), AgpError> {
        let mut state = self.state.lock().unwrap();
        if !state.acquired {
            return Err(AgpError::NotAcquired);
        }
        self.backend.enable(mode)?;
        state.mode = Some(mode);
        Ok(())
    }

    pub fn is_acquired(&self) -> bool {
        self.state.lock().unwrap().acquired
    }

    pub fn mode(&self) -> Option<u32> {
        self.state.lock().unwrap().mode
    }

    pub fn info(&self) -> AgpInfo {
        self.backend.info()
    }

    /// Allocates a region and links it at the head of the ledger.
    pub fn alloc(&self, pages: usize, mem_type: u32) -> Result<u64, AgpError> {
        if pages == 0 {
            return Err(AgpError::ZeroPages);
        }
        let mut state = self.state.lock().unwrap();
        if !state.acquired {
            return Err(AgpError::NotAcquired);
        }
        let key = self.backend.allocate(pages, mem_type)?;
        let handle = key + 1;
        state.regions.insert(
            0,
            AgpRegion {
                handle,
                pages,
                mem_type,
                bound: 0,
                key,
            },
        );
        tracing::debug!(handle, pages, mem_type, "AGP region allocated");
        Ok(handle)
    }

    fn position(state: &AgpState, handle: u64) -> Result<usize, AgpError> {
        if handle == 0 {
            return Err(AgpError::UnknownHandle(0));
        }
        state
            .regions
            .iter()
            .position(|r| r.handle == handle)
            .ok_or(AgpError::UnknownHandle(handle))
    }

    /// Maps the region at `offset`. Fails (leaving the region unbound) if
    /// the region is already bound or the back-end refuses.
    pub fn bind(&self, handle: u64, offset: u64) -> Result<u64, AgpError> {
        let mut state = self.state.lock().unwrap();
        let pos = Self::position(&state, handle)?;
        if state.regions[pos].bound != 0 {
            return Err(AgpError::AlreadyBound);
        }
        let bound = self.backend.bind(state.regions[pos].key, offset)?;
        state.regions[pos].bound = bound;
        Ok(bound)
    }

    /// Unmaps the region; a no-op if it is not bound.
    pub fn unbind(&self, handle: u64) -> Result<(), AgpError> {
        let mut state = self.state.lock().unwrap();
        let pos = Self::position(&state, handle)?;
        if state.regions[pos].bound == 0 {
            return Ok(());
        }
        self.backend.unbind(state.regions[pos].key)?;
        state.regions[pos].bound = 0;
        Ok(())
    }

    /// Releases the region back to the back-end, unbinding first if needed,
    /// and unlinks it from the ledger. The handle is invalid afterwards.
    pub fn free(&self, handle: u64) -> Result<(), AgpError> {
        let mut state = self.state.lock().unwrap();
        let pos = Self::position(&state, handle)?;
        let region = state.regions[pos];
        if region.bound != 0 {
            self.backend.unbind(region.key)?;
        }
        self.backend.free(region.key);
        state.regions.remove(pos);
        tracing::debug!(handle, "AGP region freed");
        Ok(())
    }

    /// Linear lookup by handle.
    pub fn region(&self, handle: u64) -> Option<AgpRegion> {
        let state = self.state.lock().unwrap();
        Self::position(&state, handle)
            .ok()
            .map(|pos| state.regions[pos])
    }

    /// Snapshot of the ledger, newest first.
    pub fn regions(&self) -> Vec<AgpRegion> {
        self.state.lock().unwrap().regions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct FakeBackend {
        next_key: AtomicU64,
        bound: Mutex<HashMap<BackendKey, u64>>,
        live: Mutex<HashMap<BackendKey, usize>>,
    }

    const APERTURE_BASE: u64 = 0xF000_0000;

    impl AgpBackend for FakeBackend {
        fn acquire(&self) -> Result<(), AgpError> {
            Ok(())
        }

        fn release(&self) {}

        fn enable(&self, _mode: u32) -> Result<(), AgpError> {
            Ok(())
        }

        fn allocate(&self, pages: usize, _mem_type: u32) -> Result<BackendKey, AgpError> {
            let key = self.next_key.fetch_add(1, Ordering::SeqCst);
            self.live.lock().unwrap().insert(key, pages);
            Ok(key)
        }

        fn free(&self, key: BackendKey) {
            assert!(self.live.lock().unwrap().remove(&key).is_some());
            assert!(
                !self.bound.lock().unwrap().contains_key(&key),
                "freed while bound"
            );
        }

        fn bind(&self, key: BackendKey, offset: u64) -> Result<u64, AgpError> {
            let mut bound = self.bound.lock().unwrap();
            assert!(!bound.contains_key(&key), "double bind reached back-end");
            bound.insert(key, offset);
            Ok(APERTURE_BASE + offset)
        }

        fn unbind(&self, key: BackendKey) -> Result<(), AgpError> {
            assert!(self.bound.lock().unwrap().remove(&key).is_some());
            Ok(())
        }

        fn info(&self) -> AgpInfo {
            AgpInfo {
                aperture_base: APERTURE_BASE,
                aperture_size: 64 << 20,
                ..AgpInfo::default()
            }
        }
    }

    fn manager() -> AgpManager {
        let mgr = AgpManager::new(Arc::new(FakeBackend::default()));
        mgr.acquire().unwrap();
        mgr
    }

    #[test]
    fn handles_start_at_one() {
        let mgr = manager();
        let h = mgr.alloc(4, 0).unwrap();
        assert_eq!(h, 1);
        assert!(mgr.region(0).is_none());
        assert_eq!(mgr.region(h).unwrap().pages, 4);
    }

    #[test]
    fn alloc_requires_acquire() {
        let mgr = AgpManager::new(Arc::new(FakeBackend::default()));
        assert_eq!(mgr.alloc(4, 0), Err(AgpError::NotAcquired));
        assert_eq!(mgr.enable(1), Err(AgpError::NotAcquired));
        assert_eq!(mgr.release(), Err(AgpError::NotAcquired));
    }

    #[test]
    fn double_acquire_is_busy() {
        let mgr = manager();
        assert_eq!(mgr.acquire(), Err(AgpError::AlreadyAcquired));
        mgr.release().unwrap();
        mgr.acquire().unwrap();
    }

    #[test]
    fn bind_records_aperture_address() {
        let mgr = manager();
        let h = mgr.alloc(4, 0).unwrap();
        assert_eq!(mgr.region(h).unwrap().bound, 0);
        let addr = mgr.bind(h, 0x1000).unwrap();
        assert_eq!(addr, APERTURE_BASE + 0x1000);
        assert_eq!(mgr.region(h).unwrap().bound, addr);
        assert_eq!(mgr.bind(h, 0x2000), Err(AgpError::AlreadyBound));
        // Failed rebind left the original mapping intact.
        assert_eq!(mgr.region(h).unwrap().bound, addr);
    }

    #[test]
    fn unbind_is_idempotent() {
        let mgr = manager();
        let h = mgr.alloc(4, 0).unwrap();
        mgr.unbind(h).unwrap();
        mgr.bind(h, 0).unwrap();
        mgr.unbind(h).unwrap();
        mgr.unbind(h).unwrap();
        assert_eq!(mgr.region(h).unwrap().bound, 0);
    }

    /// Freeing a still-bound region unbinds first and fully
    /// unlinks it.
    #[test]
    fn free_while_bound_unbinds_first() {
        let mgr = manager();
        let h = mgr.alloc(8, 0).unwrap();
        mgr.bind(h, 0x4000).unwrap();
        mgr.free(h).unwrap();
        assert!(mgr.region(h).is_none());
        assert_eq!(mgr.free(h), Err(AgpError::UnknownHandle(h)));
    }

    #[test]
    fn ledger_is_newest_first() {
        let mgr = manager();
        let a = mgr.alloc(1, 0).unwrap();
        let b = mgr.alloc(2, 0).unwrap();
        let handles: Vec<u64> = mgr.regions().iter().map(|r| r.handle).collect();
        assert_eq!(handles, vec![b, a]);
    }

    #[test]
    fn zero_pages_rejected() {
        let mgr = manager();
        assert_eq!(mgr.alloc(0, 0), Err(AgpError::ZeroPages));
    }
}
