use std::sync::Mutex;

use crate::bpf::PageId;

/// Bounded pool of page identifiers with O(1) acquire and release.
///
/// Capacity is fixed at construction. Exhaustion is reported through
/// [`Freelist::acquire`] returning `None`; callers decide whether to evict
/// or fail. Releasing a page that is not outstanding panics: it means the
/// pool bookkeeping is corrupted and every allocation sharing the pool is
/// suspect.
pub(crate) struct Freelist {
    state: Mutex<FreelistState>,
    total: usize,
}

struct FreelistState {
    free: Vec<PageId>,
    outstanding: Box<[bool]>,
}

impl Freelist {
    pub fn new(total: usize) -> Self {
        Freelist {
            state: Mutex::new(FreelistState {
                free: (0..total as PageId).collect(),
                outstanding: vec![false; total].into_boxed_slice(),
            }),
            total,
        }
    }

    pub fn acquire(&self) -> Option<PageId> {
        let mut state = self.state.lock().expect("lock");
        let id = state.free.pop()?;
        state.outstanding[id as usize] = true;
        Some(id)
    }

    pub fn release(&self, id: PageId) {
        let mut state = self.state.lock().expect("lock");
        assert!((id as usize) < self.total, "page {id} is outside the pool");
        assert!(state.outstanding[id as usize], "page {id} released twice");
        state.outstanding[id as usize] = false;
        state.free.push(id);
    }

    pub fn total_items(&self) -> usize {
        self.total
    }

    pub fn free_items(&self) -> usize {
        self.state.lock().expect("lock").free.len()
    }
}
