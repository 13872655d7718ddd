use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::unwind::manager::Allocation;

pub(crate) const INVALID_CACHE_INDEX: usize = usize::MAX;

/// Cached allocations ordered by owned page count, largest first, so one
/// eviction reclaims as many pages as possible.
///
/// The heap is an arena of entries where every allocation tracks its own
/// current position (`cache_index`), letting a re-engaged allocation be
/// removed in O(log n) instead of waiting to be popped. Indices are only
/// written while the heap lock is held.
pub(crate) struct AllocationCache {
    heap: Mutex<Vec<Arc<Allocation>>>,
}

impl AllocationCache {
    pub fn new() -> Self {
        AllocationCache {
            heap: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("lock").len()
    }

    pub fn push(&self, allocation: Arc<Allocation>) {
        let mut heap = self.heap.lock().expect("lock");
        allocation
            .cache_index
            .store(heap.len(), Ordering::Relaxed);
        heap.push(allocation);
        let last = heap.len() - 1;
        sift_up(&mut heap, last);
    }

    /// Remove and return the allocation owning the most pages.
    pub fn pop(&self) -> Option<Arc<Allocation>> {
        let mut heap = self.heap.lock().expect("lock");
        if heap.is_empty() {
            return None;
        }
        let last = heap.len() - 1;
        heap.swap(0, last);
        let top = heap.pop().expect("heap is not empty");
        top.cache_index.store(INVALID_CACHE_INDEX, Ordering::Relaxed);
        if !heap.is_empty() {
            heap[0].cache_index.store(0, Ordering::Relaxed);
            sift_down(&mut heap, 0);
        }
        Some(top)
    }

    /// Remove a specific allocation. Returns false when it is not a member,
    /// which happens when the eviction path popped it concurrently. An entry
    /// whose recorded index disagrees with the heap is a corrupted pool and
    /// panics.
    pub fn remove(&self, allocation: &Allocation) -> bool {
        let mut heap = self.heap.lock().expect("lock");
        let index = allocation.cache_index.load(Ordering::Relaxed);
        if index == INVALID_CACHE_INDEX {
            return false;
        }
        assert!(
            index < heap.len() && std::ptr::eq(heap[index].as_ref(), allocation),
            "allocation cache index out of sync"
        );

        let last = heap.len() - 1;
        heap.swap(index, last);
        let removed = heap.pop().expect("heap is not empty");
        removed
            .cache_index
            .store(INVALID_CACHE_INDEX, Ordering::Relaxed);
        if index < heap.len() {
            heap[index].cache_index.store(index, Ordering::Relaxed);
            sift_down(&mut heap, index);
            sift_up(&mut heap, index);
        }
        true
    }
}

fn key(allocation: &Allocation) -> usize {
    allocation.page_count()
}

fn swap_entries(heap: &mut [Arc<Allocation>], i: usize, j: usize) {
    heap.swap(i, j);
    heap[i].cache_index.store(i, Ordering::Relaxed);
    heap[j].cache_index.store(j, Ordering::Relaxed);
}

fn sift_up(heap: &mut [Arc<Allocation>], mut index: usize) {
    while index > 0 {
        let parent = (index - 1) / 2;
        if key(&heap[index]) <= key(&heap[parent]) {
            break;
        }
        swap_entries(heap, index, parent);
        index = parent;
    }
}

fn sift_down(heap: &mut [Arc<Allocation>], mut index: usize) {
    loop {
        let mut largest = index;
        for child in [2 * index + 1, 2 * index + 2] {
            if child < heap.len() && key(&heap[child]) > key(&heap[largest]) {
                largest = child;
            }
        }
        if largest == index {
            return;
        }
        swap_entries(heap, index, largest);
        index = largest;
    }
}
