//! Test Utilities for the NGC Heap Test Suite
//!
//! Shared fixture, managed test types and strict assertion helpers.
//!
//! ============================================================================
//! Assertions are exact. A collector that keeps garbage or loses live objects
//! must fail these tests, not pass them with a tolerance.
//! ============================================================================

#![allow(dead_code)]

use ngc::{
    DefaultPlatform, GarbageCollected, GcConfig, Heap, HeapConfig, MarkingType, Member, SweepingType,
    Visitor, WeakMember,
};
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::Arc;

/// Collection used by most tests: nothing on the stack, everything swept now
pub const PRECISE: GcConfig = GcConfig::precise_atomic().with_sweeping_type(SweepingType::Atomic);

/// ============================================================================
/// DROP LOG
/// ============================================================================

/// Records the ids of finalized objects, in finalization order
#[derive(Clone, Default)]
pub struct DropLog(Arc<Mutex<Vec<usize>>>);

impl DropLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, id: usize) {
        self.0.lock().push(id);
    }

    pub fn count(&self) -> usize {
        self.0.lock().len()
    }

    pub fn contains(&self, id: usize) -> bool {
        self.0.lock().contains(&id)
    }

    pub fn times_finalized(&self, id: usize) -> usize {
        self.0.lock().iter().filter(|&&seen| seen == id).count()
    }

    pub fn ids(&self) -> Vec<usize> {
        let mut ids = self.0.lock().clone();
        ids.sort_unstable();
        ids
    }
}

/// ============================================================================
/// MANAGED TEST TYPES
/// ============================================================================

/// List node that reports its finalization
pub struct Item {
    pub id: usize,
    pub next: Member<Item>,
    log: DropLog,
}

impl Item {
    pub fn new(id: usize, log: &DropLog) -> Self {
        Self {
            id,
            next: Member::null(),
            log: log.clone(),
        }
    }
}

impl GarbageCollected for Item {
    fn trace(&self, visitor: &mut dyn Visitor) {
        visitor.trace(&self.next);
    }
}

impl Drop for Item {
    fn drop(&mut self) {
        self.log.record(self.id);
    }
}

/// Object with one strong and one weak reference
#[derive(Default)]
pub struct Holder {
    pub strong: Member<Item>,
    pub weak: WeakMember<Item>,
}

impl GarbageCollected for Holder {
    fn trace(&self, visitor: &mut dyn Visitor) {
        visitor.trace(&self.strong);
        visitor.trace_weak(&self.weak);
    }
}

/// ============================================================================
/// HEAP FIXTURE
/// ============================================================================

/// Test fixture owning a heap and its platform
///
/// Heap growing is disabled so collections only happen when a test asks.
pub struct HeapFixture {
    pub heap: Arc<Heap>,
    pub platform: Arc<DefaultPlatform>,
}

impl HeapFixture {
    /// Default configuration
    ///
    /// **Bug this finds:** Initialization failures with a valid config
    pub fn with_defaults() -> Self {
        Self::with_config(HeapConfig::default())
    }

    /// Atomic marking and atomic sweeping only
    pub fn atomic() -> Self {
        Self::with_config(HeapConfig {
            marking_support: MarkingType::Atomic,
            sweeping_support: SweepingType::Atomic,
            ..HeapConfig::default()
        })
    }

    pub fn with_config(config: HeapConfig) -> Self {
        Self::with_platform(config, DefaultPlatform::new())
    }

    pub fn with_platform(config: HeapConfig, platform: DefaultPlatform) -> Self {
        let fixture = Self::with_growing(config, platform);
        fixture.heap.growing().disable_for_testing();
        fixture
    }

    /// Heap growing left enabled
    pub fn with_growing(config: HeapConfig, platform: DefaultPlatform) -> Self {
        let platform = Arc::new(platform);
        let heap = Heap::new(config, Arc::clone(&platform) as Arc<dyn ngc::Platform>)
            .expect("heap creation should succeed with a valid config");
        Self { heap, platform }
    }

    /// Allocate an [`Item`]
    ///
    /// **Bug this finds:** Allocation failures on a healthy heap
    pub fn item(&self, id: usize, log: &DropLog) -> NonNull<Item> {
        self.heap
            .make_garbage_collected(Item::new(id, log))
            .unwrap_or_else(|e| panic!("allocating item {} failed: {}", id, e))
    }

    /// Allocate a chain of items, returning its head
    pub fn chain(&self, ids: std::ops::Range<usize>, log: &DropLog) -> NonNull<Item> {
        let mut head: Option<NonNull<Item>> = None;
        for id in ids.rev() {
            let item = self.item(id, log);
            // SAFETY: just allocated and not yet visible to any collection.
            unsafe { item.as_ref() }.next.set(head);
            head = Some(item);
        }
        head.expect("chain must not be empty")
    }

    /// Precise atomic collection with atomic sweeping
    pub fn collect(&self) {
        self.heap.collect_garbage(PRECISE);
    }

    /// Run every pending foreground task
    pub fn pump(&self) -> usize {
        self.platform.run_until_idle()
    }

    /// Sum of live object bytes over all pages
    pub fn live_bytes(&self) -> usize {
        self.heap.page_statistics().iter().map(|page| page.live_bytes).sum()
    }

    /// Number of marked headers left on the heap
    pub fn marked_objects(&self) -> usize {
        let raw_heap = self.heap.raw_heap();
        let mut marked = 0;
        for space in raw_heap.spaces() {
            for page in raw_heap.pages_of(space) {
                page.iterate_headers(|header| {
                    if !header.is_free() && header.is_marked() {
                        marked += 1;
                    }
                });
            }
        }
        marked
    }
}

/// ============================================================================
/// ASSERTIONS
/// ============================================================================

/// Every id in `ids` was finalized exactly once
pub fn assert_finalized_once(log: &DropLog, ids: impl IntoIterator<Item = usize>, context: &str) {
    for id in ids {
        let times = log.times_finalized(id);
        assert_eq!(times, 1, "{}: object {} finalized {} times", context, id, times);
    }
}

/// No id in `ids` was finalized
pub fn assert_alive(log: &DropLog, ids: impl IntoIterator<Item = usize>, context: &str) {
    for id in ids {
        assert!(!log.contains(id), "{}: live object {} was finalized", context, id);
    }
}

/// Walk a chain and collect its ids
pub fn chain_ids(head: NonNull<Item>) -> Vec<usize> {
    let mut ids = Vec::new();
    let mut current = Some(head);
    while let Some(item) = current {
        // SAFETY: callers only walk chains that are kept alive.
        let item = unsafe { item.as_ref() };
        ids.push(item.id);
        current = item.next.get();
    }
    ids
}
