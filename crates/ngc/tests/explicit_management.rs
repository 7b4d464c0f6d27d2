//! Explicit Management Tests - Manual free and in-place resize
//!
//! These tests verify that:
//! - Freed objects are finalized exactly once and their memory is reusable
//! - Frees adjacent to the allocation buffer grow the buffer, not the free list
//! - Resizes succeed only when they fit in place and leave the object intact otherwise
//! - Neither operation is allowed while a collection is in progress
//!
//! ============================================================================
//! EACH TEST FINDS SPECIFIC EXPLICIT MANAGEMENT BUGS - DO NOT WEAKEN ASSERTIONS
//! ============================================================================

mod common;

use common::{assert_finalized_once, DropLog, HeapFixture, Item};
use ngc::config::KB;
use ngc::object::HeapObjectHeader;
use ngc::{GarbageCollected, GcConfig, HeapConfig, MarkingType, Visitor};
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::Arc;

struct Bytes;

impl GarbageCollected for Bytes {
    fn trace(&self, _visitor: &mut dyn Visitor) {}
}

fn allocate(fixture: &HeapFixture, size: usize) -> NonNull<u8> {
    let gc_info = fixture.heap.register_type::<Bytes>().unwrap();
    fixture
        .heap
        .allocate_object(size, 8, None, gc_info)
        .unwrap()
        .mark_fully_constructed()
}

fn allocated_size(payload: NonNull<u8>) -> usize {
    // SAFETY: tests only pass payloads of live objects.
    unsafe { HeapObjectHeader::from_payload(payload.as_ptr() as usize) }.allocated_size()
}

/// (buffer start, buffer size, free-list entries) of the space holding `payload`
fn space_state(fixture: &HeapFixture, payload: NonNull<u8>) -> (usize, usize, usize) {
    let raw_heap = fixture.heap.raw_heap();
    let page = raw_heap.lookup_page(payload.as_ptr() as usize).unwrap();
    let state = raw_heap.space(page.space_index()).lock();
    (state.lab.start(), state.lab.size(), state.free_list.len())
}

/// ============================================================================
/// FREE TESTS
/// ============================================================================

/// Freeing the object just below the buffer folds it into the buffer
///
/// **Bug this finds:** Adjacent frees fragmenting the free list
/// **Invariant verified:** buffer grows by exactly the freed size, free list unchanged
#[test]
fn test_free_adjacent_to_buffer_extends_buffer() {
    // Arrange
    let fixture = HeapFixture::with_defaults();
    let first = allocate(&fixture, 40);
    let second = allocate(&fixture, 40);
    let freed = allocated_size(second);
    let (start_before, size_before, entries_before) = space_state(&fixture, second);

    // Act
    fixture.heap.free_unreferenced_object(second);

    // Assert
    let (start_after, size_after, entries_after) = space_state(&fixture, first);
    assert_eq!(size_after, size_before + freed);
    assert_eq!(start_after, start_before - freed);
    assert_eq!(entries_after, entries_before, "adjacent free must not touch the free list");
}

/// Freeing an object in the middle of a page adds a free-list entry
#[test]
fn test_free_in_the_middle_goes_to_free_list() {
    // Arrange
    let fixture = HeapFixture::with_defaults();
    let first = allocate(&fixture, 40);
    let second = allocate(&fixture, 40);
    let (_, size_before, entries_before) = space_state(&fixture, second);

    // Act
    fixture.heap.free_unreferenced_object(first);

    // Assert
    let (_, size_after, entries_after) = space_state(&fixture, second);
    assert_eq!(size_after, size_before);
    assert_eq!(entries_after, entries_before + 1);
}

/// Explicitly freed objects are finalized once, never again by a collection
///
/// **Bug this finds:** Double finalization of freed memory
#[test]
fn test_explicit_free_finalizes_once() {
    // Arrange
    let fixture = HeapFixture::with_defaults();
    let log = DropLog::new();
    let item = fixture.item(1, &log);

    // Act
    fixture.heap.free_unreferenced_object(item);
    let after_free = log.count();
    fixture.collect();
    fixture.collect();

    // Assert
    assert_eq!(after_free, 1);
    assert_finalized_once(&log, [1], "explicitly freed item");
}

/// Freed memory is reused by the next allocation of the same size
#[test]
fn test_freed_memory_is_reused() {
    // Arrange
    let fixture = HeapFixture::with_defaults();
    let log = DropLog::new();
    let _keep = fixture.item(0, &log);
    let freed = fixture.item(1, &log);
    let address = freed.as_ptr() as usize;

    // Act
    fixture.heap.free_unreferenced_object(freed);
    let reused = fixture.item(2, &log);

    // Assert
    assert_eq!(reused.as_ptr() as usize, address);
}

/// Freeing a large object returns its page
#[test]
fn test_free_large_object_releases_page() {
    // Arrange
    let fixture = HeapFixture::with_defaults();
    let large = allocate(&fixture, 128 * KB);
    let pages_before = fixture.heap.raw_heap().page_count();

    // Act
    fixture.heap.free_unreferenced_object(large);

    // Assert
    assert_eq!(fixture.heap.raw_heap().page_count(), pages_before - 1);
    assert!(fixture.heap.raw_heap().lookup_page(large.as_ptr() as usize).is_none());
}

/// ============================================================================
/// RESIZE TESTS
/// ============================================================================

/// Growing the last object takes bytes from the buffer
///
/// **Bug this finds:** Grow succeeding without reserving the new bytes
#[test]
fn test_grow_into_buffer() {
    // Arrange
    let fixture = HeapFixture::with_defaults();
    let object = allocate(&fixture, 40);
    let old_size = allocated_size(object);
    let (_, buffer_before, _) = space_state(&fixture, object);

    // Act
    let resized = fixture.heap.resize_object(object, 40 + 64);

    // Assert
    assert!(resized);
    assert_eq!(allocated_size(object), old_size + 64);
    let (_, buffer_after, _) = space_state(&fixture, object);
    assert_eq!(buffer_after, buffer_before - 64);
}

/// Growing past the buffer fails and leaves the object untouched
///
/// **Bug this finds:** Partial resize corrupting the header
/// **Invariant verified:** a failed resize does not change the object size
#[test]
fn test_grow_beyond_buffer_fails() {
    // Arrange
    let fixture = HeapFixture::with_defaults();
    let object = allocate(&fixture, 40);
    let old_size = allocated_size(object);
    let (_, buffer, _) = space_state(&fixture, object);

    // Act
    let resized = fixture.heap.resize_object(object, 40 + buffer + 64);

    // Assert
    assert!(!resized);
    assert_eq!(allocated_size(object), old_size);
}

/// Objects not at the buffer boundary cannot grow
#[test]
fn test_grow_not_adjacent_to_buffer_fails() {
    let fixture = HeapFixture::with_defaults();
    let first = allocate(&fixture, 40);
    let _second = allocate(&fixture, 40);
    let old_size = allocated_size(first);

    assert!(!fixture.heap.resize_object(first, 80));
    assert_eq!(allocated_size(first), old_size);
}

/// Shrinking hands the tail back, to the buffer or the free list
///
/// **Bug this finds:** Shrunk tails lost to the heap
#[test]
fn test_shrink_returns_tail() {
    // Arrange
    let fixture = HeapFixture::with_defaults();
    let first = allocate(&fixture, 200);
    let second = allocate(&fixture, 200);
    let (_, buffer_before, entries_before) = space_state(&fixture, second);
    let second_size = allocated_size(second);

    // Act
    let shrunk_middle = fixture.heap.resize_object(first, 64);
    let shrunk_last = fixture.heap.resize_object(second, 64);

    // Assert
    assert!(shrunk_middle && shrunk_last);
    let (_, buffer_after, entries_after) = space_state(&fixture, second);
    assert_eq!(entries_after, entries_before + 1, "middle tail goes to the free list");
    assert_eq!(buffer_after, buffer_before + second_size - allocated_size(second));
}

/// Resizing to the same size class is a no-op that succeeds
#[test]
fn test_resize_to_same_size_succeeds() {
    let fixture = HeapFixture::with_defaults();
    let object = allocate(&fixture, 40);
    let size = allocated_size(object);

    assert!(fixture.heap.resize_object(object, 40));
    assert_eq!(allocated_size(object), size);
}

/// Large objects are never resized in place
#[test]
fn test_resize_large_object_fails() {
    let fixture = HeapFixture::with_defaults();
    let large = allocate(&fixture, 128 * KB);

    assert!(!fixture.heap.resize_object(large, 64 * KB));
}

/// An explicit free runs the pre-finalizer before the finalizer
#[test]
fn test_free_runs_prefinalizer_first() {
    // Arrange
    let fixture = HeapFixture::with_defaults();
    let log = DropLog::new();
    let item = fixture.item(1, &log);
    let finalized_before = Arc::new(Mutex::new(None));
    fixture
        .heap
        .register_prefinalizer(item, {
            let finalized_before = Arc::clone(&finalized_before);
            let log = log.clone();
            move |_: &Item| *finalized_before.lock() = Some(log.count())
        })
        .unwrap();

    // Act
    fixture.heap.free_unreferenced_object(item);
    fixture.collect();

    // Assert
    assert_eq!(*finalized_before.lock(), Some(0));
    assert_finalized_once(&log, [1], "explicitly freed item");
}

/// ============================================================================
/// PHASE PRECONDITION TESTS
/// ============================================================================

fn incremental_fixture() -> HeapFixture {
    HeapFixture::with_config(HeapConfig {
        marking_support: MarkingType::Incremental,
        ..HeapConfig::default()
    })
}

/// Freeing while marking is a contract violation
///
/// **Bug this finds:** Memory handed back while a marker may still visit it
#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "called while a collection is in progress")]
fn test_free_during_marking_panics_in_debug() {
    let fixture = incremental_fixture();
    let log = DropLog::new();
    let item = fixture.item(1, &log);
    fixture
        .heap
        .start_incremental_garbage_collection(GcConfig::precise_incremental());

    fixture.heap.free_unreferenced_object(item);
}

/// Resizing while sweeping is a contract violation
#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "called while a collection is in progress")]
fn test_resize_during_sweeping_panics_in_debug() {
    let fixture = HeapFixture::with_defaults();
    let object = allocate(&fixture, 40);
    let _root = fixture.heap.persistent(Some(object.cast::<Bytes>()));
    fixture.item(1, &DropLog::new());
    fixture
        .heap
        .collect_garbage(GcConfig::precise_atomic().with_sweeping_type(ngc::SweepingType::Incremental));
    assert!(fixture.heap.is_sweeping());

    fixture.heap.resize_object(object, 80);
}

/// Release builds ignore frees and resizes during a collection
///
/// **Invariant verified:** the object is neither finalized nor resized
#[cfg(not(debug_assertions))]
#[test]
fn test_free_and_resize_during_marking_are_ignored() {
    // Arrange
    let fixture = incremental_fixture();
    let log = DropLog::new();
    let item = fixture.item(1, &log);
    let _root = fixture.heap.persistent(Some(item));
    let object = allocate(&fixture, 40);
    let _object_root = fixture.heap.persistent(Some(object.cast::<Bytes>()));
    let size = allocated_size(object);
    fixture
        .heap
        .start_incremental_garbage_collection(GcConfig::precise_incremental());

    // Act
    fixture.heap.free_unreferenced_object(item);
    let resized = fixture.heap.resize_object(object, 80);

    // Assert
    assert!(!resized);
    assert_eq!(allocated_size(object), size);
    assert_eq!(log.count(), 0);
}
