//! Page-based arena allocator.
//!
//! One `mmap`-ed arena is cut into fixed 4 KiB pages. Requests below half a
//! page are served from power-of-two size classes carved out of single pages;
//! anything larger takes a run of contiguous pages (a span).
//!
//! ```rust
//! use pagealloc::{Allocator, PAGE_SIZE, PageState};
//!
//! let mut heap = Allocator::new(8 * PAGE_SIZE).unwrap();
//! let block = heap.allocate(100).unwrap();
//! let page = heap.page_of(block).unwrap();
//! assert!(matches!(heap.page_state(page), Some(PageState::Divided { class_size: 128, .. })));
//! heap.free(block).unwrap();
//! assert_eq!(heap.free_page_count(), 8);
//! ```
//!
//! The allocator is single-owner and not thread-safe: every method takes
//! `&mut self`, so sharing across threads needs an external lock.

use core::{
  fmt,
  ptr::{self, NonNull, null_mut},
};
use std::collections::VecDeque;

use log::{debug, trace, warn};
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

pub const PAGE_SIZE: usize = 4096;

/// Smallest block handed out; smaller requests are rounded up to it.
pub const MIN_BLOCK_SIZE: usize = 16;

/// Largest size class. Requests at or above this go to the span path.
const MAX_CLASS_SIZE: usize = PAGE_SIZE / 2;

/// Number of power-of-two classes between `MIN_BLOCK_SIZE` and `MAX_CLASS_SIZE`.
pub const CLASS_COUNT: usize =
  (MAX_CLASS_SIZE.trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros()) as usize + 1;

/// Block index inside a page.
type BlockIdx = u16;

/// Address checks on `free`/`reallocate`/`usable_size` beyond the arena bounds.
const VALIDATE_ADDRESSES: bool = !cfg!(feature = "trusted-free");

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(MIN_BLOCK_SIZE.is_power_of_two());
const _: () = assert!(MIN_BLOCK_SIZE <= MAX_CLASS_SIZE);
const _: () = assert!(class_to_size(0) == MIN_BLOCK_SIZE);
const _: () = assert!(class_to_size(CLASS_COUNT - 1) == MAX_CLASS_SIZE);
const _: () = assert!(PAGE_SIZE % MAX_CLASS_SIZE == 0);
const _: () = assert!(PAGE_SIZE / MIN_BLOCK_SIZE <= BlockIdx::MAX as usize + 1);

// =============================================================================
// Types
// =============================================================================

/// Index of a page inside the arena.
pub type PageId = usize;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
  #[error("invalid arena size: {requested} bytes")]
  InvalidSize { requested: usize },
  #[error("out of memory for {requested} bytes: {cause}")]
  OutOfMemory { requested: usize, cause: OomCause },
  #[error("arena mmap of {bytes} bytes failed")]
  MapFailed { bytes: usize },
  #[error("address {addr:#x} is not a live allocation of this arena")]
  InvalidAddress { addr: usize },
}

impl AllocError {
  pub fn is_out_of_memory(&self) -> bool {
    matches!(self, Self::OutOfMemory { .. })
  }
}

/// Why an allocation could not be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OomCause {
  /// A small request needed a fresh page and the free page pool is empty.
  NoFreePage,
  /// Fewer free pages in total than the span needs.
  NotEnoughPages,
  /// Enough free pages exist, but no run of them is contiguous.
  NoContiguousRun,
}

impl fmt::Display for OomCause {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      OomCause::NoFreePage => "no free pages",
      OomCause::NotEnoughPages => "not enough space",
      OomCause::NoContiguousRun => "not enough consecutive pages",
    })
  }
}

/// Public view of one page directory entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageState {
  Free,
  Divided { class_size: usize, free_blocks: usize },
  MultiPage { head: PageId, pages: usize },
}

/// Span metadata. Every page of a span carries a copy so that any of them
/// can be traced back to the head.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct SpanInfo {
  head: PageId,
  pages: usize,
}

impl SpanInfo {
  #[inline]
  fn bytes(&self) -> usize {
    self.pages * PAGE_SIZE
  }
}

/// A page split into blocks of one class.
#[derive(Debug)]
struct DividedPage {
  class: usize,
  /// Free block indices, used as a stack. The top is the next block handed out.
  free: Vec<BlockIdx>,
  /// Registered in the class pool (has at least one free block).
  pooled: bool,
}

impl DividedPage {
  fn new(class: usize) -> Self {
    let blocks = PAGE_SIZE / class_to_size(class);
    // Reverse so that block 0 sits on top and blocks come out in address order.
    let free = (0..blocks).rev().map(|b| b as BlockIdx).collect();
    Self {
      class,
      free,
      pooled: true,
    }
  }

  #[inline]
  fn capacity(&self) -> usize {
    PAGE_SIZE / class_to_size(self.class)
  }
}

#[derive(Debug)]
enum Page {
  Free,
  Divided(DividedPage),
  Span(SpanInfo),
}

/// A live allocation resolved from an address.
#[derive(Clone, Copy, Debug)]
enum Region {
  Block {
    page: PageId,
    block: BlockIdx,
    class: usize,
  },
  Span(SpanInfo),
}

impl Region {
  fn size(&self) -> usize {
    match self {
      Region::Block { class, .. } => class_to_size(*class),
      Region::Span(span) => span.bytes(),
    }
  }
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Hand physical pages back to the OS. Contents read as zero afterwards.
#[cfg(feature = "release-mem")]
unsafe fn os_release(ptr: *mut u8, size: usize) {
  unsafe { libc::madvise(ptr.cast(), size, libc::MADV_DONTNEED) };
}

// =============================================================================
// Arena
// =============================================================================

/// Owns the mapped storage. Pages are addressed by index only.
struct Arena {
  base: NonNull<u8>,
  len: usize,
}

// The mapping is exclusively owned; moving it across threads is fine.
unsafe impl Send for Arena {}

impl Arena {
  fn map(pages: usize) -> Result<Self, AllocError> {
    let len = pages * PAGE_SIZE;
    let raw = unsafe { os_mmap(len) };
    let base = NonNull::new(raw).ok_or(AllocError::MapFailed { bytes: len })?;
    debug_assert_eq!(base.as_ptr() as usize % PAGE_SIZE, 0);
    Ok(Self { base, len })
  }

  #[inline]
  fn ptr_at(&self, offset: usize) -> NonNull<u8> {
    debug_assert!(offset < self.len);
    unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
  }

  /// Resolve an address to `(page, offset within page)`.
  #[inline]
  fn resolve(&self, addr: usize) -> Option<(PageId, usize)> {
    let offset = addr.checked_sub(self.base.as_ptr() as usize)?;
    if offset >= self.len {
      return None;
    }
    Some((offset / PAGE_SIZE, offset % PAGE_SIZE))
  }

  #[cfg(feature = "release-mem")]
  fn release(&self, first: PageId, count: usize) {
    let ptr = self.ptr_at(first * PAGE_SIZE);
    unsafe { os_release(ptr.as_ptr(), count * PAGE_SIZE) };
  }

  #[cfg(not(feature = "release-mem"))]
  #[inline(always)]
  fn release(&self, _first: PageId, _count: usize) {}
}

impl Drop for Arena {
  fn drop(&mut self) {
    unsafe { os_munmap(self.base.as_ptr(), self.len) };
  }
}

// =============================================================================
// Allocator
// =============================================================================

pub struct Allocator {
  arena: Arena,
  /// One entry per page.
  directory: Vec<Page>,
  /// Pages in the `Free` state, used as a stack.
  free_pages: Vec<PageId>,
  /// Per class, divided pages with at least one free block. Oldest first.
  class_pools: [VecDeque<PageId>; CLASS_COUNT],
}

impl Allocator {
  /// Map an arena of at least `total_bytes`, rounded up to whole pages.
  pub fn new(total_bytes: usize) -> Result<Self, AllocError> {
    let invalid = AllocError::InvalidSize {
      requested: total_bytes,
    };
    if total_bytes == 0 {
      return Err(invalid);
    }
    let page_count = total_bytes.div_ceil(PAGE_SIZE);
    page_count.checked_mul(PAGE_SIZE).ok_or(invalid)?;

    // Bookkeeping first: an arena too large to track is a size error, not an abort.
    let mut directory = Vec::new();
    let mut free_pages = Vec::new();
    directory
      .try_reserve_exact(page_count)
      .map_err(|_| invalid)?;
    free_pages
      .try_reserve_exact(page_count)
      .map_err(|_| invalid)?;

    let arena = Arena::map(page_count)?;
    let mut heap = Self {
      arena,
      directory,
      free_pages,
      class_pools: Default::default(),
    };
    heap.rebuild();

    debug!(
      "arena mapped: {} pages at {:p} ({} bytes requested)",
      page_count,
      heap.arena.base,
      total_bytes
    );
    Ok(heap)
  }

  /// Reset every page to `Free` and refill the free page pool.
  fn rebuild(&mut self) {
    let page_count = self.arena.len / PAGE_SIZE;
    self.directory.clear();
    self.directory.resize_with(page_count, || Page::Free);
    self.free_pages.clear();
    self.free_pages.extend(0..page_count);
    for pool in &mut self.class_pools {
      pool.clear();
    }
  }

  /// Release the arena. Equivalent to dropping the allocator.
  pub fn destroy(self) {
    debug!("arena at {:p} destroyed", self.arena.base);
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  /// Requests below half a page are served from a size class, everything
  /// else from a run of contiguous pages. Zero-sized requests get the
  /// smallest class.
  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let result = if fits_in_class(size) {
      self.alloc_small(size)
    } else {
      self.alloc_large(size)
    };

    if let Err(err) = &result {
      warn!("allocation of {} bytes failed: {}", size, err);
    }
    result
  }

  /// Like [`allocate`](Self::allocate), with the first `size` bytes zeroed.
  pub fn allocate_zeroed(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let ptr = self.allocate(size)?;
    unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
    Ok(ptr)
  }

  fn alloc_small(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let class = size_to_class(size);
    let page = match self.class_pools[class].front() {
      Some(&page) => page,
      None => self.divide_free_page(class, size)?,
    };
    Ok(self.alloc_block(page))
  }

  /// Take a page off the free pool and split it into blocks of `class`.
  fn divide_free_page(&mut self, class: usize, requested: usize) -> Result<PageId, AllocError> {
    let page = self
      .free_pages
      .pop()
      .ok_or(AllocError::OutOfMemory {
        requested,
        cause: OomCause::NoFreePage,
      })?;

    self.directory[page] = Page::Divided(DividedPage::new(class));
    self.class_pools[class].push_back(page);

    debug!(
      "page {} divided into {} blocks of {} bytes",
      page,
      PAGE_SIZE / class_to_size(class),
      class_to_size(class)
    );
    Ok(page)
  }

  /// Pop a block from a pooled page. Full pages leave the pool.
  fn alloc_block(&mut self, page: PageId) -> NonNull<u8> {
    let Page::Divided(divided) = &mut self.directory[page] else {
      unreachable!("page {page} in a class pool is not divided");
    };
    let Some(block) = divided.free.pop() else {
      unreachable!("page {page} in a class pool has no free block");
    };

    if divided.free.is_empty() {
      divided.pooled = false;
      // The page was taken from the front of its pool.
      let front = self.class_pools[divided.class].pop_front();
      debug_assert_eq!(front, Some(page));
    }

    let class_size = class_to_size(divided.class);
    let ptr = self
      .arena
      .ptr_at(page * PAGE_SIZE + block as usize * class_size);
    trace!("block {} of page {} ({} bytes) -> {:p}", block, page, class_size, ptr);
    ptr
  }

  /// First fit over the directory in page order.
  fn alloc_large(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let amount = size.div_ceil(PAGE_SIZE);
    if amount > self.free_pages.len() {
      return Err(AllocError::OutOfMemory {
        requested: size,
        cause: OomCause::NotEnoughPages,
      });
    }

    let mut run = 0;
    let mut head = None;
    for (idx, page) in self.directory.iter().enumerate() {
      if matches!(page, Page::Free) {
        run += 1;
        if run == amount {
          head = Some(idx + 1 - amount);
          break;
        }
      } else {
        run = 0;
      }
    }
    let head = head.ok_or(AllocError::OutOfMemory {
      requested: size,
      cause: OomCause::NoContiguousRun,
    })?;

    let span = SpanInfo {
      head,
      pages: amount,
    };
    let pages = head..head + amount;
    for page in pages.clone() {
      self.directory[page] = Page::Span(span);
    }
    self.free_pages.retain(|page| !pages.contains(page));

    debug!("span of {} pages reserved at page {}", amount, head);
    Ok(self.arena.ptr_at(head * PAGE_SIZE))
  }

  // ===========================================================================
  // Free / Realloc / Reset
  // ===========================================================================

  /// Resolve `ptr` to the live allocation it starts.
  fn lookup(&self, ptr: NonNull<u8>) -> Result<Region, AllocError> {
    let addr = ptr.as_ptr() as usize;
    let invalid = AllocError::InvalidAddress { addr };
    let (page, offset) = self.arena.resolve(addr).ok_or(invalid)?;

    match &self.directory[page] {
      Page::Free => Err(invalid),
      Page::Divided(divided) => {
        let class_size = class_to_size(divided.class);
        let block = (offset / class_size) as BlockIdx;
        if VALIDATE_ADDRESSES && (offset % class_size != 0 || divided.free.contains(&block)) {
          return Err(invalid);
        }
        Ok(Region::Block {
          page,
          block,
          class: divided.class,
        })
      }
      Page::Span(span) => {
        if VALIDATE_ADDRESSES && (span.head != page || offset != 0) {
          return Err(invalid);
        }
        Ok(Region::Span(*span))
      }
    }
  }

  /// Return a block or span to the allocator.
  ///
  /// Addresses outside the arena are always rejected. Unless built with
  /// `trusted-free`, addresses that are not the start of a live allocation
  /// (interior pointers, double frees) are rejected too.
  pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
    let region = self.lookup(ptr)?;
    self.release_region(region);
    Ok(())
  }

  fn release_region(&mut self, region: Region) {
    match region {
      Region::Block { page, block, class } => self.free_block(page, block, class),
      Region::Span(span) => self.free_span(span),
    }
  }

  fn free_block(&mut self, page: PageId, block: BlockIdx, class: usize) {
    let Page::Divided(divided) = &mut self.directory[page] else {
      unreachable!("block freed into page {page} which is not divided");
    };
    debug_assert_eq!(divided.class, class);
    divided.free.push(block);
    trace!("block {} of page {} freed", block, page);

    if divided.free.len() == divided.capacity() {
      self.directory[page] = Page::Free;
      self.class_pools[class].retain(|&p| p != page);
      self.free_pages.push(page);
      self.arena.release(page, 1);
      debug!("page {} fully free, returned to pool", page);
    } else if !divided.pooled {
      divided.pooled = true;
      self.class_pools[class].push_back(page);
    }
  }

  fn free_span(&mut self, span: SpanInfo) {
    for page in span.head..span.head + span.pages {
      self.directory[page] = Page::Free;
      self.free_pages.push(page);
    }
    self.arena.release(span.head, span.pages);
    debug!("span of {} pages at page {} released", span.pages, span.head);
  }

  /// Move an allocation into a fresh region of `new_size`.
  ///
  /// Copies `min(old capacity, new capacity)` bytes from the old region into
  /// the new one, then frees the old region. On failure the old allocation
  /// is left as it was.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation from this allocator, with no references
  /// into it alive across the call.
  pub unsafe fn reallocate(
    &mut self,
    ptr: NonNull<u8>,
    new_size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    let old = self.lookup(ptr)?;
    let new_ptr = self.allocate(new_size)?;

    let count = old.size().min(region_capacity(new_size));
    unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), count) };
    self.release_region(old);

    trace!("realloc {:p} -> {:p}, {} bytes moved", ptr, new_ptr, count);
    Ok(new_ptr)
  }

  /// Return every page to `Free` without unmapping the arena.
  ///
  /// All outstanding pointers dangle afterwards.
  pub fn free_all(&mut self) {
    self.rebuild();
    self.arena.release(0, self.page_count());
    debug!("all {} pages reset", self.page_count());
  }

  // ===========================================================================
  // Introspection
  // ===========================================================================

  pub fn page_count(&self) -> usize {
    self.directory.len()
  }

  pub fn free_page_count(&self) -> usize {
    self.free_pages.len()
  }

  pub fn page_state(&self, page: PageId) -> Option<PageState> {
    let state = match self.directory.get(page)? {
      Page::Free => PageState::Free,
      Page::Divided(divided) => PageState::Divided {
        class_size: class_to_size(divided.class),
        free_blocks: divided.free.len(),
      },
      Page::Span(span) => PageState::MultiPage {
        head: span.head,
        pages: span.pages,
      },
    };
    Some(state)
  }

  /// Page containing `ptr`, or `InvalidAddress` outside the arena.
  pub fn page_of(&self, ptr: NonNull<u8>) -> Result<PageId, AllocError> {
    let addr = ptr.as_ptr() as usize;
    self
      .arena
      .resolve(addr)
      .map(|(page, _)| page)
      .ok_or(AllocError::InvalidAddress { addr })
  }

  /// Capacity of the live allocation at `ptr`.
  pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, AllocError> {
    self.lookup(ptr).map(|region| region.size())
  }

  /// Pages currently offered for new blocks of `class_size`, or `None` if
  /// `class_size` is not a size class.
  pub fn class_pool_len(&self, class_size: usize) -> Option<usize> {
    if !class_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_CLASS_SIZE).contains(&class_size) {
      return None;
    }
    Some(self.class_pools[size_to_class(class_size)].len())
  }

  /// Human-readable snapshot of the page directory.
  pub fn dump(&self) -> String {
    self.to_string()
  }
}

// =============================================================================
// Diagnostics
// =============================================================================

impl fmt::Display for Allocator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "No of pages: {}", self.page_count())?;
    writeln!(f, "Page size: {}", PAGE_SIZE)?;
    writeln!(f, "No of free pages: {}", self.free_page_count())?;
    for (idx, page) in self.directory.iter().enumerate() {
      match page {
        Page::Free => writeln!(f, "Page {idx} Free")?,
        Page::Divided(divided) => writeln!(
          f,
          "Page {idx} Divided - Class size: {} - Free blocks: {}",
          class_to_size(divided.class),
          divided.free.len()
        )?,
        Page::Span(_) => writeln!(f, "Page {idx} Multiple")?,
      }
    }
    Ok(())
  }
}

impl fmt::Debug for Allocator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Allocator")
      .field("base", &self.arena.base)
      .field("pages", &self.page_count())
      .field("free_pages", &self.free_page_count())
      .finish_non_exhaustive()
  }
}

// =============================================================================
// Size Classes
// =============================================================================

#[inline(always)]
fn fits_in_class(size: usize) -> bool {
  size < MAX_CLASS_SIZE
}

/// Convert class index to block size.
#[inline(always)]
const fn class_to_size(class: usize) -> usize {
  MIN_BLOCK_SIZE << class
}

/// Smallest class whose block holds `size` bytes. `size` must fit a class.
#[inline(always)]
fn size_to_class(size: usize) -> usize {
  let rounded = size.max(MIN_BLOCK_SIZE).next_power_of_two();
  (rounded.trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros()) as usize
}

/// Bytes actually reserved for a request of `size`.
fn region_capacity(size: usize) -> usize {
  if fits_in_class(size) {
    class_to_size(size_to_class(size))
  } else {
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
  }
}
