//! Page access for tree traversal.
//!
//! The seek cursor reads pages through the [`PageCursor`] trait and never assumes a page is
//! stable: after each logical group of reads it calls [`PageCursor::should_retry`], and when that
//! returns `true` it discards everything it read and reads again.
//!
//! [`MemoryPageFile`] is the in-memory implementation. Every page sits behind a [`PageLatch`],
//! stores its bytes in atomics, and is allocated lazily. Page slots never move once allocated, so
//! readers follow page ids without taking any lock.

use std::io;
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::latch::{ExclusiveGuard, OptimisticGuard, PageLatch};
use crate::sync::{AtomicU8, AtomicUsize, Ordering};

/// A page identifier.
pub type PageId = u64;

/// Pointer value meaning "no node".
pub const NO_NODE: PageId = 0;

/// Page reserved for tree metadata; never a tree node.
pub const META_PAGE: PageId = 1;

/// Lowest page id that can hold a tree node.
pub const MIN_NODE_ID: PageId = 2;

/// Returns `true` if `id` can point at a tree node.
#[inline]
pub fn is_node(id: PageId) -> bool {
	id >= MIN_NODE_ID
}

/// Read access to the bytes of the current page.
///
/// Reads past the end of the page never panic: they return zero and record a cursor exception,
/// which the caller inspects once the read group has been validated.
pub trait PageRead {
	/// Size of a page in bytes.
	fn page_size(&self) -> usize;

	/// Reads a single byte.
	fn get_u8(&mut self, offset: usize) -> u8;

	/// Reads bytes into `dst`.
	fn get_bytes(&mut self, offset: usize, dst: &mut [u8]);

	/// Reads a little-endian `u16`.
	fn get_u16(&mut self, offset: usize) -> u16 {
		let mut buf = [0u8; 2];
		self.get_bytes(offset, &mut buf);
		u16::from_le_bytes(buf)
	}

	/// Reads a little-endian `u32`.
	fn get_u32(&mut self, offset: usize) -> u32 {
		let mut buf = [0u8; 4];
		self.get_bytes(offset, &mut buf);
		u32::from_le_bytes(buf)
	}

	/// Reads a little-endian `u64`.
	fn get_u64(&mut self, offset: usize) -> u64 {
		let mut buf = [0u8; 8];
		self.get_bytes(offset, &mut buf);
		u64::from_le_bytes(buf)
	}
}

/// Write access to the bytes of a page.
pub trait PageWrite {
	/// Writes a single byte.
	fn put_u8(&mut self, offset: usize, value: u8);

	/// Writes all of `src` starting at `offset`.
	fn put_bytes(&mut self, offset: usize, src: &[u8]);

	/// Writes a little-endian `u16`.
	fn put_u16(&mut self, offset: usize, value: u16) {
		self.put_bytes(offset, &value.to_le_bytes());
	}

	/// Writes a little-endian `u32`.
	fn put_u32(&mut self, offset: usize, value: u32) {
		self.put_bytes(offset, &value.to_le_bytes());
	}

	/// Writes a little-endian `u64`.
	fn put_u64(&mut self, offset: usize, value: u64) {
		self.put_bytes(offset, &value.to_le_bytes());
	}
}

/// A cursor over one page at a time with optimistic retry semantics.
pub trait PageCursor: PageRead {
	/// Positions the cursor on `page_id`. Starts a new read group.
	fn next(&mut self, page_id: PageId) -> Result<()>;

	/// Returns `true` if a writer modified the page since the read group started. The cursor is
	/// then reset for another attempt: the read group restarts and any cursor exception is
	/// cleared.
	fn should_retry(&mut self) -> Result<bool>;

	/// Records a problem noticed during an optimistic read. Only meaningful if the read turns out
	/// to be consistent.
	fn set_cursor_exception(&mut self, message: String);

	/// Drops any recorded cursor exception.
	fn clear_cursor_exception(&mut self);

	/// Takes the recorded cursor exception, if any.
	fn take_cursor_exception(&mut self) -> Option<String>;

	/// Fails with an I/O error if a cursor exception was recorded, clearing it.
	fn check_and_clear_cursor_exception(&mut self) -> Result<()> {
		match self.take_cursor_exception() {
			Some(message) => Err(Error::Io(io::Error::new(io::ErrorKind::InvalidData, message))),
			None => Ok(()),
		}
	}

	/// Opens an independent read cursor over the same file, used for scouting neighbours
	/// without moving this cursor.
	fn open_linked_cursor(&mut self) -> Result<Self>
	where
		Self: Sized;

	/// Releases the page. Idempotent.
	fn close(&mut self);
}

// ---------------------------------------------------------------------------
// In-memory pages
// ---------------------------------------------------------------------------

/// Bytes of a single page.
pub struct PageData {
	bytes: Box<[AtomicU8]>,
}

impl PageData {
	fn zeroed(page_size: usize) -> Self {
		PageData {
			bytes: (0..page_size).map(|_| AtomicU8::new(0)).collect(),
		}
	}

	#[inline]
	fn len(&self) -> usize {
		self.bytes.len()
	}

	#[inline]
	fn load(&self, offset: usize) -> u8 {
		self.bytes[offset].load(Ordering::Relaxed)
	}

	#[inline]
	fn store(&self, offset: usize, value: u8) {
		self.bytes[offset].store(value, Ordering::Relaxed)
	}
}

type PageSlot = PageLatch<PageData>;

/// A fixed-capacity, in-memory paged file.
///
/// Page ids below `max_pages` are always addressable; pages are zero-filled on first access.
pub struct MemoryPageFile {
	page_size: usize,
	pages: Box<[OnceLock<Box<PageSlot>>]>,
	next_id: AtomicUsize,
}

impl MemoryPageFile {
	/// Creates a file of `max_pages` pages of `page_size` bytes each.
	pub fn new(page_size: usize, max_pages: usize) -> Self {
		MemoryPageFile {
			page_size,
			pages: (0..max_pages).map(|_| OnceLock::new()).collect(),
			next_id: AtomicUsize::new(MIN_NODE_ID as usize),
		}
	}

	/// Size of each page in bytes.
	pub fn page_size(&self) -> usize {
		self.page_size
	}

	/// Number of addressable pages.
	pub fn max_pages(&self) -> usize {
		self.pages.len()
	}

	/// Number of pages handed out by [`allocate`](Self::allocate), including reserved ones.
	pub fn high_water_mark(&self) -> PageId {
		self.next_id.load(Ordering::Acquire) as PageId
	}

	/// Never-used pages still available to [`allocate`](Self::allocate).
	pub fn unallocated(&self) -> usize {
		self.pages.len().saturating_sub(self.next_id.load(Ordering::Acquire))
	}

	/// Hands out a never-used page id.
	pub fn allocate(&self) -> Result<PageId> {
		let id = self.next_id.fetch_add(1, Ordering::AcqRel);
		if id >= self.pages.len() {
			self.next_id.fetch_sub(1, Ordering::AcqRel);
			return Err(self.full());
		}
		Ok(id as PageId)
	}

	pub(crate) fn full(&self) -> Error {
		Error::Io(io::Error::new(
			io::ErrorKind::OutOfMemory,
			format!("page file is full ({} pages)", self.pages.len()),
		))
	}

	fn slot(&self, page_id: PageId) -> Result<&PageSlot> {
		if page_id == NO_NODE {
			return Err(Error::Io(io::Error::new(
				io::ErrorKind::InvalidInput,
				"attempted to access the no-node page",
			)));
		}
		let slot = self.pages.get(page_id as usize).ok_or_else(|| {
			Error::Io(io::Error::new(
				io::ErrorKind::UnexpectedEof,
				format!("page {page_id} is beyond the end of the file"),
			))
		})?;
		Ok(slot.get_or_init(|| Box::new(PageLatch::new(PageData::zeroed(self.page_size)))))
	}

	/// Opens a read cursor that is not positioned on any page.
	pub fn read_cursor(&self) -> MemoryPageCursor<'_> {
		MemoryPageCursor {
			file: self,
			page: None,
			page_id: NO_NODE,
			exception: None,
			closed: false,
		}
	}

	/// Locks `page_id` for writing.
	pub fn write(&self, page_id: PageId) -> Result<PageWriteGuard<'_>> {
		let slot = self.slot(page_id)?;
		Ok(PageWriteGuard {
			guard: slot.exclusive(),
			page_size: self.page_size,
		})
	}

	/// Reads `page_id` without validation.
	///
	/// Only the single writer may rely on this: it is the one party that knows the page cannot
	/// change underneath it.
	pub fn peek(&self, page_id: PageId) -> Result<PageView<'_>> {
		Ok(PageView {
			data: self.slot(page_id)?.data(),
		})
	}
}

/// Unvalidated view of a page, see [`MemoryPageFile::peek`].
pub struct PageView<'f> {
	data: &'f PageData,
}

impl PageRead for PageView<'_> {
	fn page_size(&self) -> usize {
		self.data.len()
	}

	fn get_u8(&mut self, offset: usize) -> u8 {
		if offset < self.data.len() {
			self.data.load(offset)
		} else {
			0
		}
	}

	fn get_bytes(&mut self, offset: usize, dst: &mut [u8]) {
		for (i, byte) in dst.iter_mut().enumerate() {
			*byte = self.get_u8(offset + i);
		}
	}
}

/// Exclusive write access to a page. Optimistic readers of the page retry while it is alive.
pub struct PageWriteGuard<'f> {
	guard: ExclusiveGuard<'f, PageData>,
	page_size: usize,
}

impl PageWriteGuard<'_> {
	/// Zeroes the whole page.
	pub fn clear(&mut self) {
		for offset in 0..self.page_size {
			self.guard.store(offset, 0);
		}
	}
}

impl PageRead for PageWriteGuard<'_> {
	fn page_size(&self) -> usize {
		self.page_size
	}

	fn get_u8(&mut self, offset: usize) -> u8 {
		self.guard.load(offset)
	}

	fn get_bytes(&mut self, offset: usize, dst: &mut [u8]) {
		for (i, byte) in dst.iter_mut().enumerate() {
			*byte = self.guard.load(offset + i);
		}
	}
}

impl PageWrite for PageWriteGuard<'_> {
	fn put_u8(&mut self, offset: usize, value: u8) {
		self.guard.store(offset, value);
	}

	fn put_bytes(&mut self, offset: usize, src: &[u8]) {
		for (i, byte) in src.iter().enumerate() {
			self.guard.store(offset + i, *byte);
		}
	}
}

/// Optimistic read cursor over a [`MemoryPageFile`].
pub struct MemoryPageCursor<'f> {
	file: &'f MemoryPageFile,
	page: Option<OptimisticGuard<'f, PageData>>,
	page_id: PageId,
	exception: Option<String>,
	closed: bool,
}

impl MemoryPageCursor<'_> {
	/// Returns `true` once [`close`](PageCursor::close) has been called.
	pub fn is_closed(&self) -> bool {
		self.closed
	}

	fn out_of_bounds(&mut self, offset: usize, len: usize) {
		if self.exception.is_none() {
			self.exception = Some(format!(
				"read of {len} bytes at offset {offset} is out of bounds on page {} (page size {})",
				self.page_id, self.file.page_size
			));
		}
	}
}

impl PageRead for MemoryPageCursor<'_> {
	fn page_size(&self) -> usize {
		self.file.page_size
	}

	fn get_u8(&mut self, offset: usize) -> u8 {
		let value = match self.page.as_ref() {
			Some(page) if offset < page.len() => Some(page.load(offset)),
			_ => None,
		};
		value.unwrap_or_else(|| {
			self.out_of_bounds(offset, 1);
			0
		})
	}

	fn get_bytes(&mut self, offset: usize, dst: &mut [u8]) {
		let in_bounds = match self.page.as_ref() {
			Some(page) => offset.checked_add(dst.len()).is_some_and(|end| end <= page.len()),
			None => false,
		};
		match self.page.as_ref() {
			Some(page) if in_bounds => {
				for (i, byte) in dst.iter_mut().enumerate() {
					*byte = page.load(offset + i);
				}
			}
			_ => {
				dst.fill(0);
				self.out_of_bounds(offset, dst.len());
			}
		}
	}
}

impl<'f> PageCursor for MemoryPageCursor<'f> {
	fn next(&mut self, page_id: PageId) -> Result<()> {
		if self.closed {
			return Err(Error::Io(io::Error::new(
				io::ErrorKind::BrokenPipe,
				"page cursor is closed",
			)));
		}
		let slot = self.file.slot(page_id)?;
		self.page = Some(slot.optimistic_or_spin());
		self.page_id = page_id;
		self.exception = None;
		Ok(())
	}

	fn should_retry(&mut self) -> Result<bool> {
		match self.page.as_mut() {
			Some(page) => {
				if page.recheck() {
					Ok(false)
				} else {
					page.restart();
					self.exception = None;
					Ok(true)
				}
			}
			None => Ok(false),
		}
	}

	fn set_cursor_exception(&mut self, message: String) {
		self.exception = Some(message);
	}

	fn clear_cursor_exception(&mut self) {
		self.exception = None;
	}

	fn take_cursor_exception(&mut self) -> Option<String> {
		self.exception.take()
	}

	fn open_linked_cursor(&mut self) -> Result<Self> {
		if self.closed {
			return Err(Error::Io(io::Error::new(
				io::ErrorKind::BrokenPipe,
				"page cursor is closed",
			)));
		}
		Ok(self.file.read_cursor())
	}

	fn close(&mut self) {
		self.page = None;
		self.page_id = NO_NODE;
		self.exception = None;
		self.closed = true;
	}
}
