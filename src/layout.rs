//! Key/value layout: ordering, sizing and (de)serialization of the abstract key and value types.
//!
//! Keys and values have a fixed on-page size. The seek cursor reads them into buffers it created
//! up front with [`Layout::new_key`] / [`Layout::new_value`], so reading a key from a page never
//! allocates.

use std::cmp::Ordering;
use std::fmt::Debug;

use crate::page::{PageRead, PageWrite};

/// Ordering and serialization for the keys and values stored in a tree.
pub trait Layout: Send + Sync {
	/// Key type.
	type Key: Clone + Debug + Send;
	/// Value type.
	type Value: Clone + Debug + Send;

	/// On-page size of a key.
	fn key_size(&self) -> usize;

	/// On-page size of a value.
	fn value_size(&self) -> usize;

	/// Creates a key buffer.
	fn new_key(&self) -> Self::Key;

	/// Creates a value buffer.
	fn new_value(&self) -> Self::Value;

	/// Total order over keys.
	fn compare(&self, a: &Self::Key, b: &Self::Key) -> Ordering;

	/// Copies `src` into `dst`, reusing `dst`'s storage where possible.
	fn copy_key(&self, src: &Self::Key, dst: &mut Self::Key) {
		dst.clone_from(src);
	}

	/// Copies `src` into `dst`, reusing `dst`'s storage where possible.
	fn copy_value(&self, src: &Self::Value, dst: &mut Self::Value) {
		dst.clone_from(src);
	}

	/// Reads a key at `offset` into `into`.
	fn read_key<P: PageRead + ?Sized>(&self, page: &mut P, offset: usize, into: &mut Self::Key);

	/// Reads a value at `offset` into `into`.
	fn read_value<P: PageRead + ?Sized>(
		&self,
		page: &mut P,
		offset: usize,
		into: &mut Self::Value,
	);

	/// Writes `key` at `offset`.
	fn write_key<P: PageWrite + ?Sized>(&self, page: &mut P, offset: usize, key: &Self::Key);

	/// Writes `value` at `offset`.
	fn write_value<P: PageWrite + ?Sized>(&self, page: &mut P, offset: usize, value: &Self::Value);
}

/// `u64` keys and values.
///
/// Keys may be padded with `key_padding` unused bytes to make nodes hold fewer keys, which is how
/// tests force deep trees and frequent splits on small pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct U64Layout {
	key_padding: usize,
}

impl U64Layout {
	/// Eight-byte keys and values.
	pub fn new() -> Self {
		U64Layout {
			key_padding: 0,
		}
	}

	/// Keys take `8 + key_padding` bytes on the page.
	pub fn with_key_padding(key_padding: usize) -> Self {
		U64Layout {
			key_padding,
		}
	}
}

impl Layout for U64Layout {
	type Key = u64;
	type Value = u64;

	#[inline]
	fn key_size(&self) -> usize {
		8 + self.key_padding
	}

	#[inline]
	fn value_size(&self) -> usize {
		8
	}

	fn new_key(&self) -> u64 {
		0
	}

	fn new_value(&self) -> u64 {
		0
	}

	#[inline]
	fn compare(&self, a: &u64, b: &u64) -> Ordering {
		a.cmp(b)
	}

	#[inline]
	fn copy_key(&self, src: &u64, dst: &mut u64) {
		*dst = *src;
	}

	#[inline]
	fn copy_value(&self, src: &u64, dst: &mut u64) {
		*dst = *src;
	}

	#[inline]
	fn read_key<P: PageRead + ?Sized>(&self, page: &mut P, offset: usize, into: &mut u64) {
		*into = page.get_u64(offset);
	}

	#[inline]
	fn read_value<P: PageRead + ?Sized>(&self, page: &mut P, offset: usize, into: &mut u64) {
		*into = page.get_u64(offset);
	}

	#[inline]
	fn write_key<P: PageWrite + ?Sized>(&self, page: &mut P, offset: usize, key: &u64) {
		page.put_u64(offset, *key);
	}

	#[inline]
	fn write_value<P: PageWrite + ?Sized>(&self, page: &mut P, offset: usize, value: &u64) {
		page.put_u64(offset, *value);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn padding_widens_keys_only() {
		let layout = U64Layout::with_key_padding(24);
		assert_eq!(layout.key_size(), 32);
		assert_eq!(layout.value_size(), 8);
		assert_eq!(layout.compare(&3, &7), Ordering::Less);
	}
}
