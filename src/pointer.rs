//! Generation-safe pointer pairs (GSPP).
//!
//! A logical pointer is stored as two slots. Each slot carries the generation it was written in,
//! the pointer itself and a checksum over both:
//!
//! ```text
//! ┌──────────── slot A (18 bytes) ────────────┬──────────── slot B (18 bytes) ────────────┐
//! │ generation u64 │ pointer u64 │ checksum u16 │ generation u64 │ pointer u64 │ checksum u16 │
//! └───────────────────────────────────────────┴───────────────────────────────────────────┘
//! ```
//!
//! The writer only ever overwrites the slot that no reader of the current stable state relies on,
//! so the previous value stays readable until the next checkpoint makes the new one stable. A
//! reader classifies both slots against its [`Generation`] snapshot and picks one, or reports a
//! [`PointerFailure`] telling it to catch up with the current generation and read again.

use std::fmt;

use crate::generation::Generation;
use crate::page::{PageId, PageRead, PageWrite, NO_NODE};

/// Size of a single slot.
pub const SLOT_SIZE: usize = 18;

/// Size of a pointer pair.
pub const PAIR_SIZE: usize = 2 * SLOT_SIZE;

const POINTER_OFFSET: usize = 8;
const CHECKSUM_OFFSET: usize = 16;

/// Classification of a single slot against a generation snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
	/// Never written.
	Empty,
	/// Checksum mismatch, a torn or garbage slot.
	Broken,
	/// Written in a generation that neither became stable nor is the current one.
	Crash,
	/// Written at or before the stable generation.
	Stable,
	/// Written in the current unstable generation.
	Unstable,
	/// Written in a generation newer than the reader knows about.
	GenerationAhead,
}

/// Why a pointer pair could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerFailure {
	/// A slot is newer than the reader's snapshot. Catch up and retry.
	GenerationAhead,
	/// Both slots are equally plausible.
	Ambiguous,
	/// Neither slot holds a usable pointer.
	NoValidSlot,
}

impl fmt::Display for PointerFailure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			PointerFailure::GenerationAhead => f.write_str("pointer generation is ahead of snapshot"),
			PointerFailure::Ambiguous => f.write_str("both pointer slots are equally current"),
			PointerFailure::NoValidSlot => f.write_str("no valid pointer slot"),
		}
	}
}

/// A resolved pointer and the generation it was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationSafePointer {
	/// Target page, or [`NO_NODE`].
	pub pointer: PageId,
	/// Generation of the slot the pointer was read from.
	pub generation: u64,
}

impl GenerationSafePointer {
	/// The "no node" pointer.
	pub const NONE: GenerationSafePointer = GenerationSafePointer {
		pointer: NO_NODE,
		generation: 0,
	};

	/// Returns `true` if the pointer names no node.
	#[inline]
	pub fn is_none(&self) -> bool {
		self.pointer == NO_NODE
	}
}

#[derive(Debug, Clone, Copy)]
struct Slot {
	generation: u64,
	pointer: PageId,
	checksum: u16,
}

/// Checksum of a slot's generation and pointer, CRC32 folded to 16 bits.
pub fn checksum(generation: u64, pointer: PageId) -> u16 {
	let mut hasher = crc32fast::Hasher::new();
	hasher.update(&generation.to_le_bytes());
	hasher.update(&pointer.to_le_bytes());
	let crc = hasher.finalize();
	((crc >> 16) ^ (crc & 0xFFFF)) as u16
}

fn read_slot<P: PageRead + ?Sized>(page: &mut P, offset: usize) -> Slot {
	Slot {
		generation: page.get_u64(offset),
		pointer: page.get_u64(offset + POINTER_OFFSET),
		checksum: page.get_u16(offset + CHECKSUM_OFFSET),
	}
}

fn write_slot<P: PageWrite + ?Sized>(page: &mut P, offset: usize, generation: u64, pointer: PageId) {
	page.put_u64(offset, generation);
	page.put_u64(offset + POINTER_OFFSET, pointer);
	page.put_u16(offset + CHECKSUM_OFFSET, checksum(generation, pointer));
}

fn classify(slot: &Slot, snapshot: Generation) -> SlotState {
	if slot.generation == 0 && slot.pointer == 0 && slot.checksum == 0 {
		return SlotState::Empty;
	}
	if slot.generation == 0 || checksum(slot.generation, slot.pointer) != slot.checksum {
		return SlotState::Broken;
	}
	if slot.generation > snapshot.unstable {
		SlotState::GenerationAhead
	} else if slot.generation == snapshot.unstable {
		SlotState::Unstable
	} else if slot.generation > snapshot.stable {
		SlotState::Crash
	} else {
		SlotState::Stable
	}
}

/// Classifies both slots of the pair at `offset`.
pub fn slot_states<P: PageRead + ?Sized>(
	page: &mut P,
	offset: usize,
	snapshot: Generation,
) -> (SlotState, SlotState) {
	let a = read_slot(page, offset);
	let b = read_slot(page, offset + SLOT_SIZE);
	(classify(&a, snapshot), classify(&b, snapshot))
}

/// Resolves the pointer pair at `offset` against `snapshot`.
///
/// A pair with both slots empty resolves to [`GenerationSafePointer::NONE`]; whether that is
/// acceptable is up to the caller.
pub fn read<P: PageRead + ?Sized>(
	page: &mut P,
	offset: usize,
	snapshot: Generation,
) -> Result<GenerationSafePointer, PointerFailure> {
	let a = read_slot(page, offset);
	let b = read_slot(page, offset + SLOT_SIZE);
	let state_a = classify(&a, snapshot);
	let state_b = classify(&b, snapshot);

	let pick = |slot: &Slot| GenerationSafePointer {
		pointer: slot.pointer,
		generation: slot.generation,
	};

	use SlotState::*;
	match (state_a, state_b) {
		(GenerationAhead, _) | (_, GenerationAhead) => Err(PointerFailure::GenerationAhead),
		(Unstable, Unstable) => Err(PointerFailure::Ambiguous),
		(Unstable, _) => Ok(pick(&a)),
		(_, Unstable) => Ok(pick(&b)),
		(Stable, Stable) => match a.generation.cmp(&b.generation) {
			std::cmp::Ordering::Greater => Ok(pick(&a)),
			std::cmp::Ordering::Less => Ok(pick(&b)),
			std::cmp::Ordering::Equal => Err(PointerFailure::Ambiguous),
		},
		(Stable, Empty | Crash | Broken) => Ok(pick(&a)),
		(Empty | Crash | Broken, Stable) => Ok(pick(&b)),
		(Empty, Empty) => Ok(GenerationSafePointer::NONE),
		_ => Err(PointerFailure::NoValidSlot),
	}
}

/// Writes `pointer` into the pair at `offset`, stamped with `snapshot.unstable`.
///
/// Overwrites the slot already written in this generation if there is one, otherwise the slot
/// that does not hold the newest stable pointer.
pub fn write<P: PageRead + PageWrite + ?Sized>(
	page: &mut P,
	offset: usize,
	pointer: PageId,
	snapshot: Generation,
) -> Result<(), PointerFailure> {
	let a = read_slot(page, offset);
	let b = read_slot(page, offset + SLOT_SIZE);
	let state_a = classify(&a, snapshot);
	let state_b = classify(&b, snapshot);

	use SlotState::*;
	let target = match (state_a, state_b) {
		(GenerationAhead, _) | (_, GenerationAhead) => return Err(PointerFailure::GenerationAhead),
		(Unstable, _) => offset,
		(_, Unstable) => offset + SLOT_SIZE,
		(Stable, Stable) => {
			if a.generation >= b.generation {
				offset + SLOT_SIZE
			} else {
				offset
			}
		}
		(Stable, _) => offset + SLOT_SIZE,
		_ => offset,
	};
	write_slot(page, target, snapshot.unstable, pointer);
	Ok(())
}

/// Clears both slots of the pair at `offset`.
pub fn initialize<P: PageWrite + ?Sized>(page: &mut P, offset: usize) {
	page.put_bytes(offset, &[0u8; PAIR_SIZE]);
}
