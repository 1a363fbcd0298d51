//! Operation tracker
//!
//! Owns every in-flight read request together with its buffer. Operations
//! live in an arena of slots; a [`Token`] names a slot by index plus a
//! generation counter that is bumped each time the slot is reused, so a
//! completion that arrives for an already-finalized request can never match
//! the unrelated request that now occupies the same slot.
//!
//! ## Buffer ownership
//!
//! The kernel writes into a request's buffer while the request is in flight,
//! which the compiler cannot see. The tracker therefore only ever hands out
//! the raw buffer pointer for tracked operations. A `&[u8]` view of the bytes
//! is available only on an [`Operation`] that has been finalized and marked
//! completed (see [`Operation::data`]).
//!
//! Slot lifecycle: `Free → Tracked → Free` (generation + 1).

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;

use tracing::trace;

use crate::error::{Error, Result};
use crate::target::TargetId;

/// Alignment of every read buffer. Covers the logical block size of all
/// devices that accept `O_DIRECT`.
pub const DIRECT_IO_ALIGNMENT: usize = 4096;

// ============================================================================
// Token
// ============================================================================

/// Correlation token: slot index plus generation.
///
/// Packs into the 64-bit `user_data` carried by the asynchronous request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    index: u32,
    generation: u32,
}

impl Token {
    /// Create a token from its parts.
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot when the token was issued.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into the request's `user_data`.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Unpack from a completion's `user_data`.
    #[inline]
    #[must_use]
    pub const fn from_u64(raw: u64) -> Self {
        Self { index: raw as u32, generation: (raw >> 32) as u32 }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}.{}", self.index, self.generation)
    }
}

// ============================================================================
// Aligned buffer
// ============================================================================

/// Heap buffer aligned for direct I/O. Its address is stable for its lifetime.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the allocation is exclusively owned; nothing else holds the pointer
// except the kernel while a read is in flight, and that read is tied to the
// owning Operation.
unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `len` zeroed bytes aligned to `align`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] for a zero length, an invalid layout, or
    /// when the allocator fails.
    pub fn new(len: usize, align: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Allocation { len, reason: "zero-length buffer" });
        }
        let layout = Layout::from_size_align(len, align)
            .map_err(|_| Error::Allocation { len, reason: "invalid size or alignment" })?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr =
            NonNull::new(raw).ok_or(Error::Allocation { len, reason: "allocator returned null" })?;
        Ok(Self { ptr, layout })
    }

    /// Buffer length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Always false; zero-length buffers are rejected at allocation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Raw pointer handed to the kernel as the read destination.
    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Whether the start address satisfies `align`.
    #[must_use]
    pub fn is_aligned_to(&self, align: usize) -> bool {
        (self.ptr.as_ptr() as usize) % align == 0
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len come from a live allocation; callers only reach this
        // once no read is in flight.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with exactly this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

// ============================================================================
// Operation
// ============================================================================

/// Lifecycle state of a read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// Created, not yet handed to the backend.
    PendingSubmit,
    /// Accepted (or assumed accepted) by the backend.
    InFlight,
    /// Finished; carries the byte count.
    CompletedOk(usize),
    /// Finished with a positive errno.
    CompletedError(i32),
    /// Never accepted by the backend.
    Rejected,
}

impl OpStatus {
    /// True for the two completed states.
    #[must_use]
    pub fn is_completed(self) -> bool {
        matches!(self, Self::CompletedOk(_) | Self::CompletedError(_))
    }
}

/// One read request and its exclusively owned buffer.
#[derive(Debug)]
pub struct Operation {
    token: Token,
    target: TargetId,
    offset: u64,
    buffer: AlignedBuffer,
    status: OpStatus,
}

impl Operation {
    /// Correlation token.
    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }

    /// Target the read is issued against.
    #[must_use]
    pub fn target(&self) -> TargetId {
        self.target
    }

    /// Byte offset within the target.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Always false.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> OpStatus {
        self.status
    }

    /// Set the status.
    pub fn set_status(&mut self, status: OpStatus) {
        self.status = status;
    }

    /// Record a raw completion result (`>= 0` bytes, `< 0` negated errno).
    pub fn complete(&mut self, result: i32) {
        self.status = if result < 0 {
            OpStatus::CompletedError(-result)
        } else {
            OpStatus::CompletedOk(result as usize)
        };
    }

    /// Raw destination pointer for the read.
    #[must_use]
    pub fn buffer_ptr(&mut self) -> *mut u8 {
        self.buffer.as_mut_ptr()
    }

    /// Bytes read, once the operation completed successfully.
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        match self.status {
            OpStatus::CompletedOk(n) => Some(&self.buffer.as_slice()[..n.min(self.buffer.len())]),
            _ => None,
        }
    }

    /// Whether the read buffer is aligned for direct I/O.
    #[must_use]
    pub fn is_buffer_aligned(&self) -> bool {
        self.buffer.is_aligned_to(DIRECT_IO_ALIGNMENT)
    }
}

// ============================================================================
// Tracker
// ============================================================================

#[derive(Debug)]
struct Slot {
    generation: u32,
    op: Option<Operation>,
}

/// Arena of in-flight operations keyed by [`Token`].
#[derive(Debug)]
pub struct Tracker {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    limit: Option<usize>,
    alignment: usize,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    /// Create an unbounded tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            limit: None,
            alignment: DIRECT_IO_ALIGNMENT,
        }
    }

    /// Create a tracker that refuses to hold more than `limit` operations.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            slots: Vec::with_capacity(limit),
            free: Vec::with_capacity(limit),
            limit: Some(limit),
            ..Self::new()
        }
    }

    /// Number of tracked operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// True when nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Allocate a buffer and a record for a read of `length` bytes at
    /// `offset` on `target`, and start tracking it.
    ///
    /// # Errors
    ///
    /// [`Error::Allocation`] when the record pool is exhausted or the buffer
    /// cannot be allocated. Nothing is tracked in that case.
    pub fn create(&mut self, target: TargetId, offset: u64, length: usize) -> Result<Token> {
        if self.limit.is_some_and(|limit| self.live >= limit) {
            return Err(Error::Allocation { len: length, reason: "record pool exhausted" });
        }
        let buffer = AlignedBuffer::new(length, self.alignment)?;

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len())
                    .map_err(|_| Error::Allocation { len: length, reason: "slot index overflow" })?;
                self.slots.push(Slot { generation: 0, op: None });
                index
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1).max(1);
        let token = Token::new(index, slot.generation);
        slot.op = Some(Operation {
            token,
            target,
            offset,
            buffer,
            status: OpStatus::PendingSubmit,
        });
        self.live += 1;

        trace!(%token, target = target.index(), offset, length, "operation created");
        Ok(token)
    }

    /// Look up a tracked operation.
    #[must_use]
    pub fn get(&self, token: Token) -> Option<&Operation> {
        self.slots
            .get(token.index as usize)
            .filter(|slot| slot.generation == token.generation)
            .and_then(|slot| slot.op.as_ref())
    }

    /// Look up a tracked operation mutably.
    pub fn get_mut(&mut self, token: Token) -> Option<&mut Operation> {
        self.slots
            .get_mut(token.index as usize)
            .filter(|slot| slot.generation == token.generation)
            .and_then(|slot| slot.op.as_mut())
    }

    /// True if `token` names a tracked operation.
    #[must_use]
    pub fn contains(&self, token: Token) -> bool {
        self.get(token).is_some()
    }

    /// Stop tracking `token` and hand its operation back.
    ///
    /// The buffer is released when the returned [`Operation`] is dropped.
    ///
    /// # Errors
    ///
    /// [`Error::Correlation`] if the token is unknown, stale, or already
    /// finalized.
    pub fn finalize(&mut self, token: Token) -> Result<Operation> {
        let op = self
            .slots
            .get_mut(token.index as usize)
            .filter(|slot| slot.generation == token.generation)
            .and_then(|slot| slot.op.take())
            .ok_or(Error::Correlation { token })?;

        self.free.push(token.index);
        self.live -= 1;
        trace!(%token, "operation finalized");
        Ok(op)
    }

    /// Tokens of all tracked operations, in slot order.
    pub fn tokens(&self) -> impl Iterator<Item = Token> + '_ {
        self.slots.iter().filter_map(|slot| slot.op.as_ref().map(Operation::token))
    }

    /// Drop tracking of every operation without releasing its buffer.
    ///
    /// Used at shutdown when reads may still be in flight: leaking the memory
    /// is the only way to keep the kernel from writing into freed pages.
    /// Returns the number of operations abandoned.
    pub fn abandon(&mut self) -> usize {
        let mut abandoned = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(op) = slot.op.take() {
                std::mem::forget(op);
                self.free.push(index as u32);
                abandoned += 1;
            }
        }
        self.live = 0;
        abandoned
    }
}
