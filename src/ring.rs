//! Conflating frame exchange: one writer, many readers, latest frame wins.
//!
//! The exchange hands fixed-size frames from a single producer to any number
//! of consumers with **zero-copy borrow semantics**: a consumer borrows a
//! read-only view of the most recently published frame, and the producer is
//! never blocked by slow consumers. When every spare segment is pinned by a
//! reader, the producer conflates: it overwrites the newest segment instead
//! of stalling.
//!
//! # Design Overview
//!
//! The pool owns up to [`MAX_SEGMENTS`] heap buffers of `bufsize` bytes.
//! A single mutex guards the bookkeeping (borrow counts, publication
//! indices, flags) while the bulk frame copy runs with the mutex released.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ bookkeeping (mutex)                                          │
//! │   borrows[i]  last_written  prev_written  receivers  flags   │
//! ├─────────────────────────────────────────────────────────────┤
//! │ seg 0      │ seg 1      │ seg 2      │ …  │ seg 15           │
//! │ bufsize B  │ bufsize B  │ bufsize B  │    │ (grown lazily)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Publication protocol:
//!
//! 1. Under the lock, the writer picks a target segment with no outstanding
//!    borrows, skipping `last_written` so fresh readers keep a stable
//!    segment to land on.
//! 2. The lock is released and the payload is copied into the target.
//! 3. The lock is retaken and `last_written` moves to the target.
//!
//! Readers borrow `prev_written` (always fully committed) or, while a
//! conflating overwrite of `last_written` is in flight, `last_written`
//! itself. The pool starts with 3 segments and grows by one per
//! [`Receiver::try_clone`], so a free writer target always exists.
//!
//! # Loss model
//!
//! Delivery is deliberately lossy: each borrow observes the latest committed
//! frame (or the one just before it), never a backlog. The single unsafe
//! window is conflation: when every other segment is pinned the writer
//! overwrites `last_written` while a new reader may be borrowing it, and
//! that reader can observe a torn frame. Callers treat a torn frame like a
//! dropped one.
//!
//! # Quick Example
//!
//! ```ignore
//! let (mut tx, rx) = framecast::ring::channel(4);
//! tx.send(&[1, 2, 3, 4], 10)?;
//! let frame = rx.recv()?;
//! assert_eq!(&frame[..], &[1, 2, 3, 4]);
//! assert_eq!(frame.timestamp(), 10);
//! // dropping `frame` releases the borrow
//! ```

use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::error::RingError;

/// Hard upper bound on pool size, and therefore on fan-out: the pool starts
/// with 3 segments for 1 receiver and grows by one per additional receiver,
/// so at most 14 receivers can exist.
pub const MAX_SEGMENTS: usize = 16;

const INITIAL_SEGMENTS: usize = 3;

/// A conflating overwrite of `last_written` is in flight.
const FLAG_CONFLATION: u8 = 1;
/// The sender handle has been dropped.
const FLAG_NO_SENDER: u8 = 1 << 1;

/// One fixed-size heap buffer. The allocation is owned by `_boxed`; `ptr`
/// refers to the same allocation and is what gets borrowed out and written
/// through while the pool mutex is released.
struct Segment {
    _boxed: Box<[u8]>,
    ptr: NonNull<u8>,
}

// The buffer is exclusively owned by the pool; moving a Segment between
// threads moves ownership of the allocation with it.
unsafe impl Send for Segment {}

impl Segment {
    /// Allocates a zero-filled segment. Readers that land on a segment
    /// before its first write observe the all-zero sentinel frame.
    fn new(bufsize: usize) -> Self {
        let boxed = vec![0u8; bufsize].into_boxed_slice();
        let ptr = unsafe { NonNull::new_unchecked(boxed.as_ptr() as *mut u8) };
        Self { _boxed: boxed, ptr }
    }
}

/// Pool bookkeeping. Every field is guarded by the pool mutex; the segment
/// *contents* are not: they are read and written while the mutex is
/// released.
struct PoolState {
    segments: Vec<Segment>,
    borrows: [u8; MAX_SEGMENTS],
    last_written: usize,
    prev_written: usize,
    /// Committed writes so far, saturating. Readers prefer `last_written`
    /// until two commits exist, because before that `prev_written` points at
    /// a segment that has never been written.
    commits: u8,
    num_receivers: u8,
    flags: u8,
}

impl PoolState {
    /// Picks the writer's target: the first segment with no outstanding
    /// borrows, skipping `last_written` so it stays available to fresh
    /// readers. Falls back to `last_written` itself when every other
    /// segment is pinned, which is the conflation path.
    fn pick_writer(&self) -> usize {
        let mut free = self.last_written;
        for i in 0..self.segments.len() {
            if i == self.last_written {
                continue;
            }
            if self.borrows[i] == 0 {
                free = i;
                break;
            }
        }
        free
    }

    /// Picks the segment a fresh reader should see.
    ///
    /// `prev_written` is always safe: the writer never targets it (it either
    /// targets a borrow-free segment other than `last_written`, or
    /// `last_written` itself under conflation). `last_written` is preferred
    /// while it is the only committed segment, and is the forced choice
    /// under conflation, the one documented window where a reader can
    /// observe a frame mid-copy.
    fn pick_reader(&self) -> usize {
        if self.flags & FLAG_CONFLATION != 0 {
            self.last_written
        } else if self.commits < 2 {
            self.last_written
        } else {
            self.prev_written
        }
    }

    /// Allocates one more segment, failing once the pool is saturated. The
    /// new segment is immediately eligible as a writer target but is not
    /// referenced by any reader yet.
    fn grow(&mut self, bufsize: usize) -> Result<usize, RingError> {
        if self.segments.len() == MAX_SEGMENTS {
            return Err(RingError::MaxReceivers);
        }
        self.segments.push(Segment::new(bufsize));
        Ok(self.segments.len() - 1)
    }
}

/// State shared by all handles. Dropped (and with it every segment buffer)
/// when the last handle goes away.
struct Shared {
    bufsize: usize,
    state: Mutex<PoolState>,
    /// Timestamp of the last write to each segment. Stored by the writer in
    /// the unsynchronized phase, snapshotted by readers under the lock.
    /// Cache padded so the writer's stores don't bounce the line the
    /// readers' borrow bookkeeping sits next to.
    timestamps: [CachePadded<AtomicU64>; MAX_SEGMENTS],
}

/// Creates a frame exchange for frames of exactly `bufsize` bytes.
///
/// The pool starts with 3 zero-filled segments and a single receiver.
/// Additional receivers come from [`Receiver::try_clone`], each growing the
/// pool by one segment up to [`MAX_SEGMENTS`].
///
/// # Panics
///
/// Panics if `bufsize` is zero.
pub fn channel(bufsize: usize) -> (Sender, Receiver) {
    assert!(bufsize > 0, "frame size must be non-zero");

    let mut segments = Vec::with_capacity(MAX_SEGMENTS);
    for _ in 0..INITIAL_SEGMENTS {
        segments.push(Segment::new(bufsize));
    }

    let shared = Arc::new(Shared {
        bufsize,
        state: Mutex::new(PoolState {
            segments,
            borrows: [0; MAX_SEGMENTS],
            last_written: 0,
            prev_written: 1,
            commits: 0,
            num_receivers: 1,
            flags: 0,
        }),
        timestamps: std::array::from_fn(|_| CachePadded::new(AtomicU64::new(0))),
    });

    (
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    )
}

/// The producing half of the exchange.
///
/// There is exactly one `Sender` per pool: the type is not `Clone` and
/// [`send`](Sender::send) takes `&mut self`, so the single-producer contract
/// is enforced by the type system rather than by convention.
///
/// Dropping the sender closes the exchange for readers: their next
/// [`Receiver::recv`] returns [`RingError::SenderClosed`].
pub struct Sender {
    shared: Arc<Shared>,
}

impl Sender {
    /// Publishes one frame with its timestamp.
    ///
    /// The target segment is chosen under the pool lock, the payload copy
    /// runs with the lock released, and the publication indices are updated
    /// under the lock again. The call never blocks on readers: when every
    /// spare segment is pinned it conflates, overwriting the most recently
    /// published segment in place.
    ///
    /// Returns [`RingError::NoReceivers`], without copying anything, once
    /// every receiver handle has been dropped. This is how a producer loop
    /// learns that nobody is listening any more.
    ///
    /// # Panics
    ///
    /// Panics if `frame.len() != bufsize`.
    pub fn send(&mut self, frame: &[u8], timestamp: u64) -> Result<(), RingError> {
        assert_eq!(frame.len(), self.shared.bufsize);

        let target;
        let dst;
        {
            let mut state = self.shared.state.lock();
            if state.num_receivers == 0 {
                return Err(RingError::NoReceivers);
            }

            target = state.pick_writer();
            if target == state.last_written {
                // Every other segment is pinned: overwrite in place and let
                // concurrent borrowers of this segment see the tear.
                state.flags |= FLAG_CONFLATION;
            } else {
                state.prev_written = state.last_written;
            }
            dst = state.segments[target].ptr;
        }

        // Unsynchronized phase. Existing borrows pin segments other than
        // `target`, and fresh borrows are routed to `prev_written` or
        // `last_written`, neither of which is `target` unless conflating.
        unsafe {
            ptr::copy_nonoverlapping(frame.as_ptr(), dst.as_ptr(), self.shared.bufsize);
        }
        self.shared.timestamps[target].store(timestamp, Ordering::Release);

        let mut state = self.shared.state.lock();
        state.last_written = target;
        state.commits = state.commits.saturating_add(1);
        state.flags &= !FLAG_CONFLATION;
        Ok(())
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.flags |= FLAG_NO_SENDER;
    }
}

/// The consuming half of the exchange.
///
/// Receivers hand out [`Frame`] views of the latest published frame. A
/// receiver handle on its own pins nothing; only live `Frame`s do, one
/// segment each.
///
/// Cloning goes through [`try_clone`](Receiver::try_clone) because each new
/// receiver grows the pool by a segment and the pool is bounded; `Clone`
/// could not report [`RingError::MaxReceivers`].
pub struct Receiver {
    shared: Arc<Shared>,
}

impl Receiver {
    /// Borrows a read-only view of the most recent committed frame.
    ///
    /// The view pins its segment: the writer will not overwrite it while the
    /// `Frame` is alive (conflation excepted, see the module docs). Dropping
    /// the `Frame` releases the pin.
    ///
    /// Before the first publish this returns the all-zero sentinel frame
    /// with timestamp 0.
    ///
    /// Returns [`RingError::SenderClosed`] once the sender has been dropped;
    /// the receiver itself remains valid to drop or clone.
    pub fn recv(&self) -> Result<Frame<'_>, RingError> {
        let mut state = self.shared.state.lock();
        if state.flags & FLAG_NO_SENDER != 0 {
            return Err(RingError::SenderClosed);
        }

        let index = state.pick_reader();
        debug_assert!(state.borrows[index] < u8::MAX);
        state.borrows[index] += 1;
        let data = state.segments[index].ptr;
        let timestamp = self.shared.timestamps[index].load(Ordering::Acquire);
        drop(state);

        Ok(Frame {
            receiver: self,
            data,
            timestamp,
            index,
        })
    }

    /// Creates an additional receiver, growing the pool by one segment.
    ///
    /// Fails with [`RingError::MaxReceivers`] once the pool holds
    /// [`MAX_SEGMENTS`] segments; the parent receiver is unaffected.
    pub fn try_clone(&self) -> Result<Receiver, RingError> {
        let mut state = self.shared.state.lock();
        state.grow(self.shared.bufsize)?;
        state.num_receivers += 1;
        drop(state);

        Ok(Receiver {
            shared: self.shared.clone(),
        })
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        debug_assert!(state.num_receivers > 0);
        state.num_receivers -= 1;
    }
}

/// A borrowed read-only frame, valid until dropped.
///
/// Dereferences to the frame bytes and carries the timestamp the frame was
/// published with. While a `Frame` is alive its segment is pinned against
/// the writer, so the bytes are stable, except during conflation when a
/// torn read is possible and should be treated as a dropped frame.
pub struct Frame<'a> {
    receiver: &'a Receiver,
    data: NonNull<u8>,
    timestamp: u64,
    index: usize,
}

impl Frame<'_> {
    /// Timestamp the frame was published with.
    #[inline(always)]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

impl Deref for Frame<'_> {
    type Target = [u8];

    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        unsafe { slice::from_raw_parts(self.data.as_ptr(), self.receiver.shared.bufsize) }
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        let mut state = self.receiver.shared.state.lock();
        debug_assert!(state.borrows[self.index] > 0);
        state.borrows[self.index] -= 1;
    }
}
