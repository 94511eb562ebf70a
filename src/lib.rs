//! # framecast: conflating latest-frame exchange and streaming daemon
//!
//! A **single-producer / multi-consumer** exchange for fixed-size frames
//! (video frames, sensor snapshots) optimized for **latest-value delivery
//! with zero-copy borrow semantics**, plus the small daemon built around it:
//! a synthetic frame source, derived metadata feeds, and a Unix-socket
//! server speaking a framed JSON protocol.
//!
//! # Features
//!
//! * **Never blocks the producer**: slow consumers cause conflation, not
//!   backpressure
//! * **Zero-copy reads**: consumers borrow the frame in place; the borrow
//!   pins the segment against the writer
//! * **Latest-value delivery**: each borrow observes the newest committed
//!   frame or the one just before it, never a backlog
//! * **Bounded memory**: at most [`ring::MAX_SEGMENTS`] fixed-size
//!   segments, grown one per receiver
//! * Single mutex over bookkeeping only; the bulk copy runs unsynchronized
//!
//! # Loss model
//!
//! Delivery is deliberately lossy. A consumer that borrows rarely skips
//! frames; a consumer that holds a borrow for too long pins one segment and
//! pushes the producer toward conflation. The exchange trades a transient
//! torn frame in the worst case for a producer that never stalls; callers
//! treat a torn frame as a dropped one.
//!
//! # Quick Example
//!
//! ```ignore
//! use framecast::ring;
//!
//! let (mut tx, rx) = ring::channel(4);
//! tx.send(&[1, 2, 3, 4], 10)?;
//!
//! let frame = rx.recv()?;
//! assert_eq!(&frame[..], &[1, 2, 3, 4]);
//! assert_eq!(frame.timestamp(), 10);
//! ```
//!
//! The remaining modules form the daemon: [`source`] publishes frames,
//! [`exchange`] computes per-frame metadata feeds, and [`server`]/[`session`]
//! stream them to subscribed clients over the [`wire`] protocol.

#[cfg(not(unix))]
compile_error!("This crate only supports Unix-like operating systems.");

pub mod config;
pub mod conflate;
pub mod error;
pub mod exchange;
pub mod ring;
pub mod server;
pub mod session;
pub mod source;
pub mod util;
pub mod wire;

pub use config::Config;
pub use error::{RingError, ServiceError};
pub use ring::{channel, Frame, Receiver, Sender, MAX_SEGMENTS};
