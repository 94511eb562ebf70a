//! Derived metadata feeds computed from the frame stream.
//!
//! The exchange owns the consuming side of the frame ring and runs one
//! worker thread per feed. Sessions subscribe dynamically and get a
//! [`conflate::Receiver`] carrying the latest feed value; a worker whose
//! subscriber list is empty idles instead of chewing on frames.

use std::sync::Arc;
use std::thread::{sleep, Builder};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::conflate;
use crate::error::Result;
use crate::ring;
use crate::wire::{FrameStats, Motion};

/// Pixel delta above which a pixel counts as "changed" for the motion feed.
const MOTION_THRESHOLD: u8 = 16;

type Senders<T> = Arc<Mutex<Vec<conflate::Sender<T>>>>;

/// Fan-out point for the metadata feeds.
///
/// The mutexes here only guard the sender lists; live feed receivers are
/// never blocked by a subscription being added or dropped.
pub struct Exchange {
    stats_senders: Senders<FrameStats>,
    motion_senders: Senders<Motion>,
}

impl Exchange {
    /// Spawns the feed workers over the given frame receiver. The second
    /// feed grows the ring pool by one segment for its own receiver.
    pub fn new(receiver: ring::Receiver) -> Result<Self> {
        let motion_receiver = receiver.try_clone()?;

        let stats_senders: Senders<FrameStats> = Arc::new(Mutex::new(vec![]));
        let senders = stats_senders.clone();
        Builder::new()
            .name("stats".to_string())
            .spawn(move || stats_worker(receiver, senders))?;

        let motion_senders: Senders<Motion> = Arc::new(Mutex::new(vec![]));
        let senders = motion_senders.clone();
        Builder::new()
            .name("motion".to_string())
            .spawn(move || motion_worker(motion_receiver, senders))?;

        Ok(Self {
            stats_senders,
            motion_senders,
        })
    }

    /// Attaches a new subscriber to the frame-statistics feed.
    pub fn subscribe_stats(&self) -> conflate::Receiver<FrameStats> {
        let mut senders = self.stats_senders.lock();
        let (sx, rx) = conflate::channel();
        senders.push(sx);
        rx
    }

    /// Attaches a new subscriber to the motion feed.
    pub fn subscribe_motion(&self) -> conflate::Receiver<Motion> {
        let mut senders = self.motion_senders.lock();
        let (sx, rx) = conflate::channel();
        senders.push(sx);
        rx
    }
}

/// Publishes `value` into every sender of the list, dropping senders whose
/// receivers are all gone. Returns false when the list is empty and the
/// worker should idle.
fn fan_out<T: Clone + Default>(
    senders: &Mutex<Vec<conflate::Sender<T>>>,
    to_delete: &mut Vec<usize>,
    value: &T,
) -> bool {
    let mut senders = senders.lock();
    if senders.is_empty() {
        return false;
    }

    to_delete.clear();
    for (i, s) in senders.iter_mut().enumerate() {
        if s.send(value.clone()) == 0 {
            to_delete.push(i);
        }
    }
    for (removed, &i) in to_delete.iter().enumerate() {
        senders.remove(i - removed);
    }
    true
}

fn stats_worker(receiver: ring::Receiver, senders: Senders<FrameStats>) {
    let mut stats = FrameStats::default();
    let mut to_delete = vec![];
    let mut idle = true;

    loop {
        if idle {
            sleep(Duration::from_secs(1));
        }
        idle = !fan_out(&senders, &mut to_delete, &stats);
        if idle {
            continue;
        }

        let frame = match receiver.recv() {
            Ok(frame) => frame,
            Err(_) => {
                info!("frame stream closed");
                break;
            }
        };

        if frame.timestamp() == stats.timestamp {
            // Same frame as last round; wait for a fresh one.
            sleep(Duration::from_millis(20));
            continue;
        }
        stats.timestamp = frame.timestamp();

        let n = frame.len() as f32;
        let mut sum = 0.0f32;
        let mut min = u8::MAX;
        let mut max = u8::MIN;
        for &p in frame.iter() {
            sum += p as f32;
            min = min.min(p);
            max = max.max(p);
        }
        stats.mean = sum / n;
        stats.min = min as f32;
        stats.max = max as f32;

        let variance = frame
            .iter()
            .map(|&p| {
                let d = p as f32 - stats.mean;
                d * d
            })
            .sum::<f32>()
            / n;
        stats.std_dev = variance.sqrt();
    }
}

fn motion_worker(receiver: ring::Receiver, senders: Senders<Motion>) {
    let mut motion = Motion::default();
    let mut prev: Vec<u8> = vec![];
    let mut to_delete = vec![];
    let mut idle = true;

    loop {
        if idle {
            sleep(Duration::from_secs(1));
        }
        idle = !fan_out(&senders, &mut to_delete, &motion);
        if idle {
            continue;
        }

        let frame = match receiver.recv() {
            Ok(frame) => frame,
            Err(_) => {
                info!("frame stream closed");
                break;
            }
        };

        if frame.timestamp() == motion.timestamp {
            sleep(Duration::from_millis(20));
            continue;
        }
        motion.timestamp = frame.timestamp();

        if prev.len() != frame.len() {
            // First frame: nothing to diff against yet.
            prev = frame.to_vec();
            motion.mean_abs_delta = 0.0;
            motion.changed_fraction = 0.0;
            continue;
        }

        let mut delta_sum = 0u64;
        let mut changed = 0u64;
        for (q, &p) in prev.iter_mut().zip(frame.iter()) {
            let d = p.abs_diff(*q);
            delta_sum += d as u64;
            if d > MOTION_THRESHOLD {
                changed += 1;
            }
            *q = p;
        }
        let n = frame.len() as f32;
        motion.mean_abs_delta = delta_sum as f32 / n;
        motion.changed_fraction = changed as f32 / n;
    }
}
