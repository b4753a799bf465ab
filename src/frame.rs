//! Frames and the single-slot latest-frame mailbox.
//!
//! - `Frame`: immutable decoded picture, shared as `Arc<Frame>` once published.
//! - `FrameSlot`: holds at most one frame. Writers overwrite, readers take a handle
//!   to whatever is there. There is no queue: a slow reader misses intermediate
//!   frames (last write wins).

use std::sync::{Arc, Mutex, MutexGuard};

/// Bytes per pixel of the packed BGR24 layout every backend produces.
pub const BYTES_PER_PIXEL: usize = 3;

/// A decoded frame in packed BGR24.
///
/// Frames are never mutated after construction, so handing out `Arc<Frame>`
/// gives each reader its own stable copy of the picture.
#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Per-source sequence number, starting at 1.
    pub seq: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, seq: u64) -> Self {
        Self {
            data,
            width,
            height,
            seq,
        }
    }

    /// Expected byte length for a `width` x `height` BGR24 frame.
    pub fn byte_len_for(width: u32, height: u32) -> usize {
        width as usize * height as usize * BYTES_PER_PIXEL
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

/// Single-slot mailbox between one acquisition loop and any number of readers.
///
/// The lock is held only for the pointer swap, never while decoding or
/// processing, so neither side waits on the other beyond that.
#[derive(Debug, Default)]
pub struct FrameSlot {
    latest: Mutex<Option<Arc<Frame>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace whatever is in the slot. The previous frame is dropped once its
    /// last reader lets go of it.
    pub fn publish(&self, frame: Frame) {
        let frame = Arc::new(frame);
        *self.lock() = Some(frame);
    }

    /// Most recently published frame, if any.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().take();
    }

    // A panicking writer cannot leave the slot half-written: the value is a
    // single pointer swap. Recover rather than propagate the poison.
    fn lock(&self) -> MutexGuard<'_, Option<Arc<Frame>>> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner())
    }
}
