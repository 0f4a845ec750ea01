//! Capture source trait and frame ownership

use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::types::Frame;
use crate::Result;

/// Trait for image sensor frame sources
///
/// Sources abstract over the sensor driver. Every frame returned by
/// [`acquire_frame`](FrameSource::acquire_frame) must come back through
/// [`release_frame`](FrameSource::release_frame) exactly once; wrapping it in
/// a [`FrameLease`] takes care of that.
pub trait FrameSource: Send + Sync + 'static {
    /// Grab the next frame from the sensor.
    ///
    /// Returns:
    /// - `Ok(frame)` - New frame available
    /// - `Err(CameraError::Capture)` - No frame available right now (underrun)
    ///
    /// May block the calling thread until the sensor delivers.
    fn acquire_frame(&self) -> Result<Frame>;

    /// Hand a frame buffer back to the sensor driver
    fn release_frame(&self, frame: Frame);

    /// Power up the sensor
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Power down the sensor
    fn stop(&self) {}
}

/// Exclusive ownership of one captured frame.
///
/// The frame is released back to its source when the lease is dropped, on
/// every path including panics in the holder.
pub struct FrameLease {
    frame: Option<Frame>,
    source: Arc<dyn FrameSource>,
}

impl FrameLease {
    /// Wrap a frame acquired from `source`
    pub fn new(frame: Frame, source: Arc<dyn FrameSource>) -> Self {
        Self { frame: Some(frame), source }
    }

    /// Release the frame now instead of at end of scope
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for FrameLease {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        // Only `Drop` takes the frame out.
        match &self.frame {
            Some(frame) => frame,
            None => unreachable!("frame lease accessed after release"),
        }
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            trace!(sequence = frame.sequence, "Releasing frame");
            self.source.release_frame(frame);
        }
    }
}

impl std::fmt::Debug for FrameLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameLease").field("frame", &self.frame).finish()
    }
}

/// Acquire one frame from `source` under a lease
pub fn acquire(source: &Arc<dyn FrameSource>) -> Result<FrameLease> {
    let frame = source.acquire_frame()?;
    Ok(FrameLease::new(frame, Arc::clone(source)))
}

/// Acquire `frames` frames back to back and keep only the last one.
///
/// The first frames out of the sensor after an idle period are often stale,
/// so the latest of a short burst is used for analysis.
pub fn acquire_stable(source: &Arc<dyn FrameSource>, frames: usize) -> Result<FrameLease> {
    let mut lease = acquire(source)?;
    for _ in 1..frames.max(1) {
        // Release the previous frame before asking for the next buffer
        drop(lease);
        lease = acquire(source)?;
    }
    debug!(
        sequence = lease.sequence,
        width = lease.width,
        height = lease.height,
        "Captured stable frame"
    );
    Ok(lease)
}

/// Grab and immediately release up to `count` frames to let the sensor settle.
///
/// Returns how many frames were actually discarded.
pub fn discard_frames(source: &Arc<dyn FrameSource>, count: usize) -> usize {
    let mut discarded = 0;
    for _ in 0..count {
        match acquire(source) {
            Ok(lease) => {
                lease.release();
                discarded += 1;
            }
            Err(e) => trace!("Warm-up capture missed: {}", e),
        }
    }
    if discarded < count {
        warn!("Only {}/{} warm-up frames were available", discarded, count);
    }
    discarded
}
