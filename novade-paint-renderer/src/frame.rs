//! Acquire/record/submit/present cycle over `F` rotating frame slots.
//!
//! [`FrameScheduler`] owns only the ordering decisions. The Vulkan calls
//! sit behind [`FrameBackend`], so the protocol can be driven by a scripted
//! backend as easily as by the real renderer.

use tracing::{debug, warn};

use crate::error::{RendererError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreateOutcome {
    Rebuilt,
    /// The surface has no area (minimized); try again next frame.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented { slot: usize, image_index: u32 },
    /// Nothing reached the screen this iteration.
    Dropped,
}

/// The GPU side of one frame, split at the points where the scheduler has
/// to make a decision.
pub trait FrameBackend {
    /// Blocks until the slot's previous submission has completed.
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;
    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome>;
    /// CPU-side work for the frame (per-slot buffers, planning). Runs while
    /// the slot's fence is still signaled.
    fn prepare_slot(&mut self, slot: usize, image_index: u32) -> Result<()>;
    fn reset_slot(&mut self, slot: usize) -> Result<()>;
    fn record_slot(&mut self, slot: usize, image_index: u32) -> Result<()>;
    fn submit_slot(&mut self, slot: usize, image_index: u32) -> Result<()>;
    fn present_image(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;
    fn recreate_swapchain(&mut self) -> Result<RecreateOutcome>;
    /// Gives up on a frame that failed after its image was acquired. Must
    /// leave the slot's fence signaled (or about to be) and consume the
    /// acquire semaphore, so the next wait on the slot returns.
    fn abandon_slot(&mut self, slot: usize) -> Result<()>;
}

#[derive(Debug)]
pub struct FrameScheduler {
    frames_in_flight: usize,
    current: usize,
    recreate_pending: bool,
    consecutive_failures: u32,
}

impl FrameScheduler {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            current: 0,
            recreate_pending: false,
            consecutive_failures: 0,
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn recreate_pending(&self) -> bool {
        self.recreate_pending
    }

    /// Schedules a swapchain rebuild at the start of the next frame.
    pub fn request_recreate(&mut self) {
        self.recreate_pending = true;
    }

    /// Runs one iteration of the frame protocol.
    ///
    /// Out-of-date results never surface as errors; they drop the frame and
    /// rebuild the swapchain. Only a second consecutive failed rebuild is
    /// reported, as [`RendererError::SwapchainRecreation`].
    ///
    /// Any other failure after the image is acquired abandons the frame
    /// before the error is returned, so the scheduler stays usable and the
    /// next call does not block on the failed slot.
    pub fn draw_frame(&mut self, backend: &mut dyn FrameBackend) -> Result<FrameOutcome> {
        if self.recreate_pending && !self.recreate(backend)? {
            return Ok(FrameOutcome::Dropped);
        }

        let slot = self.current;
        backend.wait_for_slot(slot)?;

        let image_index = match backend.acquire_image(slot)? {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    warn!(slot, image_index, "Acquired a suboptimal swapchain image.");
                }
                image_index
            }
            AcquireOutcome::OutOfDate => {
                debug!(slot, "Swapchain out of date on acquire; dropping frame.");
                self.recreate_pending = true;
                self.recreate(backend)?;
                return Ok(FrameOutcome::Dropped);
            }
        };

        if let Err(err) = Self::record_and_submit(backend, slot, image_index) {
            warn!(slot, image_index, error = %err, "Frame failed after acquire; abandoning it.");
            backend.abandon_slot(slot)?;
            // The acquired image is never presented; a rebuild releases it.
            self.recreate_pending = true;
            return Err(err);
        }

        let presented = backend.present_image(slot, image_index)?;
        self.current = (self.current + 1) % self.frames_in_flight;

        match presented {
            PresentOutcome::Presented => Ok(FrameOutcome::Presented { slot, image_index }),
            PresentOutcome::Suboptimal => {
                debug!(slot, "Present reported suboptimal; rebuilding next frame.");
                self.recreate_pending = true;
                Ok(FrameOutcome::Presented { slot, image_index })
            }
            PresentOutcome::OutOfDate => {
                debug!(slot, "Present reported out of date; rebuilding next frame.");
                self.recreate_pending = true;
                Ok(FrameOutcome::Dropped)
            }
        }
    }

    fn record_and_submit(
        backend: &mut dyn FrameBackend,
        slot: usize,
        image_index: u32,
    ) -> Result<()> {
        backend.prepare_slot(slot, image_index)?;
        backend.reset_slot(slot)?;
        backend.record_slot(slot, image_index)?;
        backend.submit_slot(slot, image_index)
    }

    /// Returns whether the swapchain is usable afterwards.
    fn recreate(&mut self, backend: &mut dyn FrameBackend) -> Result<bool> {
        match backend.recreate_swapchain() {
            Ok(RecreateOutcome::Rebuilt) => {
                self.recreate_pending = false;
                self.consecutive_failures = 0;
                Ok(true)
            }
            Ok(RecreateOutcome::Deferred) => {
                debug!("Surface has no area; swapchain rebuild deferred.");
                self.recreate_pending = true;
                Ok(false)
            }
            Err(err) => {
                self.consecutive_failures += 1;
                self.recreate_pending = true;
                if self.consecutive_failures >= 2 {
                    return Err(RendererError::SwapchainRecreation(Box::new(err)));
                }
                warn!(error = %err, "Swapchain rebuild failed; retrying next frame.");
                Ok(false)
            }
        }
    }
}

/// Fixed-size arena of per-slot resources, addressed by slot index.
#[derive(Debug)]
pub struct SlotRing<T> {
    slots: Vec<T>,
}

impl<T> SlotRing<T> {
    pub fn new(count: usize, mut make: impl FnMut(usize) -> Result<T>) -> Result<Self> {
        let slots = (0..count).map(&mut make).collect::<Result<Vec<_>>>()?;
        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&T> {
        self.slots.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut T> {
        self.slots.get_mut(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }
}
