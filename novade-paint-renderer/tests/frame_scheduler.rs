use std::collections::VecDeque;

use ash::vk;
use novade_paint_renderer::error::{RendererError, Result};
use novade_paint_renderer::frame::{
    AcquireOutcome, FrameBackend, FrameOutcome, FrameScheduler, PresentOutcome, RecreateOutcome,
};
use novade_paint_renderer::input::InputQueue;
use novade_paint_renderer::BrushConfig;

const IMAGES: u32 = 3;

/// A lazy GPU: submitted work only completes when someone waits on its
/// fence. That makes every frame the scheduler lets into flight visible.
struct SimulatedGpu {
    fences_signaled: Vec<bool>,
    queue: VecDeque<usize>,
    max_in_flight: usize,
    next_image: u32,
    /// Size the window system currently reports.
    surface: (u32, u32),
    /// Size the swapchain was last built at.
    extent: (u32, u32),
    frame: usize,
    out_of_date_on: Option<usize>,
    /// Frame whose preparation fails, as with an overfull draw queue.
    fail_prepare_on: Option<usize>,
    /// Frame whose command recording fails after the fence was reset.
    fail_record_on: Option<usize>,
    recreates: usize,
    presents: Vec<(usize, (u32, u32))>,
    recorded: Vec<(usize, u32, (u32, u32))>,
}

impl SimulatedGpu {
    fn new(frames_in_flight: usize) -> Self {
        Self {
            fences_signaled: vec![true; frames_in_flight],
            queue: VecDeque::new(),
            max_in_flight: 0,
            next_image: 0,
            surface: (800, 600),
            extent: (800, 600),
            frame: 0,
            out_of_date_on: None,
            fail_prepare_on: None,
            fail_record_on: None,
            recreates: 0,
            presents: Vec::new(),
            recorded: Vec::new(),
        }
    }

    fn in_flight(&self) -> usize {
        self.fences_signaled.iter().filter(|signaled| !**signaled).count()
    }
}

impl FrameBackend for SimulatedGpu {
    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        while !self.fences_signaled[slot] {
            let done = self.queue.pop_front().expect("waiting on a fence nothing will signal");
            self.fences_signaled[done] = true;
        }
        Ok(())
    }

    fn acquire_image(&mut self, _slot: usize) -> Result<AcquireOutcome> {
        if self.out_of_date_on == Some(self.frame) {
            self.out_of_date_on = None;
            return Ok(AcquireOutcome::OutOfDate);
        }
        let image_index = self.next_image;
        self.next_image = (self.next_image + 1) % IMAGES;
        Ok(AcquireOutcome::Acquired {
            image_index,
            suboptimal: false,
        })
    }

    fn prepare_slot(&mut self, slot: usize, _image_index: u32) -> Result<()> {
        assert!(self.fences_signaled[slot], "slot prepared while its frame is in flight");
        if self.fail_prepare_on == Some(self.frame) {
            return Err(RendererError::DrawQueueFull { capacity: 8 });
        }
        Ok(())
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        assert!(self.fences_signaled[slot], "fence reset while its frame is in flight");
        self.fences_signaled[slot] = false;
        Ok(())
    }

    fn record_slot(&mut self, slot: usize, image_index: u32) -> Result<()> {
        if self.fail_record_on == Some(self.frame) {
            return Err(RendererError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        self.recorded.push((slot, image_index, self.extent));
        Ok(())
    }

    fn submit_slot(&mut self, slot: usize, _image_index: u32) -> Result<()> {
        self.queue.push_back(slot);
        self.max_in_flight = self.max_in_flight.max(self.in_flight());
        Ok(())
    }

    fn present_image(&mut self, slot: usize, _image_index: u32) -> Result<PresentOutcome> {
        self.presents.push((slot, self.extent));
        Ok(PresentOutcome::Presented)
    }

    fn recreate_swapchain(&mut self) -> Result<RecreateOutcome> {
        if self.surface.0 == 0 || self.surface.1 == 0 {
            return Ok(RecreateOutcome::Deferred);
        }
        self.recreates += 1;
        self.extent = self.surface;
        self.next_image = 0;
        Ok(RecreateOutcome::Rebuilt)
    }

    /// An empty submission that only signals the slot's fence.
    fn abandon_slot(&mut self, slot: usize) -> Result<()> {
        self.fences_signaled[slot] = false;
        self.queue.push_back(slot);
        Ok(())
    }
}

fn run(scheduler: &mut FrameScheduler, gpu: &mut SimulatedGpu) -> FrameOutcome {
    let outcome = scheduler.draw_frame(gpu).expect("frame failed");
    gpu.frame += 1;
    outcome
}

#[test]
fn never_more_frames_in_flight_than_slots() {
    for frames_in_flight in 1..=3 {
        let mut scheduler = FrameScheduler::new(frames_in_flight);
        let mut gpu = SimulatedGpu::new(frames_in_flight);
        for _ in 0..100 {
            assert!(matches!(
                run(&mut scheduler, &mut gpu),
                FrameOutcome::Presented { .. }
            ));
            assert!(gpu.in_flight() <= frames_in_flight);
        }
        assert_eq!(gpu.max_in_flight, frames_in_flight);
        assert_eq!(gpu.presents.len(), 100);
    }
}

#[test]
fn out_of_date_acquire_drops_one_frame_and_rebuilds_at_the_new_size() {
    let mut scheduler = FrameScheduler::new(2);
    let mut gpu = SimulatedGpu::new(2);

    for _ in 0..3 {
        run(&mut scheduler, &mut gpu);
    }
    let slot_before = scheduler.current_slot();
    let presents_before = gpu.presents.len();

    gpu.surface = (1024, 768);
    gpu.out_of_date_on = Some(gpu.frame);
    assert_eq!(run(&mut scheduler, &mut gpu), FrameOutcome::Dropped);
    assert_eq!(gpu.presents.len(), presents_before, "dropped frame was presented");
    assert_eq!(gpu.recreates, 1);
    assert_eq!(scheduler.current_slot(), slot_before);
    assert!(!scheduler.recreate_pending());

    match run(&mut scheduler, &mut gpu) {
        FrameOutcome::Presented { slot, image_index } => {
            assert_eq!(slot, slot_before);
            assert_eq!(image_index, 0);
        }
        other => panic!("expected a presented frame, got {other:?}"),
    }
    assert_eq!(gpu.presents.last(), Some(&(slot_before, (1024, 768))));
    assert_eq!(gpu.recorded.last().map(|r| r.2), Some((1024, 768)));
}

#[test]
fn bursts_of_resize_events_rebuild_once() {
    let mut scheduler = FrameScheduler::new(2);
    let mut gpu = SimulatedGpu::new(2);
    let mut input = InputQueue::new(BrushConfig::default(), (800, 600));
    let handle = input.handle();

    for width in [900, 950, 1000, 1280] {
        handle.on_resize(width, 720);
    }
    gpu.surface = (1280, 720);

    let state = input.drain();
    assert!(state.resized);
    assert_eq!(state.framebuffer, (1280, 720));
    scheduler.request_recreate();
    scheduler.request_recreate();

    run(&mut scheduler, &mut gpu);
    assert_eq!(gpu.recreates, 1);

    assert!(!input.drain().resized);
    for _ in 0..5 {
        run(&mut scheduler, &mut gpu);
    }
    assert_eq!(gpu.recreates, 1);
    assert!(gpu.presents.iter().all(|(_, extent)| *extent == (1280, 720)));
}

#[test]
fn recreating_at_the_same_size_changes_nothing_visible() {
    let mut scheduler = FrameScheduler::new(3);
    let mut gpu = SimulatedGpu::new(3);
    for _ in 0..4 {
        run(&mut scheduler, &mut gpu);
    }
    let slot = scheduler.current_slot();
    let extent = gpu.extent;

    scheduler.request_recreate();
    assert!(matches!(
        run(&mut scheduler, &mut gpu),
        FrameOutcome::Presented { slot: presented, .. } if presented == slot
    ));
    assert_eq!(gpu.recreates, 1);
    assert_eq!(gpu.extent, extent);
    assert_eq!(scheduler.current_slot(), (slot + 1) % 3);
}

#[test]
fn minimized_window_drops_frames_until_restored() {
    let mut scheduler = FrameScheduler::new(2);
    let mut gpu = SimulatedGpu::new(2);
    run(&mut scheduler, &mut gpu);

    gpu.surface = (0, 0);
    scheduler.request_recreate();
    for _ in 0..10 {
        assert_eq!(run(&mut scheduler, &mut gpu), FrameOutcome::Dropped);
    }
    assert_eq!(gpu.presents.len(), 1);

    gpu.surface = (640, 480);
    assert!(matches!(
        run(&mut scheduler, &mut gpu),
        FrameOutcome::Presented { .. }
    ));
    assert_eq!(gpu.extent, (640, 480));
}

#[test]
fn failed_frames_leave_their_slot_waitable() {
    for fail_recording in [false, true] {
        let mut scheduler = FrameScheduler::new(2);
        let mut gpu = SimulatedGpu::new(2);
        for _ in 0..3 {
            run(&mut scheduler, &mut gpu);
        }
        let slot = scheduler.current_slot();
        if fail_recording {
            gpu.fail_record_on = Some(gpu.frame);
        } else {
            gpu.fail_prepare_on = Some(gpu.frame);
        }

        assert!(scheduler.draw_frame(&mut gpu).is_err());
        gpu.frame += 1;
        assert!(
            !gpu.fences_signaled[slot] && gpu.queue.contains(&slot),
            "failed slot has nothing left to signal its fence"
        );
        let presents = gpu.presents.len();

        // Waits on the abandoned slot first; the simulated GPU panics if
        // that wait could never return.
        for _ in 0..4 {
            assert!(matches!(
                run(&mut scheduler, &mut gpu),
                FrameOutcome::Presented { .. }
            ));
            assert!(gpu.in_flight() <= 2);
        }
        assert_eq!(gpu.presents.len(), presents + 4);
        assert_eq!(gpu.recreates, 1, "the unpresented image is released by a rebuild");
    }
}

struct BrokenSurface;

impl FrameBackend for BrokenSurface {
    fn wait_for_slot(&mut self, _slot: usize) -> Result<()> {
        Ok(())
    }

    fn acquire_image(&mut self, _slot: usize) -> Result<AcquireOutcome> {
        Ok(AcquireOutcome::OutOfDate)
    }

    fn prepare_slot(&mut self, _slot: usize, _image_index: u32) -> Result<()> {
        Ok(())
    }

    fn reset_slot(&mut self, _slot: usize) -> Result<()> {
        Ok(())
    }

    fn record_slot(&mut self, _slot: usize, _image_index: u32) -> Result<()> {
        Ok(())
    }

    fn submit_slot(&mut self, _slot: usize, _image_index: u32) -> Result<()> {
        Ok(())
    }

    fn present_image(&mut self, _slot: usize, _image_index: u32) -> Result<PresentOutcome> {
        Ok(PresentOutcome::Presented)
    }

    fn recreate_swapchain(&mut self) -> Result<RecreateOutcome> {
        Err(RendererError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR))
    }

    fn abandon_slot(&mut self, _slot: usize) -> Result<()> {
        Ok(())
    }
}

#[test]
fn repeated_rebuild_failure_surfaces_as_an_error() {
    let mut scheduler = FrameScheduler::new(2);
    let mut backend = BrokenSurface;

    assert_eq!(
        scheduler.draw_frame(&mut backend).expect("first failure is retried"),
        FrameOutcome::Dropped
    );
    match scheduler.draw_frame(&mut backend) {
        Err(RendererError::SwapchainRecreation(inner)) => assert!(matches!(
            *inner,
            RendererError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR)
        )),
        other => panic!("expected a recreation error, got {other:?}"),
    }
}
