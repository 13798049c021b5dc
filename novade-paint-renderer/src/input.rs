//! Window events delivered over a channel and drained once per frame.

use std::sync::mpsc::{self, Receiver, Sender};
use tracing::debug;

use crate::config::BrushConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    GrowBrush,
    ShrinkBrush,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    /// New framebuffer size in physical pixels.
    Resized { width: u32, height: u32 },
    PointerMoved { x: f64, y: f64 },
    PointerButton { pressed: bool },
    Key(KeyAction),
}

/// Sending half handed to the window system. Cloneable; sends never block
/// and are silently dropped once the renderer is gone.
#[derive(Debug, Clone)]
pub struct InputHandle {
    sender: Sender<InputEvent>,
}

impl InputHandle {
    fn send(&self, event: InputEvent) {
        let _ = self.sender.send(event);
    }

    pub fn on_resize(&self, width: u32, height: u32) {
        self.send(InputEvent::Resized { width, height });
    }

    pub fn on_pointer_move(&self, x: f64, y: f64) {
        self.send(InputEvent::PointerMoved { x, y });
    }

    pub fn on_pointer_button(&self, pressed: bool) {
        self.send(InputEvent::PointerButton { pressed });
    }

    pub fn on_key(&self, action: KeyAction) {
        self.send(InputEvent::Key(action));
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputState {
    pub x: f64,
    pub y: f64,
    pub pressed: bool,
    pub brush_radius: f32,
    /// Size carried by the last resize event. Only a hint that a rebuild is
    /// due; stamps are mapped against the rebuilt swapchain's extent.
    pub framebuffer: (u32, u32),
    /// Set when at least one resize arrived during the last drain.
    pub resized: bool,
}

impl InputState {
    /// A stamp is drawn on every frame the pointer is held down.
    pub fn wants_stamp(&self) -> bool {
        self.pressed
    }
}

pub struct InputQueue {
    sender: Sender<InputEvent>,
    receiver: Receiver<InputEvent>,
    brush: BrushConfig,
    state: InputState,
}

impl InputQueue {
    pub fn new(brush: BrushConfig, framebuffer: (u32, u32)) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver,
            brush,
            state: InputState {
                x: 0.0,
                y: 0.0,
                pressed: false,
                brush_radius: brush.radius,
                framebuffer,
                resized: false,
            },
        }
    }

    pub fn handle(&self) -> InputHandle {
        InputHandle {
            sender: self.sender.clone(),
        }
    }

    pub fn state(&self) -> &InputState {
        &self.state
    }

    /// Applies every pending event in arrival order.
    pub fn drain(&mut self) -> InputState {
        self.state.resized = false;
        while let Ok(event) = self.receiver.try_recv() {
            self.apply(event);
        }
        self.state
    }

    fn apply(&mut self, event: InputEvent) {
        let state = &mut self.state;
        match event {
            InputEvent::Resized { width, height } => {
                state.framebuffer = (width, height);
                state.resized = true;
            }
            InputEvent::PointerMoved { x, y } => {
                state.x = x;
                state.y = y;
            }
            InputEvent::PointerButton { pressed } => state.pressed = pressed,
            InputEvent::Key(action) => {
                let scaled = match action {
                    KeyAction::GrowBrush => state.brush_radius * self.brush.step,
                    KeyAction::ShrinkBrush => state.brush_radius / self.brush.step,
                };
                state.brush_radius = scaled.clamp(self.brush.min_radius, self.brush.max_radius);
                debug!(radius = state.brush_radius, "Brush resized.");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_apply_in_order_once_per_drain() {
        let mut queue = InputQueue::new(BrushConfig::default(), (800, 600));
        let handle = queue.handle();
        handle.on_pointer_move(10.0, 20.0);
        handle.on_pointer_button(true);
        handle.on_pointer_move(30.0, 40.0);

        let state = queue.drain();
        assert_eq!((state.x, state.y), (30.0, 40.0));
        assert!(state.wants_stamp());
        assert!(!state.resized);

        handle.on_pointer_button(false);
        assert!(queue.state().pressed, "events wait for the next drain");
        assert!(!queue.drain().pressed);
    }

    #[test]
    fn resize_flag_lasts_one_drain() {
        let mut queue = InputQueue::new(BrushConfig::default(), (800, 600));
        let handle = queue.handle();
        handle.on_resize(1024, 768);
        handle.on_resize(1280, 720);
        let state = queue.drain();
        assert!(state.resized);
        assert_eq!(state.framebuffer, (1280, 720));
        assert!(!queue.drain().resized);
    }

    #[test]
    fn brush_keys_scale_within_bounds() {
        let brush = BrushConfig {
            radius: 0.1,
            min_radius: 0.05,
            max_radius: 0.2,
            step: 2.0,
        };
        let mut queue = InputQueue::new(brush, (1, 1));
        let handle = queue.handle();

        handle.on_key(KeyAction::GrowBrush);
        assert!((queue.drain().brush_radius - 0.2).abs() < 1e-6);
        handle.on_key(KeyAction::GrowBrush);
        assert!((queue.drain().brush_radius - 0.2).abs() < 1e-6);
        for _ in 0..4 {
            handle.on_key(KeyAction::ShrinkBrush);
        }
        assert!((queue.drain().brush_radius - 0.05).abs() < 1e-6);
    }
}
