//! Window management using winit
//!
//! Turns keyboard and cursor events into the per-frame [`InputState`] the
//! engine consumes.

use crate::error::{EngineError, EngineResult};
use crate::scene::InputState;
use crate::EngineConfig;
use glam::Vec2;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    dpi::{PhysicalPosition, PhysicalSize},
    event::{ElementState, Event, KeyEvent, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window as WinitWindow, WindowBuilder},
};

/// Wrapper around winit window with additional state
pub struct Window {
    window: Arc<WinitWindow>,
    width: u32,
    height: u32,
    close_requested: bool,
    input: InputState,
}

impl Window {
    /// Create a new window with the configured title and dimensions
    pub fn new(event_loop: &EventLoop<()>, config: &EngineConfig) -> EngineResult<Self> {
        let window = WindowBuilder::new()
            .with_title(&config.title)
            .with_inner_size(PhysicalSize::new(config.width, config.height))
            .with_resizable(false)
            .build(event_loop)
            .map_err(|e| EngineError::Window(e.to_string()))?;

        let size = window.inner_size();
        Ok(Self {
            window: Arc::new(window),
            width: size.width.max(1),
            height: size.height.max(1),
            close_requested: false,
            input: InputState::new(),
        })
    }

    /// Get the raw window for backend initialization
    pub fn window(&self) -> &WinitWindow {
        &self.window
    }

    /// Get arc reference to window
    pub fn window_arc(&self) -> Arc<WinitWindow> {
        Arc::clone(&self.window)
    }

    /// Get current window dimensions
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Check if close was requested
    pub fn should_close(&self) -> bool {
        self.close_requested
    }

    /// Input gathered since the last [`Window::take_input`]
    pub fn input(&self) -> &InputState {
        &self.input
    }

    /// Snapshot the input for this frame and reset the mouse delta
    pub fn take_input(&mut self) -> InputState {
        let input = self.input.clone();
        self.input.reset_deltas();
        input
    }

    /// Handle window events
    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(size) => {
                self.width = size.width.max(1);
                self.height = size.height.max(1);
            }
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state,
                        ..
                    },
                ..
            } => {
                if *code == KeyCode::Escape {
                    self.close_requested = true;
                }
                apply_key(&mut self.input, *code, *state == ElementState::Pressed);
            }
            WindowEvent::CursorMoved { position, .. } => {
                self.input.mouse_delta += offset_from_center(*position, self.width, self.height);
            }
            _ => {}
        }
    }

    /// Request a redraw
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

/// Record a key press or release. Keys without a binding are ignored.
fn apply_key(input: &mut InputState, code: KeyCode, pressed: bool) {
    let key = match code {
        KeyCode::KeyW => &mut input.forward,
        KeyCode::KeyS => &mut input.backward,
        KeyCode::KeyA => &mut input.left,
        KeyCode::KeyD => &mut input.right,
        KeyCode::Space => &mut input.up,
        KeyCode::KeyZ => &mut input.down,
        _ => return,
    };
    *key = pressed;
}

fn offset_from_center(position: PhysicalPosition<f64>, width: u32, height: u32) -> Vec2 {
    Vec2::new(
        position.x as f32 - width as f32 / 2.0,
        position.y as f32 - height as f32 / 2.0,
    )
}

/// Run the event loop, calling `callback` with the window and the seconds
/// since the previous call once per iteration.
///
/// The first error returned by `callback` stops the loop and is returned.
pub fn run<F>(event_loop: EventLoop<()>, mut window: Window, mut callback: F) -> EngineResult<()>
where
    F: FnMut(&mut Window, f32) -> EngineResult<()>,
{
    let mut last_frame = Instant::now();
    let mut failure = None;

    event_loop
        .run(|event, elwt: &EventLoopWindowTarget<()>| {
            elwt.set_control_flow(ControlFlow::Poll);

            match event {
                Event::WindowEvent { event, .. } => {
                    window.handle_event(&event);
                    if window.should_close() {
                        elwt.exit();
                    }
                }
                Event::AboutToWait => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_frame).as_secs_f32();
                    last_frame = now;

                    if let Err(err) = callback(&mut window, dt) {
                        log::error!("Frame failed: {err}");
                        failure = Some(err);
                        elwt.exit();
                        return;
                    }
                    window.request_redraw();
                }
                _ => {}
            }
        })
        .map_err(|e| EngineError::Window(e.to_string()))?;

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_bindings() {
        let mut input = InputState::new();
        for code in [KeyCode::KeyW, KeyCode::KeyS, KeyCode::KeyA, KeyCode::KeyD, KeyCode::Space, KeyCode::KeyZ] {
            apply_key(&mut input, code, true);
        }
        assert!(input.forward && input.backward && input.left && input.right && input.up && input.down);

        apply_key(&mut input, KeyCode::KeyW, false);
        apply_key(&mut input, KeyCode::KeyQ, true);
        assert!(!input.forward);
        assert!(input.backward);
    }

    #[test]
    fn test_cursor_offset_is_relative_to_center() {
        let offset = offset_from_center(PhysicalPosition::new(700.0, 300.0), 1280, 720);
        assert_eq!(offset, Vec2::new(60.0, -60.0));
        assert_eq!(offset_from_center(PhysicalPosition::new(640.0, 360.0), 1280, 720), Vec2::ZERO);
    }
}
