// SPDX-License-Identifier: CEPL-1.0
//! Window and event collaborator. The renderer never touches `winit` directly;
//! the app goes through this crate for window attributes and quit detection.
pub use winit;

use winit::dpi::LogicalSize;
use winit::event::{ElementState, WindowEvent};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowAttributes};

pub fn window_attributes(title: &str, width: u32, height: u32) -> WindowAttributes {
    Window::default_attributes()
        .with_title(title)
        .with_inner_size(LogicalSize::new(width, height))
        .with_resizable(true)
}

/// Current drawable extent in physical pixels. May be 0x0 while minimised.
pub fn framebuffer_extent(window: &Window) -> (u32, u32) {
    let size = window.inner_size();
    (size.width, size.height)
}

/// True for events that should end the main loop: close button or Escape.
pub fn is_quit_request(event: &WindowEvent) -> bool {
    match event {
        WindowEvent::CloseRequested => true,
        WindowEvent::KeyboardInput { event, .. } => {
            event.state == ElementState::Pressed
                && event.logical_key == Key::Named(NamedKey::Escape)
        }
        _ => false,
    }
}
