//! Keyboard state for toggles.

use std::collections::HashSet;

pub use winit::keyboard::KeyCode;

/// Tracks held keys and the edges seen since the last frame.
#[derive(Debug, Default)]
pub struct InputState {
    pressed_keys: HashSet<KeyCode>,
    just_pressed_keys: HashSet<KeyCode>,
}

impl InputState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the per-frame edges. Call once per frame after handling input.
    pub fn begin_frame(&mut self) {
        self.just_pressed_keys.clear();
    }

    /// Key repeat does not produce a new press.
    pub fn on_key_pressed(&mut self, key: KeyCode) {
        if self.pressed_keys.insert(key) {
            self.just_pressed_keys.insert(key);
        }
    }

    pub fn on_key_released(&mut self, key: KeyCode) {
        self.pressed_keys.remove(&key);
    }

    pub fn is_key_pressed(&self, key: KeyCode) -> bool {
        self.pressed_keys.contains(&key)
    }

    pub fn is_key_just_pressed(&self, key: KeyCode) -> bool {
        self.just_pressed_keys.contains(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_press_is_an_edge_once() {
        let mut input = InputState::new();

        input.on_key_pressed(KeyCode::KeyC);
        input.on_key_pressed(KeyCode::KeyC);
        assert!(input.is_key_just_pressed(KeyCode::KeyC));

        input.begin_frame();
        input.on_key_pressed(KeyCode::KeyC);
        assert!(input.is_key_pressed(KeyCode::KeyC));
        assert!(!input.is_key_just_pressed(KeyCode::KeyC));
    }

    #[test]
    fn test_release_allows_new_press() {
        let mut input = InputState::new();

        input.on_key_pressed(KeyCode::KeyV);
        input.begin_frame();
        input.on_key_released(KeyCode::KeyV);
        assert!(!input.is_key_pressed(KeyCode::KeyV));

        input.on_key_pressed(KeyCode::KeyV);
        assert!(input.is_key_just_pressed(KeyCode::KeyV));
    }
}
