//! LEDs and user keys.

use std::cell::RefCell;
use std::rc::Rc;

/// Previous-disk key bit.
pub const KEY_PREV: u8 = 1 << 0;
/// Next-disk key bit.
pub const KEY_NEXT: u8 = 1 << 1;
/// Home (first disk) key bit.
pub const KEY_HOME: u8 = 1 << 2;
/// Sleep key bit.
pub const KEY_SLEEP: u8 = 1 << 3;

/// Drive front panel: two LEDs and four edge-triggered keys.
pub trait Ui {
    fn busy_led(&mut self, on: bool);
    fn dirty_led(&mut self, on: bool);

    /// Whether any key in `mask` has been pressed since it was last reset.
    fn key_pressed(&mut self, mask: u8) -> bool;

    /// Consume pending presses of the keys in `mask`.
    fn reset_key(&mut self, mask: u8);
}

/// UI sink that ignores everything.
pub struct NullUi;

impl Ui for NullUi {
    fn busy_led(&mut self, _on: bool) {}
    fn dirty_led(&mut self, _on: bool) {}
    fn key_pressed(&mut self, _mask: u8) -> bool {
        false
    }
    fn reset_key(&mut self, _mask: u8) {}
}

#[derive(Default)]
struct SimUiState {
    busy: bool,
    dirty: bool,
    pending_keys: u8,
}

/// Shared-state UI for tests: key presses are injected from outside and
/// LED levels stay observable.
#[derive(Clone, Default)]
pub struct SimUi {
    state: Rc<RefCell<SimUiState>>,
}

impl SimUi {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a key press.
    pub fn press(&self, mask: u8) {
        self.state.borrow_mut().pending_keys |= mask;
    }

    #[must_use]
    pub fn busy(&self) -> bool {
        self.state.borrow().busy
    }

    #[must_use]
    pub fn dirty(&self) -> bool {
        self.state.borrow().dirty
    }
}

impl Ui for SimUi {
    fn busy_led(&mut self, on: bool) {
        self.state.borrow_mut().busy = on;
    }

    fn dirty_led(&mut self, on: bool) {
        self.state.borrow_mut().dirty = on;
    }

    fn key_pressed(&mut self, mask: u8) -> bool {
        self.state.borrow().pending_keys & mask != 0
    }

    fn reset_key(&mut self, mask: u8) {
        self.state.borrow_mut().pending_keys &= !mask;
    }
}
