//! Non-volatile configuration memory boundary.
//!
//! A small byte-addressable region; the engine stores its persisted
//! configuration block here and the `E-R`/`E-W` commands expose it to the
//! host.

use std::cell::RefCell;
use std::rc::Rc;

/// Byte-addressable persistent memory.
pub trait Nvram {
    fn read(&mut self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, value: u8);
    /// Capacity in bytes.
    fn len(&self) -> u16;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RAM-backed NVRAM whose contents stay observable from outside the drive.
///
/// Cloning shares the backing storage, so a test can keep one clone and
/// hand the other to the engine.
#[derive(Clone)]
pub struct SharedNvram {
    bytes: Rc<RefCell<Vec<u8>>>,
}

impl SharedNvram {
    #[must_use]
    pub fn new(size: u16) -> Self {
        Self {
            bytes: Rc::new(RefCell::new(vec![0xff; usize::from(size)])),
        }
    }

    /// Snapshot of the current contents.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.borrow().clone()
    }
}

impl Nvram for SharedNvram {
    fn read(&mut self, addr: u16) -> u8 {
        self.bytes
            .borrow()
            .get(usize::from(addr))
            .copied()
            .unwrap_or(0xff)
    }

    fn write(&mut self, addr: u16, value: u8) {
        if let Some(slot) = self.bytes.borrow_mut().get_mut(usize::from(addr)) {
            *slot = value;
        }
    }

    fn len(&self) -> u16 {
        self.bytes.borrow().len() as u16
    }
}
