use std::ffi::{CString, NulError, c_char};

/// Strings handed to the script engine as C strings for the duration of one
/// script run (or one worker request). The owning thread clears it after every
/// run; pointers returned by `pin_c_string` are valid until then.
#[derive(Default)]
pub struct PinArena {
    pinned: Vec<CString>,
}

impl PinArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin_c_string(&mut self, value: &str) -> Result<*const c_char, NulError> {
        let value = CString::new(value)?;
        // moving the CString into the Vec does not move its heap buffer
        let ptr = value.as_ptr();
        self.pinned.push(value);
        Ok(ptr)
    }

    pub fn len(&self) -> usize {
        self.pinned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pinned.is_empty()
    }

    pub fn clear(&mut self) {
        self.pinned.clear();
    }
}
