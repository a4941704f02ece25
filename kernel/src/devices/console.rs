//! Output sink for process-visible text.

/// Where `hello` and `write` deliver their bytes.
pub trait Console {
    fn write_bytes(&mut self, bytes: &[u8]);
}

/// Keeps everything written to it; lets tests inspect syscall output.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct CaptureConsole {
    buffer: alloc::sync::Arc<spin::Mutex<alloc::vec::Vec<u8>>>,
}

#[cfg(test)]
impl CaptureConsole {
    pub fn contents(&self) -> alloc::vec::Vec<u8> {
        self.buffer.lock().clone()
    }
}

#[cfg(test)]
impl Console for CaptureConsole {
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.lock().extend_from_slice(bytes);
    }
}
