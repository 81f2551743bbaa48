//! Encoder input buffer pool
//!
//! An arena of buffer slots indexed by integer handle. Every slot carries an
//! atomic reference count; [`InputFrame`] handles increment it on clone and
//! decrement it on drop. When the count reaches zero the slot goes back to
//! the pool, which either recycles the buffer through the free list or frees
//! it through the backend when its size no longer matches.
//!
//! ```text
//! obtain_input_frame ──> [slot refs=1] ──clone──> encoder ──drop──> refs=0
//!        ^                                                            │
//!        └────────────── free list <── size matches ──────────────────┤
//!                                                                     └─> backend.release
//! ```

pub mod backend;

pub use backend::{
    BackendKind, CopyMode, DeviceHandle, GpuBufferBackend, HostBackend, HostBuffer, NativeBuffer,
};

use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::{AppError, Result};
use crate::video::format::{PixelFormat, Resolution};
use crate::video::frame::SourceFrame;

#[derive(Debug, Clone, Copy, Default)]
struct FrameMeta {
    frame_id: u32,
    timestamp_us: u64,
}

struct Slot {
    refs: AtomicU32,
    meta: Mutex<FrameMeta>,
    buffer: RwLock<Option<NativeBuffer>>,
}

impl Slot {
    fn vacant() -> Self {
        Self {
            refs: AtomicU32::new(0),
            meta: Mutex::new(FrameMeta::default()),
            buffer: RwLock::new(None),
        }
    }
}

struct PoolState {
    backend: Box<dyn GpuBufferBackend>,
    slots: Vec<Arc<Slot>>,
    /// Unreferenced slots holding a buffer of the current size
    free: Vec<u32>,
    /// Slots without a buffer
    vacant: Vec<u32>,
    /// Slots referenced by at least one handle
    active: HashSet<u32>,
    resolution: Resolution,
    resizable: bool,
    next_frame_id: u32,
}

impl PoolState {
    fn take_frame_id(&mut self) -> u32 {
        let id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);
        if self.next_frame_id == 0 {
            self.next_frame_id = 1;
        }
        id
    }

    fn free_slot_buffer(&mut self, index: u32) {
        if let Some(buffer) = self.slots[index as usize].buffer.write().take() {
            self.backend.release(buffer);
        }
        self.vacant.push(index);
    }
}

impl Drop for PoolState {
    fn drop(&mut self) {
        for slot in &self.slots {
            if let Some(buffer) = slot.buffer.write().take() {
                self.backend.release(buffer);
            }
        }
    }
}

struct PoolShared {
    state: Mutex<PoolState>,
}

impl PoolShared {
    /// Last reference to `index` dropped
    fn release(&self, index: u32) {
        let mut state = self.state.lock();
        if !state.active.remove(&index) {
            error!("Input frame slot {} released while not active", index);
            return;
        }

        let current = state.resolution;
        let resizable = state.resizable;
        let matches = state.slots[index as usize]
            .buffer
            .read()
            .as_ref()
            .map(|b| b.resolution() == current)
            .unwrap_or(false);

        if matches || !resizable {
            state.free.push(index);
        } else {
            debug!("Dropping stale input buffer in slot {}", index);
            state.free_slot_buffer(index);
        }
    }
}

/// Buffer counts, for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Slots that currently hold a native buffer
    pub allocated: usize,
    /// Unreferenced buffers ready for reuse
    pub free: usize,
    /// Buffers referenced by at least one handle
    pub active: usize,
}

/// Pool of encoder input buffers bound to one backend
///
/// Clones share the same pool. Encoders keep a clone to read the frames
/// they are handed.
#[derive(Clone)]
pub struct InputPool {
    shared: Arc<PoolShared>,
}

impl InputPool {
    /// Create a pool for a backend compiled into this build.
    ///
    /// Asking for a backend without an implementation is a startup failure:
    /// the matching codec plugin is missing.
    pub fn create_for_backend(
        kind: BackendKind,
        device: DeviceHandle,
        resolution: Resolution,
        resizable: bool,
    ) -> Result<Self> {
        let backend: Box<dyn GpuBufferBackend> = match kind {
            BackendKind::Host => Box::new(HostBackend::new(PixelFormat::Bgra8)),
            other => {
                error!("No encoder input implementation for {} (device {:?})", other, device);
                return Err(AppError::BackendUnavailable(other));
            }
        };
        Ok(Self::with_backend(backend, resolution, resizable))
    }

    /// Create a pool around an injected backend
    pub fn with_backend(
        backend: Box<dyn GpuBufferBackend>,
        resolution: Resolution,
        resizable: bool,
    ) -> Self {
        info!(
            "Encoder input pool: {} backend, {}, resizable={}",
            backend.kind(),
            resolution,
            resizable
        );
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    backend,
                    slots: Vec::new(),
                    free: Vec::new(),
                    vacant: Vec::new(),
                    active: HashSet::new(),
                    resolution,
                    resizable,
                    next_frame_id: 1,
                }),
            }),
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.shared.state.lock().backend.kind()
    }

    pub fn format(&self) -> PixelFormat {
        self.shared.state.lock().backend.format()
    }

    pub fn resolution(&self) -> Resolution {
        self.shared.state.lock().resolution
    }

    /// Get a frame from the free list, or allocate a new buffer at the
    /// current resolution. Allocation is the only stall here.
    pub fn obtain_input_frame(&self) -> Result<InputFrame> {
        let mut state = self.shared.state.lock();

        let index = match state.free.pop() {
            Some(index) => index,
            None => {
                let resolution = state.resolution;
                let buffer = state.backend.allocate(resolution)?;
                let index = match state.vacant.pop() {
                    Some(index) => index,
                    None => {
                        state.slots.push(Arc::new(Slot::vacant()));
                        (state.slots.len() - 1) as u32
                    }
                };
                *state.slots[index as usize].buffer.write() = Some(buffer);
                index
            }
        };

        let frame_id = state.take_frame_id();
        let slot = state.slots[index as usize].clone();
        slot.refs.store(1, Ordering::Release);
        *slot.meta.lock() = FrameMeta {
            frame_id,
            timestamp_us: 0,
        };
        state.active.insert(index);

        Ok(InputFrame {
            shared: self.shared.clone(),
            slot,
            index,
        })
    }

    /// Change the size of future buffers. Unreferenced buffers are freed now;
    /// in-flight ones are freed when their last handle drops.
    pub fn set_resolution(&self, resolution: Resolution) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.resolution == resolution {
            return Ok(());
        }
        if !state.resizable {
            return Err(AppError::InvalidState(format!(
                "input pool is fixed at {}",
                state.resolution
            )));
        }
        info!("Input pool resolution {} -> {}", state.resolution, resolution);
        state.resolution = resolution;
        Self::flush_locked(&mut state);
        Ok(())
    }

    /// Free every buffer that is not currently referenced
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        Self::flush_locked(&mut state);
    }

    fn flush_locked(state: &mut PoolState) {
        let free = std::mem::take(&mut state.free);
        if !free.is_empty() {
            debug!("Flushing {} input buffers", free.len());
        }
        for index in free {
            state.free_slot_buffer(index);
        }
    }

    /// Copy a rendered frame into `frame`'s buffer.
    ///
    /// Only allowed while `frame` is the sole handle, so nothing downstream
    /// can observe a half-written buffer.
    pub fn copy_into(&self, frame: &mut InputFrame, source: &SourceFrame) -> Result<CopyMode> {
        frame.ensure_unique()?;
        let mut state = self.shared.state.lock();
        let mut buffer = frame.slot.buffer.write();
        let buffer = buffer
            .as_mut()
            .ok_or_else(|| AppError::Internal(format!("slot {} has no buffer", frame.index)))?;
        state.backend.copy_frame(source, buffer)
    }

    /// Fill `frame` with a solid colour (r, g, b, a)
    pub fn fill(&self, frame: &mut InputFrame, rgba: [u8; 4]) -> Result<()> {
        frame.ensure_unique()?;
        let mut state = self.shared.state.lock();
        let mut buffer = frame.slot.buffer.write();
        let buffer = buffer
            .as_mut()
            .ok_or_else(|| AppError::Internal(format!("slot {} has no buffer", frame.index)))?;
        state.backend.fill(buffer, rgba)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            allocated: state.slots.len() - state.vacant.len(),
            free: state.free.len(),
            active: state.active.len(),
        }
    }
}

impl fmt::Debug for InputPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputPool").field("stats", &self.stats()).finish()
    }
}

/// Reference-counted handle to one pooled buffer
pub struct InputFrame {
    shared: Arc<PoolShared>,
    slot: Arc<Slot>,
    index: u32,
}

impl InputFrame {
    pub fn frame_id(&self) -> u32 {
        self.slot.meta.lock().frame_id
    }

    /// Capture timestamp in microseconds
    pub fn timestamp_us(&self) -> u64 {
        self.slot.meta.lock().timestamp_us
    }

    pub fn set_timestamp_us(&mut self, timestamp_us: u64) {
        self.slot.meta.lock().timestamp_us = timestamp_us;
    }

    pub fn resolution(&self) -> Resolution {
        self.slot
            .buffer
            .read()
            .as_ref()
            .map(|b| b.resolution())
            .unwrap_or(Resolution::new(0, 0))
    }

    /// Number of live handles to this frame
    pub fn ref_count(&self) -> u32 {
        self.slot.refs.load(Ordering::Acquire)
    }

    /// Read access to the native buffer
    pub fn read<R>(&self, f: impl FnOnce(&NativeBuffer) -> R) -> Option<R> {
        self.slot.buffer.read().as_ref().map(f)
    }

    fn ensure_unique(&self) -> Result<()> {
        if self.ref_count() != 1 {
            return Err(AppError::InvalidState(format!(
                "input frame {} is shared and can no longer be written",
                self.frame_id()
            )));
        }
        Ok(())
    }
}

impl Clone for InputFrame {
    fn clone(&self) -> Self {
        self.slot.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: self.shared.clone(),
            slot: self.slot.clone(),
            index: self.index,
        }
    }
}

impl Drop for InputFrame {
    fn drop(&mut self) {
        if self.slot.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.release(self.index);
        }
    }
}

impl fmt::Debug for InputFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputFrame")
            .field("slot", &self.index)
            .field("frame_id", &self.frame_id())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Host backend that counts allocate/release calls
    pub struct CountingBackend {
        inner: HostBackend,
        pub allocs: Arc<AtomicUsize>,
        pub releases: Arc<AtomicUsize>,
    }

    impl CountingBackend {
        pub fn new() -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let allocs = Arc::new(AtomicUsize::new(0));
            let releases = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    inner: HostBackend::new(PixelFormat::Bgra8),
                    allocs: allocs.clone(),
                    releases: releases.clone(),
                },
                allocs,
                releases,
            )
        }
    }

    impl GpuBufferBackend for CountingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Host
        }

        fn format(&self) -> PixelFormat {
            self.inner.format()
        }

        fn allocate(&mut self, resolution: Resolution) -> Result<NativeBuffer> {
            self.allocs.fetch_add(1, Ordering::SeqCst);
            self.inner.allocate(resolution)
        }

        fn release(&mut self, buffer: NativeBuffer) {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.inner.release(buffer);
        }
    }
}
