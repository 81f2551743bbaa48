//! Encoder input backends
//!
//! A backend allocates and frees the native buffers an encoder reads from
//! and copies rendered frames into them. Each accelerator family gets its own
//! variant; only the host-memory backend is compiled in, the others are the
//! seam where vendor SDK integrations plug in.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

use crate::error::{AppError, Result};
use crate::video::format::{PixelFormat, Resolution};
use crate::video::frame::SourceFrame;

/// Accelerator family an input pool is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    D3d11,
    D3d12,
    Cuda,
    Vulkan,
    /// System memory
    Host,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::D3d11 => write!(f, "D3D11"),
            BackendKind::D3d12 => write!(f, "D3D12"),
            BackendKind::Cuda => write!(f, "CUDA"),
            BackendKind::Vulkan => write!(f, "Vulkan"),
            BackendKind::Host => write!(f, "Host"),
        }
    }
}

/// Opaque accelerator device (device pointer, context or queue)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceHandle(pub u64);

/// System-memory pixel buffer
#[derive(Debug)]
pub struct HostBuffer {
    pub data: Vec<u8>,
    pub resolution: Resolution,
    pub format: PixelFormat,
}

impl HostBuffer {
    pub fn new(resolution: Resolution, format: PixelFormat) -> Self {
        Self {
            data: vec![0u8; format.frame_size(resolution)],
            resolution,
            format,
        }
    }
}

/// Backend-native buffer. Owned by the pool, never handed out by value.
#[derive(Debug)]
pub enum NativeBuffer {
    Host(HostBuffer),
    /// Accelerator resource (texture, imported array, image)
    External { handle: u64, resolution: Resolution },
}

impl NativeBuffer {
    pub fn resolution(&self) -> Resolution {
        match self {
            NativeBuffer::Host(buf) => buf.resolution,
            NativeBuffer::External { resolution, .. } => *resolution,
        }
    }

    pub fn as_host(&self) -> Option<&HostBuffer> {
        match self {
            NativeBuffer::Host(buf) => Some(buf),
            NativeBuffer::External { .. } => None,
        }
    }
}

/// How a source frame ended up in an input buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Same format and size
    Blit,
    /// Same size, channel order converted
    Swizzle,
    /// Size differs, bilinear resample
    Resample,
}

/// Allocation, release and copy for one accelerator family
pub trait GpuBufferBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Pixel format of the buffers this backend allocates
    fn format(&self) -> PixelFormat;

    fn allocate(&mut self, resolution: Resolution) -> Result<NativeBuffer>;

    /// Free a buffer. Called exactly once per allocated buffer.
    fn release(&mut self, buffer: NativeBuffer);

    /// Copy a rendered frame into `target`
    fn copy_frame(&mut self, source: &SourceFrame, target: &mut NativeBuffer) -> Result<CopyMode> {
        match target {
            NativeBuffer::Host(buf) => Ok(copy_to_host(source, buf)),
            NativeBuffer::External { .. } => Err(AppError::Capture(format!(
                "{} backend cannot copy into external buffers",
                self.kind()
            ))),
        }
    }

    /// Overwrite `target` with one colour (r, g, b, a)
    fn fill(&mut self, target: &mut NativeBuffer, rgba: [u8; 4]) -> Result<()> {
        match target {
            NativeBuffer::Host(buf) => {
                fill_host(buf, rgba);
                Ok(())
            }
            NativeBuffer::External { .. } => Err(AppError::Capture(format!(
                "{} backend cannot fill external buffers",
                self.kind()
            ))),
        }
    }
}

/// System-memory backend
pub struct HostBackend {
    format: PixelFormat,
}

impl HostBackend {
    pub fn new(format: PixelFormat) -> Self {
        Self { format }
    }
}

impl GpuBufferBackend for HostBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Host
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn allocate(&mut self, resolution: Resolution) -> Result<NativeBuffer> {
        if resolution.is_empty() {
            return Err(AppError::Capture(format!(
                "cannot allocate {} input buffer",
                resolution
            )));
        }
        trace!("Allocating host input buffer {}", resolution);
        Ok(NativeBuffer::Host(HostBuffer::new(resolution, self.format)))
    }

    fn release(&mut self, buffer: NativeBuffer) {
        trace!("Releasing host input buffer {}", buffer.resolution());
    }
}

/// CPU copy with format conversion and bilinear scaling
pub fn copy_to_host(source: &SourceFrame, target: &mut HostBuffer) -> CopyMode {
    let src_res = source.resolution;
    let dst_res = target.resolution;
    let bpp = target.format.bytes_per_pixel();
    let dst_stride = dst_res.width as usize * bpp;

    if src_res == dst_res {
        if source.format == target.format {
            for y in 0..dst_res.height as usize {
                target.data[y * dst_stride..(y + 1) * dst_stride].copy_from_slice(source.row(y));
            }
            return CopyMode::Blit;
        }

        let src_off = source.format.channel_offsets();
        let dst_off = target.format.channel_offsets();
        for y in 0..dst_res.height as usize {
            let row = source.row(y);
            let out = &mut target.data[y * dst_stride..(y + 1) * dst_stride];
            for (src_px, dst_px) in row.chunks_exact(bpp).zip(out.chunks_exact_mut(bpp)) {
                for c in 0..4 {
                    dst_px[dst_off[c]] = src_px[src_off[c]];
                }
            }
        }
        return CopyMode::Swizzle;
    }

    resample_bilinear(source, target);
    CopyMode::Resample
}

fn resample_bilinear(source: &SourceFrame, target: &mut HostBuffer) {
    let (sw, sh) = (source.width() as usize, source.height() as usize);
    let (dw, dh) = (target.resolution.width as usize, target.resolution.height as usize);
    let src_bpp = source.format.bytes_per_pixel();
    let dst_bpp = target.format.bytes_per_pixel();
    let src_off = source.format.channel_offsets();
    let dst_off = target.format.channel_offsets();

    let x_ratio = sw as f32 / dw as f32;
    let y_ratio = sh as f32 / dh as f32;

    for dy in 0..dh {
        let fy = ((dy as f32 + 0.5) * y_ratio - 0.5).max(0.0);
        let y0 = (fy as usize).min(sh - 1);
        let y1 = (y0 + 1).min(sh - 1);
        let wy = fy - y0 as f32;
        let row0 = source.row(y0);
        let row1 = source.row(y1);

        for dx in 0..dw {
            let fx = ((dx as f32 + 0.5) * x_ratio - 0.5).max(0.0);
            let x0 = (fx as usize).min(sw - 1);
            let x1 = (x0 + 1).min(sw - 1);
            let wx = fx - x0 as f32;

            let out = (dy * dw + dx) * dst_bpp;
            for c in 0..4 {
                let sc = src_off[c];
                let p00 = row0[x0 * src_bpp + sc] as f32;
                let p01 = row0[x1 * src_bpp + sc] as f32;
                let p10 = row1[x0 * src_bpp + sc] as f32;
                let p11 = row1[x1 * src_bpp + sc] as f32;
                let top = p00 + (p01 - p00) * wx;
                let bottom = p10 + (p11 - p10) * wx;
                let value = top + (bottom - top) * wy;
                target.data[out + dst_off[c]] = value.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

fn fill_host(target: &mut HostBuffer, rgba: [u8; 4]) {
    let offsets = target.format.channel_offsets();
    let mut pixel = [0u8; 4];
    for (c, offset) in offsets.iter().enumerate() {
        pixel[*offset] = rgba[c];
    }
    for px in target.data.chunks_exact_mut(4) {
        px.copy_from_slice(&pixel);
    }
}
