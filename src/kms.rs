//! Kernel display device interface
//!
//! The swap chain and the cursor talk to the display hardware only through
//! these traits. They follow the DRM/KMS + GBM call shapes (surface lock and
//! release, framebuffer add/remove, CRTC modeset, page flip with an event on
//! the device fd) without committing to the ioctl ABI.

use crate::handle::{BufferHandle, ConnectorId, CrtcId, FramebufferId, SurfaceId};
use crate::Result;
use bitflags::bitflags;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

/// DRM fourcc format codes
pub mod drm_fourcc {
    pub const DRM_FORMAT_XRGB8888: u32 = 0x34325258; // 'XR24'
    pub const DRM_FORMAT_ARGB8888: u32 = 0x34325241; // 'AR24'
}

/// Scanout buffer format
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Xrgb8888 = drm_fourcc::DRM_FORMAT_XRGB8888,
    Argb8888 = drm_fourcc::DRM_FORMAT_ARGB8888,
}

impl PixelFormat {
    /// Opaque windows scan out without alpha
    pub fn for_window(opaque: bool, alpha_bits: u32) -> Self {
        if opaque || alpha_bits == 0 {
            PixelFormat::Xrgb8888
        } else {
            PixelFormat::Argb8888
        }
    }

    pub fn fourcc(self) -> u32 {
        self as u32
    }

    pub fn depth(self) -> u32 {
        match self {
            PixelFormat::Xrgb8888 => 24,
            PixelFormat::Argb8888 => 32,
        }
    }

    pub fn bpp(self) -> u32 {
        32
    }
}

bitflags! {
    /// GBM buffer usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        const SCANOUT = 1 << 0;
        const CURSOR = 1 << 1;
        const RENDERING = 1 << 2;
        const WRITE = 1 << 3;
        const LINEAR = 1 << 4;
    }
}

/// Display timing of an output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
}

/// The CRTC/connector pair driving the primary output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputInfo {
    pub crtc: CrtcId,
    pub connector: ConnectorId,
    pub mode: DisplayMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
}

/// Completion of a page flip that asked for an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlipEvent {
    pub crtc: CrtcId,
    pub sequence: u32,
    pub user_data: u64,
}

/// Swap-chain side of a DRM/GBM device.
///
/// The raw fd becomes readable when page-flip completions are queued;
/// `handle_events` then runs the handler for each of them.
pub trait KmsDevice: AsRawFd {
    fn primary_output(&self) -> Result<OutputInfo>;

    fn create_surface(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
        buffers: usize,
    ) -> Result<SurfaceId>;

    fn destroy_surface(&mut self, surface: SurfaceId) -> Result<()>;

    /// Take the most recently rendered buffer of the surface
    fn lock_front_buffer(&mut self, surface: SurfaceId) -> Result<BufferHandle>;

    /// Return a locked buffer to the surface for rendering
    fn release_buffer(&mut self, surface: SurfaceId, bo: BufferHandle) -> Result<()>;

    fn buffer_info(&self, bo: BufferHandle) -> Result<BufferInfo>;

    fn add_framebuffer(&mut self, bo: BufferHandle) -> Result<FramebufferId>;

    fn remove_framebuffer(&mut self, fb: FramebufferId) -> Result<()>;

    fn set_crtc(
        &mut self,
        crtc: CrtcId,
        fb: FramebufferId,
        x: u32,
        y: u32,
        connector: ConnectorId,
        mode: &DisplayMode,
    ) -> Result<()>;

    /// Queue a flip to `fb`; with `event` set, a completion carrying that
    /// user data is delivered through `handle_events`.
    fn page_flip(&mut self, crtc: CrtcId, fb: FramebufferId, event: Option<u64>) -> Result<()>;

    /// Read the device fd and dispatch queued completions; returns how many
    fn handle_events(&mut self, handler: &mut dyn FnMut(PageFlipEvent)) -> Result<usize>;
}

/// Hardware cursor plane of a DRM device
pub trait CursorPlane {
    /// Edge length of the (square) cursor plane
    fn cursor_plane_size(&self) -> u32;

    fn create_cursor_bo(&mut self, width: u32, height: u32) -> Result<BufferHandle>;

    /// Upload ARGB pixels covering the whole buffer
    fn write_cursor_bo(&mut self, bo: BufferHandle, pixels: &[u32]) -> Result<()>;

    /// Bind `bo` to the CRTC cursor plane, or unbind with `None`
    fn set_cursor(&mut self, crtc: CrtcId, bo: Option<BufferHandle>, hotspot: (i32, i32)) -> Result<()>;

    fn move_cursor(&mut self, crtc: CrtcId, x: i32, y: i32) -> Result<()>;

    fn destroy_bo(&mut self, bo: BufferHandle) -> Result<()>;
}

/// Wait until `fd` is readable. `Ok(false)` means the timeout expired.
pub fn wait_readable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    let timeout_ms: libc::c_int = match timeout {
        Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        None => -1,
    };
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    loop {
        // SAFETY: pfd is a valid pollfd for the duration of the call
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if ret > 0 && pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device fd reported an error"));
        }
        return Ok(ret > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_format_selection() {
        assert_eq!(PixelFormat::for_window(true, 8), PixelFormat::Xrgb8888);
        assert_eq!(PixelFormat::for_window(false, 0), PixelFormat::Xrgb8888);
        assert_eq!(PixelFormat::for_window(false, 8), PixelFormat::Argb8888);
        assert_eq!(PixelFormat::Argb8888.fourcc(), 0x34325241);
    }

    #[test]
    fn test_wait_readable_times_out_on_idle_fd() {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds has room for the two descriptors pipe() writes
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ready = wait_readable(fds[0], Some(Duration::from_millis(5))).unwrap();
        assert!(!ready);
        // SAFETY: both descriptors were just created and are closed once
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
