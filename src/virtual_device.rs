//! Virtual DRM/GBM device
//!
//! A software display device with the same object model as a kernel KMS
//! device: GBM-style surfaces with buffer rings, framebuffers wrapping buffer
//! objects, one CRTC driving one connector, and a cursor plane. Page-flip
//! completions are signalled through a pipe so callers wait on a real fd,
//! exactly as they would on `/dev/dri/cardN`.
//!
//! # DRM Object IDs
//! - Connector: 1
//! - CRTC: 10
//! - Surfaces: 50+
//! - Framebuffers: 100+
//! - Buffer objects: 1000+

use crate::handle::{BufferHandle, ConnectorId, CrtcId, FramebufferId, SurfaceId};
use crate::kms::{
    BufferInfo, BufferUsage, CursorPlane, DisplayMode, KmsDevice, OutputInfo, PageFlipEvent, PixelFormat,
};
use crate::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tracing::{debug, info, warn};

const CONNECTOR_ID: u32 = 1;
const CRTC_ID: u32 = 10;
const SURFACE_ID_BASE: u32 = 50;
const FB_ID_BASE: u32 = 100;
const BO_ID_BASE: u32 = 1000;

/// Operations the device performed, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    Lock(BufferHandle),
    Release(BufferHandle),
    AddFramebuffer { fb: FramebufferId, bo: BufferHandle },
    RemoveFramebuffer(FramebufferId),
    SetCrtc(FramebufferId),
    PageFlip { fb: FramebufferId, event: bool },
    FlipComplete(FramebufferId),
    SetCursor(Option<BufferHandle>),
    MoveCursor { x: i32, y: i32 },
}

/// Failure injection for exercising error paths
#[derive(Debug, Clone, Default)]
pub struct Faults {
    pub reject_modeset: bool,
    /// Fail the next framebuffer creation only
    pub fail_next_framebuffer: bool,
    pub reject_flip: bool,
    /// Accept flips but never signal their completion
    pub hold_flips: bool,
    /// Fail the next buffer release only
    pub fail_next_release: bool,
    pub reject_cursor: bool,
}

#[derive(Debug)]
struct BufferObject {
    info: BufferInfo,
    usage: BufferUsage,
    surface: Option<SurfaceId>,
    locked: bool,
    pixels: Vec<u32>,
}

#[derive(Debug)]
struct Surface {
    ring: Vec<BufferHandle>,
    next: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CrtcState {
    pub scanout: Option<FramebufferId>,
    pub mode_set: bool,
    pub cursor: Option<BufferHandle>,
    pub cursor_hotspot: (i32, i32),
    pub cursor_position: (i32, i32),
}

#[derive(Debug, Clone, Copy)]
struct PendingFlip {
    fb: FramebufferId,
    user_data: u64,
    signalled: bool,
}

/// Software KMS device with a pipe-backed event fd
pub struct VirtualKmsDevice {
    mode: DisplayMode,
    cursor_size: u32,
    events_rx: OwnedFd,
    events_tx: OwnedFd,
    next_bo: u32,
    next_fb: u32,
    next_surface: u32,
    buffers: HashMap<BufferHandle, BufferObject>,
    surfaces: HashMap<SurfaceId, Surface>,
    framebuffers: HashMap<FramebufferId, BufferHandle>,
    crtc: CrtcState,
    pending_flip: Option<PendingFlip>,
    /// Completions for other CRTCs sharing the fd
    foreign_events: Vec<u64>,
    flip_sequence: u32,
    journal: Vec<DeviceOp>,
    faults: Faults,
}

impl VirtualKmsDevice {
    pub fn new(mode: DisplayMode, cursor_size: u32) -> Result<Self> {
        info!(
            "Creating virtual KMS device {}x{}@{}",
            mode.width, mode.height, mode.refresh_rate
        );

        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds has room for the two descriptors pipe2() writes
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        // SAFETY: pipe2 succeeded, so both descriptors are open and owned by us
        let (events_rx, events_tx) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        Ok(Self {
            mode,
            cursor_size,
            events_rx,
            events_tx,
            next_bo: BO_ID_BASE,
            next_fb: FB_ID_BASE,
            next_surface: SURFACE_ID_BASE,
            buffers: HashMap::new(),
            surfaces: HashMap::new(),
            framebuffers: HashMap::new(),
            crtc: CrtcState::default(),
            pending_flip: None,
            foreign_events: Vec::new(),
            flip_sequence: 0,
            journal: Vec::new(),
            faults: Faults::default(),
        })
    }

    pub fn faults_mut(&mut self) -> &mut Faults {
        &mut self.faults
    }

    pub fn journal(&self) -> &[DeviceOp] {
        &self.journal
    }

    pub fn crtc_state(&self) -> CrtcState {
        self.crtc
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Buffer object wrapped by `fb`
    pub fn framebuffer_buffer(&self, fb: FramebufferId) -> Option<BufferHandle> {
        self.framebuffers.get(&fb).copied()
    }

    pub fn cursor_pixels(&self, bo: BufferHandle) -> Option<&[u32]> {
        self.buffers.get(&bo).map(|b| b.pixels.as_slice())
    }

    /// Signal completion of a flip that was held back by `Faults::hold_flips`
    pub fn release_held_flip(&mut self) -> Result<()> {
        match self.pending_flip.as_mut() {
            Some(flip) if !flip.signalled => {
                flip.signalled = true;
                self.signal_vblank()
            }
            _ => Ok(()),
        }
    }

    /// Queue a completion carrying `user_data` as if a flip on another CRTC
    /// of the same device had finished
    pub fn inject_flip_event(&mut self, user_data: u64) -> Result<()> {
        self.foreign_events.push(user_data);
        self.signal_vblank()
    }

    fn alloc_bo(&mut self, info: BufferInfo, usage: BufferUsage, surface: Option<SurfaceId>) -> BufferHandle {
        let bo = BufferHandle::from_raw(self.next_bo);
        self.next_bo += 1;
        let pixels = if usage.contains(BufferUsage::WRITE) {
            vec![0; (info.width * info.height) as usize]
        } else {
            Vec::new()
        };
        self.buffers.insert(
            bo,
            BufferObject {
                info,
                usage,
                surface,
                locked: false,
                pixels,
            },
        );
        bo
    }

    fn check_crtc(&self, crtc: CrtcId) -> Result<()> {
        if crtc.raw() == CRTC_ID {
            Ok(())
        } else {
            Err(Error::Platform(format!("unknown CRTC {}", crtc)))
        }
    }

    fn signal_vblank(&mut self) -> Result<()> {
        let byte = 1u8;
        // SAFETY: writes one byte from a live stack variable to our own pipe
        let ret = unsafe {
            libc::write(
                self.events_tx.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn drain_event_pipe(&mut self) -> Result<usize> {
        let mut total = 0;
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: reads into a live stack buffer of the given length
            let ret = unsafe {
                libc::read(
                    self.events_rx.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if ret > 0 {
                total += ret as usize;
                continue;
            }
            if ret == 0 {
                return Ok(total);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return Ok(total),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(Error::Io(err)),
            }
        }
    }
}

impl AsRawFd for VirtualKmsDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.events_rx.as_raw_fd()
    }
}

impl KmsDevice for VirtualKmsDevice {
    fn primary_output(&self) -> Result<OutputInfo> {
        Ok(OutputInfo {
            crtc: CrtcId::from_raw(CRTC_ID),
            connector: ConnectorId::from_raw(CONNECTOR_ID),
            mode: self.mode,
        })
    }

    fn create_surface(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
        buffers: usize,
    ) -> Result<SurfaceId> {
        if width == 0 || height == 0 {
            return Err(Error::BufferAlloc(format!("invalid surface size {}x{}", width, height)));
        }
        let surface = SurfaceId::from_raw(self.next_surface);
        self.next_surface += 1;

        let info = BufferInfo {
            width,
            height,
            stride: width * format.bpp() / 8,
            format,
        };
        let ring = (0..buffers).map(|_| self.alloc_bo(info, usage, Some(surface))).collect();
        self.surfaces.insert(surface, Surface { ring, next: 0 });

        info!("Created surface {} {}x{} with {} buffers", surface, width, height, buffers);
        Ok(surface)
    }

    fn destroy_surface(&mut self, surface: SurfaceId) -> Result<()> {
        let s = self
            .surfaces
            .remove(&surface)
            .ok_or_else(|| Error::Platform(format!("unknown surface {}", surface)))?;
        for bo in s.ring {
            self.buffers.remove(&bo);
        }
        debug!("Destroyed surface {}", surface);
        Ok(())
    }

    fn lock_front_buffer(&mut self, surface: SurfaceId) -> Result<BufferHandle> {
        let s = self
            .surfaces
            .get_mut(&surface)
            .ok_or_else(|| Error::Platform(format!("unknown surface {}", surface)))?;

        let len = s.ring.len();
        for step in 0..len {
            let index = (s.next + step) % len;
            let bo = s.ring[index];
            if let Some(buffer) = self.buffers.get_mut(&bo) {
                if !buffer.locked {
                    buffer.locked = true;
                    s.next = (index + 1) % len;
                    self.journal.push(DeviceOp::Lock(bo));
                    return Ok(bo);
                }
            }
        }
        Err(Error::BufferAlloc(format!("surface {} has no free buffers", surface)))
    }

    fn release_buffer(&mut self, surface: SurfaceId, bo: BufferHandle) -> Result<()> {
        let buffer = self
            .buffers
            .get_mut(&bo)
            .ok_or_else(|| Error::Platform(format!("unknown buffer {}", bo)))?;
        if buffer.surface != Some(surface) || !buffer.locked {
            return Err(Error::Platform(format!("buffer {} is not locked on surface {}", bo, surface)));
        }
        if std::mem::take(&mut self.faults.fail_next_release) {
            return Err(Error::Platform(format!("release of buffer {}: EIO", bo)));
        }
        buffer.locked = false;
        self.journal.push(DeviceOp::Release(bo));
        Ok(())
    }

    fn buffer_info(&self, bo: BufferHandle) -> Result<BufferInfo> {
        self.buffers
            .get(&bo)
            .map(|b| b.info)
            .ok_or_else(|| Error::Platform(format!("unknown buffer {}", bo)))
    }

    fn add_framebuffer(&mut self, bo: BufferHandle) -> Result<FramebufferId> {
        if std::mem::take(&mut self.faults.fail_next_framebuffer) {
            return Err(Error::Framebuffer(format!("ADDFB2 rejected buffer {}", bo)));
        }
        let info = self.buffer_info(bo).map_err(|e| Error::Framebuffer(e.to_string()))?;

        let fb = FramebufferId::from_raw(self.next_fb);
        self.next_fb += 1;
        self.framebuffers.insert(fb, bo);
        self.journal.push(DeviceOp::AddFramebuffer { fb, bo });

        debug!(
            "Created framebuffer {}: {}x{} format=0x{:08x}",
            fb,
            info.width,
            info.height,
            info.format.fourcc()
        );
        Ok(fb)
    }

    fn remove_framebuffer(&mut self, fb: FramebufferId) -> Result<()> {
        if self.framebuffers.remove(&fb).is_some() {
            if self.crtc.scanout == Some(fb) {
                self.crtc.scanout = None;
            }
            self.journal.push(DeviceOp::RemoveFramebuffer(fb));
            debug!("Removed framebuffer {}", fb);
            Ok(())
        } else {
            Err(Error::Framebuffer(format!("framebuffer {} not found", fb)))
        }
    }

    fn set_crtc(
        &mut self,
        crtc: CrtcId,
        fb: FramebufferId,
        x: u32,
        y: u32,
        connector: ConnectorId,
        mode: &DisplayMode,
    ) -> Result<()> {
        self.check_crtc(crtc)?;
        if self.faults.reject_modeset {
            return Err(Error::Platform("SETCRTC: EINVAL".into()));
        }
        if connector.raw() != CONNECTOR_ID {
            return Err(Error::Platform(format!("unknown connector {}", connector)));
        }
        if x != 0 || y != 0 {
            return Err(Error::Platform(format!("SETCRTC: offset {},{} not supported", x, y)));
        }
        if *mode != self.mode {
            return Err(Error::Platform(format!("SETCRTC: unsupported mode {}x{}", mode.width, mode.height)));
        }
        if !self.framebuffers.contains_key(&fb) {
            return Err(Error::Platform(format!("SETCRTC: framebuffer {} not found", fb)));
        }

        self.crtc.scanout = Some(fb);
        self.crtc.mode_set = true;
        self.journal.push(DeviceOp::SetCrtc(fb));
        debug!("CRTC {} scanning out {}", crtc, fb);
        Ok(())
    }

    fn page_flip(&mut self, crtc: CrtcId, fb: FramebufferId, event: Option<u64>) -> Result<()> {
        self.check_crtc(crtc)?;
        if !self.crtc.mode_set {
            return Err(Error::PageFlip(format!("CRTC {} has no mode set", crtc)));
        }
        if self.faults.reject_flip {
            return Err(Error::PageFlip("PAGE_FLIP: EINVAL".into()));
        }
        if !self.framebuffers.contains_key(&fb) {
            return Err(Error::PageFlip(format!("framebuffer {} not found", fb)));
        }
        if self.pending_flip.is_some() {
            return Err(Error::PageFlip("PAGE_FLIP: EBUSY".into()));
        }

        self.journal.push(DeviceOp::PageFlip { fb, event: event.is_some() });
        match event {
            Some(user_data) => {
                let signalled = !self.faults.hold_flips;
                self.pending_flip = Some(PendingFlip { fb, user_data, signalled });
                if signalled {
                    self.signal_vblank()?;
                }
            }
            None => {
                self.crtc.scanout = Some(fb);
            }
        }
        Ok(())
    }

    fn handle_events(&mut self, handler: &mut dyn FnMut(PageFlipEvent)) -> Result<usize> {
        if self.drain_event_pipe()? == 0 {
            return Ok(0);
        }

        let mut delivered = 0;
        for user_data in std::mem::take(&mut self.foreign_events) {
            self.flip_sequence = self.flip_sequence.wrapping_add(1);
            handler(PageFlipEvent {
                crtc: CrtcId::from_raw(CRTC_ID + 1),
                sequence: self.flip_sequence,
                user_data,
            });
            delivered += 1;
        }

        match self.pending_flip {
            Some(flip) if flip.signalled => {
                self.pending_flip = None;
                self.flip_sequence = self.flip_sequence.wrapping_add(1);
                self.crtc.scanout = Some(flip.fb);
                self.journal.push(DeviceOp::FlipComplete(flip.fb));
                handler(PageFlipEvent {
                    crtc: CrtcId::from_raw(CRTC_ID),
                    sequence: self.flip_sequence,
                    user_data: flip.user_data,
                });
                delivered += 1;
            }
            _ if delivered == 0 => warn!("Vblank signalled with no flip pending"),
            _ => {}
        }
        Ok(delivered)
    }
}

impl CursorPlane for VirtualKmsDevice {
    fn cursor_plane_size(&self) -> u32 {
        self.cursor_size
    }

    fn create_cursor_bo(&mut self, width: u32, height: u32) -> Result<BufferHandle> {
        if width > self.cursor_size || height > self.cursor_size {
            return Err(Error::BufferAlloc(format!(
                "cursor buffer {}x{} exceeds the {}x{} plane",
                width, height, self.cursor_size, self.cursor_size
            )));
        }
        let info = BufferInfo {
            width,
            height,
            stride: width * 4,
            format: PixelFormat::Argb8888,
        };
        Ok(self.alloc_bo(info, BufferUsage::CURSOR | BufferUsage::WRITE, None))
    }

    fn write_cursor_bo(&mut self, bo: BufferHandle, pixels: &[u32]) -> Result<()> {
        let buffer = self
            .buffers
            .get_mut(&bo)
            .ok_or_else(|| Error::Cursor(format!("unknown buffer {}", bo)))?;
        if !buffer.usage.contains(BufferUsage::WRITE) {
            return Err(Error::Cursor(format!("buffer {} is not writable", bo)));
        }
        if pixels.len() != buffer.pixels.len() {
            return Err(Error::Cursor(format!(
                "expected {} pixels for buffer {}, got {}",
                buffer.pixels.len(),
                bo,
                pixels.len()
            )));
        }
        buffer.pixels.copy_from_slice(pixels);
        Ok(())
    }

    fn set_cursor(&mut self, crtc: CrtcId, bo: Option<BufferHandle>, hotspot: (i32, i32)) -> Result<()> {
        self.check_crtc(crtc)?;
        if self.faults.reject_cursor {
            return Err(Error::Cursor("SETCURSOR2: EINVAL".into()));
        }
        if let Some(bo) = bo {
            let usage = self
                .buffers
                .get(&bo)
                .map(|b| b.usage)
                .ok_or_else(|| Error::Cursor(format!("unknown buffer {}", bo)))?;
            if !usage.contains(BufferUsage::CURSOR) {
                return Err(Error::Cursor(format!("buffer {} is not a cursor buffer", bo)));
            }
        }
        self.crtc.cursor = bo;
        self.crtc.cursor_hotspot = hotspot;
        self.journal.push(DeviceOp::SetCursor(bo));
        Ok(())
    }

    fn move_cursor(&mut self, crtc: CrtcId, x: i32, y: i32) -> Result<()> {
        self.check_crtc(crtc)?;
        self.crtc.cursor_position = (x, y);
        self.journal.push(DeviceOp::MoveCursor { x, y });
        Ok(())
    }

    fn destroy_bo(&mut self, bo: BufferHandle) -> Result<()> {
        if self.crtc.cursor == Some(bo) {
            warn!("Destroying cursor buffer {} while it is still bound", bo);
            self.crtc.cursor = None;
        }
        self.buffers
            .remove(&bo)
            .map(|_| ())
            .ok_or_else(|| Error::Cursor(format!("unknown buffer {}", bo)))
    }
}

impl Drop for VirtualKmsDevice {
    fn drop(&mut self) {
        debug!(
            "Closing virtual KMS device ({} buffers, {} framebuffers left)",
            self.buffers.len(),
            self.framebuffers.len()
        );
    }
}

#[cfg(test)]
pub(crate) fn test_device() -> VirtualKmsDevice {
    let mode = DisplayMode {
        width: 1280,
        height: 720,
        refresh_rate: 60,
    };
    VirtualKmsDevice::new(mode, 64).expect("virtual device")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_hands_out_each_buffer_once() {
        let mut dev = test_device();
        let surface = dev
            .create_surface(64, 64, PixelFormat::Xrgb8888, BufferUsage::SCANOUT, 2)
            .unwrap();
        let a = dev.lock_front_buffer(surface).unwrap();
        let b = dev.lock_front_buffer(surface).unwrap();
        assert_ne!(a, b);
        assert!(matches!(dev.lock_front_buffer(surface), Err(Error::BufferAlloc(_))));

        dev.release_buffer(surface, a).unwrap();
        assert_eq!(dev.lock_front_buffer(surface).unwrap(), a);
    }

    #[test]
    fn test_flip_event_arrives_on_fd() {
        let mut dev = test_device();
        let surface = dev
            .create_surface(1280, 720, PixelFormat::Xrgb8888, BufferUsage::SCANOUT, 2)
            .unwrap();
        let bo = dev.lock_front_buffer(surface).unwrap();
        let fb = dev.add_framebuffer(bo).unwrap();
        let output = dev.primary_output().unwrap();
        dev.set_crtc(output.crtc, fb, 0, 0, output.connector, &output.mode).unwrap();

        let bo2 = dev.lock_front_buffer(surface).unwrap();
        let fb2 = dev.add_framebuffer(bo2).unwrap();
        dev.page_flip(output.crtc, fb2, Some(7)).unwrap();
        assert!(crate::kms::wait_readable(dev.as_raw_fd(), Some(std::time::Duration::from_millis(100))).unwrap());

        let mut seen = Vec::new();
        assert_eq!(dev.handle_events(&mut |ev| seen.push(ev.user_data)).unwrap(), 1);
        assert_eq!(seen, vec![7]);
        assert_eq!(dev.crtc_state().scanout, Some(fb2));
    }

    #[test]
    fn test_flip_before_modeset_is_rejected() {
        let mut dev = test_device();
        let surface = dev
            .create_surface(1280, 720, PixelFormat::Xrgb8888, BufferUsage::SCANOUT, 2)
            .unwrap();
        let bo = dev.lock_front_buffer(surface).unwrap();
        let fb = dev.add_framebuffer(bo).unwrap();
        assert!(matches!(dev.page_flip(CrtcId::from_raw(CRTC_ID), fb, Some(1)), Err(Error::PageFlip(_))));
    }

    #[test]
    fn test_held_flip_stays_pending_past_foreign_events() {
        let mut dev = test_device();
        let surface = dev
            .create_surface(1280, 720, PixelFormat::Xrgb8888, BufferUsage::SCANOUT, 2)
            .unwrap();
        let output = dev.primary_output().unwrap();
        let bo = dev.lock_front_buffer(surface).unwrap();
        let fb = dev.add_framebuffer(bo).unwrap();
        dev.set_crtc(output.crtc, fb, 0, 0, output.connector, &output.mode).unwrap();
        let bo2 = dev.lock_front_buffer(surface).unwrap();
        let fb2 = dev.add_framebuffer(bo2).unwrap();

        dev.faults_mut().hold_flips = true;
        dev.page_flip(output.crtc, fb2, Some(1)).unwrap();
        dev.inject_flip_event(9).unwrap();

        let mut seen = Vec::new();
        assert_eq!(dev.handle_events(&mut |ev| seen.push(ev.user_data)).unwrap(), 1);
        assert_eq!(seen, vec![9]);
        assert_eq!(dev.crtc_state().scanout, Some(fb));

        dev.release_held_flip().unwrap();
        assert_eq!(dev.handle_events(&mut |ev| seen.push(ev.user_data)).unwrap(), 1);
        assert_eq!(seen, vec![9, 1]);
        assert_eq!(dev.crtc_state().scanout, Some(fb2));
    }
}
