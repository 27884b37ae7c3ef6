//! DRM/KMS backend on drm-rs and gbm
//!
//! Opens a card node, picks the first connected connector with its preferred
//! mode and implements the swap-chain and cursor traits on GBM surfaces and
//! buffer objects. The renderer draws into a surface through EGL;
//! `lock_front_buffer` takes whatever its last buffer swap produced.
//!
//! Legacy page flips carry no user data, so the tag of the flip pending on
//! each CRTC is kept here and attached to the completion when it arrives.

use crate::handle::{BufferHandle, ConnectorId, CrtcId, FramebufferId, SurfaceId};
use crate::kms::{BufferInfo, BufferUsage, CursorPlane, DisplayMode, KmsDevice, OutputInfo, PageFlipEvent, PixelFormat};
use crate::{Error, Result};
use drm::control::{self, connector, crtc, framebuffer, Device as ControlDevice, ModeTypeFlags, PageFlipFlags};
use drm::Device as _;
use gbm::{BufferObject, BufferObjectFlags, Format};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::Path;
use tracing::{debug, info, warn};

const DEFAULT_CURSOR_SIZE: u32 = 64;

/// Open DRM card node
pub struct Card(File);

impl Card {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::Platform(format!("open {}: {}", path.display(), e)))?;
        Ok(Card(file))
    }
}

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for Card {}
impl ControlDevice for Card {}

#[derive(Debug, Clone, Copy)]
struct Output {
    crtc: crtc::Handle,
    connector: connector::Handle,
    mode: control::Mode,
}

struct Locked {
    surface: SurfaceId,
    bo: BufferObject<()>,
}

/// KMS device backed by a real card node
pub struct DrmKmsDevice {
    gbm: gbm::Device<Card>,
    output: Output,
    cursor_size: u32,
    next_id: u32,
    surfaces: HashMap<SurfaceId, gbm::Surface<()>>,
    locked: HashMap<BufferHandle, Locked>,
    cursors: HashMap<BufferHandle, BufferObject<()>>,
    framebuffers: HashMap<FramebufferId, framebuffer::Handle>,
    pending_tags: HashMap<CrtcId, u64>,
}

impl DrmKmsDevice {
    /// Open `path` (e.g. `/dev/dri/card0`) and select the primary output
    pub fn open(path: &Path) -> Result<Self> {
        let card = Card::open(path)?;
        let output = select_output(&card)?;
        let cursor_size = card
            .get_driver_capability(drm::DriverCapability::CursorWidth)
            .map(|w| w as u32)
            .unwrap_or(DEFAULT_CURSOR_SIZE);
        let gbm = gbm::Device::new(card).map_err(|e| Error::Platform(format!("GBM init: {}", e)))?;

        let (width, height) = output.mode.size();
        info!(
            "Opened {}: connector {:?} on CRTC {:?}, {}x{}@{}, cursor {}",
            path.display(),
            output.connector,
            output.crtc,
            width,
            height,
            output.mode.vrefresh(),
            cursor_size
        );
        Ok(Self {
            gbm,
            output,
            cursor_size,
            next_id: 1,
            surfaces: HashMap::new(),
            locked: HashMap::new(),
            cursors: HashMap::new(),
            framebuffers: HashMap::new(),
            pending_tags: HashMap::new(),
        })
    }

    fn card(&self) -> &Card {
        &self.gbm
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn buffer(&self, bo: BufferHandle) -> Option<&BufferObject<()>> {
        self.locked.get(&bo).map(|l| &l.bo).or_else(|| self.cursors.get(&bo))
    }

    /// Kernel mode matching `mode` on `connector`
    fn find_mode(&self, connector: connector::Handle, mode: &DisplayMode) -> Result<control::Mode> {
        if display_mode(&self.output.mode) == *mode {
            return Ok(self.output.mode);
        }
        let info = self
            .card()
            .get_connector(connector, false)
            .map_err(|e| Error::Platform(format!("GETCONNECTOR: {}", e)))?;
        info.modes()
            .iter()
            .find(|m| display_mode(m) == *mode)
            .copied()
            .ok_or_else(|| {
                Error::Platform(format!(
                    "connector has no {}x{}@{} mode",
                    mode.width, mode.height, mode.refresh_rate
                ))
            })
    }
}

fn select_output(card: &Card) -> Result<Output> {
    let res = card
        .resource_handles()
        .map_err(|e| Error::Platform(format!("GETRESOURCES: {}", e)))?;

    for &handle in res.connectors() {
        let Ok(info) = card.get_connector(handle, false) else {
            continue;
        };
        if info.state() != connector::State::Connected {
            continue;
        }
        let Some(mode) = preferred_mode(info.modes()) else {
            debug!("Connector {:?} is connected but reports no modes", handle);
            continue;
        };
        let current = info
            .current_encoder()
            .and_then(|e| card.get_encoder(e).ok())
            .and_then(|e| e.crtc());
        let crtc = current.or_else(|| {
            info.encoders()
                .iter()
                .filter_map(|&e| card.get_encoder(e).ok())
                .flat_map(|e| res.filter_crtcs(e.possible_crtcs()))
                .next()
        });
        match crtc {
            Some(crtc) => {
                return Ok(Output {
                    crtc,
                    connector: handle,
                    mode,
                })
            }
            None => warn!("No CRTC can drive connector {:?}", handle),
        }
    }
    Err(Error::Platform("no connected display found".into()))
}

fn preferred_mode(modes: &[control::Mode]) -> Option<control::Mode> {
    modes
        .iter()
        .find(|m| m.mode_type().contains(ModeTypeFlags::PREFERRED))
        .or_else(|| modes.first())
        .copied()
}

fn display_mode(mode: &control::Mode) -> DisplayMode {
    let (width, height) = mode.size();
    DisplayMode {
        width: u32::from(width),
        height: u32::from(height),
        refresh_rate: mode.vrefresh(),
    }
}

fn gbm_format(format: PixelFormat) -> Format {
    match format {
        PixelFormat::Xrgb8888 => Format::Xrgb8888,
        PixelFormat::Argb8888 => Format::Argb8888,
    }
}

fn pixel_format(format: Format) -> Result<PixelFormat> {
    match format {
        Format::Xrgb8888 => Ok(PixelFormat::Xrgb8888),
        Format::Argb8888 => Ok(PixelFormat::Argb8888),
        other => Err(Error::Platform(format!("unsupported buffer format {:?}", other))),
    }
}

fn gbm_usage(usage: BufferUsage) -> BufferObjectFlags {
    let mut flags = BufferObjectFlags::empty();
    for (ours, theirs) in [
        (BufferUsage::SCANOUT, BufferObjectFlags::SCANOUT),
        (BufferUsage::CURSOR, BufferObjectFlags::CURSOR),
        (BufferUsage::RENDERING, BufferObjectFlags::RENDERING),
        (BufferUsage::WRITE, BufferObjectFlags::WRITE),
        (BufferUsage::LINEAR, BufferObjectFlags::LINEAR),
    ] {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

/// Waited flips complete on vblank with an event; the rest may tear
fn flip_flags(event: bool) -> PageFlipFlags {
    if event {
        PageFlipFlags::EVENT
    } else {
        PageFlipFlags::ASYNC
    }
}

fn cursor_bytes(pixels: &[u32]) -> Vec<u8> {
    pixels.iter().flat_map(|p| p.to_ne_bytes()).collect()
}

fn crtc_handle(crtc: CrtcId) -> Result<crtc::Handle> {
    control::from_u32(crtc.raw()).ok_or_else(|| Error::Platform(format!("invalid CRTC {}", crtc)))
}

fn connector_handle(connector: ConnectorId) -> Result<connector::Handle> {
    control::from_u32(connector.raw()).ok_or_else(|| Error::Platform(format!("invalid connector {}", connector)))
}

impl AsRawFd for DrmKmsDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.card().0.as_raw_fd()
    }
}

impl KmsDevice for DrmKmsDevice {
    fn primary_output(&self) -> Result<OutputInfo> {
        Ok(OutputInfo {
            crtc: CrtcId::from_raw(u32::from(self.output.crtc)),
            connector: ConnectorId::from_raw(u32::from(self.output.connector)),
            mode: display_mode(&self.output.mode),
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
        let gbm_surface = self
            .gbm
            .create_surface::<()>(width, height, gbm_format(format), gbm_usage(usage))
            .map_err(|e| Error::BufferAlloc(format!("GBM surface {}x{}: {}", width, height, e)))?;
        let surface = SurfaceId::from_raw(self.next_id());
        self.surfaces.insert(surface, gbm_surface);
        // GBM sizes the ring itself
        info!("Created GBM surface {} {}x{} ({} buffers wanted)", surface, width, height, buffers);
        Ok(surface)
    }

    fn destroy_surface(&mut self, surface: SurfaceId) -> Result<()> {
        let held: Vec<BufferHandle> = self
            .locked
            .iter()
            .filter(|(_, l)| l.surface == surface)
            .map(|(&bo, _)| bo)
            .collect();
        for bo in held {
            warn!("Surface {} destroyed with {} still locked", surface, bo);
            self.locked.remove(&bo);
        }
        self.surfaces
            .remove(&surface)
            .map(|_| debug!("Destroyed GBM surface {}", surface))
            .ok_or_else(|| Error::Platform(format!("unknown surface {}", surface)))
    }

    fn lock_front_buffer(&mut self, surface: SurfaceId) -> Result<BufferHandle> {
        let gbm_surface = self
            .surfaces
            .get(&surface)
            .ok_or_else(|| Error::Platform(format!("unknown surface {}", surface)))?;
        // SAFETY: callers present only after the renderer swapped buffers on
        // this surface, which is what gbm_surface_lock_front_buffer requires
        let bo = unsafe { gbm_surface.lock_front_buffer() }
            .map_err(|e| Error::BufferAlloc(format!("lock front buffer of {}: {:?}", surface, e)))?;
        let handle = BufferHandle::from_raw(self.next_id());
        self.locked.insert(handle, Locked { surface, bo });
        Ok(handle)
    }

    fn release_buffer(&mut self, surface: SurfaceId, bo: BufferHandle) -> Result<()> {
        match self.locked.get(&bo) {
            Some(l) if l.surface == surface => {
                // Dropping the buffer object hands it back to the surface
                self.locked.remove(&bo);
                Ok(())
            }
            _ => Err(Error::Platform(format!("buffer {} is not locked on surface {}", bo, surface))),
        }
    }

    fn buffer_info(&self, bo: BufferHandle) -> Result<BufferInfo> {
        let buffer = self
            .buffer(bo)
            .ok_or_else(|| Error::Platform(format!("unknown buffer {}", bo)))?;
        Ok(BufferInfo {
            width: buffer.width(),
            height: buffer.height(),
            stride: buffer.stride(),
            format: pixel_format(buffer.format())?,
        })
    }

    fn add_framebuffer(&mut self, bo: BufferHandle) -> Result<FramebufferId> {
        let format = self.buffer_info(bo).map_err(|e| Error::Framebuffer(e.to_string()))?.format;
        let buffer = self
            .buffer(bo)
            .ok_or_else(|| Error::Framebuffer(format!("unknown buffer {}", bo)))?;
        let handle = self
            .card()
            .add_framebuffer(buffer, format.depth(), format.bpp())
            .map_err(|e| Error::Framebuffer(format!("ADDFB for {}: {}", bo, e)))?;

        let fb = FramebufferId::from_raw(u32::from(handle));
        self.framebuffers.insert(fb, handle);
        debug!("Created framebuffer {} for {}", fb, bo);
        Ok(fb)
    }

    fn remove_framebuffer(&mut self, fb: FramebufferId) -> Result<()> {
        let handle = self
            .framebuffers
            .remove(&fb)
            .ok_or_else(|| Error::Framebuffer(format!("framebuffer {} not found", fb)))?;
        self.card()
            .destroy_framebuffer(handle)
            .map_err(|e| Error::Framebuffer(format!("RMFB {}: {}", fb, e)))
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
        let crtc_h = crtc_handle(crtc)?;
        let connector_h = connector_handle(connector)?;
        let fb_h = *self
            .framebuffers
            .get(&fb)
            .ok_or_else(|| Error::Platform(format!("SETCRTC: framebuffer {} not found", fb)))?;
        let kernel_mode = self.find_mode(connector_h, mode)?;

        self.card()
            .set_crtc(crtc_h, Some(fb_h), (x, y), &[connector_h], Some(kernel_mode))
            .map_err(|e| Error::Platform(format!("SETCRTC: {}", e)))?;
        debug!("CRTC {} scanning out {}", crtc, fb);
        Ok(())
    }

    fn page_flip(&mut self, crtc: CrtcId, fb: FramebufferId, event: Option<u64>) -> Result<()> {
        let crtc_h = crtc_handle(crtc)?;
        let fb_h = *self
            .framebuffers
            .get(&fb)
            .ok_or_else(|| Error::PageFlip(format!("framebuffer {} not found", fb)))?;
        self.card()
            .page_flip(crtc_h, fb_h, flip_flags(event.is_some()), None)
            .map_err(|e| Error::PageFlip(format!("PAGE_FLIP to {}: {}", fb, e)))?;
        if let Some(tag) = event {
            self.pending_tags.insert(crtc, tag);
        }
        Ok(())
    }

    fn handle_events(&mut self, handler: &mut dyn FnMut(PageFlipEvent)) -> Result<usize> {
        let events = match self.card().receive_events() {
            Ok(events) => events,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(e) => return Err(Error::Io(e)),
        };
        let flips: Vec<(CrtcId, u32)> = events
            .filter_map(|event| match event {
                control::Event::PageFlip(flip) => Some((CrtcId::from_raw(u32::from(flip.crtc)), flip.frame)),
                _ => None,
            })
            .collect();

        let mut delivered = 0;
        for (crtc, sequence) in flips {
            match self.pending_tags.remove(&crtc) {
                Some(user_data) => {
                    handler(PageFlipEvent {
                        crtc,
                        sequence,
                        user_data,
                    });
                    delivered += 1;
                }
                None => debug!("Flip completion on {} nobody waits for", crtc),
            }
        }
        Ok(delivered)
    }
}

impl CursorPlane for DrmKmsDevice {
    fn cursor_plane_size(&self) -> u32 {
        self.cursor_size
    }

    fn create_cursor_bo(&mut self, width: u32, height: u32) -> Result<BufferHandle> {
        let bo = self
            .gbm
            .create_buffer_object::<()>(
                width,
                height,
                Format::Argb8888,
                BufferObjectFlags::CURSOR | BufferObjectFlags::WRITE,
            )
            .map_err(|e| Error::BufferAlloc(format!("cursor buffer {}x{}: {}", width, height, e)))?;
        let handle = BufferHandle::from_raw(self.next_id());
        self.cursors.insert(handle, bo);
        Ok(handle)
    }

    fn write_cursor_bo(&mut self, bo: BufferHandle, pixels: &[u32]) -> Result<()> {
        let buffer = self
            .cursors
            .get_mut(&bo)
            .ok_or_else(|| Error::Cursor(format!("unknown cursor buffer {}", bo)))?;
        let expected = (buffer.width() * buffer.height()) as usize;
        if pixels.len() != expected {
            return Err(Error::Cursor(format!(
                "expected {} pixels for buffer {}, got {}",
                expected,
                bo,
                pixels.len()
            )));
        }
        buffer
            .write(&cursor_bytes(pixels))
            .map_err(|e| Error::Cursor(format!("write {}: {}", bo, e)))
    }

    fn set_cursor(&mut self, crtc: CrtcId, bo: Option<BufferHandle>, hotspot: (i32, i32)) -> Result<()> {
        let crtc_h = crtc_handle(crtc)?;
        let buffer = match bo {
            Some(bo) => Some(
                self.cursors
                    .get(&bo)
                    .ok_or_else(|| Error::Cursor(format!("unknown cursor buffer {}", bo)))?,
            ),
            None => None,
        };
        self.card()
            .set_cursor2(crtc_h, buffer, hotspot)
            .map_err(|e| Error::Cursor(format!("SETCURSOR2: {}", e)))
    }

    fn move_cursor(&mut self, crtc: CrtcId, x: i32, y: i32) -> Result<()> {
        self.card()
            .move_cursor(crtc_handle(crtc)?, (x, y))
            .map_err(|e| Error::Cursor(format!("MOVECURSOR: {}", e)))
    }

    fn destroy_bo(&mut self, bo: BufferHandle) -> Result<()> {
        self.cursors
            .remove(&bo)
            .map(|_| ())
            .ok_or_else(|| Error::Cursor(format!("unknown cursor buffer {}", bo)))
    }
}

impl Drop for DrmKmsDevice {
    fn drop(&mut self) {
        let card: &Card = &self.gbm;
        for (fb, handle) in self.framebuffers.drain() {
            if let Err(e) = card.destroy_framebuffer(handle) {
                warn!("Failed to remove framebuffer {} on close: {}", fb, e);
            }
        }
        debug!(
            "Closing DRM device ({} surfaces, {} cursor buffers left)",
            self.surfaces.len(),
            self.cursors.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formats_map_both_ways() {
        for format in [PixelFormat::Xrgb8888, PixelFormat::Argb8888] {
            assert_eq!(gbm_format(format) as u32, format.fourcc());
            assert_eq!(pixel_format(gbm_format(format)).unwrap(), format);
        }
        assert!(pixel_format(Format::Rgb565).is_err());
    }

    #[test]
    fn test_usage_flags_translate() {
        let flags = gbm_usage(BufferUsage::SCANOUT | BufferUsage::RENDERING);
        assert_eq!(flags, BufferObjectFlags::SCANOUT | BufferObjectFlags::RENDERING);
        assert_eq!(gbm_usage(BufferUsage::empty()), BufferObjectFlags::empty());
    }

    #[test]
    fn test_only_waited_flips_request_an_event() {
        assert!(flip_flags(true).contains(PageFlipFlags::EVENT));
        assert!(!flip_flags(false).contains(PageFlipFlags::EVENT));
    }

    #[test]
    fn test_null_object_ids_are_rejected() {
        assert!(crtc_handle(CrtcId::from_raw(0)).is_err());
        assert!(connector_handle(ConnectorId::from_raw(0)).is_err());
        assert_eq!(u32::from(crtc_handle(CrtcId::from_raw(41)).unwrap()), 41);
    }

    #[test]
    fn test_cursor_pixels_keep_native_byte_order() {
        let bytes = cursor_bytes(&[0xff00_00ff, 0x0000_0000]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[0..4], &0xff00_00ffu32.to_ne_bytes());
    }
}
