//! Hardware cursor resource
//!
//! A cursor image lives in its own plane-sized buffer object on the same
//! device as the swap chain, with a lifecycle of its own. Images smaller than
//! the plane are copied into its top-left corner; the rest stays transparent.

use crate::handle::{BufferHandle, CrtcId};
use crate::kms::CursorPlane;
use crate::{Error, Result};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct CursorResource {
    bo: BufferHandle,
    width: u32,
    height: u32,
    hotspot: (i32, i32),
    position: (i32, i32),
    visible: bool,
    crtc: Option<CrtcId>,
}

impl CursorResource {
    /// Upload an ARGB image of `width` x `height` pixels as a new cursor
    pub fn create<D: CursorPlane + ?Sized>(
        device: &mut D,
        pixels: &[u32],
        width: u32,
        height: u32,
        hot_x: i32,
        hot_y: i32,
    ) -> Result<Self> {
        let plane = device.cursor_plane_size();
        if width == 0 || height == 0 || width > plane || height > plane {
            return Err(Error::Cursor(format!(
                "cursor image {}x{} must fit the {}x{} cursor plane",
                width, height, plane, plane
            )));
        }
        let expected = (width * height) as usize;
        if pixels.len() != expected {
            return Err(Error::Cursor(format!(
                "cursor image {}x{} needs {} pixels, got {}",
                width,
                height,
                expected,
                pixels.len()
            )));
        }
        if hot_x < 0 || hot_y < 0 || hot_x as u32 >= width || hot_y as u32 >= height {
            return Err(Error::Cursor(format!(
                "hotspot ({}, {}) lies outside the {}x{} image",
                hot_x, hot_y, width, height
            )));
        }

        let mut plane_pixels = vec![0u32; (plane * plane) as usize];
        for (row, src) in pixels.chunks_exact(width as usize).enumerate() {
            let start = row * plane as usize;
            plane_pixels[start..start + width as usize].copy_from_slice(src);
        }

        let bo = device.create_cursor_bo(plane, plane)?;
        if let Err(e) = device.write_cursor_bo(bo, &plane_pixels) {
            if let Err(cleanup) = device.destroy_bo(bo) {
                warn!("Failed to free cursor buffer {}: {}", bo, cleanup);
            }
            return Err(e);
        }

        debug!("Created {}x{} cursor in {} (hotspot {},{})", width, height, bo, hot_x, hot_y);
        Ok(Self {
            bo,
            width,
            height,
            hotspot: (hot_x, hot_y),
            position: (0, 0),
            visible: false,
            crtc: None,
        })
    }

    pub fn buffer(&self) -> BufferHandle {
        self.bo
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn hotspot(&self) -> (i32, i32) {
        self.hotspot
    }

    /// Pointer position the hotspot sits on
    pub fn position(&self) -> (i32, i32) {
        self.position
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Bind the cursor to `crtc` at (`x`, `y`), or unbind it
    pub fn set_visible<D: CursorPlane + ?Sized>(
        &mut self,
        device: &mut D,
        crtc: CrtcId,
        visible: bool,
        x: i32,
        y: i32,
    ) -> Result<()> {
        if visible {
            // Move first so the plane never shows up at a stale position
            device.move_cursor(crtc, x - self.hotspot.0, y - self.hotspot.1)?;
            device.set_cursor(crtc, Some(self.bo), self.hotspot)?;
            self.crtc = Some(crtc);
        } else {
            device.set_cursor(crtc, None, (0, 0))?;
            self.crtc = None;
        }
        self.visible = visible;
        self.position = (x, y);
        Ok(())
    }

    /// Reposition without touching visibility
    pub fn move_to<D: CursorPlane + ?Sized>(&mut self, device: &mut D, crtc: CrtcId, x: i32, y: i32) -> Result<()> {
        if self.position == (x, y) {
            return Ok(());
        }
        device.move_cursor(crtc, x - self.hotspot.0, y - self.hotspot.1)?;
        self.position = (x, y);
        Ok(())
    }

    /// Unbind if still shown and free the buffer.
    ///
    /// The buffer is freed even when unbinding fails; the first error wins.
    pub fn destroy<D: CursorPlane + ?Sized>(self, device: &mut D) -> Result<()> {
        let unbound = match (self.visible, self.crtc) {
            (true, Some(crtc)) => device.set_cursor(crtc, None, (0, 0)),
            _ => Ok(()),
        };
        if let Err(e) = &unbound {
            warn!("Failed to unbind cursor {}: {}", self.bo, e);
        }
        let freed = device.destroy_bo(self.bo);
        if freed.is_ok() {
            debug!("Destroyed cursor {}", self.bo);
        }
        unbound.and(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::KmsDevice;
    use crate::virtual_device::{test_device, DeviceOp};

    const RED: u32 = 0xffff_0000;

    #[test]
    fn test_small_image_is_padded_top_left() {
        let mut dev = test_device();
        let cursor = CursorResource::create(&mut dev, &[RED; 4], 2, 2, 0, 0).unwrap();

        let pixels = dev.cursor_pixels(cursor.buffer()).unwrap();
        assert_eq!(pixels.len(), 64 * 64);
        assert_eq!(&pixels[0..3], &[RED, RED, 0]);
        assert_eq!(&pixels[64..67], &[RED, RED, 0]);
        assert!(pixels[128..].iter().all(|&p| p == 0));
    }

    #[test]
    fn test_oversize_image_is_rejected() {
        let mut dev = test_device();
        let pixels = vec![RED; 65 * 65];
        assert!(matches!(
            CursorResource::create(&mut dev, &pixels, 65, 65, 0, 0),
            Err(Error::Cursor(_))
        ));
        assert_eq!(dev.buffer_count(), 0);
    }

    #[test]
    fn test_short_pixel_data_is_rejected() {
        let mut dev = test_device();
        assert!(CursorResource::create(&mut dev, &[RED; 3], 2, 2, 0, 0).is_err());
        assert!(CursorResource::create(&mut dev, &[RED; 4], 2, 2, 2, 0).is_err());
    }

    #[test]
    fn test_visibility_and_hotspot_offset() {
        let mut dev = test_device();
        let crtc = dev.primary_output().unwrap().crtc;
        let mut cursor = CursorResource::create(&mut dev, &[RED; 16 * 16], 16, 16, 4, 6).unwrap();

        cursor.set_visible(&mut dev, crtc, true, 100, 50).unwrap();
        let state = dev.crtc_state();
        assert_eq!(state.cursor, Some(cursor.buffer()));
        assert_eq!(state.cursor_position, (96, 44));
        assert!(cursor.is_visible());

        cursor.set_visible(&mut dev, crtc, false, 100, 50).unwrap();
        assert_eq!(dev.crtc_state().cursor, None);
    }

    #[test]
    fn test_move_to_same_position_is_noop() {
        let mut dev = test_device();
        let crtc = dev.primary_output().unwrap().crtc;
        let mut cursor = CursorResource::create(&mut dev, &[RED; 4], 2, 2, 0, 0).unwrap();
        cursor.set_visible(&mut dev, crtc, true, 10, 10).unwrap();

        let before = dev.journal().len();
        cursor.move_to(&mut dev, crtc, 10, 10).unwrap();
        assert_eq!(dev.journal().len(), before);

        cursor.move_to(&mut dev, crtc, 20, 15).unwrap();
        assert_eq!(dev.journal().last(), Some(&DeviceOp::MoveCursor { x: 20, y: 15 }));
        assert!(cursor.is_visible());
    }

    #[test]
    fn test_destroy_unbinds_visible_cursor() {
        let mut dev = test_device();
        let crtc = dev.primary_output().unwrap().crtc;
        let mut cursor = CursorResource::create(&mut dev, &[RED; 4], 2, 2, 0, 0).unwrap();
        cursor.set_visible(&mut dev, crtc, true, 0, 0).unwrap();

        cursor.destroy(&mut dev).unwrap();

        assert_eq!(dev.crtc_state().cursor, None);
        assert_eq!(dev.journal().last(), Some(&DeviceOp::SetCursor(None)));
        assert_eq!(dev.buffer_count(), 0);
    }

    #[test]
    fn test_destroy_frees_buffer_when_unbind_fails() {
        let mut dev = test_device();
        let crtc = dev.primary_output().unwrap().crtc;
        let mut cursor = CursorResource::create(&mut dev, &[RED; 4], 2, 2, 0, 0).unwrap();
        cursor.set_visible(&mut dev, crtc, true, 0, 0).unwrap();

        dev.faults_mut().reject_cursor = true;
        let err = cursor.destroy(&mut dev).unwrap_err();

        assert!(matches!(err, Error::Cursor(_)));
        assert_eq!(dev.buffer_count(), 0);
    }
}
