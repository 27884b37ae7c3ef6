//! Swap-chain manager for the DRM/GBM path
//!
//! Each window owns a GBM-style surface whose buffers are locked as they are
//! presented. A buffer gets a kernel framebuffer the first time it is shown
//! and keeps it until the window closes. The first present performs the
//! CRTC modeset; later presents page-flip and, unless the swap interval is
//! zero, block on the device fd until the flip has completed. Only then is
//! the previously displayed buffer handed back to the surface. A buffer the
//! surface refuses to take back is kept aside and offered again on the next
//! present, so the chain itself keeps running.
//!
//! ```text
//! Uninitialized ──first_present──▶ Ready ──next_present──▶ Flipping ──flip done──▶ Ready
//!                                    │                                              │
//!                                    └──────────────close_window──▶ Destroyed ◀─────┘
//! ```

use crate::event::Rect;
use crate::handle::{BufferHandle, FramebufferId, SurfaceId, WindowHandle};
use crate::kms::{wait_readable, BufferUsage, KmsDevice, OutputInfo, PixelFormat};
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapState {
    Uninitialized,
    Ready,
    Flipping,
    Destroyed,
}

/// A presented buffer and the framebuffer wrapping it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapChainBuffer {
    pub bo: BufferHandle,
    pub fb: FramebufferId,
    pub in_use_by_kernel: bool,
}

#[derive(Debug)]
struct RingSlot {
    bo: BufferHandle,
    fb: FramebufferId,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    next: SwapChainBuffer,
    previous: BufferHandle,
}

#[derive(Debug)]
struct WindowSurface {
    surface: SurfaceId,
    output: OutputInfo,
    geometry: Rect,
    format: PixelFormat,
    slots: Vec<RingSlot>,
    scanout: Option<BufferHandle>,
    in_flight: Option<InFlight>,
    flip_pending: bool,
    /// Buffers whose release failed, retried before the next lock
    unreleased: Vec<BufferHandle>,
    state: SwapState,
}

impl WindowSurface {
    /// Cached framebuffer of `bo`, created on first use
    fn framebuffer_for<D: KmsDevice + ?Sized>(&mut self, device: &mut D, bo: BufferHandle) -> Result<FramebufferId> {
        if let Some(slot) = self.slots.iter().find(|s| s.bo == bo) {
            return Ok(slot.fb);
        }
        let fb = device.add_framebuffer(bo).map_err(|e| match e {
            Error::Framebuffer(_) => e,
            other => Error::Framebuffer(other.to_string()),
        })?;
        debug!("Surface {}: buffer {} now backs {}", self.surface, bo, fb);
        self.slots.push(RingSlot { bo, fb });
        Ok(fb)
    }

    /// Hand `bo` back to the surface, keeping it for a retry on failure
    fn release_or_defer<D: KmsDevice + ?Sized>(&mut self, device: &mut D, bo: BufferHandle) {
        if let Err(e) = device.release_buffer(self.surface, bo) {
            warn!("Failed to release {} to {}, retrying later: {}", bo, self.surface, e);
            self.unreleased.push(bo);
        }
    }

    fn retry_releases<D: KmsDevice + ?Sized>(&mut self, device: &mut D) {
        let surface = self.surface;
        self.unreleased.retain(|&bo| match device.release_buffer(surface, bo) {
            Ok(()) => {
                debug!("Released deferred {} to {}", bo, surface);
                false
            }
            Err(e) => {
                warn!("Release of {} to {} failed again: {}", bo, surface, e);
                true
            }
        });
    }

    fn geometry_error(&self, reason: impl Into<String>) -> Error {
        Error::ModeSet {
            x: self.geometry.x,
            y: self.geometry.y,
            width: self.geometry.width,
            height: self.geometry.height,
            reason: reason.into(),
        }
    }
}

pub struct SwapChainManager {
    windows: HashMap<WindowHandle, WindowSurface>,
    next_window: u32,
    /// Flip tags completed while another window was waiting
    completed: HashSet<u64>,
    ring_depth: usize,
    flip_timeout: Option<Duration>,
}

impl SwapChainManager {
    pub fn new(ring_depth: usize, flip_timeout: Option<Duration>) -> Result<Self> {
        if !(2..=3).contains(&ring_depth) {
            return Err(Error::InvalidArgument(format!(
                "swap ring depth must be 2 or 3, got {}",
                ring_depth
            )));
        }
        Ok(Self {
            windows: HashMap::new(),
            next_window: 1,
            completed: HashSet::new(),
            ring_depth,
            flip_timeout,
        })
    }

    /// Closed windows report `Destroyed`; handles never issued report `None`
    pub fn state(&self, window: WindowHandle) -> Option<SwapState> {
        match self.windows.get(&window) {
            Some(w) => Some(w.state),
            None if self.was_issued(window) => Some(SwapState::Destroyed),
            None => None,
        }
    }

    /// Windows that are still open
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    fn was_issued(&self, window: WindowHandle) -> bool {
        (1..self.next_window).contains(&window.raw())
    }

    /// Buffers of the ring that already carry a framebuffer
    pub fn framebuffer_count(&self, window: WindowHandle) -> usize {
        self.windows.get(&window).map_or(0, |w| w.slots.len())
    }

    pub fn format(&self, window: WindowHandle) -> Option<PixelFormat> {
        self.windows.get(&window).map(|w| w.format)
    }

    /// Allocate the buffer ring for a new window. No buffer is locked yet.
    #[allow(clippy::too_many_arguments)]
    pub fn create_window<D: KmsDevice + ?Sized>(
        &mut self,
        device: &mut D,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        opaque: bool,
        alpha_bits: u32,
    ) -> Result<WindowHandle> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument(format!("window size {}x{} is empty", width, height)));
        }
        let output = device.primary_output()?;
        let format = PixelFormat::for_window(opaque, alpha_bits);
        let surface = device.create_surface(
            width,
            height,
            format,
            BufferUsage::SCANOUT | BufferUsage::RENDERING,
            self.ring_depth,
        )?;

        let window = WindowHandle::from_raw(self.next_window);
        self.next_window += 1;
        self.windows.insert(
            window,
            WindowSurface {
                surface,
                output,
                geometry: Rect::new(x, y, width, height),
                format,
                slots: Vec::with_capacity(self.ring_depth),
                scanout: None,
                in_flight: None,
                flip_pending: false,
                unreleased: Vec::new(),
                state: SwapState::Uninitialized,
            },
        );
        info!("Created {} {}x{}+{}+{} format {:?}", window, width, height, x, y, format);
        Ok(window)
    }

    /// Lock the first buffer and bind it to the output with a full modeset
    pub fn first_present<D: KmsDevice + ?Sized>(
        &mut self,
        device: &mut D,
        window: WindowHandle,
    ) -> Result<SwapChainBuffer> {
        let ws = window_mut(&mut self.windows, window)?;
        if ws.state != SwapState::Uninitialized {
            return Err(Error::InvalidArgument(format!("{} was already presented", window)));
        }
        // Scanout from a non-zero CRTC offset is refused by common drivers
        if ws.geometry.x != 0 || ws.geometry.y != 0 {
            return Err(ws.geometry_error("scanout offset must be (0,0)"));
        }

        let bo = device.lock_front_buffer(ws.surface)?;
        let fb = match ws.framebuffer_for(device, bo) {
            Ok(fb) => fb,
            Err(e) => {
                release_quietly(device, ws.surface, bo);
                return Err(e);
            }
        };

        let output = ws.output;
        if let Err(e) = device.set_crtc(output.crtc, fb, 0, 0, output.connector, &output.mode) {
            release_quietly(device, ws.surface, bo);
            return Err(ws.geometry_error(e.to_string()));
        }

        ws.scanout = Some(bo);
        ws.state = SwapState::Ready;
        info!("{}: modeset on {} with {}", window, output.crtc, fb);
        Ok(SwapChainBuffer {
            bo,
            fb,
            in_use_by_kernel: true,
        })
    }

    /// Present the next rendered buffer.
    ///
    /// With a non-zero `swap_interval` this blocks until the flip completed;
    /// `previous` is released only after that. With zero the flip is issued
    /// without synchronisation and `previous` is released right away. Once the
    /// flip went through, a failed release is logged and retried later rather
    /// than reported.
    pub fn next_present<D: KmsDevice + ?Sized>(
        &mut self,
        device: &mut D,
        window: WindowHandle,
        previous: SwapChainBuffer,
        swap_interval: u32,
    ) -> Result<SwapChainBuffer> {
        let flip_timeout = self.flip_timeout;
        let ws = window_mut(&mut self.windows, window)?;
        match ws.state {
            SwapState::Ready => {}
            SwapState::Flipping => {
                return Err(Error::InvalidArgument(format!(
                    "{} still has a flip in flight; complete it first",
                    window
                )))
            }
            other => {
                return Err(Error::InvalidArgument(format!("{} cannot present in state {:?}", window, other)))
            }
        }
        if ws.scanout != Some(previous.bo) {
            return Err(Error::InvalidArgument(format!(
                "{} is not the buffer on screen for {}",
                previous.bo, window
            )));
        }

        ws.retry_releases(device);
        let bo = device.lock_front_buffer(ws.surface)?;
        let fb = match ws.framebuffer_for(device, bo) {
            Ok(fb) => fb,
            Err(e) => {
                release_quietly(device, ws.surface, bo);
                return Err(e);
            }
        };
        let next = SwapChainBuffer {
            bo,
            fb,
            in_use_by_kernel: true,
        };

        if swap_interval == 0 {
            if let Err(e) = device.page_flip(ws.output.crtc, fb, None) {
                release_quietly(device, ws.surface, bo);
                return Err(e);
            }
            ws.scanout = Some(bo);
            ws.release_or_defer(device, previous.bo);
            return Ok(next);
        }

        if let Err(e) = device.page_flip(ws.output.crtc, fb, Some(u64::from(window.raw()))) {
            release_quietly(device, ws.surface, bo);
            return Err(e);
        }
        ws.in_flight = Some(InFlight {
            next,
            previous: previous.bo,
        });
        ws.flip_pending = true;
        ws.state = SwapState::Flipping;

        finish_flip(device, window, ws, &mut self.completed, flip_timeout)
    }

    /// Wait again for a flip whose earlier wait failed or timed out
    pub fn complete_pending_flip<D: KmsDevice + ?Sized>(
        &mut self,
        device: &mut D,
        window: WindowHandle,
    ) -> Result<SwapChainBuffer> {
        let flip_timeout = self.flip_timeout;
        let ws = window_mut(&mut self.windows, window)?;
        if ws.state != SwapState::Flipping {
            return Err(Error::InvalidArgument(format!("{} has no flip in flight", window)));
        }
        finish_flip(device, window, ws, &mut self.completed, flip_timeout)
    }

    /// Drop framebuffers, return buffers and free the surface of `window`.
    ///
    /// The window's entry is removed; closing it again is a no-op.
    pub fn close_window<D: KmsDevice + ?Sized>(&mut self, device: &mut D, window: WindowHandle) -> Result<()> {
        let Some(mut ws) = self.windows.remove(&window) else {
            if self.was_issued(window) {
                return Ok(());
            }
            return Err(Error::InvalidArgument(format!("unknown swap-chain window {}", window)));
        };
        self.completed.remove(&u64::from(window.raw()));
        if ws.flip_pending {
            warn!("{} closed with a flip in flight", window);
        }

        for slot in ws.slots.drain(..) {
            if let Err(e) = device.remove_framebuffer(slot.fb) {
                warn!("Failed to remove {} of {}: {}", slot.fb, window, e);
            }
        }
        let locked = ws
            .scanout
            .take()
            .into_iter()
            .chain(ws.in_flight.take().map(|f| f.next.bo))
            .chain(ws.unreleased.drain(..));
        for bo in locked {
            release_quietly(device, ws.surface, bo);
        }
        device.destroy_surface(ws.surface)?;
        info!("Closed {}", window);
        Ok(())
    }
}

fn window_mut(
    windows: &mut HashMap<WindowHandle, WindowSurface>,
    window: WindowHandle,
) -> Result<&mut WindowSurface> {
    windows
        .get_mut(&window)
        .ok_or_else(|| Error::InvalidArgument(format!("unknown swap-chain window {}", window)))
}

fn release_quietly<D: KmsDevice + ?Sized>(device: &mut D, surface: SurfaceId, bo: BufferHandle) {
    if let Err(e) = device.release_buffer(surface, bo) {
        warn!("Failed to release {} to {}: {}", bo, surface, e);
    }
}

/// Block on the device fd until this window's flip completes, then recycle
/// the buffer it replaced. Completions for other windows seen on the way are
/// parked in `completed` for their own wait to pick up.
fn finish_flip<D: KmsDevice + ?Sized>(
    device: &mut D,
    window: WindowHandle,
    ws: &mut WindowSurface,
    completed: &mut HashSet<u64>,
    timeout: Option<Duration>,
) -> Result<SwapChainBuffer> {
    let tag = u64::from(window.raw());
    let deadline = timeout.map(|t| Instant::now() + t);

    if completed.remove(&tag) {
        debug!("{}: flip already completed during another wait", window);
        ws.flip_pending = false;
    }

    while ws.flip_pending {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let ready = wait_readable(device.as_raw_fd(), remaining).map_err(|source| Error::EventWait {
            what: "page flip completion",
            source,
        })?;
        if !ready {
            return Err(Error::TimedOut {
                what: "page flip completion",
                timeout: timeout.unwrap_or_default(),
            });
        }

        let pending = &mut ws.flip_pending;
        device.handle_events(&mut |event| {
            if event.user_data == tag {
                *pending = false;
            } else {
                debug!("Flip completion for another window (tag {})", event.user_data);
                completed.insert(event.user_data);
            }
        })?;
    }

    let in_flight = ws
        .in_flight
        .take()
        .ok_or_else(|| Error::PageFlip(format!("{} completed a flip it never issued", window)))?;
    ws.scanout = Some(in_flight.next.bo);
    ws.state = SwapState::Ready;
    ws.release_or_defer(device, in_flight.previous);
    debug!("{}: {} on screen, {} released", window, in_flight.next.fb, in_flight.previous);
    Ok(in_flight.next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_device::{test_device, DeviceOp};

    fn fullscreen(manager: &mut SwapChainManager, dev: &mut crate::virtual_device::VirtualKmsDevice) -> WindowHandle {
        manager.create_window(dev, 0, 0, 1280, 720, true, 0).unwrap()
    }

    #[test]
    fn test_create_window_locks_nothing() {
        let mut dev = test_device();
        let mut manager = SwapChainManager::new(3, None).unwrap();
        let window = fullscreen(&mut manager, &mut dev);
        assert_eq!(manager.state(window), Some(SwapState::Uninitialized));
        assert!(dev.journal().is_empty());
        assert_eq!(manager.format(window), Some(PixelFormat::Xrgb8888));
    }

    #[test]
    fn test_previous_released_only_after_successor_flip() {
        let mut dev = test_device();
        let mut manager = SwapChainManager::new(3, Some(Duration::from_millis(500))).unwrap();
        let window = fullscreen(&mut manager, &mut dev);

        let mut current = manager.first_present(&mut dev, window).unwrap();
        let mut shown = vec![current];
        for _ in 0..6 {
            current = manager.next_present(&mut dev, window, current, 1).unwrap();
            shown.push(current);
        }

        let journal = dev.journal();
        assert_eq!(journal.iter().filter(|o| **o == DeviceOp::SetCrtc(shown[0].fb)).count(), 1);
        let flips: Vec<usize> = journal
            .iter()
            .enumerate()
            .filter(|(_, o)| matches!(o, DeviceOp::PageFlip { .. }))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(flips.len(), shown.len() - 1);

        for (flip, pair) in flips.iter().copied().zip(shown.windows(2)) {
            let (older, newer) = (pair[0], pair[1]);
            assert_eq!(journal[flip], DeviceOp::PageFlip { fb: newer.fb, event: true });
            let after = &journal[flip..];
            let done = after.iter().position(|o| *o == DeviceOp::FlipComplete(newer.fb)).unwrap();
            let released = after.iter().position(|o| *o == DeviceOp::Release(older.bo)).unwrap();
            assert!(done < released, "released {} before flip to {} completed", older.bo, newer.fb);
        }
        assert_eq!(manager.state(window), Some(SwapState::Ready));
    }

    #[test]
    fn test_framebuffers_are_created_once_per_buffer() {
        let mut dev = test_device();
        let mut manager = SwapChainManager::new(3, Some(Duration::from_millis(500))).unwrap();
        let window = fullscreen(&mut manager, &mut dev);

        let mut current = manager.first_present(&mut dev, window).unwrap();
        for _ in 0..10 {
            current = manager.next_present(&mut dev, window, current, 1).unwrap();
        }

        let added = dev
            .journal()
            .iter()
            .filter(|o| matches!(o, DeviceOp::AddFramebuffer { .. }))
            .count();
        assert_eq!(added, 3);
        assert_eq!(manager.framebuffer_count(window), 3);
        assert_eq!(dev.crtc_state().scanout, Some(current.fb));
    }

    #[test]
    fn test_zero_interval_skips_flip_wait() {
        let mut dev = test_device();
        dev.faults_mut().hold_flips = true;
        let mut manager = SwapChainManager::new(2, Some(Duration::from_millis(10))).unwrap();
        let window = fullscreen(&mut manager, &mut dev);

        let first = manager.first_present(&mut dev, window).unwrap();
        let second = manager.next_present(&mut dev, window, first, 0).unwrap();

        assert!(dev.journal().contains(&DeviceOp::PageFlip { fb: second.fb, event: false }));
        assert!(dev.journal().contains(&DeviceOp::Release(first.bo)));
        assert_eq!(dev.crtc_state().scanout, Some(second.fb));
    }

    #[test]
    fn test_flip_timeout_keeps_previous_locked() {
        let mut dev = test_device();
        dev.faults_mut().hold_flips = true;
        let mut manager = SwapChainManager::new(3, Some(Duration::from_millis(10))).unwrap();
        let window = fullscreen(&mut manager, &mut dev);

        let first = manager.first_present(&mut dev, window).unwrap();
        let err = manager.next_present(&mut dev, window, first, 1).unwrap_err();

        assert!(matches!(err, Error::TimedOut { .. }));
        assert_eq!(manager.state(window), Some(SwapState::Flipping));
        assert!(!dev.journal().contains(&DeviceOp::Release(first.bo)));

        dev.release_held_flip().unwrap();
        let second = manager.complete_pending_flip(&mut dev, window).unwrap();
        assert_ne!(second.bo, first.bo);
        assert!(dev.journal().contains(&DeviceOp::Release(first.bo)));
        assert_eq!(manager.state(window), Some(SwapState::Ready));
    }

    #[test]
    fn test_rejected_modeset_names_geometry() {
        let mut dev = test_device();
        dev.faults_mut().reject_modeset = true;
        let mut manager = SwapChainManager::new(2, None).unwrap();
        let window = fullscreen(&mut manager, &mut dev);

        match manager.first_present(&mut dev, window) {
            Err(Error::ModeSet { width, height, x, y, .. }) => assert_eq!((width, height, x, y), (1280, 720, 0, 0)),
            other => panic!("expected modeset error, got {:?}", other),
        }
        assert_eq!(manager.state(window), Some(SwapState::Uninitialized));
    }

    #[test]
    fn test_nonzero_offset_rejected_before_modeset() {
        let mut dev = test_device();
        let mut manager = SwapChainManager::new(2, None).unwrap();
        let window = manager.create_window(&mut dev, 10, 20, 1280, 720, true, 0).unwrap();

        assert!(matches!(manager.first_present(&mut dev, window), Err(Error::ModeSet { x: 10, y: 20, .. })));
        assert!(dev.journal().is_empty());
    }

    #[test]
    fn test_framebuffer_failure_is_propagated() {
        let mut dev = test_device();
        let mut manager = SwapChainManager::new(3, Some(Duration::from_millis(100))).unwrap();
        let window = fullscreen(&mut manager, &mut dev);
        let first = manager.first_present(&mut dev, window).unwrap();

        dev.faults_mut().fail_next_framebuffer = true;
        let err = manager.next_present(&mut dev, window, first, 1).unwrap_err();

        assert!(matches!(err, Error::Framebuffer(_)));
        assert_eq!(dev.crtc_state().scanout, Some(first.fb));
        // The failed present gave its buffer back; presenting works again
        assert!(manager.next_present(&mut dev, window, first, 1).is_ok());
    }

    #[test]
    fn test_close_window_frees_everything() {
        let mut dev = test_device();
        let mut manager = SwapChainManager::new(3, Some(Duration::from_millis(100))).unwrap();
        let window = fullscreen(&mut manager, &mut dev);
        let first = manager.first_present(&mut dev, window).unwrap();
        manager.next_present(&mut dev, window, first, 1).unwrap();

        manager.close_window(&mut dev, window).unwrap();

        assert_eq!(manager.state(window), Some(SwapState::Destroyed));
        assert_eq!(manager.window_count(), 0);
        assert_eq!(dev.framebuffer_count(), 0);
        assert_eq!(dev.buffer_count(), 0);
        assert!(manager.close_window(&mut dev, window).is_ok());
    }

    #[test]
    fn test_close_unknown_window_is_rejected() {
        let mut dev = test_device();
        let mut manager = SwapChainManager::new(2, None).unwrap();
        let stranger = WindowHandle::from_raw(42);
        assert!(matches!(manager.close_window(&mut dev, stranger), Err(Error::InvalidArgument(_))));
        assert_eq!(manager.state(stranger), None);
    }

    #[test]
    fn test_closed_windows_do_not_accumulate() {
        let mut dev = test_device();
        let mut manager = SwapChainManager::new(2, None).unwrap();
        for _ in 0..20 {
            let window = fullscreen(&mut manager, &mut dev);
            manager.first_present(&mut dev, window).unwrap();
            manager.close_window(&mut dev, window).unwrap();
        }
        assert_eq!(manager.window_count(), 0);
        assert_eq!(dev.buffer_count(), 0);
    }

    #[test]
    fn test_failed_release_after_flip_keeps_chain_running() {
        let mut dev = test_device();
        let mut manager = SwapChainManager::new(3, Some(Duration::from_millis(500))).unwrap();
        let window = fullscreen(&mut manager, &mut dev);
        let first = manager.first_present(&mut dev, window).unwrap();

        dev.faults_mut().fail_next_release = true;
        let second = manager.next_present(&mut dev, window, first, 1).unwrap();

        assert_eq!(manager.state(window), Some(SwapState::Ready));
        assert_eq!(dev.crtc_state().scanout, Some(second.fb));
        assert!(!dev.journal().contains(&DeviceOp::Release(first.bo)));

        let third = manager.next_present(&mut dev, window, second, 1).unwrap();
        assert!(dev.journal().contains(&DeviceOp::Release(first.bo)));
        assert!(dev.journal().contains(&DeviceOp::Release(second.bo)));
        assert_eq!(dev.crtc_state().scanout, Some(third.fb));
    }

    #[test]
    fn test_failed_release_with_zero_interval_records_scanout() {
        let mut dev = test_device();
        let mut manager = SwapChainManager::new(2, None).unwrap();
        let window = fullscreen(&mut manager, &mut dev);
        let first = manager.first_present(&mut dev, window).unwrap();

        dev.faults_mut().fail_next_release = true;
        let second = manager.next_present(&mut dev, window, first, 0).unwrap();
        assert_eq!(manager.state(window), Some(SwapState::Ready));

        // The deferred release frees a ring slot before the next lock
        let third = manager.next_present(&mut dev, window, second, 0).unwrap();
        assert_eq!(third.bo, first.bo);
        assert_eq!(dev.crtc_state().scanout, Some(third.fb));
    }

    #[test]
    fn test_flip_completion_seen_by_other_window_is_kept() {
        let mut dev = test_device();
        dev.faults_mut().hold_flips = true;
        let mut manager = SwapChainManager::new(3, Some(Duration::from_millis(10))).unwrap();
        let a = fullscreen(&mut manager, &mut dev);
        let b = fullscreen(&mut manager, &mut dev);

        let first = manager.first_present(&mut dev, a).unwrap();
        assert!(matches!(manager.next_present(&mut dev, a, first, 1), Err(Error::TimedOut { .. })));

        // Put b into a flip of its own on the same fd
        let b_first = manager.first_present(&mut dev, b).unwrap();
        {
            let ws = manager.windows.get_mut(&b).unwrap();
            let bo = dev.lock_front_buffer(ws.surface).unwrap();
            let fb = ws.framebuffer_for(&mut dev, bo).unwrap();
            ws.in_flight = Some(InFlight {
                next: SwapChainBuffer { bo, fb, in_use_by_kernel: true },
                previous: b_first.bo,
            });
            ws.flip_pending = true;
            ws.state = SwapState::Flipping;
        }

        // a's completion arrives while b is the one waiting
        dev.release_held_flip().unwrap();
        dev.inject_flip_event(u64::from(b.raw())).unwrap();
        manager.complete_pending_flip(&mut dev, b).unwrap();
        assert_eq!(manager.state(b), Some(SwapState::Ready));
        assert_eq!(manager.state(a), Some(SwapState::Flipping));

        let second = manager.complete_pending_flip(&mut dev, a).unwrap();
        assert_ne!(second.bo, first.bo);
        assert_eq!(manager.state(a), Some(SwapState::Ready));
        assert!(dev.journal().contains(&DeviceOp::Release(first.bo)));
    }
}
