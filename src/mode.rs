//! Screen mode controller
//!
//! Enumerates (resolution × refresh rate × rotation) modes of a display
//! output, applies one, and confirms it by waiting for the matching
//! change notification on the display's low-level event channel.
//!
//! Per-output state machine:
//!
//! ```text
//! Idle ──request──▶ ModeRequested ──set──▶ AwaitingConfirmation ─┬─▶ Confirmed
//!                                                                 └─▶ TimedOutOrMismatched
//! ```

use crate::event::DispatchTarget;
use crate::{Error, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rotation {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub const ALL: [Rotation; 4] = [Rotation::Deg0, Rotation::Deg90, Rotation::Deg180, Rotation::Deg270];

    pub fn degrees(self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    pub fn from_degrees(degrees: u32) -> Result<Self> {
        match degrees {
            0 => Ok(Rotation::Deg0),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            other => Err(Error::InvalidArgument(format!(
                "rotation must be one of 0, 90, 180, 270 degrees, got {}",
                other
            ))),
        }
    }

    /// RandR `RR_Rotate_*` bit
    pub fn to_platform_bits(self) -> u16 {
        match self {
            Rotation::Deg0 => 0x1,
            Rotation::Deg90 => 0x2,
            Rotation::Deg180 => 0x4,
            Rotation::Deg270 => 0x8,
        }
    }

    /// Decode a rotation reported by the platform. Reflection bits are
    /// ignored; anything else that is not exactly one rotation bit means the
    /// driver state is corrupt.
    pub fn from_platform_bits(bits: u16) -> Result<Self> {
        match bits & 0x0f {
            0x1 => Ok(Rotation::Deg0),
            0x2 => Ok(Rotation::Deg90),
            0x4 => Ok(Rotation::Deg180),
            0x8 => Ok(Rotation::Deg270),
            _ => Err(Error::InvalidRotation(u32::from(bits))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenMode {
    pub width: u32,
    pub height: u32,
    pub refresh_hz: u32,
    pub rotation: Rotation,
}

impl ScreenMode {
    /// Forward this mode to a target's screen-mode callback
    pub fn notify(&self, target: &mut dyn DispatchTarget) {
        target.on_screen_mode_changed(self.width, self.height, self.refresh_hz);
    }
}

/// One entry of the output's resolution list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
    pub mm_width: u32,
    pub mm_height: u32,
}

/// Active configuration as the platform reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenConfig {
    pub size_index: usize,
    pub rotation_bits: u16,
    pub rate: u16,
}

/// Screen change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeNotify {
    pub rotation_bits: u16,
    pub width: u32,
    pub height: u32,
}

/// RandR-shaped platform interface for one display
pub trait ModeBackend {
    fn screen_sizes(&mut self, output: usize) -> Result<Vec<ScreenSize>>;

    /// Rates available at `size_index`; indexed like `screen_sizes`
    fn refresh_rates(&mut self, output: usize, size_index: usize) -> Result<Vec<u16>>;

    /// Mask of supported `RR_Rotate_*` bits
    fn supported_rotations(&mut self, output: usize) -> Result<u16>;

    fn current_config(&mut self, output: usize) -> Result<ScreenConfig>;

    fn set_screen_config(&mut self, output: usize, size_index: usize, rotation_bits: u16, rate: u16) -> Result<()>;

    /// Block for the next change notification. `Ok(None)` means `timeout`
    /// elapsed first; `None` as timeout waits without bound.
    fn wait_change_notify(&mut self, timeout: Option<Duration>) -> Result<Option<ChangeNotify>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModeState {
    #[default]
    Idle,
    ModeRequested,
    AwaitingConfirmation,
    Confirmed,
    TimedOutOrMismatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeRequest {
    /// Index into the output's resolution list
    pub resolution_index: usize,
    pub refresh_hz: u16,
    pub rotation: Rotation,
}

pub struct ScreenModeController<B: ModeBackend> {
    backend: B,
    states: HashMap<usize, ModeState>,
    confirm_timeout: Option<Duration>,
}

impl<B: ModeBackend> ScreenModeController<B> {
    pub fn new(backend: B, confirm_timeout: Option<Duration>) -> Self {
        Self {
            backend,
            states: HashMap::new(),
            confirm_timeout,
        }
    }

    pub fn state(&self, output: usize) -> ModeState {
        self.states.get(&output).copied().unwrap_or_default()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// All modes of `output`, queried fresh from the platform
    pub fn enumerate_modes(&mut self, output: usize) -> Result<Vec<ScreenMode>> {
        let sizes = self.backend.screen_sizes(output)?;
        let rotation_mask = self.backend.supported_rotations(output)?;

        let mut modes = Vec::new();
        for (index, size) in sizes.iter().enumerate() {
            for rate in self.backend.refresh_rates(output, index)? {
                for rotation in Rotation::ALL {
                    if rotation_mask & rotation.to_platform_bits() != 0 {
                        modes.push(ScreenMode {
                            width: size.width,
                            height: size.height,
                            refresh_hz: u32::from(rate),
                            rotation,
                        });
                    }
                }
            }
        }
        debug!("Output {} exposes {} modes", output, modes.len());
        Ok(modes)
    }

    pub fn current_mode(&mut self, output: usize) -> Result<ScreenMode> {
        let config = self.backend.current_config(output)?;
        let sizes = self.backend.screen_sizes(output)?;
        let size = sizes.get(config.size_index).ok_or_else(|| {
            Error::Platform(format!(
                "output {} reports size index {} of {}",
                output,
                config.size_index,
                sizes.len()
            ))
        })?;
        Ok(ScreenMode {
            width: size.width,
            height: size.height,
            refresh_hz: u32::from(config.rate),
            rotation: Rotation::from_platform_bits(config.rotation_bits)?,
        })
    }

    /// Apply `request` and wait until the platform confirms it.
    ///
    /// The confirmed mode is also reported to `target` when given.
    pub fn request_mode(
        &mut self,
        output: usize,
        request: ModeRequest,
        target: Option<&mut dyn DispatchTarget>,
    ) -> Result<ScreenMode> {
        let sizes = self.backend.screen_sizes(output)?;
        let Some(size) = sizes.get(request.resolution_index).copied() else {
            return Err(Error::InvalidArgument(format!(
                "resolution index {} out of range [0, {})",
                request.resolution_index,
                sizes.len()
            )));
        };

        self.states.insert(output, ModeState::ModeRequested);
        let rotation_bits = request.rotation.to_platform_bits();
        info!(
            "Output {}: requesting {}x{}@{} rotation {}",
            output,
            size.width,
            size.height,
            request.refresh_hz,
            request.rotation.degrees()
        );
        if let Err(e) = self.backend.set_screen_config(
            output,
            request.resolution_index,
            rotation_bits,
            request.refresh_hz,
        ) {
            self.states.insert(output, ModeState::Idle);
            return Err(e);
        }

        self.states.insert(output, ModeState::AwaitingConfirmation);
        match self.await_confirmation(request.rotation, size) {
            Ok(()) => {
                self.states.insert(output, ModeState::Confirmed);
                let mode = ScreenMode {
                    width: size.width,
                    height: size.height,
                    refresh_hz: u32::from(request.refresh_hz),
                    rotation: request.rotation,
                };
                info!("Output {}: mode {}x{} confirmed", output, mode.width, mode.height);
                if let Some(target) = target {
                    mode.notify(target);
                }
                Ok(mode)
            }
            Err(e) => {
                self.states.insert(output, ModeState::TimedOutOrMismatched);
                Err(e)
            }
        }
    }

    /// Request the resolution entry matching `mode` exactly
    pub fn request_screen_mode(
        &mut self,
        output: usize,
        mode: &ScreenMode,
        target: Option<&mut dyn DispatchTarget>,
    ) -> Result<ScreenMode> {
        let sizes = self.backend.screen_sizes(output)?;
        let resolution_index = sizes
            .iter()
            .position(|s| s.width == mode.width && s.height == mode.height)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "output {} has no {}x{} resolution",
                    output, mode.width, mode.height
                ))
            })?;
        let refresh_hz = u16::try_from(mode.refresh_hz)
            .map_err(|_| Error::InvalidArgument(format!("refresh rate {} out of range", mode.refresh_hz)))?;
        self.request_mode(
            output,
            ModeRequest {
                resolution_index,
                refresh_hz,
                rotation: mode.rotation,
            },
            target,
        )
    }

    fn await_confirmation(&mut self, rotation: Rotation, size: ScreenSize) -> Result<()> {
        let deadline = self.confirm_timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(self.timed_out());
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            let Some(notify) = self.backend.wait_change_notify(remaining)? else {
                return Err(self.timed_out());
            };

            let reported = Rotation::from_platform_bits(notify.rotation_bits)?;
            if reported == rotation && notify.width == size.width && notify.height == size.height {
                return Ok(());
            }
            warn!(
                "Skipping screen change {}x{} rotation {} while waiting for {}x{} rotation {}",
                notify.width,
                notify.height,
                reported.degrees(),
                size.width,
                size.height,
                rotation.degrees()
            );
        }
    }

    fn timed_out(&self) -> Error {
        Error::TimedOut {
            what: "screen mode confirmation",
            timeout: self.confirm_timeout.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::testing::{Call, Recorder};
    use crate::virtual_screen::VirtualScreen;

    fn controller(timeout: Option<Duration>) -> ScreenModeController<VirtualScreen> {
        ScreenModeController::new(VirtualScreen::laptop(), timeout)
    }

    #[test]
    fn test_rotation_bits_roundtrip_and_reject() {
        for rotation in Rotation::ALL {
            assert_eq!(Rotation::from_platform_bits(rotation.to_platform_bits()).unwrap(), rotation);
        }
        assert!(matches!(Rotation::from_platform_bits(0x3), Err(Error::InvalidRotation(3))));
        assert!(matches!(Rotation::from_platform_bits(0), Err(Error::InvalidRotation(0))));
        assert!(Rotation::from_degrees(45).is_err());
    }

    #[test]
    fn test_enumerate_follows_platform_order() {
        let mut ctl = controller(None);
        let modes = ctl.enumerate_modes(0).unwrap();
        // 3 sizes with 2, 1, 1 rates, two rotations each
        assert_eq!(modes.len(), 8);
        assert_eq!((modes[0].width, modes[0].height, modes[0].refresh_hz), (1920, 1080, 60));
        assert_eq!(modes[1].rotation, Rotation::Deg90);
        assert_eq!(modes[2].refresh_hz, 50);
    }

    #[test]
    fn test_request_then_current_mode_roundtrip() {
        let mut ctl = controller(Some(Duration::from_millis(100)));
        let (mut target, calls) = Recorder::new(true);
        let request = ModeRequest { resolution_index: 1, refresh_hz: 60, rotation: Rotation::Deg90 };

        let confirmed = ctl.request_mode(0, request, Some(&mut target)).unwrap();
        let current = ctl.current_mode(0).unwrap();

        assert_eq!(ctl.state(0), ModeState::Confirmed);
        assert_eq!((current.width, current.height, current.rotation), (1280, 720, Rotation::Deg90));
        assert_eq!(current, confirmed);
        assert_eq!(*calls.borrow(), vec![Call::ModeChanged(1280, 720, 60)]);
    }

    #[test]
    fn test_out_of_range_index_makes_no_platform_call() {
        let mut ctl = controller(None);
        let sizes = ctl.backend_mut().screen_sizes(0).unwrap().len();
        let request = ModeRequest { resolution_index: sizes, refresh_hz: 60, rotation: Rotation::Deg0 };

        let err = ctl.request_mode(0, request, None).unwrap_err();

        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(ctl.backend().set_calls(), 0);
        assert_eq!(ctl.state(0), ModeState::Idle);
    }

    #[test]
    fn test_mismatched_notifications_are_skipped() {
        let mut ctl = controller(None);
        ctl.backend_mut().inject_notify(ChangeNotify { rotation_bits: 0x1, width: 640, height: 480 });
        let request = ModeRequest { resolution_index: 2, refresh_hz: 60, rotation: Rotation::Deg0 };

        let mode = ctl.request_mode(0, request, None).unwrap();

        assert_eq!((mode.width, mode.height), (800, 600));
        assert_eq!(ctl.state(0), ModeState::Confirmed);
    }

    #[test]
    fn test_missing_confirmation_times_out() {
        let mut ctl = controller(Some(Duration::from_millis(20)));
        ctl.backend_mut().set_silent(true);
        let request = ModeRequest { resolution_index: 0, refresh_hz: 60, rotation: Rotation::Deg0 };

        let err = ctl.request_mode(0, request, None).unwrap_err();

        assert!(matches!(err, Error::TimedOut { .. }));
        assert_eq!(ctl.state(0), ModeState::TimedOutOrMismatched);
    }

    #[test]
    fn test_corrupt_rotation_fails_fast() {
        let mut ctl = controller(None);
        ctl.backend_mut().inject_notify(ChangeNotify { rotation_bits: 0x6, width: 800, height: 600 });
        let request = ModeRequest { resolution_index: 2, refresh_hz: 60, rotation: Rotation::Deg0 };

        let err = ctl.request_mode(0, request, None).unwrap_err();

        assert!(matches!(err, Error::InvalidRotation(6)));
    }

    #[test]
    fn test_request_screen_mode_resolves_index() {
        let mut ctl = controller(None);
        let wanted = ScreenMode { width: 800, height: 600, refresh_hz: 60, rotation: Rotation::Deg0 };
        assert_eq!(ctl.request_screen_mode(0, &wanted, None).unwrap(), wanted);

        let missing = ScreenMode { width: 1, height: 1, refresh_hz: 60, rotation: Rotation::Deg0 };
        assert!(matches!(ctl.request_screen_mode(0, &missing, None), Err(Error::InvalidArgument(_))));
    }
}
