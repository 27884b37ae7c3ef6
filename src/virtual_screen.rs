//! In-process RandR stand-in
//!
//! Keeps a resolution/rate table per output and answers every accepted
//! configuration change with a change notification, the way an X server does
//! after `SetScreenConfig`. Used by the probe tool and the tests.

use crate::mode::{ChangeNotify, ModeBackend, ScreenConfig, ScreenSize};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::io;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct VirtualOutput {
    pub sizes: Vec<ScreenSize>,
    /// Rates per entry of `sizes`
    pub rates: Vec<Vec<u16>>,
    pub rotations: u16,
    pub current: ScreenConfig,
}

#[derive(Debug, Clone)]
pub struct VirtualScreen {
    outputs: Vec<VirtualOutput>,
    notifications: VecDeque<ChangeNotify>,
    set_calls: usize,
    silent: bool,
}

impl VirtualScreen {
    pub fn new(outputs: Vec<VirtualOutput>) -> Self {
        Self {
            outputs,
            notifications: VecDeque::new(),
            set_calls: 0,
            silent: false,
        }
    }

    /// One output with three resolutions and normal/left rotation
    pub fn laptop() -> Self {
        let size = |width, height, mm_width, mm_height| ScreenSize { width, height, mm_width, mm_height };
        Self::new(vec![VirtualOutput {
            sizes: vec![size(1920, 1080, 344, 194), size(1280, 720, 344, 194), size(800, 600, 344, 258)],
            rates: vec![vec![60, 50], vec![60], vec![60]],
            rotations: 0x1 | 0x2,
            current: ScreenConfig { size_index: 0, rotation_bits: 0x1, rate: 60 },
        }])
    }

    /// Queue a notification ahead of whatever the next change produces
    pub fn inject_notify(&mut self, notify: ChangeNotify) {
        self.notifications.push_back(notify);
    }

    /// Apply changes without sending notifications
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    /// Number of mode-set calls received
    pub fn set_calls(&self) -> usize {
        self.set_calls
    }

    fn output(&self, output: usize) -> Result<&VirtualOutput> {
        self.outputs
            .get(output)
            .ok_or_else(|| Error::InvalidArgument(format!("no output {}", output)))
    }
}

impl ModeBackend for VirtualScreen {
    fn screen_sizes(&mut self, output: usize) -> Result<Vec<ScreenSize>> {
        Ok(self.output(output)?.sizes.clone())
    }

    fn refresh_rates(&mut self, output: usize, size_index: usize) -> Result<Vec<u16>> {
        Ok(self.output(output)?.rates.get(size_index).cloned().unwrap_or_default())
    }

    fn supported_rotations(&mut self, output: usize) -> Result<u16> {
        Ok(self.output(output)?.rotations)
    }

    fn current_config(&mut self, output: usize) -> Result<ScreenConfig> {
        Ok(self.output(output)?.current)
    }

    fn set_screen_config(&mut self, output: usize, size_index: usize, rotation_bits: u16, rate: u16) -> Result<()> {
        self.set_calls += 1;
        let silent = self.silent;
        let out = self
            .outputs
            .get_mut(output)
            .ok_or_else(|| Error::InvalidArgument(format!("no output {}", output)))?;
        let size = *out
            .sizes
            .get(size_index)
            .ok_or_else(|| Error::Platform(format!("SetScreenConfig: bad size index {}", size_index)))?;
        if out.rotations & rotation_bits == 0 {
            return Err(Error::Platform(format!("SetScreenConfig: rotation {:#x} unsupported", rotation_bits)));
        }

        out.current = ScreenConfig { size_index, rotation_bits, rate };
        debug!("Virtual output {} now {}x{}@{}", output, size.width, size.height, rate);
        if !silent {
            self.notifications.push_back(ChangeNotify {
                rotation_bits,
                width: size.width,
                height: size.height,
            });
        }
        Ok(())
    }

    fn wait_change_notify(&mut self, timeout: Option<Duration>) -> Result<Option<ChangeNotify>> {
        match self.notifications.pop_front() {
            Some(notify) => Ok(Some(notify)),
            // Nothing will ever arrive on an in-process queue
            None if timeout.is_some() => Ok(None),
            None => Err(Error::EventWait {
                what: "screen change notification",
                source: io::Error::new(io::ErrorKind::UnexpectedEof, "notification stream closed"),
            }),
        }
    }
}
