//! Error types for the native window driver

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid rotation value {0:#x} (expected one of 0x1, 0x2, 0x4, 0x8)")]
    InvalidRotation(u32),

    #[error("mode setting rejected for {width}x{height}+{x}+{y}: {reason}")]
    ModeSet {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("framebuffer creation failed: {0}")]
    Framebuffer(String),

    #[error("page flip failed: {0}")]
    PageFlip(String),

    #[error("waiting for {what} failed: {source}")]
    EventWait {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{what} timed out after {timeout:?}")]
    TimedOut { what: &'static str, timeout: Duration },

    #[error("buffer allocation failed: {0}")]
    BufferAlloc(String),

    #[error("cursor error: {0}")]
    Cursor(String),

    #[error("platform error: {0}")]
    Platform(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
