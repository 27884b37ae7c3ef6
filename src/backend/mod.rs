//! Platform backends
//!
//! Adapters that implement the platform traits on top of a real display
//! connection or a real display device.

#[cfg(feature = "drm")]
pub mod drm;
#[cfg(feature = "x11")]
pub mod x11;

#[cfg(feature = "drm")]
pub use self::drm::{Card, DrmKmsDevice};
#[cfg(feature = "x11")]
pub use self::x11::{X11EventQueue, X11ModeBackend, X11PropertyStore, X11Shared};
