//! Opaque native handles
//!
//! Every kind of platform object gets its own newtype so a window id can
//! never be passed where a framebuffer id is expected. The driver never
//! interprets the wrapped value.

use std::fmt;

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name($inner);

        impl $name {
            pub const fn from_raw(raw: $inner) -> Self {
                Self(raw)
            }

            pub const fn raw(self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }
    };
}

opaque_handle!(
    /// Platform window (X11 window id). Zero means "no window".
    WindowHandle(u32)
);
opaque_handle!(
    /// Interned property/message name (X11 atom)
    Atom(u32)
);
opaque_handle!(
    /// GBM-style buffer object
    BufferHandle(u32)
);
opaque_handle!(
    /// Kernel framebuffer wrapping a buffer object
    FramebufferId(u32)
);
opaque_handle!(
    /// Display controller scanning out to one connector
    CrtcId(u32)
);
opaque_handle!(
    /// Physical output connector
    ConnectorId(u32)
);
opaque_handle!(
    /// Buffer ring backing one window
    SurfaceId(u32)
);

impl WindowHandle {
    pub const NONE: WindowHandle = WindowHandle(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_window_is_none() {
        assert!(WindowHandle::NONE.is_none());
        assert!(!WindowHandle::from_raw(0x400001).is_none());
    }

    #[test]
    fn test_display_names_the_kind() {
        assert_eq!(FramebufferId::from_raw(100).to_string(), "FramebufferId(0x64)");
    }
}
