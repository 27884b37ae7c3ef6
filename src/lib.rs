//! Native window driver layer
//!
//! Sits between a managed windowing toolkit and the native window system /
//! kernel display stack. It pumps window-system events into abstract window
//! events, keeps the window-to-target bindings, drives screen mode changes and
//! runs a DRM/GBM swap chain plus a hardware cursor on the display device.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Managed toolkit (DispatchTarget per window)    │
//! └─────────────────────────────────────────────────────────────┘
//!          ▲ callbacks                      │ calls
//! ┌─────────────────────────────────────────────────────────────┐
//! │              native-window-driver                           │
//! │  ┌────────────┐ ┌──────────┐ ┌──────────┐ ┌──────────────┐  │
//! │  │ Translator │ │ Registry │ │ Mode     │ │ Swap chain + │  │
//! │  │ (events)   │ │ (props)  │ │ control  │ │ cursor       │  │
//! │  └────────────┘ └──────────┘ └──────────┘ └──────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!          │                │            │              │
//!   NativeEventQueue  PropertyStore  ModeBackend   KmsDevice / CursorPlane
//!          │                │            │              │
//! ┌──────────────────────────────────────┐ ┌────────────────────┐
//! │  X11 server (x11rb backend)          │ │ DRM/KMS + GBM      │
//! │                                      │ │ (drm + gbm backend)│
//! │  or in-memory stand-ins              │ │ or VirtualKmsDevice│
//! └──────────────────────────────────────┘ └────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use native_window_driver::{EventTranslator, WindowRegistry};
//!
//! let translator = EventTranslator::new(wm_protocols, wm_delete_window);
//! let mut registry = WindowRegistry::new(store, binding_atom);
//! registry.bind(window, Box::new(my_window));
//!
//! // From the toolkit's idle loop
//! translator.poll_and_dispatch(&mut queue, &mut registry, config.max_events_per_poll);
//! ```

#[cfg(any(feature = "x11", feature = "drm"))]
pub mod backend;
pub mod config;
pub mod cursor;
pub mod error;
pub mod event;
pub mod handle;
pub mod kms;
pub mod mode;
pub mod native;
pub mod registry;
pub mod swapchain;
pub mod translate;
pub mod virtual_device;
pub mod virtual_screen;

pub use config::DriverConfig;
pub use cursor::CursorResource;
pub use error::Error;
pub use event::{AbstractEvent, DispatchTarget, KeyEvent, Modifiers, PointerEvent, PointerKind, Rect};
pub use handle::{Atom, BufferHandle, ConnectorId, CrtcId, FramebufferId, SurfaceId, WindowHandle};
pub use kms::{CursorPlane, KmsDevice, PixelFormat};
pub use mode::{ModeBackend, ModeRequest, ModeState, Rotation, ScreenMode, ScreenModeController};
pub use native::{MemoryEventQueue, NativeEvent, NativeEventQueue};
pub use registry::{MemoryPropertyStore, PropertyStore, WindowRegistry};
pub use swapchain::{SwapChainBuffer, SwapChainManager, SwapState};
pub use translate::{EventTranslator, PollOutcome};
pub use virtual_device::VirtualKmsDevice;
pub use virtual_screen::VirtualScreen;

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;
