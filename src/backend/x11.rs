//! X11 backend on x11rb
//!
//! One display connection shared by three adapters: the event queue for the
//! translator, the property store for the registry and a RandR 1.1 mode
//! backend. The mode backend may read past unrelated events while it waits
//! for a screen-change notification; those are parked in a shared backlog so
//! the event queue still sees them, in order.

use crate::handle::{Atom, WindowHandle};
use crate::kms::wait_readable;
use crate::mode::{ChangeNotify, ModeBackend, ScreenConfig, ScreenSize};
use crate::native::{NativeEvent, NativeEventQueue};
use crate::registry::{PropertyError, PropertyStore};
use crate::{Error, Result};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use x11rb::connection::Connection;
use x11rb::errors::ReplyError;
use x11rb::protocol::randr::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{self, AtomEnum, ConnectionExt as _, PropMode};
use x11rb::protocol::{ErrorKind, Event};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;

fn platform<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::Platform(format!("{}: {}", what, e))
}

/// Display connection and the state its adapters share
pub struct X11Shared {
    conn: RustConnection,
    screen_num: usize,
    backlog: RefCell<VecDeque<Event>>,
    notifies: RefCell<VecDeque<ChangeNotify>>,
    connected: Cell<bool>,
}

impl X11Shared {
    /// Connect to `display`, or `$DISPLAY` when `None`
    pub fn connect(display: Option<&str>) -> Result<Rc<Self>> {
        let (conn, screen_num) = RustConnection::connect(display).map_err(platform("X11 connect failed"))?;
        info!("Connected to X11 display, default screen {}", screen_num);
        Ok(Rc::new(Self {
            conn,
            screen_num,
            backlog: RefCell::new(VecDeque::new()),
            notifies: RefCell::new(VecDeque::new()),
            connected: Cell::new(true),
        }))
    }

    pub fn connection(&self) -> &RustConnection {
        &self.conn
    }

    pub fn default_screen(&self) -> usize {
        self.screen_num
    }

    pub fn root(&self, screen: usize) -> Option<xproto::Window> {
        self.conn.setup().roots.get(screen).map(|s| s.root)
    }

    pub fn intern_atom(&self, name: &str) -> Result<Atom> {
        let atom = self
            .conn
            .intern_atom(false, name.as_bytes())
            .map_err(platform("intern_atom"))?
            .reply()
            .map_err(platform("intern_atom reply"))?
            .atom;
        Ok(Atom::from_raw(atom))
    }

    /// Next event from the backlog or the connection, without blocking.
    /// Screen-change notifications are diverted to the mode backend.
    fn poll(&self) -> Option<Event> {
        if let Some(event) = self.backlog.borrow_mut().pop_front() {
            return Some(event);
        }
        loop {
            match self.conn.poll_for_event() {
                Ok(Some(Event::RandrScreenChangeNotify(e))) => self.park_notify(&e),
                Ok(event) => return event,
                Err(e) => {
                    if self.connected.replace(false) {
                        warn!("X11 connection lost: {}", e);
                    }
                    return None;
                }
            }
        }
    }

    fn park_notify(&self, event: &randr::ScreenChangeNotifyEvent) {
        self.notifies.borrow_mut().push_back(ChangeNotify {
            rotation_bits: u16::from(event.rotation),
            width: u32::from(event.width),
            height: u32::from(event.height),
        });
    }
}

fn window(raw: xproto::Window) -> WindowHandle {
    WindowHandle::from_raw(raw)
}

fn to_native(event: &Event) -> NativeEvent {
    match event {
        Event::KeyPress(e) => NativeEvent::KeyPress {
            window: window(e.event),
            time: e.time,
            keycode: u32::from(e.detail),
            state: u16::from(e.state),
        },
        Event::KeyRelease(e) => NativeEvent::KeyRelease {
            window: window(e.event),
            time: e.time,
            keycode: u32::from(e.detail),
            state: u16::from(e.state),
        },
        Event::ButtonPress(e) => NativeEvent::ButtonPress {
            window: window(e.event),
            time: e.time,
            button: e.detail,
            x: i32::from(e.event_x),
            y: i32::from(e.event_y),
            state: u16::from(e.state),
        },
        Event::ButtonRelease(e) => NativeEvent::ButtonRelease {
            window: window(e.event),
            time: e.time,
            button: e.detail,
            x: i32::from(e.event_x),
            y: i32::from(e.event_y),
            state: u16::from(e.state),
        },
        Event::MotionNotify(e) => NativeEvent::Motion {
            window: window(e.event),
            time: e.time,
            x: i32::from(e.event_x),
            y: i32::from(e.event_y),
            state: u16::from(e.state),
        },
        Event::EnterNotify(e) => NativeEvent::Enter {
            window: window(e.event),
            time: e.time,
            x: i32::from(e.event_x),
            y: i32::from(e.event_y),
            state: u16::from(e.state),
        },
        Event::LeaveNotify(e) => NativeEvent::Leave {
            window: window(e.event),
            time: e.time,
            x: i32::from(e.event_x),
            y: i32::from(e.event_y),
            state: u16::from(e.state),
        },
        Event::FocusIn(e) => NativeEvent::FocusIn { window: window(e.event) },
        Event::FocusOut(e) => NativeEvent::FocusOut { window: window(e.event) },
        Event::Expose(e) => NativeEvent::Expose {
            window: window(e.window),
            x: i32::from(e.x),
            y: i32::from(e.y),
            width: u32::from(e.width),
            height: u32::from(e.height),
            count: e.count,
        },
        Event::ConfigureNotify(e) => NativeEvent::Configure {
            event: window(e.event),
            window: window(e.window),
            x: i32::from(e.x),
            y: i32::from(e.y),
            width: u32::from(e.width),
            height: u32::from(e.height),
        },
        Event::MapNotify(e) => NativeEvent::Map {
            event: window(e.event),
            window: window(e.window),
        },
        Event::UnmapNotify(e) => NativeEvent::Unmap {
            event: window(e.event),
            window: window(e.window),
        },
        Event::ReparentNotify(e) => NativeEvent::Reparent {
            event: window(e.event),
            window: window(e.window),
            parent: window(e.parent),
        },
        Event::DestroyNotify(e) => NativeEvent::Destroy {
            event: window(e.event),
            window: window(e.window),
        },
        Event::ClientMessage(e) => NativeEvent::ClientMessage {
            window: window(e.window),
            message_type: Atom::from_raw(e.type_),
            data: e.data.as_data32(),
        },
        other => NativeEvent::Other {
            window: source_window(other),
            raw_kind: other.raw_response_type() & 0x7f,
        },
    }
}

/// Window an untranslated event was reported on, if the protocol names one
fn source_window(event: &Event) -> WindowHandle {
    let raw = match event {
        Event::PropertyNotify(e) => e.window,
        Event::VisibilityNotify(e) => e.window,
        Event::ColormapNotify(e) => e.window,
        Event::ResizeRequest(e) => e.window,
        Event::GravityNotify(e) => e.event,
        Event::CirculateNotify(e) => e.event,
        Event::CreateNotify(e) => e.parent,
        Event::MapRequest(e) => e.parent,
        Event::ConfigureRequest(e) => e.parent,
        Event::GraphicsExposure(e) => e.drawable,
        Event::NoExposure(e) => e.drawable,
        Event::SelectionClear(e) => e.owner,
        Event::SelectionRequest(e) => e.owner,
        Event::SelectionNotify(e) => e.requestor,
        _ => x11rb::NONE,
    };
    window(raw)
}

/// Split a binding token into the low and high CARDINAL words
fn encode_token(value: u64) -> [u32; 2] {
    [value as u32, (value >> 32) as u32]
}

fn decode_token(mut words: impl Iterator<Item = u32>) -> Option<u64> {
    match (words.next(), words.next()) {
        (Some(lo), Some(hi)) => Some(u64::from(lo) | (u64::from(hi) << 32)),
        _ => None,
    }
}

/// Event queue of the shared connection
pub struct X11EventQueue {
    shared: Rc<X11Shared>,
    lookahead: Option<NativeEvent>,
}

impl X11EventQueue {
    pub fn new(shared: Rc<X11Shared>) -> Self {
        Self { shared, lookahead: None }
    }
}

impl NativeEventQueue for X11EventQueue {
    fn is_connected(&self) -> bool {
        self.shared.connected.get()
    }

    fn next_event(&mut self) -> Option<NativeEvent> {
        if let Some(event) = self.lookahead.take() {
            return Some(event);
        }
        self.shared.poll().map(|e| to_native(&e))
    }

    fn peek_event(&mut self) -> Option<&NativeEvent> {
        if self.lookahead.is_none() {
            self.lookahead = self.shared.poll().map(|e| to_native(&e));
        }
        self.lookahead.as_ref()
    }
}

/// Window properties as 64-bit CARDINAL pairs
pub struct X11PropertyStore {
    shared: Rc<X11Shared>,
}

impl X11PropertyStore {
    pub fn new(shared: Rc<X11Shared>) -> Self {
        Self { shared }
    }
}

fn property_error(window: WindowHandle, err: ReplyError) -> PropertyError {
    match err {
        ReplyError::X11Error(ref e) if e.error_kind == ErrorKind::Window => PropertyError::BadWindow(window),
        other => PropertyError::Platform(other.to_string()),
    }
}

impl PropertyStore for X11PropertyStore {
    fn set_property(&mut self, window: WindowHandle, name: Atom, value: u64) -> std::result::Result<(), PropertyError> {
        let words = encode_token(value);
        self.shared
            .conn
            .change_property32(PropMode::REPLACE, window.raw(), name.raw(), AtomEnum::CARDINAL, &words)
            .map_err(|e| PropertyError::Platform(e.to_string()))?
            .check()
            .map_err(|e| property_error(window, e))
    }

    fn get_property(&mut self, window: WindowHandle, name: Atom) -> std::result::Result<Option<u64>, PropertyError> {
        let reply = self
            .shared
            .conn
            .get_property(false, window.raw(), name.raw(), AtomEnum::CARDINAL, 0, 2)
            .map_err(|e| PropertyError::Platform(e.to_string()))?
            .reply()
            .map_err(|e| property_error(window, e))?;

        Ok(reply.value32().and_then(decode_token))
    }

    fn delete_property(&mut self, window: WindowHandle, name: Atom) -> std::result::Result<(), PropertyError> {
        self.shared
            .conn
            .delete_property(window.raw(), name.raw())
            .map_err(|e| PropertyError::Platform(e.to_string()))?
            .check()
            .map_err(|e| property_error(window, e))
    }
}

/// RandR 1.1 screen configuration; outputs are X screens
pub struct X11ModeBackend {
    shared: Rc<X11Shared>,
}

impl X11ModeBackend {
    /// Check the RandR version and subscribe to screen changes on every root
    pub fn new(shared: Rc<X11Shared>) -> Result<Self> {
        let version = shared
            .conn
            .randr_query_version(1, 1)
            .map_err(platform("RRQueryVersion"))?
            .reply()
            .map_err(platform("RRQueryVersion reply"))?;
        info!("RandR {}.{}", version.major_version, version.minor_version);

        for screen in &shared.conn.setup().roots {
            shared
                .conn
                .randr_select_input(screen.root, randr::NotifyMask::SCREEN_CHANGE)
                .map_err(platform("RRSelectInput"))?;
        }
        shared.conn.flush().map_err(platform("flush"))?;
        Ok(Self { shared })
    }

    fn screen_info(&self, output: usize) -> Result<randr::GetScreenInfoReply> {
        let root = self
            .shared
            .root(output)
            .ok_or_else(|| Error::InvalidArgument(format!("no X screen {}", output)))?;
        self.shared
            .conn
            .randr_get_screen_info(root)
            .map_err(platform("RRGetScreenInfo"))?
            .reply()
            .map_err(platform("RRGetScreenInfo reply"))
    }

    /// Read whatever is queued, keeping unrelated events for the event queue
    fn drain_connection(&self) -> Result<Option<ChangeNotify>> {
        loop {
            match self.shared.conn.poll_for_event() {
                Ok(Some(Event::RandrScreenChangeNotify(e))) => self.shared.park_notify(&e),
                Ok(Some(other)) => self.shared.backlog.borrow_mut().push_back(other),
                Ok(None) => return Ok(self.shared.notifies.borrow_mut().pop_front()),
                Err(e) => {
                    self.shared.connected.set(false);
                    return Err(Error::Platform(format!("X11 connection lost: {}", e)));
                }
            }
        }
    }
}

impl ModeBackend for X11ModeBackend {
    fn screen_sizes(&mut self, output: usize) -> Result<Vec<ScreenSize>> {
        Ok(self
            .screen_info(output)?
            .sizes
            .iter()
            .map(|s| ScreenSize {
                width: u32::from(s.width),
                height: u32::from(s.height),
                mm_width: u32::from(s.mwidth),
                mm_height: u32::from(s.mheight),
            })
            .collect())
    }

    fn refresh_rates(&mut self, output: usize, size_index: usize) -> Result<Vec<u16>> {
        Ok(self
            .screen_info(output)?
            .rates
            .get(size_index)
            .map(|r| r.rates.clone())
            .unwrap_or_default())
    }

    fn supported_rotations(&mut self, output: usize) -> Result<u16> {
        Ok(u16::from(self.screen_info(output)?.rotations))
    }

    fn current_config(&mut self, output: usize) -> Result<ScreenConfig> {
        let info = self.screen_info(output)?;
        Ok(ScreenConfig {
            size_index: usize::from(info.size_id),
            rotation_bits: u16::from(info.rotation),
            rate: info.rate,
        })
    }

    fn set_screen_config(&mut self, output: usize, size_index: usize, rotation_bits: u16, rate: u16) -> Result<()> {
        let info = self.screen_info(output)?;
        let size_id = u16::try_from(size_index)
            .map_err(|_| Error::InvalidArgument(format!("size index {} out of range", size_index)))?;
        let reply = self
            .shared
            .conn
            .randr_set_screen_config(
                info.root,
                info.timestamp,
                info.config_timestamp,
                size_id,
                randr::Rotation::from(rotation_bits),
                rate,
            )
            .map_err(platform("RRSetScreenConfig"))?
            .reply()
            .map_err(platform("RRSetScreenConfig reply"))?;

        if reply.status != randr::SetConfig::SUCCESS {
            return Err(Error::Platform(format!("RRSetScreenConfig refused: {:?}", reply.status)));
        }
        debug!("Screen {} set to size {} rate {}", output, size_index, rate);
        Ok(())
    }

    fn wait_change_notify(&mut self, timeout: Option<Duration>) -> Result<Option<ChangeNotify>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(notify) = self.drain_connection()? {
                return Ok(Some(notify));
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining == Some(Duration::ZERO) {
                return Ok(None);
            }
            let fd = self.shared.conn.stream().as_raw_fd();
            wait_readable(fd, remaining).map_err(|source| Error::EventWait {
                what: "RandR screen change notification",
                source,
            })?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AbstractEvent;
    use crate::native::kind;
    use crate::translate::EventTranslator;
    use x11rb::protocol::xproto::{ClientMessageEvent, ConfigureNotifyEvent, Property, PropertyNotifyEvent};

    const PARENT: u32 = 0x40_0001;
    const CHILD: u32 = 0x40_0002;

    fn configure(event: u32, window: u32) -> Event {
        Event::ConfigureNotify(ConfigureNotifyEvent {
            response_type: xproto::CONFIGURE_NOTIFY_EVENT,
            sequence: 1,
            event,
            window,
            above_sibling: x11rb::NONE,
            x: 10,
            y: 20,
            width: 640,
            height: 480,
            border_width: 0,
            override_redirect: false,
        })
    }

    #[test]
    fn test_child_configure_keeps_both_windows() {
        let native = to_native(&configure(PARENT, CHILD));
        assert_eq!(
            native,
            NativeEvent::Configure {
                event: WindowHandle::from_raw(PARENT),
                window: WindowHandle::from_raw(CHILD),
                x: 10,
                y: 20,
                width: 640,
                height: 480,
            }
        );
        assert_eq!(native.window(), WindowHandle::from_raw(PARENT));
        assert_eq!(EventTranslator::new(Atom::from_raw(1), Atom::from_raw(2)).translate(&native), None);
    }

    #[test]
    fn test_client_message_carries_data32() {
        let event = ClientMessageEvent::new(32, PARENT, 300u32, [301u32, 5, 0, 0, 0]);
        let native = to_native(&Event::ClientMessage(event));
        assert_eq!(
            native,
            NativeEvent::ClientMessage {
                window: WindowHandle::from_raw(PARENT),
                message_type: Atom::from_raw(300),
                data: [301, 5, 0, 0, 0],
            }
        );
        let translator = EventTranslator::new(Atom::from_raw(300), Atom::from_raw(301));
        assert_eq!(translator.translate(&native), Some(AbstractEvent::CloseRequest));
    }

    #[test]
    fn test_untranslated_event_keeps_its_window() {
        let event = Event::PropertyNotify(PropertyNotifyEvent {
            response_type: xproto::PROPERTY_NOTIFY_EVENT,
            sequence: 1,
            window: PARENT,
            atom: 39,
            time: 0,
            state: Property::NEW_VALUE,
        });
        let native = to_native(&event);
        assert_eq!(
            native,
            NativeEvent::Other {
                window: WindowHandle::from_raw(PARENT),
                raw_kind: kind::PROPERTY_NOTIFY,
            }
        );
        let translator = EventTranslator::new(Atom::from_raw(1), Atom::from_raw(2));
        assert_eq!(translator.translate(&native), Some(AbstractEvent::Unhandled(kind::PROPERTY_NOTIFY)));
    }

    #[test]
    fn test_token_words_are_low_then_high() {
        let token = 0x0000_0007_8000_0001u64;
        assert_eq!(encode_token(token), [0x8000_0001, 0x7]);
        assert_eq!(decode_token(encode_token(token).into_iter()), Some(token));
        assert_eq!(decode_token([0x8000_0001u32].into_iter()), None);
    }
}
