//! Abstract window events and the dispatch capability
//!
//! Whatever the window system, the translator reduces its events to
//! [`AbstractEvent`] and hands them to the window's [`DispatchTarget`].

use crate::handle::WindowHandle;
use bitflags::bitflags;

bitflags! {
    /// Keyboard and pointer modifier state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Modifiers: u32 {
        const SHIFT = 1 << 0;
        const CAPS_LOCK = 1 << 1;
        const CONTROL = 1 << 2;
        const ALT = 1 << 3;
        const NUM_LOCK = 1 << 4;
        const META = 1 << 6;
        const BUTTON1 = 1 << 8;
        const BUTTON2 = 1 << 9;
        const BUTTON3 = 1 << 10;
        const BUTTON4 = 1 << 11;
        const BUTTON5 = 1 << 12;
        /// Key event synthesised from an OS auto-repeat release/press pair
        const AUTOREPEAT = 1 << 16;
    }
}

impl Modifiers {
    /// Convert an X11 key/button state mask
    pub fn from_x11_state(state: u16) -> Self {
        let mut mods = Modifiers::empty();
        let map = [
            (0x0001, Modifiers::SHIFT),
            (0x0002, Modifiers::CAPS_LOCK),
            (0x0004, Modifiers::CONTROL),
            (0x0008, Modifiers::ALT),
            (0x0010, Modifiers::NUM_LOCK),
            (0x0040, Modifiers::META),
            (0x0100, Modifiers::BUTTON1),
            (0x0200, Modifiers::BUTTON2),
            (0x0400, Modifiers::BUTTON3),
            (0x0800, Modifiers::BUTTON4),
            (0x1000, Modifiers::BUTTON5),
        ];
        for (bit, flag) in map {
            if state & bit != 0 {
                mods |= flag;
            }
        }
        mods
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    Press,
    Release,
    Motion,
    Enter,
    Leave,
    /// Wheel step; `dx`/`dy` in notches
    Scroll { dx: i32, dy: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerEvent {
    pub kind: PointerKind,
    /// 1-based button number, 0 for motion/crossing
    pub button: u8,
    pub x: i32,
    pub y: i32,
    pub modifiers: Modifiers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub code: u32,
    pub modifiers: Modifiers,
    pub pressed: bool,
}

impl KeyEvent {
    pub fn is_repeat(&self) -> bool {
        self.modifiers.contains(Modifiers::AUTOREPEAT)
    }
}

/// Uniform window event produced by the translator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbstractEvent {
    Pointer(PointerEvent),
    Key(KeyEvent),
    Expose(Rect),
    Configure(Rect),
    Map(bool),
    Reparent(Option<WindowHandle>),
    CloseRequest,
    Focus(bool),
    Destroyed,
    /// Native kind the translator does not handle yet
    Unhandled(u8),
}

/// Callbacks the managed side exposes for one window.
///
/// Resolved once when the window is bound and reused for every event. Only
/// `on_close_request` must be answered; everything else defaults to ignoring
/// the event.
pub trait DispatchTarget {
    fn on_pointer_event(&mut self, _event: PointerEvent) {}

    fn on_key_event(&mut self, _event: KeyEvent) {}

    fn on_expose(&mut self, _area: Rect) {}

    fn on_configure(&mut self, _x: i32, _y: i32, _width: u32, _height: u32) {}

    fn on_visibility_changed(&mut self, _visible: bool) {}

    /// Returns whether the window accepted destruction
    fn on_close_request(&mut self) -> bool;

    fn on_reparent(&mut self, _new_parent: Option<WindowHandle>) {}

    fn on_focus_changed(&mut self, _focused: bool) {}

    fn on_destroyed(&mut self) {}

    fn on_screen_mode_changed(&mut self, _width: u32, _height: u32, _refresh_hz: u32) {}
}

/// Route one abstract event to the matching callback.
///
/// Returns `Some(accepted)` for close requests, `None` otherwise.
pub fn deliver(target: &mut dyn DispatchTarget, event: AbstractEvent) -> Option<bool> {
    match event {
        AbstractEvent::Pointer(e) => target.on_pointer_event(e),
        AbstractEvent::Key(e) => target.on_key_event(e),
        AbstractEvent::Expose(r) => target.on_expose(r),
        AbstractEvent::Configure(r) => target.on_configure(r.x, r.y, r.width, r.height),
        AbstractEvent::Map(visible) => target.on_visibility_changed(visible),
        AbstractEvent::Reparent(parent) => target.on_reparent(parent),
        AbstractEvent::CloseRequest => return Some(target.on_close_request()),
        AbstractEvent::Focus(focused) => target.on_focus_changed(focused),
        AbstractEvent::Destroyed => target.on_destroyed(),
        AbstractEvent::Unhandled(_) => {}
    }
    None
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording dispatch target shared by the module tests

    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Pointer(PointerEvent),
        Key(KeyEvent),
        Expose(Rect),
        Configure(Rect),
        Visible(bool),
        Close,
        Reparent(Option<WindowHandle>),
        Focus(bool),
        Destroyed,
        ModeChanged(u32, u32, u32),
    }

    pub struct Recorder {
        pub calls: Rc<RefCell<Vec<Call>>>,
        pub accept_close: bool,
    }

    impl Recorder {
        pub fn new(accept_close: bool) -> (Self, Rc<RefCell<Vec<Call>>>) {
            let calls = Rc::new(RefCell::new(Vec::new()));
            (Self { calls: Rc::clone(&calls), accept_close }, calls)
        }
    }

    impl DispatchTarget for Recorder {
        fn on_pointer_event(&mut self, event: PointerEvent) {
            self.calls.borrow_mut().push(Call::Pointer(event));
        }
        fn on_key_event(&mut self, event: KeyEvent) {
            self.calls.borrow_mut().push(Call::Key(event));
        }
        fn on_expose(&mut self, area: Rect) {
            self.calls.borrow_mut().push(Call::Expose(area));
        }
        fn on_configure(&mut self, x: i32, y: i32, width: u32, height: u32) {
            self.calls.borrow_mut().push(Call::Configure(Rect::new(x, y, width, height)));
        }
        fn on_visibility_changed(&mut self, visible: bool) {
            self.calls.borrow_mut().push(Call::Visible(visible));
        }
        fn on_close_request(&mut self) -> bool {
            self.calls.borrow_mut().push(Call::Close);
            self.accept_close
        }
        fn on_reparent(&mut self, new_parent: Option<WindowHandle>) {
            self.calls.borrow_mut().push(Call::Reparent(new_parent));
        }
        fn on_focus_changed(&mut self, focused: bool) {
            self.calls.borrow_mut().push(Call::Focus(focused));
        }
        fn on_destroyed(&mut self) {
            self.calls.borrow_mut().push(Call::Destroyed);
        }
        fn on_screen_mode_changed(&mut self, width: u32, height: u32, refresh_hz: u32) {
            self.calls.borrow_mut().push(Call::ModeChanged(width, height, refresh_hz));
        }
    }
}
