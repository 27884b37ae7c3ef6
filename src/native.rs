//! Native window-system event records
//!
//! [`NativeEvent`] mirrors the parts of an X11 `XEvent` the translator reads.
//! Structural notifications carry both the window the event was reported on
//! (`event`) and the window it is about (`window`); they differ when the
//! notification bubbled up from a child.

use crate::handle::{Atom, WindowHandle};
use std::collections::VecDeque;

/// X11 core event codes, used as the raw kind of unhandled events
pub mod kind {
    pub const KEY_PRESS: u8 = 2;
    pub const KEY_RELEASE: u8 = 3;
    pub const BUTTON_PRESS: u8 = 4;
    pub const BUTTON_RELEASE: u8 = 5;
    pub const MOTION_NOTIFY: u8 = 6;
    pub const ENTER_NOTIFY: u8 = 7;
    pub const LEAVE_NOTIFY: u8 = 8;
    pub const FOCUS_IN: u8 = 9;
    pub const FOCUS_OUT: u8 = 10;
    pub const EXPOSE: u8 = 12;
    pub const VISIBILITY_NOTIFY: u8 = 15;
    pub const DESTROY_NOTIFY: u8 = 17;
    pub const UNMAP_NOTIFY: u8 = 18;
    pub const MAP_NOTIFY: u8 = 19;
    pub const REPARENT_NOTIFY: u8 = 21;
    pub const CONFIGURE_NOTIFY: u8 = 22;
    pub const PROPERTY_NOTIFY: u8 = 28;
    pub const CLIENT_MESSAGE: u8 = 33;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeEvent {
    KeyPress { window: WindowHandle, time: u32, keycode: u32, state: u16 },
    KeyRelease { window: WindowHandle, time: u32, keycode: u32, state: u16 },
    ButtonPress { window: WindowHandle, time: u32, button: u8, x: i32, y: i32, state: u16 },
    ButtonRelease { window: WindowHandle, time: u32, button: u8, x: i32, y: i32, state: u16 },
    Motion { window: WindowHandle, time: u32, x: i32, y: i32, state: u16 },
    Enter { window: WindowHandle, time: u32, x: i32, y: i32, state: u16 },
    Leave { window: WindowHandle, time: u32, x: i32, y: i32, state: u16 },
    FocusIn { window: WindowHandle },
    FocusOut { window: WindowHandle },
    Expose { window: WindowHandle, x: i32, y: i32, width: u32, height: u32, count: u16 },
    Configure { event: WindowHandle, window: WindowHandle, x: i32, y: i32, width: u32, height: u32 },
    Map { event: WindowHandle, window: WindowHandle },
    Unmap { event: WindowHandle, window: WindowHandle },
    Reparent { event: WindowHandle, window: WindowHandle, parent: WindowHandle },
    Destroy { event: WindowHandle, window: WindowHandle },
    ClientMessage { window: WindowHandle, message_type: Atom, data: [u32; 5] },
    /// Anything else the window system reports
    Other { window: WindowHandle, raw_kind: u8 },
}

impl NativeEvent {
    /// Window the event was delivered to; selects the dispatch target
    pub fn window(&self) -> WindowHandle {
        match *self {
            NativeEvent::KeyPress { window, .. }
            | NativeEvent::KeyRelease { window, .. }
            | NativeEvent::ButtonPress { window, .. }
            | NativeEvent::ButtonRelease { window, .. }
            | NativeEvent::Motion { window, .. }
            | NativeEvent::Enter { window, .. }
            | NativeEvent::Leave { window, .. }
            | NativeEvent::FocusIn { window }
            | NativeEvent::FocusOut { window }
            | NativeEvent::Expose { window, .. }
            | NativeEvent::ClientMessage { window, .. }
            | NativeEvent::Other { window, .. } => window,
            NativeEvent::Configure { event, .. }
            | NativeEvent::Map { event, .. }
            | NativeEvent::Unmap { event, .. }
            | NativeEvent::Reparent { event, .. }
            | NativeEvent::Destroy { event, .. } => event,
        }
    }

    pub fn raw_kind(&self) -> u8 {
        match self {
            NativeEvent::KeyPress { .. } => kind::KEY_PRESS,
            NativeEvent::KeyRelease { .. } => kind::KEY_RELEASE,
            NativeEvent::ButtonPress { .. } => kind::BUTTON_PRESS,
            NativeEvent::ButtonRelease { .. } => kind::BUTTON_RELEASE,
            NativeEvent::Motion { .. } => kind::MOTION_NOTIFY,
            NativeEvent::Enter { .. } => kind::ENTER_NOTIFY,
            NativeEvent::Leave { .. } => kind::LEAVE_NOTIFY,
            NativeEvent::FocusIn { .. } => kind::FOCUS_IN,
            NativeEvent::FocusOut { .. } => kind::FOCUS_OUT,
            NativeEvent::Expose { .. } => kind::EXPOSE,
            NativeEvent::Configure { .. } => kind::CONFIGURE_NOTIFY,
            NativeEvent::Map { .. } => kind::MAP_NOTIFY,
            NativeEvent::Unmap { .. } => kind::UNMAP_NOTIFY,
            NativeEvent::Reparent { .. } => kind::REPARENT_NOTIFY,
            NativeEvent::Destroy { .. } => kind::DESTROY_NOTIFY,
            NativeEvent::ClientMessage { .. } => kind::CLIENT_MESSAGE,
            NativeEvent::Other { raw_kind, .. } => *raw_kind,
        }
    }
}

/// Non-blocking access to a display connection's event queue
pub trait NativeEventQueue {
    /// False once the connection is gone; polling a closed queue is a no-op
    fn is_connected(&self) -> bool;

    /// Next already-queued event, without waiting for more
    fn next_event(&mut self) -> Option<NativeEvent>;

    /// Look at the next queued event without removing it
    fn peek_event(&mut self) -> Option<&NativeEvent>;
}

/// In-process event queue, used for loopback displays and tests
#[derive(Debug, Default)]
pub struct MemoryEventQueue {
    events: VecDeque<NativeEvent>,
    closed: bool,
}

impl MemoryEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: NativeEvent) {
        self.events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

impl Extend<NativeEvent> for MemoryEventQueue {
    fn extend<I: IntoIterator<Item = NativeEvent>>(&mut self, iter: I) {
        self.events.extend(iter);
    }
}

impl NativeEventQueue for MemoryEventQueue {
    fn is_connected(&self) -> bool {
        !self.closed
    }

    fn next_event(&mut self) -> Option<NativeEvent> {
        self.events.pop_front()
    }

    fn peek_event(&mut self) -> Option<&NativeEvent> {
        self.events.front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_events_report_event_window() {
        let parent = WindowHandle::from_raw(1);
        let child = WindowHandle::from_raw(2);
        let ev = NativeEvent::Configure { event: parent, window: child, x: 0, y: 0, width: 1, height: 1 };
        assert_eq!(ev.window(), parent);
        assert_eq!(ev.raw_kind(), kind::CONFIGURE_NOTIFY);
    }

    #[test]
    fn test_memory_queue_is_fifo() {
        let w = WindowHandle::from_raw(7);
        let mut queue = MemoryEventQueue::new();
        queue.push(NativeEvent::FocusIn { window: w });
        queue.push(NativeEvent::FocusOut { window: w });
        assert_eq!(queue.peek_event(), Some(&NativeEvent::FocusIn { window: w }));
        assert_eq!(queue.next_event(), Some(NativeEvent::FocusIn { window: w }));
        assert_eq!(queue.next_event(), Some(NativeEvent::FocusOut { window: w }));
        assert_eq!(queue.next_event(), None);
    }
}
