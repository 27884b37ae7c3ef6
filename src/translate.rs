//! Native event translation and dispatch
//!
//! One call to [`EventTranslator::poll_and_dispatch`] drains what is already
//! queued on a display connection (bounded by an iteration cap), turns every
//! native record into an [`AbstractEvent`] and delivers it synchronously to
//! the window's dispatch target, in queue order.

use crate::event::{deliver, AbstractEvent, KeyEvent, Modifiers, PointerEvent, PointerKind, Rect};
use crate::handle::{Atom, WindowHandle};
use crate::native::{NativeEvent, NativeEventQueue};
use crate::registry::{PropertyStore, WindowRegistry};
use tracing::{debug, info, warn};

/// What happened during one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollOutcome {
    /// Native events taken off the queue
    pub processed: usize,
    /// Abstract events handed to dispatch targets
    pub delivered: usize,
    /// Native events dropped (no window, unbound, suppressed, unhandled)
    pub dropped: usize,
    /// Window that accepted a close request; polling stopped there
    pub closed: Option<WindowHandle>,
}

#[derive(Debug, Clone, Copy)]
pub struct EventTranslator {
    wm_protocols: Atom,
    wm_delete_window: Atom,
}

impl EventTranslator {
    /// Atoms negotiated for the close protocol: a close request is a client
    /// message of type `wm_protocols` carrying `wm_delete_window` first
    pub fn new(wm_protocols: Atom, wm_delete_window: Atom) -> Self {
        Self {
            wm_protocols,
            wm_delete_window,
        }
    }

    pub fn wm_protocols(&self) -> Atom {
        self.wm_protocols
    }

    pub fn wm_delete_window(&self) -> Atom {
        self.wm_delete_window
    }

    /// Drain up to `max_events` queued native events and dispatch them.
    ///
    /// A disconnected queue is not an error: the display may have been closed
    /// by another part of the toolkit, so this returns an empty outcome.
    pub fn poll_and_dispatch<Q, S>(
        &self,
        queue: &mut Q,
        registry: &mut WindowRegistry<S>,
        max_events: usize,
    ) -> PollOutcome
    where
        Q: NativeEventQueue + ?Sized,
        S: PropertyStore,
    {
        let mut outcome = PollOutcome::default();
        if !queue.is_connected() {
            return outcome;
        }

        while outcome.processed < max_events {
            let Some(native) = queue.next_event() else {
                break;
            };
            outcome.processed += 1;

            let window = native.window();
            if window.is_none() {
                debug!("Dropping event kind {} without a window", native.raw_kind());
                outcome.dropped += 1;
                continue;
            }

            let Some(mut event) = self.translate(&native) else {
                outcome.dropped += 1;
                continue;
            };

            // A folded pair counts as two events against the cap
            if let NativeEvent::KeyRelease { time, keycode, .. } = native {
                let repeat = if outcome.processed < max_events {
                    take_repeat_press(queue, window, time, keycode)
                } else {
                    None
                };
                if let Some(repeat) = repeat {
                    outcome.processed += 1;
                    event = repeat;
                }
            }

            if let AbstractEvent::Unhandled(kind) = event {
                debug!("Ignoring unhandled event kind {} for {}", kind, window);
                outcome.dropped += 1;
                continue;
            }

            let Some(target) = registry.lookup(window) else {
                warn!("No dispatch target for {}, dropping event kind {}", window, native.raw_kind());
                outcome.dropped += 1;
                continue;
            };

            let answer = deliver(target, event);
            outcome.delivered += 1;

            match (event, answer) {
                (AbstractEvent::CloseRequest, Some(true)) => {
                    info!("{} accepted close, stopping event poll", window);
                    outcome.closed = Some(window);
                    return outcome;
                }
                (AbstractEvent::CloseRequest, _) => {
                    debug!("{} refused close", window);
                }
                (AbstractEvent::Destroyed, _) => {
                    registry.unbind(window);
                }
                _ => {}
            }
        }

        outcome
    }

    /// Map one native record to an abstract event.
    ///
    /// `None` means the record is deliberately suppressed (notifications
    /// about child windows, button releases of wheel steps, empty exposes).
    pub fn translate(&self, native: &NativeEvent) -> Option<AbstractEvent> {
        let event = match *native {
            NativeEvent::KeyPress { keycode, state, .. } => AbstractEvent::Key(KeyEvent {
                code: keycode,
                modifiers: Modifiers::from_x11_state(state),
                pressed: true,
            }),
            NativeEvent::KeyRelease { keycode, state, .. } => AbstractEvent::Key(KeyEvent {
                code: keycode,
                modifiers: Modifiers::from_x11_state(state),
                pressed: false,
            }),
            NativeEvent::ButtonPress { button, x, y, state, .. } => {
                let kind = match scroll_delta(button) {
                    Some((dx, dy)) => PointerKind::Scroll { dx, dy },
                    None => PointerKind::Press,
                };
                pointer(kind, button, x, y, state)
            }
            NativeEvent::ButtonRelease { button, x, y, state, .. } => {
                if scroll_delta(button).is_some() {
                    return None;
                }
                pointer(PointerKind::Release, button, x, y, state)
            }
            NativeEvent::Motion { x, y, state, .. } => pointer(PointerKind::Motion, 0, x, y, state),
            NativeEvent::Enter { x, y, state, .. } => pointer(PointerKind::Enter, 0, x, y, state),
            NativeEvent::Leave { x, y, state, .. } => pointer(PointerKind::Leave, 0, x, y, state),
            NativeEvent::FocusIn { .. } => AbstractEvent::Focus(true),
            NativeEvent::FocusOut { .. } => AbstractEvent::Focus(false),
            NativeEvent::Expose { x, y, width, height, .. } => {
                if width == 0 || height == 0 {
                    return None;
                }
                AbstractEvent::Expose(Rect::new(x, y, width, height))
            }
            NativeEvent::Configure { event, window, x, y, width, height } => {
                self_only(event, window)?;
                AbstractEvent::Configure(Rect::new(x, y, width, height))
            }
            NativeEvent::Map { event, window } => {
                self_only(event, window)?;
                AbstractEvent::Map(true)
            }
            NativeEvent::Unmap { event, window } => {
                self_only(event, window)?;
                AbstractEvent::Map(false)
            }
            NativeEvent::Reparent { event, window, parent } => {
                self_only(event, window)?;
                AbstractEvent::Reparent((!parent.is_none()).then_some(parent))
            }
            NativeEvent::Destroy { event, window } => {
                self_only(event, window)?;
                AbstractEvent::Destroyed
            }
            NativeEvent::ClientMessage { message_type, data, .. } => {
                if message_type == self.wm_protocols && data[0] == self.wm_delete_window.raw() {
                    AbstractEvent::CloseRequest
                } else {
                    AbstractEvent::Unhandled(native.raw_kind())
                }
            }
            NativeEvent::Other { raw_kind, .. } => AbstractEvent::Unhandled(raw_kind),
        };
        Some(event)
    }
}

fn pointer(kind: PointerKind, button: u8, x: i32, y: i32, state: u16) -> AbstractEvent {
    AbstractEvent::Pointer(PointerEvent {
        kind,
        button,
        x,
        y,
        modifiers: Modifiers::from_x11_state(state),
    })
}

/// X11 reports wheel steps as presses of buttons 4..7
fn scroll_delta(button: u8) -> Option<(i32, i32)> {
    match button {
        4 => Some((0, -1)),
        5 => Some((0, 1)),
        6 => Some((-1, 0)),
        7 => Some((1, 0)),
        _ => None,
    }
}

fn self_only(event: WindowHandle, window: WindowHandle) -> Option<()> {
    if event == window {
        Some(())
    } else {
        debug!("Ignoring structural notification about child {} on {}", window, event);
        None
    }
}

/// Consume the press half of an auto-repeat pair, if it is next in the queue
fn take_repeat_press<Q: NativeEventQueue + ?Sized>(
    queue: &mut Q,
    window: WindowHandle,
    time: u32,
    keycode: u32,
) -> Option<AbstractEvent> {
    let state = match queue.peek_event() {
        Some(&NativeEvent::KeyPress { window: w, time: t, keycode: k, state })
            if w == window && t == time && k == keycode =>
        {
            state
        }
        _ => return None,
    };
    queue.next_event();
    Some(AbstractEvent::Key(KeyEvent {
        code: keycode,
        modifiers: Modifiers::from_x11_state(state) | Modifiers::AUTOREPEAT,
        pressed: true,
    }))
}
