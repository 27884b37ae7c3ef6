//! Probe for the driver layer
//!
//! Runs the event pump, the mode controller, the swap chain and the cursor
//! against the in-process virtual display and device, logging each step.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use native_window_driver::kms::DisplayMode;
use native_window_driver::native::kind;
use native_window_driver::{
    Atom, CursorResource, DispatchTarget, DriverConfig, EventTranslator, KeyEvent, KmsDevice, MemoryEventQueue,
    MemoryPropertyStore, ModeRequest, NativeEvent, PointerEvent, Rotation, ScreenModeController, SwapChainManager,
    VirtualKmsDevice, VirtualScreen, WindowHandle, WindowRegistry,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "nwd-probe")]
#[command(about = "Exercise the native window driver against a virtual display", long_about = None)]
struct Args {
    /// Config file (defaults to the XDG location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Frames to present after the initial modeset
    #[arg(short, long, default_value_t = 10)]
    frames: u32,

    /// Swap interval; 0 presents without waiting for flips
    #[arg(short, long, default_value_t = 1)]
    swap_interval: u32,

    /// Enable verbose debug output
    #[arg(short, long)]
    debug: bool,
}

const WM_PROTOCOLS: Atom = Atom::from_raw(300);
const WM_DELETE_WINDOW: Atom = Atom::from_raw(301);
const BINDING_PROPERTY: Atom = Atom::from_raw(302);

/// Dispatch target that just logs what it receives
struct ProbeWindow {
    name: &'static str,
}

impl DispatchTarget for ProbeWindow {
    fn on_pointer_event(&mut self, event: PointerEvent) {
        info!("{}: pointer {:?} at {},{}", self.name, event.kind, event.x, event.y);
    }

    fn on_key_event(&mut self, event: KeyEvent) {
        info!(
            "{}: key {} {}{}",
            self.name,
            event.code,
            if event.pressed { "down" } else { "up" },
            if event.is_repeat() { " (repeat)" } else { "" }
        );
    }

    fn on_configure(&mut self, x: i32, y: i32, width: u32, height: u32) {
        info!("{}: configured {}x{}+{}+{}", self.name, width, height, x, y);
    }

    fn on_close_request(&mut self) -> bool {
        info!("{}: close requested, accepting", self.name);
        true
    }

    fn on_screen_mode_changed(&mut self, width: u32, height: u32, refresh_hz: u32) {
        info!("{}: screen now {}x{}@{}", self.name, width, height, refresh_hz);
    }
}

fn pump_events(config: &DriverConfig) {
    let window = WindowHandle::from_raw(0x40_0001);
    let mut store = MemoryPropertyStore::new();
    store.create_window(window);
    let mut registry = WindowRegistry::new(store, BINDING_PROPERTY);
    registry.bind(window, Box::new(ProbeWindow { name: "probe" }));

    let mut queue = MemoryEventQueue::new();
    queue.extend([
        NativeEvent::Configure { event: window, window, x: 0, y: 0, width: 1280, height: 720 },
        NativeEvent::Motion { window, time: 10, x: 40, y: 30, state: 0 },
        NativeEvent::KeyPress { window, time: 20, keycode: 38, state: 0 },
        NativeEvent::KeyRelease { window, time: 30, keycode: 38, state: 0 },
        NativeEvent::KeyPress { window, time: 30, keycode: 38, state: 0 },
        NativeEvent::Other { window, raw_kind: kind::PROPERTY_NOTIFY },
        NativeEvent::ClientMessage { window, message_type: WM_PROTOCOLS, data: [WM_DELETE_WINDOW.raw(), 0, 0, 0, 0] },
    ]);

    let translator = EventTranslator::new(WM_PROTOCOLS, WM_DELETE_WINDOW);
    let outcome = translator.poll_and_dispatch(&mut queue, &mut registry, config.max_events_per_poll);
    info!(
        "Event pump: {} processed, {} delivered, {} dropped, closed={:?}",
        outcome.processed, outcome.delivered, outcome.dropped, outcome.closed
    );
    registry.unbind(window);
}

fn switch_mode(config: &DriverConfig) -> Result<DisplayMode> {
    let mut controller = ScreenModeController::new(VirtualScreen::laptop(), config.mode_confirm_timeout());
    let modes = controller.enumerate_modes(0).context("enumerate modes")?;
    for (i, mode) in modes.iter().enumerate() {
        info!("  mode {}: {}x{}@{} rotation {}", i, mode.width, mode.height, mode.refresh_hz, mode.rotation.degrees());
    }

    let mut window = ProbeWindow { name: "probe" };
    let request = ModeRequest { resolution_index: 1, refresh_hz: 60, rotation: Rotation::Deg0 };
    let mode = controller
        .request_mode(0, request, Some(&mut window))
        .context("request screen mode")?;
    Ok(DisplayMode { width: mode.width, height: mode.height, refresh_rate: mode.refresh_hz })
}

fn present_frames(config: &DriverConfig, device: &mut VirtualKmsDevice, args: &Args) -> Result<()> {
    let output = device.primary_output()?;
    let mut swap = SwapChainManager::new(config.ring_depth, config.flip_timeout())?;
    let window = swap.create_window(device, 0, 0, output.mode.width, output.mode.height, true, 0)?;

    let mut current = swap.first_present(device, window).context("initial modeset")?;
    for frame in 0..args.frames {
        current = swap
            .next_present(device, window, current, args.swap_interval)
            .with_context(|| format!("present frame {}", frame))?;
    }
    info!(
        "Presented {} frames; {} framebuffers for the ring, {} on screen",
        args.frames,
        swap.framebuffer_count(window),
        current.fb
    );

    let size = config.cursor_size.min(32);
    let arrow = vec![0xffff_ffffu32; (size * size) as usize];
    let mut cursor = CursorResource::create(device, &arrow, size, size, 0, 0).context("create cursor")?;
    cursor.set_visible(device, output.crtc, true, 100, 100)?;
    for step in 0..5 {
        cursor.move_to(device, output.crtc, 100 + step * 20, 100 + step * 10)?;
    }
    cursor.destroy(device)?;

    swap.close_window(device, window)?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug {
        "debug,native_window_driver=debug"
    } else {
        "warn,native_window_driver=info,nwd_probe=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = DriverConfig::load(args.config.as_deref()).context("load driver config")?;
    info!(device = %config.device_path.display(), "nwd-probe starting");

    pump_events(&config);
    let mode = switch_mode(&config)?;

    let mut device = VirtualKmsDevice::new(mode, config.cursor_size)?;
    if let Err(e) = present_frames(&config, &mut device, &args) {
        warn!("Presentation failed: {:#}", e);
        return Err(e);
    }

    info!("Probe finished ({} device operations)", device.journal().len());
    Ok(())
}
