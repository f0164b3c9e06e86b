// =============================================================================
// FRAME PACER - Spinning cube with several frames in flight
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit App (window, input, redraw requests)                     │
// │    └── Renderer (tick, resize, vsync, fullscreen)               │
// │          └── Frame engine (fence, slots, surface, uploads)      │
// │                └── VulkanBackend (ash, timeline semaphores)     │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. RedrawRequested with the time since the last frame
// 2. Renderer::tick (update, wait for the slot, record, submit, present)
// 3. FPS bookkeeping
//
// =============================================================================

use anyhow::{Context, Result};
use frame_pacer::backend::device::AdapterPreference;
use frame_pacer::backend::{ShaderSet, VulkanBackend, VulkanDevice};
use frame_pacer::cli::Args;
use frame_pacer::config::Config;
use frame_pacer::display::{action_for, FullscreenChange, KeyAction, KeyChord, WindowPlacement};
use frame_pacer::scene::{FrameCounter, SceneDescription};
use frame_pacer::{exit_code, FatalError, Renderer, RendererSettings};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::fs::File;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    dpi::{PhysicalPosition, PhysicalSize},
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{ModifiersState, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes, WindowId},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() {
    let args = Args::from_env();

    // Load configuration, then let the command line override it
    let mut config = Config::load(&args.config);
    args.apply(&mut config);

    init_logging(&config);
    log::info!("Starting frame pacer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );

    if let Err(e) = run(config) {
        log::error!("Fatal: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

fn run(config: Config) -> Result<()> {
    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Initialize logging: info by default, RUST_LOG overrides, optional file output
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();

    let mut file_error = None;
    if config.debug.log_to_file {
        match File::create(&config.debug.log_file) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => file_error = Some(e),
        }
    }
    builder.init();

    if let Some(e) = file_error {
        log::warn!("Cannot open log file {:?}: {}", config.debug.log_file, e);
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Window plus the renderer drawing into it.
///
/// Field order matters for Drop: the renderer (and the Vulkan surface inside
/// it) must go before the window.
struct App {
    config: Config,
    renderer: Option<Renderer<VulkanBackend>>,
    window: Option<Arc<Window>>,

    /// Window is minimized (size = 0) - skip rendering
    is_minimized: bool,
    modifiers: ModifiersState,

    // FPS tracking
    fps: FrameCounter,
    last_frame_time: Instant,

    /// First fatal error; the event loop exits once it is set
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            renderer: None,
            window: None,
            is_minimized: false,
            modifiers: ModifiersState::empty(),
            fps: FrameCounter::new(),
            last_frame_time: Instant::now(),
            fatal: None,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    /// Build the renderer for a freshly created window.
    ///
    /// 1. Vulkan device with a surface for the window
    /// 2. Presentation chain sized from the window
    /// 3. Shaders
    /// 4. Frame engine and scene
    fn init_renderer(&self, window: &Window) -> Result<Renderer<VulkanBackend>> {
        log::info!("Initializing Vulkan...");

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Device and surface
        // ─────────────────────────────────────────────────────────────────────
        // Validation only in debug builds, and only if the config asks for it
        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let display = window
            .display_handle()
            .map_err(|e| FatalError::Surface(e.to_string()))?
            .as_raw();
        let handle = window
            .window_handle()
            .map_err(|e| FatalError::Surface(e.to_string()))?
            .as_raw();
        let device = VulkanDevice::new(
            &self.config.window.title,
            enable_validation,
            AdapterPreference {
                software: self.config.graphics.use_software_adapter,
            },
            display,
            handle,
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Presentation chain
        // ─────────────────────────────────────────────────────────────────────
        let size = window.inner_size();
        let settings = RendererSettings::from_config(&self.config, size.width, size.height);
        let backend = VulkanBackend::new(
            device,
            settings.extent,
            settings.frames_in_flight,
            settings.vsync,
            settings.allow_tearing,
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Shaders
        // ─────────────────────────────────────────────────────────────────────
        let shaders = ShaderSet::load(&self.config.graphics.shader_dir)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Frame engine
        // ─────────────────────────────────────────────────────────────────────
        let renderer = Renderer::initialize(backend, settings, &SceneDescription::cube(), &shaders)
            .context("Failed to initialize renderer")?;

        log::info!("Vulkan initialized successfully!");
        Ok(renderer)
    }

    /// Record a fatal error and stop the event loop.
    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        event_loop.exit();
    }

    /// Drain the GPU, release everything and stop the event loop.
    fn close(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(renderer) = self.renderer.take() {
            match renderer.shutdown() {
                // Dropping the backend destroys the chain, device and surface
                Ok(backend) => drop(backend),
                Err(e) => {
                    self.fail(event_loop, e);
                    return;
                }
            }
        }
        event_loop.exit();
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    fn render_frame(&mut self) -> Result<()> {
        let now = Instant::now();
        let delta = now.duration_since(self.last_frame_time);
        self.last_frame_time = now;

        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(());
        };
        if self.is_minimized {
            return Ok(());
        }
        renderer.tick(delta)?;

        if let Some(fps) = self.fps.tick(delta) {
            log::info!("{:.0} FPS", fps);
            if self.config.debug.show_fps {
                if let Some(ref window) = self.window {
                    let mode = if renderer.is_fullscreen() { "fullscreen" } else { "windowed" };
                    let sync = if renderer.present_mode().sync_interval > 0 {
                        "vsync"
                    } else {
                        "no vsync"
                    };
                    window.set_title(&format!(
                        "{} - {:.0} FPS ({:.2}ms) [{}, {}]",
                        self.config.window.title,
                        fps,
                        1000.0 / fps,
                        mode,
                        sync
                    ));
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        let (Some(window), Some(renderer)) = (self.window.as_ref(), self.renderer.as_mut()) else {
            return;
        };

        let position = window.outer_position().unwrap_or(PhysicalPosition::new(0, 0));
        let size = window.inner_size();
        let current = WindowPlacement {
            x: position.x,
            y: position.y,
            width: size.width,
            height: size.height,
        };

        let enable = !renderer.is_fullscreen();
        match renderer.set_fullscreen(enable, current) {
            FullscreenChange::Unchanged => {}
            FullscreenChange::Entered => {
                // Borderless on the current monitor
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
            }
            FullscreenChange::Left { restore } => {
                window.set_fullscreen(None);
                if let Some(placement) = restore {
                    window.set_outer_position(PhysicalPosition::new(placement.x, placement.y));
                    let _ = window
                        .request_inner_size(PhysicalSize::new(placement.width, placement.height));
                }
            }
        }
        // The size change comes back as a Resized event
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        // Create window with settings from config
        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                let error = anyhow::Error::new(e).context("Failed to create window");
                self.fail(event_loop, error);
                return;
            }
        };

        match self.init_renderer(&window) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                self.fail(event_loop, e.context("Failed to initialize Vulkan"));
                return;
            }
        }

        self.window = Some(window);
        self.last_frame_time = Instant::now();
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            // ─────────────────────────────────────────────────────────────────
            // CLOSE REQUEST
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.close(event_loop);
            }

            // ─────────────────────────────────────────────────────────────────
            // WINDOW RESIZED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                // Minimized windows report 0x0; pause until restored
                self.is_minimized = size.width == 0 || size.height == 0;
                if self.is_minimized {
                    return;
                }
                if let Some(renderer) = self.renderer.as_mut() {
                    if let Err(e) = renderer.resize(size.width, size.height) {
                        self.fail(event_loop, e);
                    }
                }
            }

            // ─────────────────────────────────────────────────────────────────
            // REDRAW REQUESTED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render_frame() {
                    self.fail(event_loop, e.context("Render error"));
                }
            }

            WindowEvent::ModifiersChanged(modifiers) => {
                self.modifiers = modifiers.state();
            }

            // ─────────────────────────────────────────────────────────────────
            // KEYBOARD INPUT
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::KeyboardInput { event, .. } => {
                if !event.state.is_pressed() || event.repeat {
                    return;
                }
                let PhysicalKey::Code(key) = event.physical_key else {
                    return;
                };
                let chord = KeyChord {
                    key,
                    alt: self.modifiers.alt_key(),
                };

                match action_for(chord) {
                    Some(KeyAction::Quit) => {
                        log::info!("ESC pressed, exiting...");
                        self.close(event_loop);
                    }
                    Some(KeyAction::ToggleFullscreen) => self.toggle_fullscreen(),
                    Some(KeyAction::ToggleVsync) => {
                        if let Some(renderer) = self.renderer.as_mut() {
                            renderer.toggle_vsync();
                        }
                    }
                    None => {}
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws while there is something to show.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.is_minimized {
            return;
        }
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
