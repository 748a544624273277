//! # PBR IBL Viewer
//!
//! Opens a window and renders a row of PBR spheres lit by an HDR panorama.
//!
//! Controls:
//! - W/S/A/D to fly, Space/Z to move up and down
//! - Mouse to look around
//! - Escape to quit

use pbr_ibl_engine::{window, Engine, EngineConfig, EngineResult, SceneAssets, VulkanBackend, Window};
use winit::event_loop::EventLoop;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run_viewer() {
        log::error!("{err}");
        std::process::exit(1);
    }
}

fn run_viewer() -> EngineResult<()> {
    let config = EngineConfig::default();
    log::info!("Starting {} ({}x{})", config.title, config.width, config.height);

    let event_loop = EventLoop::new().map_err(|e| pbr_ibl_engine::EngineError::Window(e.to_string()))?;
    let window = Window::new(&event_loop, &config)?;

    let backend = VulkanBackend::new(window.window_arc(), config.vsync)?;
    let mut engine = Engine::new(backend, &config, &SceneAssets::default())?;

    window::run(event_loop, window, |window, dt| {
        let input = window.take_input();
        engine.update(dt, &input)?;
        engine.render()
    })?;

    log::info!("Shutting down after {:.1}s", engine.elapsed());
    engine.destroy()?;
    Ok(())
}
