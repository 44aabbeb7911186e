#![cfg(not(target_arch = "wasm32"))]

use std::backtrace::Backtrace;
use std::panic;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _};
use log::{error, info, warn, LevelFilter};

use slop_render::gpu::WgpuBackend;
use slop_render::{
    GraphicsBackend, HeadlessBackend, HeadlessOptions, MaterialManager, MaterialManagerConfig, Renderer,
    RendererConfig, TextureState,
};

const USAGE: &str = "usage: slop_render <asset_dir> <material.json> [--wgpu] [--shader <basename>]";

struct Args {
    asset_dir: PathBuf,
    material: String,
    use_wgpu: bool,
    shader: Option<String>,
}

fn parse_args() -> anyhow::Result<Option<Args>> {
    let mut positional = Vec::new();
    let mut use_wgpu = false;
    let mut shader = None;
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--wgpu" => use_wgpu = true,
            "--shader" => shader = Some(iter.next().context("--shader needs a basename")?),
            "-h" | "--help" => return Ok(None),
            _ => positional.push(arg),
        }
    }
    let mut positional = positional.into_iter();
    let (Some(asset_dir), Some(material)) = (positional.next(), positional.next()) else {
        return Ok(None);
    };
    Ok(Some(Args {
        asset_dir: PathBuf::from(asset_dir),
        material,
        use_wgpu,
        shader,
    }))
}

fn main() -> anyhow::Result<()> {
    init_logging();
    install_panic_report();

    let Some(args) = parse_args()? else {
        println!("{}", USAGE);
        return Ok(());
    };

    let backend: Box<dyn GraphicsBackend> = if args.use_wgpu {
        Box::new(WgpuBackend::new())
    } else {
        Box::new(HeadlessBackend::new(HeadlessOptions::default()))
    };
    let config = RendererConfig::default();
    let mut renderer = Renderer::new(backend, config.clone());
    renderer
        .initialize(config.window_size, "slop_render")
        .with_context(|| format!("initialize failed: {}", renderer.last_error()))?;
    info!(
        "{} renderer at {:?}, window {}x{}",
        renderer.backend_name(),
        renderer.feature_level(),
        renderer.window_size().x,
        renderer.window_size().y
    );

    let mut manager = MaterialManager::new(MaterialManagerConfig::default().with_asset_root(&args.asset_dir));

    if let Some(basename) = &args.shader {
        match manager.load_shader(&mut renderer, basename) {
            Ok(shader) => info!("shader {} linked, attributes {:?}", basename, shader.attributes()),
            Err(_) => warn!("shader {} unavailable: {}", basename, renderer.last_error()),
        }
    }

    let material = match manager.load_material(&mut renderer, &args.material) {
        Ok(material) => material,
        Err(err) => bail!("{}: {}", renderer.last_error(), err),
    };
    manager.start_loading_textures()?;

    let start = Instant::now();
    let deadline = start + Duration::from_secs(30);
    while !manager.try_finalize(&mut renderer) {
        if Instant::now() > deadline {
            bail!("textures for {} did not settle in time", args.material);
        }
        renderer.advance_frame(false, start.elapsed().as_secs_f64());
        std::thread::sleep(Duration::from_millis(2));
    }

    for name in material.texture_names() {
        let Some(texture) = manager.find_texture(name) else {
            continue;
        };
        match texture.state() {
            TextureState::Resident => info!(
                "{}: {}x{} {:?} -> {:?}, {} mip levels",
                name,
                texture.size().x,
                texture.size().y,
                texture.desired_format(),
                texture.actual_format(),
                texture.mip_levels()
            ),
            state => error!("{}: {:?} ({})", name, state, texture.error().unwrap_or_default()),
        }
    }

    material.set(&mut renderer);
    info!(
        "material {} ready={} blend={:?} after {} frames ({:.1} ms)",
        args.material,
        material.is_ready(),
        renderer.blend_mode(),
        renderer.frame_count(),
        start.elapsed().as_secs_f64() * 1000.0
    );
    renderer.shut_down();
    Ok(())
}

/// Debug builds log every texture transition and loader dispatch, release builds
/// only warnings and failed uploads. wgpu and naga are held at `warn` so their
/// per-call tracing doesn't bury the loader's. `RUST_LOG` overrides all of it.
fn init_logging() {
    let level = if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .filter_module("wgpu_core", LevelFilter::Warn)
        .filter_module("wgpu_hal", LevelFilter::Warn)
        .filter_module("naga", LevelFilter::Warn)
        .format_timestamp_millis()
        .parse_default_env()
        .init();
}

/// Prints the panicking thread's name with the backtrace. A decode worker that
/// panics is still reported here, even though the loader catches the unwind and
/// fails only that texture.
fn install_panic_report() {
    panic::set_hook(Box::new(|info| {
        let payload = info.payload();
        let reason = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string payload");
        let location = info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_default();
        let thread = std::thread::current();
        eprintln!(
            "slop_render: thread '{}' panicked at {}: {}\n{}",
            thread.name().unwrap_or("<unnamed>"),
            location,
            reason,
            Backtrace::force_capture()
        );
    }));
}
