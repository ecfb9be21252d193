//! Ember demo: opens a window and clears it every frame.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p ember-demo -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--config <PATH>`: Load the session configuration from a TOML file
//! - `--present-mode <MODE>`: immediate, double, vsync or triple (default: vsync)
//! - `--srgb`: Prefer an sRGB surface format
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)
//!
//! Build with `--features profiling-tracy` to stream frame spans to Tracy.

mod app;

use anyhow::Context;
use ember_gpu::{ChainParams, ContextConfig, PresentModePreference};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
#[cfg(feature = "profiling-tracy")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use winit::event_loop::{ControlFlow, EventLoop};

use crate::app::DemoRunner;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

/// Options parsed from the command line.
#[derive(Debug, Clone, Default)]
struct DemoOptions {
    config_path: Option<String>,
    params: ChainParams,
}

impl DemoOptions {
    fn from_args() -> anyhow::Result<Self> {
        let mut options = Self::default();
        let mut args = std::env::args().skip(1);

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    options.config_path = Some(args.next().context("--config needs a path")?);
                }
                "--present-mode" => {
                    let mode = args.next().context("--present-mode needs a value")?;
                    options.params = options.params.with_present_mode(parse_present_mode(&mode)?);
                }
                "--srgb" => options.params = options.params.with_srgb(true),
                other => anyhow::bail!("unknown argument: {other}"),
            }
        }

        Ok(options)
    }

    fn load_config(&self) -> anyhow::Result<ContextConfig> {
        match &self.config_path {
            Some(path) => {
                let source = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {path}"))?;
                Ok(ContextConfig::from_toml_str(&source)?)
            }
            None => Ok(ContextConfig::new("Ember Demo")),
        }
    }
}

fn parse_present_mode(value: &str) -> anyhow::Result<PresentModePreference> {
    Ok(match value {
        "immediate" => PresentModePreference::Immediate,
        "double" => PresentModePreference::DoubleBuffering,
        "vsync" => PresentModePreference::Vsync,
        "triple" => PresentModePreference::TripleBuffering,
        other => anyhow::bail!("unknown present mode: {other}"),
    })
}

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    #[cfg(feature = "profiling-tracy")]
    {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,ember_gpu=trace,ember_demo=trace"));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .init();
    }

    let options = DemoOptions::from_args()?;
    let config = options.load_config()?;
    config.validate()?;

    info!("{} starting...", config.app_name);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = DemoRunner::new(config, options.params, WIDTH, HEIGHT);
    if let Err(e) = event_loop.run_app(&mut runner) {
        error!("Event loop error: {e}");
    }

    Ok(())
}

fn print_help() {
    eprintln!(
        "Ember demo

USAGE:
    cargo run -p ember-demo -- [OPTIONS]

OPTIONS:
    --config <PATH>         Load the session configuration from a TOML file
    --present-mode <MODE>   immediate, double, vsync or triple (default: vsync)
    --srgb                  Prefer an sRGB surface format
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
