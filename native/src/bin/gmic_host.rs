// Command line host: feeds PNG layers to the filter UI and saves what it returns.

use clap::Parser;
use gmic_bridge::{
    logging, BridgeConfig, BridgeError, GmicLauncher, Immediate, Layer, OutputImages, PipeServer,
    Surface,
};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(
    name = "gmic-host",
    about = "Run the G'MIC filter UI on a stack of PNG layers",
    version
)]
struct Cli {
    /// Layer images, topmost first.
    #[arg(long = "layer", value_name = "PNG", required = true)]
    layers: Vec<PathBuf>,

    /// Mark the layer at this index as hidden. Repeatable.
    #[arg(long = "hidden", value_name = "IDX")]
    hidden: Vec<usize>,

    /// Index of the active layer.
    #[arg(long, value_name = "IDX", default_value_t = 0)]
    active: usize,

    /// Repeat the last filter without showing the UI.
    #[arg(long)]
    reapply: bool,

    /// Where results are written. Defaults to the configured directory, then `.`.
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Filter UI executable, overriding configuration.
    #[arg(long, value_name = "EXE")]
    gmic: Option<PathBuf>,
}

#[derive(Error, Debug)]
enum HostError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("Image error for {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("Invalid arguments: {0}")]
    Usage(String),
}

impl HostError {
    fn user_message(&self) -> String {
        match self {
            HostError::Bridge(e) => e.user_message(),
            other => other.to_string(),
        }
    }
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    gmic_bridge::initialize_diagnostics();

    let cli = Cli::parse();
    let result = run(cli);
    logging::shutdown_sentry();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let HostError::Bridge(bridge) = &e {
                logging::report_session_error(bridge);
            }
            error!("[HOST] {}", e);
            eprintln!("{}", e.user_message());
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), HostError> {
    if cli.active >= cli.layers.len() {
        return Err(HostError::Usage(format!(
            "--active {} is out of range for {} layer(s)",
            cli.active,
            cli.layers.len()
        )));
    }

    let mut config = BridgeConfig::load_or_default()?;
    if let Some(exe) = cli.gmic {
        config.gmic_executable = Some(exe);
    }
    let output_dir = cli
        .output_dir
        .or_else(|| config.output_directory.clone())
        .unwrap_or_else(|| PathBuf::from("."));

    let layers = cli
        .layers
        .iter()
        .enumerate()
        .map(|(index, path)| load_layer(path, !cli.hidden.contains(&index)))
        .collect::<Result<Vec<_>, _>>()?;

    let launcher = GmicLauncher::locate(&config)?;
    let server = PipeServer::with_completion(Arc::new(Immediate), config.completion_dispatch);
    server.on_output_image_changed(|state| {
        info!(
            "[HOST] Output #{} arrived ({} image(s))",
            state.generation(),
            state.image_count()
        );
    });
    server.add_layers(layers)?;
    server.set_active_index(cli.active)?;

    let outcome = launcher.run(&server, cli.reapply);
    server.dispose();
    let outcome = outcome?;

    match outcome.output {
        Some(output) => {
            let name = outcome.command_name.as_deref().unwrap_or("gmic");
            let saved = save_output(&output, &output_dir, name)?;
            println!("Saved {} image(s) ({:?})", saved.len(), output.mode);
            for path in saved {
                println!("  {}", path.display());
            }
        }
        None => println!("No filter applied."),
    }
    Ok(())
}

fn load_layer(path: &Path, visible: bool) -> Result<Layer, HostError> {
    let image = image::open(path)
        .map_err(|source| HostError::Image {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgba8();
    let (width, height) = image.dimensions();
    let surface = Surface::from_rgba(width, height, image.into_raw())
        .ok_or_else(|| HostError::Usage(format!("{} has an unexpected pixel layout", path.display())))?;
    Ok(Layer::owned(surface, visible))
}

fn save_output(
    output: &OutputImages,
    dir: &Path,
    command_name: &str,
) -> Result<Vec<PathBuf>, HostError> {
    std::fs::create_dir_all(dir).map_err(BridgeError::from)?;
    let stem = sanitize_file_stem(command_name);

    let mut saved = Vec::with_capacity(output.images.len());
    for (index, surface) in output.images.iter().enumerate() {
        let path = dir.join(format!("{}_{}.png", stem, index + 1));
        image::save_buffer(
            &path,
            &surface.to_rgba(),
            surface.width(),
            surface.height(),
            image::ExtendedColorType::Rgba8,
        )
        .map_err(|source| HostError::Image {
            path: path.clone(),
            source,
        })?;
        saved.push(path);
    }
    Ok(saved)
}

/// Filter names look like `Artistic / Cartoon`; keep them readable as file names.
fn sanitize_file_stem(name: &str) -> String {
    let mut stem = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_alphanumeric() || c == '-' {
            stem.push(c);
        } else if !stem.ends_with('_') {
            stem.push('_');
        }
    }
    let stem = stem.trim_matches('_');
    if stem.is_empty() {
        "gmic".to_string()
    } else {
        stem.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gmic_bridge::OutputMode;

    #[test]
    fn file_stems_are_sanitized() {
        assert_eq!(sanitize_file_stem("Artistic / Cartoon"), "Artistic_Cartoon");
        assert_eq!(sanitize_file_stem("  "), "gmic");
        assert_eq!(sanitize_file_stem("a:b*c"), "a_b_c");
    }

    #[test]
    fn cli_accepts_repeated_layers() {
        let cli = Cli::try_parse_from([
            "gmic-host", "--layer", "a.png", "--layer", "b.png", "--hidden", "1", "--active", "1",
            "--reapply",
        ])
        .unwrap();
        assert_eq!(cli.layers.len(), 2);
        assert_eq!(cli.hidden, vec![1]);
        assert_eq!(cli.active, 1);
        assert!(cli.reapply);
    }

    #[test]
    fn png_round_trip_preserves_channels() {
        let dir = tempfile::tempdir().unwrap();
        let surface = Surface::from_bgra(1, 1, vec![10, 20, 30, 255]).unwrap();
        let output = OutputImages {
            mode: OutputMode::InPlace,
            images: vec![surface.clone()],
        };

        let saved = save_output(&output, dir.path(), "Blur / Gaussian").unwrap();
        assert_eq!(saved, vec![dir.path().join("Blur_Gaussian_1.png")]);

        let layer = load_layer(&saved[0], true).unwrap();
        assert_eq!(layer.surface(), &surface);
    }

    #[test]
    fn active_index_must_name_a_layer() {
        let cli = Cli::try_parse_from(["gmic-host", "--layer", "a.png", "--active", "3"]).unwrap();
        assert!(matches!(run(cli), Err(HostError::Usage(_))));
    }
}
