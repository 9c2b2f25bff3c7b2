use camino::Utf8Path;
use indicatif::ProgressStyle;

use crate::chain::Chain;

/// Overall progress bar of an execution.
pub(crate) fn get_style_build() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )
    .map(|style| style.progress_chars("=>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Spinner shown for each running step.
pub(crate) fn get_style_step() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Writes the Mermaid rendering of a chain, creating parent directories.
pub(crate) fn write_graph(path: &Utf8Path, chain: &Chain) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, chain.to_string())
}

/// Installs a `tracing` subscriber for host binaries: an `EnvFilter` read
/// from `RUST_LOG` (defaulting to `info`), a formatting layer, and the
/// `tracing-indicatif` layer that renders step progress.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let indicatif_layer = IndicatifLayer::new();

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .try_init()?;

    Ok(())
}
