use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Headless inspection of a GeoLeaf profile and its GeoJSON layers.
#[derive(Debug, Parser)]
#[command(name = "geoleaf", version, about)]
pub struct CliArgs {
    /// Profile JSON declaring layers, search fields and POI settings.
    #[arg(long, short)]
    pub profile: PathBuf,

    /// Directory holding `<layer-id>.geojson` files. Defaults to the
    /// profile's directory.
    #[arg(long, short)]
    pub data: Option<PathBuf>,

    /// Zoom level applied after the layers are displayed.
    #[arg(long, short)]
    pub zoom: Option<f64>,

    /// Also display layers declared `lazy`.
    #[arg(long)]
    pub include_lazy: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the legend (one entry per declared layer).
    Legend,
    /// Apply a filter state and print its summary and the table rows.
    Filter {
        /// Filter state as inline JSON, or `@path` to read it from a file.
        #[arg(long, short)]
        state: String,
    },
    /// Toggle a layer, or one feature of it, then print the legend.
    Toggle {
        layer: String,
        #[arg(long)]
        feature: Option<String>,
    },
}
