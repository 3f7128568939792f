mod args;
mod loader;

use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use anyhow::Context;
use clap::Parser;
use foundation::{FeatureId, LayerId, SystemClock};
use layers::{
    FilterState, HeadlessClusterEngine, HeadlessSurface, LayerLifecycle, LifecycleSettings,
    ShowTicket, ToggleCommand, legend_entries, table_rows,
};
use profile::Profile;
use scene::FeatureQuery;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::args::{CliArgs, Commands};
use crate::loader::DirLoader;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();
    let profile = Profile::load(&args.profile)
        .with_context(|| format!("loading profile {}", args.profile.display()))?;
    let cell = open_session(&args, &profile).await?;

    let output = match &args.command {
        Commands::Legend => json!({ "layers": legend_entries(&cell.borrow()) }),
        Commands::Filter { state } => {
            let state = read_filter_state(state)?;
            let mut lifecycle = cell.borrow_mut();
            let summary = lifecycle.apply_filter(&state, &FeatureQuery::all())?;
            lifecycle.flush();
            let columns = profile.table_settings()?.columns;
            json!({
                "summary": summary,
                "columns": columns,
                "rows": table_rows(&lifecycle, &FeatureQuery::all(), &columns),
            })
        }
        Commands::Toggle { layer, feature } => {
            let command = ToggleCommand {
                layer_id: LayerId::new(layer.as_str()),
                feature_id: feature.as_deref().map(FeatureId::new),
            };
            let ticket = cell.borrow_mut().apply_toggle(&command)?;
            info!(?ticket, "toggle applied");
            if let ShowTicket::Pending(pending) = ticket {
                let request = pending.request();
                let outcome = pending.await;
                cell.borrow_mut()
                    .settle_load(&command.layer_id, request, outcome)?;
            }
            json!({ "layers": legend_entries(&cell.borrow()) })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Declares the profile's layers, displays them through the directory loader
/// and applies the requested zoom. Layers that fail to load stay in the
/// legend as disabled entries.
async fn open_session(args: &CliArgs, profile: &Profile) -> anyhow::Result<RefCell<LayerLifecycle>> {
    let data_dir = match &args.data {
        Some(dir) => dir.clone(),
        None => args
            .profile
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default(),
    };
    let settings = LifecycleSettings::from_profile(profile)?;
    let mut lifecycle = LayerLifecycle::new(
        Box::new(HeadlessSurface::new()),
        Box::new(HeadlessClusterEngine::new()),
        Rc::new(SystemClock::new()),
        settings,
    )
    .with_loader(Rc::new(DirLoader::new(data_dir)));
    let declared = lifecycle.declare_from_profile(profile)?;
    info!(declared, "layers declared");

    let eager: Vec<LayerId> = profile
        .layer_declarations()?
        .into_iter()
        .filter(|decl| args.include_lazy || !decl.lazy)
        .map(|decl| decl.id)
        .collect();

    let cell = RefCell::new(lifecycle);
    for id in &eager {
        if let Err(err) = LayerLifecycle::show_and_wait(&cell, id).await {
            warn!(layer = %id, "layer not displayed: {err}");
        }
    }
    if let Some(zoom) = args.zoom {
        cell.borrow_mut().on_zoom_end(zoom);
    }
    cell.borrow_mut().flush();
    Ok(cell)
}

fn read_filter_state(arg: &str) -> anyhow::Result<FilterState> {
    let text = match arg.strip_prefix('@') {
        Some(path) => fs::read_to_string(path).with_context(|| format!("reading {path}"))?,
        None => arg.to_string(),
    };
    let value = serde_json::from_str(&text).context("filter state is not JSON")?;
    Ok(FilterState::from_value(value)?)
}
