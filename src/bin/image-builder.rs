use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use image_builder::blockdevice::loopback;
use image_builder::registry::Capability;
use image_builder::{
    default_lease_dir, preflight, runs, BuildConfig, BuildOutcome, Pipeline, PluginRegistry,
    Services,
};
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "Usage:\n  image-builder build <config.toml> [block_device] [provisioner]\n  image-builder plugins\n  image-builder runs <runs_dir>"
}

fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [build, config] if build == "build" => build_one(Path::new(config), None, None),
        [build, config, block_device] if build == "build" => {
            build_one(Path::new(config), Some(block_device), None)
        }
        [build, config, block_device, provisioner] if build == "build" => {
            build_one(Path::new(config), Some(block_device), Some(provisioner))
        }
        [plugins] if plugins == "plugins" => {
            list_plugins();
            Ok(())
        }
        [runs_cmd, runs_dir] if runs_cmd == "runs" => list_runs(Path::new(runs_dir)),
        _ => bail!(usage()),
    }
}

fn build_one(
    config_path: &Path,
    block_device: Option<&String>,
    provisioner: Option<&String>,
) -> Result<()> {
    let config = BuildConfig::load(config_path)?;
    let (settings, mut context) = config.into_context();
    let block_device = block_device.unwrap_or(&settings.block_device);
    let provisioner = provisioner.unwrap_or(&settings.provisioner);

    preflight::check_required_tools(preflight::REQUIRED_TOOLS)?;
    preflight::check_required_tools(loopback::REQUIRED_TOOLS)?;

    let lease_dir = settings.lease_dir.clone().unwrap_or_else(default_lease_dir);
    let services = Services::system(lease_dir).context("initializing build services")?;
    let mut pipeline = Pipeline::new(Arc::new(PluginRegistry::builtin()), services)
        .with_span(tracing::info_span!("image-builder", config = %config_path.display()));
    if let Some(runs_dir) = &settings.runs_dir {
        pipeline = pipeline.with_runs_dir(runs_dir);
    }
    if let Some(keep) = settings.keep_runs {
        pipeline = pipeline.keep_runs(keep);
    }

    println!("[build] {} via {} + {}", config_path.display(), block_device, provisioner);
    let outcome = pipeline
        .run(&mut context, block_device, provisioner)
        .with_context(|| format!("building '{}'", config_path.display()))?;
    print_outcome(&outcome);

    if let Some(failure) = outcome.failure() {
        let step = outcome
            .failed_step()
            .map(|record| record.step.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        bail!("build {} failed at step '{}': {}", outcome.run_id, step, failure);
    }
    println!(
        "[build] {} built {} {}-{}",
        outcome.run_id, context.package.name, context.package.version, context.package.release
    );
    Ok(())
}

fn print_outcome(outcome: &BuildOutcome) {
    for record in &outcome.steps {
        let mark = if record.success { "ok" } else { "FAILED" };
        println!("[build] {:<26} {}", record.step.to_string(), mark);
        if !record.success && !record.output.trim().is_empty() {
            for line in record.output.trim().lines() {
                println!("        {}", line);
            }
        }
    }
}

fn list_plugins() {
    let registry = PluginRegistry::builtin();
    for capability in [Capability::BlockDevice, Capability::Provisioner] {
        println!("{}: {}", capability, registry.names(capability).join(", "));
    }
}

fn list_runs(runs_dir: &Path) -> Result<()> {
    let runs = runs::load_runs_metadata(runs_dir)?;
    if runs.is_empty() {
        println!("no runs under '{}'", runs_dir.display());
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:<8}  {}  {} + {}{}",
            run.run_id,
            run.status,
            run.finished_at_utc.as_deref().unwrap_or(&run.created_at_utc),
            run.block_device,
            run.provisioner,
            run.failed_step
                .map(|step| format!("  (failed at {})", step))
                .unwrap_or_default()
        );
    }
    Ok(())
}
