use std::collections::HashMap;
use std::fs::{self, File};
use std::path::Path;
use std::process::Command;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tracing::info;

pub use crate::config::{Config, TreeConfig};
pub use crate::storage::{SearchHit, Storage};
pub use crate::tags::build_lines;

pub mod config;
pub mod index;
pub mod mime;
pub mod plugins;
pub mod storage;
pub mod tags;
pub mod templates;
pub mod workers;

#[derive(Default)]
pub struct BuildOptions {
    /// Overrides the config file's `nb_jobs`.
    pub nb_jobs: Option<usize>,
    /// Build only this tree; all trees when None.
    pub tree: Option<String>,
    /// Echo the external build command instead of capturing its log.
    pub verbose: bool,
}

/// Build the whole site instance: load the configuration, lay down the
/// shared output (config.py, the root landing page), then build each
/// requested tree. Any failure aborts the build with an error.
pub fn build_instance(config_path: &Path, options: &BuildOptions) -> Result<()> {
    let config = Config::load(config_path, options.nb_jobs)?;
    let trees = config.select_trees(options.tree.as_deref())?;

    info!("generating target folder");
    ensure_folder(&config.target_folder, false)?;
    ensure_folder(&config.temp_folder, true)?;
    ensure_folder(&config.log_folder, true)?;

    let emitter = templates::PageEmitter::new()?;
    fs::write(
        config.target_folder.join("config.py"),
        emitter.render_config_py(&config)?,
    )?;
    ensure_folder(&config.target_folder.join("trees"), false)?;
    fs::write(
        config.target_folder.join("trees").join("index.html"),
        emitter.render_trees_index(&config)?,
    )?;

    for tree in trees {
        build_tree_site(&config, tree, options.verbose)?;
    }
    Ok(())
}

/// Build one tree: index, run the external build command, finalize the
/// store, then decorate every file through the worker pool.
fn build_tree_site(config: &Config, tree: &TreeConfig, verbose: bool) -> Result<()> {
    let start = Instant::now();
    info!(tree = %tree.name, "building tree");

    ensure_folder(&tree.target_folder, true)?;
    ensure_folder(&tree.object_folder, tree.source_folder != tree.object_folder)?;
    ensure_folder(&tree.temp_folder, true)?;
    ensure_folder(&tree.log_folder, true)?;
    let plugin_temp = tree.temp_folder.join("plugins");
    ensure_folder(&plugin_temp, true)?;
    for name in &tree.enabled_plugins {
        ensure_folder(&plugin_temp.join(name), true)?;
    }

    // A build always starts from an empty index.
    let db_path = tree.db_path();
    if db_path.exists() {
        fs::remove_file(&db_path)
            .with_context(|| format!("removing stale index store {}", db_path.display()))?;
    }

    let emitter = templates::PageEmitter::new()?;
    let store = Storage::create(&db_path)?;
    index::index_files(config, tree, &store, &emitter)?;
    run_external_build(config, tree, &store, verbose)?;
    store.finalize()?;
    // Workers each open their own read-only view; the writable connection
    // must be gone before the pool starts.
    drop(store);

    workers::run_html_workers(config, tree)?;

    info!(tree = %tree.name, elapsed = ?start.elapsed(), "finished building tree");
    Ok(())
}

fn ensure_folder(folder: &Path, clean: bool) -> Result<()> {
    if clean && folder.is_dir() {
        fs::remove_dir_all(folder).with_context(|| format!("cleaning {}", folder.display()))?;
    }
    if !folder.is_dir() {
        fs::create_dir_all(folder).with_context(|| format!("creating {}", folder.display()))?;
    }
    Ok(())
}

/// Run the plugins' pre-process hooks, the tree's external build command
/// (if any), and the plugins' post-process hooks, in that order. The
/// command runs in the object folder with the overlaid environment; its
/// output is captured to build.log and dumped to stderr on failure.
fn run_external_build(
    config: &Config,
    tree: &TreeConfig,
    store: &Storage,
    verbose: bool,
) -> Result<()> {
    let plugins = plugins::enabled_plugins(tree, &config.wwwroot)?;

    let mut environ: HashMap<String, String> = std::env::vars().collect();
    for plugin in &plugins {
        plugin
            .pre_process(tree, &mut environ)
            .with_context(|| format!("plugin '{}' failed its pre-process hook", plugin.name()))?;
    }
    environ.insert(
        "source_folder".to_string(),
        tree.source_folder.display().to_string(),
    );
    environ.insert(
        "build_folder".to_string(),
        tree.object_folder.display().to_string(),
    );

    if let Some(command) = &tree.build_command {
        let command = command.replace("$jobs", &config.nb_jobs.to_string());
        info!(tree = %tree.name, %command, "running build command");
        let log_path = tree.log_folder.join("build.log");
        let mut child = Command::new("sh");
        child
            .arg("-c")
            .arg(&command)
            .env_clear()
            .envs(&environ)
            .current_dir(&tree.object_folder);
        let status = if verbose {
            child.status()
        } else {
            let log = File::create(&log_path)?;
            let err = log.try_clone()?;
            child.stdout(log).stderr(err).status()
        }
        .with_context(|| format!("spawning the build command for tree '{}'", tree.name))?;

        if !status.success() {
            if !verbose {
                if let Ok(log) = fs::read_to_string(&log_path) {
                    eprintln!("Log follows:");
                    for line in log.lines() {
                        eprintln!("    | {line}");
                    }
                }
            }
            bail!("build command for tree '{}' exited non-zero", tree.name);
        }
    }

    for plugin in &plugins {
        plugin
            .post_process(tree, store)
            .with_context(|| format!("plugin '{}' failed its post-process hook", plugin.name()))?;
    }
    Ok(())
}
