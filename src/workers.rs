use std::fs::{self, File};
use std::io::Write;
use std::time::Instant;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::info;

use crate::config::{Config, TreeConfig};
use crate::plugins::{self, Plugin};
use crate::storage::Storage;
use crate::tags;
use crate::templates::{self, PageEmitter};

// How many file ids one worker task takes at a time.
const RANGE_SIZE: i64 = 500;

/// Divide `a..=b` into contiguous slices of at most `slice` ids.
fn sliced_range_bounds(a: i64, b: i64, slice: i64) -> Vec<(i64, i64)> {
    let mut bounds = Vec::new();
    let mut lo = a;
    while lo <= b {
        let hi = (lo + slice - 1).min(b);
        bounds.push((lo, hi));
        lo = hi + 1;
    }
    bounds
}

/// Farm the building of HTML out to a pool of worker threads, one id range
/// per task. Tasks are independent and unordered; the first failure aborts
/// the whole build and abandons whatever hasn't started.
pub fn run_html_workers(config: &Config, tree: &TreeConfig) -> Result<()> {
    let max_id = {
        let store = Storage::open_read_only(&tree.db_path())?;
        store.max_file_id()?
    };
    if max_id == 0 {
        info!(tree = %tree.name, "no files to decorate");
        return Ok(());
    }

    let ranges = sliced_range_bounds(1, max_id, RANGE_SIZE);
    info!(tree = %tree.name, workers = config.nb_jobs, tasks = ranges.len(), "building HTML");
    let pb = ProgressBar::new(ranges.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} tasks ({eta})")?
            .progress_chars("#>-"),
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.nb_jobs)
        .build()
        .context("building the worker pool")?;
    let result = pool.install(|| {
        ranges.par_iter().try_for_each(|&(start, end)| {
            build_html_for_file_ids(config, tree, start, end)?;
            pb.inc(1);
            Ok::<(), anyhow::Error>(())
        })
    });
    pb.finish_and_clear();
    result
}

/// Write HTML pages for the files with ids in `start..=end`. Runs on a
/// worker thread with its own read-only store view; progress goes to a
/// per-range log file.
fn build_html_for_file_ids(config: &Config, tree: &TreeConfig, start: i64, end: i64) -> Result<()> {
    let task_start = Instant::now();
    let store = Storage::open_read_only(&tree.db_path())?;
    let emitter = PageEmitter::new()?;
    let plugins = plugins::enabled_plugins(tree, &config.wwwroot)?;
    for plugin in &plugins {
        plugin
            .load(tree, &store)
            .with_context(|| format!("loading plugin '{}'", plugin.name()))?;
    }

    let mut log = File::create(tree.log_folder.join(format!("build-html-{start}-{end}.log")))?;
    let mut count = 0u32;
    for row in store.files_in_range(start, end)? {
        writeln!(log, "Starting {}.", row.path)?;
        let html = htmlify(config, tree, &emitter, &plugins, &row.icon, &row.path, &row.text)
            .with_context(|| format!("htmlifying {} (file id {})", row.path, row.id))?;
        let dst = tree.target_folder.join(format!("{}.html", row.path));
        if let Some(dir) = dst.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&dst, html).with_context(|| format!("writing {}", dst.display()))?;
        count += 1;
    }
    writeln!(log, "Finished {} files in {:?}.", count, task_start.elapsed())?;
    Ok(())
}

/// Build the HTML page for one file: gather htmlifiers, run the decoration
/// pipeline, and render through the page template.
pub fn htmlify(
    config: &Config,
    tree: &TreeConfig,
    emitter: &PageEmitter,
    plugins: &[Box<dyn Plugin>],
    icon: &str,
    path: &str,
    text: &str,
) -> Result<String> {
    let htmlifiers: Vec<_> = plugins
        .iter()
        .filter_map(|p| p.htmlifier(path, text))
        .collect();
    let lines = tags::build_lines(text, &htmlifiers)?;
    let sections = templates::build_sections(&htmlifiers);
    emitter.render_file(config, tree, icon, path, lines, sections)
}
