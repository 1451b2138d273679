use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use tracing::info;
use walkdir::{DirEntry, WalkDir};

use crate::config::{Config, IgnoreRules, TreeConfig};
use crate::mime;
use crate::storage::Storage;
use crate::templates::{FileEntry, FolderEntry, PageEmitter};

#[derive(Default)]
struct Listing {
    folders: Vec<FolderEntry>,
    files: Vec<FileEntry>,
}

/// Walk the tree's source folder top-down, apply the ignore rules, index
/// every surviving text file into the store, and emit a directory-listing
/// page per folder. The store transaction commits before this returns, so
/// the decoration pool only ever sees a complete index.
pub fn index_files(
    config: &Config,
    tree: &TreeConfig,
    store: &Storage,
    emitter: &PageEmitter,
) -> Result<()> {
    info!(tree = %tree.name, "indexing files");
    let start = Instant::now();
    let rules = tree.ignore_rules()?;
    let spinner = ProgressBar::new_spinner();

    // Every folder gets a listing, the root included, even when empty.
    let mut listings: BTreeMap<String, Listing> = BTreeMap::new();
    listings.insert(String::new(), Listing::default());

    let mut indexed = 0u64;
    store.begin()?;
    let source = tree.source_folder.clone();
    let walker = WalkDir::new(&source)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| keep_entry(e, &source, &rules));
    for entry in walker {
        let entry = entry.context("walking source tree")?;
        if entry.depth() == 0 {
            continue;
        }
        let rel = entry.path().strip_prefix(&source)?;
        let rel_str = slash_path(rel);
        let parent = match rel_str.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => String::new(),
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let modified = modified_stamp(&entry);

        if entry.file_type().is_dir() {
            listings.entry(rel_str.clone()).or_default();
            listings.entry(parent).or_default().folders.push(FolderEntry {
                icon: "folder",
                href: format!("{name}/{}", config.directory_index),
                name,
                modified,
            });
        } else if entry.file_type().is_file() {
            let bytes = fs::read(entry.path())
                .with_context(|| format!("reading {}", entry.path().display()))?;
            if !mime::is_text(entry.path(), &bytes) {
                continue;
            }
            let text = String::from_utf8_lossy(&bytes).into_owned();
            let icon = mime::icon(entry.path());
            let id = store.add_file(&rel_str, icon)?;
            store.add_text(id, &text)?;
            indexed += 1;
            spinner.set_message(format!("{indexed} files"));
            spinner.tick();
            listings.entry(parent).or_default().files.push(FileEntry {
                icon,
                href: format!("{name}.html"),
                name,
                modified,
                size: bytes.len() as u64,
            });
        }
    }
    store.commit()?;
    spinner.finish_and_clear();

    for (folder, mut listing) in listings {
        listing.folders.sort_by(|a, b| a.name.cmp(&b.name));
        listing.files.sort_by(|a, b| a.name.cmp(&b.name));
        let html = emitter.render_folder(config, tree, &folder, &listing.folders, &listing.files)?;
        let dst = if folder.is_empty() {
            tree.target_folder.join(&config.directory_index)
        } else {
            tree.target_folder.join(&folder).join(&config.directory_index)
        };
        if let Some(dir) = dst.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&dst, html).with_context(|| format!("writing {}", dst.display()))?;
    }

    info!(tree = %tree.name, files = indexed, elapsed = ?start.elapsed(), "indexing finished");
    Ok(())
}

/// The walk predicate: a folder matching a name-glob is not descended; a
/// file or folder matching either glob family is dropped.
fn keep_entry(entry: &DirEntry, source: &Path, rules: &IgnoreRules) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    if rules.ignores_name(&name) {
        return false;
    }
    let rel = match entry.path().strip_prefix(source) {
        Ok(rel) => slash_path(rel),
        Err(_) => return true,
    };
    !rules.ignores_path(&rel, entry.file_type().is_dir())
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn modified_stamp(entry: &DirEntry) -> String {
    entry
        .metadata()
        .ok()
        .and_then(|md| md.modified().ok())
        .map(|t| {
            chrono::DateTime::<chrono::Local>::from(t)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        })
        .unwrap_or_default()
}
