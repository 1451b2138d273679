use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct RawConfig {
    nb_jobs: Option<usize>,
    #[serde(default)]
    wwwroot: String,
    generated_date: Option<String>,
    #[serde(default = "default_directory_index")]
    directory_index: String,
    #[serde(default = "default_template_parameters")]
    template_parameters: Value,
    #[serde(default = "default_target_folder")]
    target_folder: PathBuf,
    #[serde(default = "default_temp_folder")]
    temp_folder: PathBuf,
    #[serde(default = "default_log_folder")]
    log_folder: PathBuf,
    #[serde(default)]
    trees: BTreeMap<String, RawTree>,
}

#[derive(Debug, Deserialize)]
struct RawTree {
    source_folder: PathBuf,
    object_folder: Option<PathBuf>,
    build_command: Option<String>,
    #[serde(default)]
    ignore_patterns: Vec<String>,
    #[serde(default)]
    ignore_paths: Vec<String>,
    #[serde(default = "default_enabled_plugins")]
    enabled_plugins: Vec<String>,
}

fn default_directory_index() -> String {
    "index.html".to_string()
}

fn default_template_parameters() -> Value {
    Value::Object(Default::default())
}

fn default_target_folder() -> PathBuf {
    PathBuf::from("www")
}

fn default_temp_folder() -> PathBuf {
    PathBuf::from("tmp")
}

fn default_log_folder() -> PathBuf {
    PathBuf::from("logs")
}

fn default_enabled_plugins() -> Vec<String> {
    vec!["syntax".to_string()]
}

fn default_nb_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Site-wide configuration, loaded from a TOML file. Relative folders are
/// resolved against the config file's directory.
#[derive(Debug, Clone)]
pub struct Config {
    pub nb_jobs: usize,
    pub wwwroot: String,
    pub generated_date: String,
    pub directory_index: String,
    pub template_parameters: Value,
    pub target_folder: PathBuf,
    pub temp_folder: PathBuf,
    pub log_folder: PathBuf,
    pub trees: Vec<TreeConfig>,
}

/// One configured source repository to be indexed into the site.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    pub name: String,
    pub source_folder: PathBuf,
    pub object_folder: PathBuf,
    pub build_command: Option<String>,
    pub ignore_patterns: Vec<String>,
    pub ignore_paths: Vec<String>,
    pub enabled_plugins: Vec<String>,
    pub target_folder: PathBuf,
    pub temp_folder: PathBuf,
    pub log_folder: PathBuf,
}

impl Config {
    pub fn load(path: &Path, nb_jobs_override: Option<usize>) -> Result<Config> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading configuration from {}", path.display()))?;
        let raw: RawConfig = toml::from_str(&text)
            .with_context(|| format!("malformed configuration in {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let target_folder = resolve(base, &raw.target_folder);
        let temp_folder = resolve(base, &raw.temp_folder);
        let log_folder = resolve(base, &raw.log_folder);

        let trees = raw
            .trees
            .into_iter()
            .map(|(name, tree)| {
                let source_folder = resolve(base, &tree.source_folder);
                let object_folder = tree
                    .object_folder
                    .map(|p| resolve(base, &p))
                    .unwrap_or_else(|| source_folder.clone());
                TreeConfig {
                    target_folder: target_folder.join(&name),
                    temp_folder: temp_folder.join(&name),
                    log_folder: log_folder.join(&name),
                    name,
                    source_folder,
                    object_folder,
                    build_command: tree.build_command,
                    ignore_patterns: tree.ignore_patterns,
                    ignore_paths: tree.ignore_paths,
                    enabled_plugins: tree.enabled_plugins,
                }
            })
            .collect();

        Ok(Config {
            nb_jobs: nb_jobs_override.or(raw.nb_jobs).unwrap_or_else(default_nb_jobs),
            wwwroot: raw.wwwroot,
            generated_date: raw
                .generated_date
                .unwrap_or_else(|| chrono::Local::now().to_rfc2822()),
            directory_index: raw.directory_index,
            template_parameters: raw.template_parameters,
            target_folder,
            temp_folder,
            log_folder,
            trees,
        })
    }

    /// The trees to build: all of them, or the one named on the command
    /// line. Naming a tree the config doesn't define is an error.
    pub fn select_trees(&self, name: Option<&str>) -> Result<Vec<&TreeConfig>> {
        match name {
            None => Ok(self.trees.iter().collect()),
            Some(name) => {
                let selected: Vec<&TreeConfig> =
                    self.trees.iter().filter(|t| t.name == name).collect();
                if selected.is_empty() {
                    bail!("tree '{name}' is not defined in the config file");
                }
                Ok(selected)
            }
        }
    }

    pub fn tree_names(&self) -> Vec<String> {
        self.trees.iter().map(|t| t.name.clone()).collect()
    }
}

impl TreeConfig {
    /// Where this tree's index store lives, next to its HTML output.
    pub fn db_path(&self) -> PathBuf {
        self.target_folder.with_extension("sqlite")
    }

    pub fn ignore_rules(&self) -> Result<IgnoreRules> {
        IgnoreRules::new(&self.ignore_patterns, &self.ignore_paths)
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Compiled ignore rules: name-globs match the bare file or folder name,
/// path-globs match `"/" + relpath` (with a trailing slash for folders).
#[derive(Debug)]
pub struct IgnoreRules {
    names: GlobSet,
    paths: GlobSet,
}

impl IgnoreRules {
    pub fn new(name_globs: &[String], path_globs: &[String]) -> Result<IgnoreRules> {
        Ok(IgnoreRules {
            names: build_glob_set(name_globs)?,
            paths: build_glob_set(path_globs)?,
        })
    }

    pub fn ignores_name(&self, name: &str) -> bool {
        self.names.is_match(name)
    }

    /// `rel` is the forward-slash repo-relative path, without leading slash.
    pub fn ignores_path(&self, rel: &str, is_dir: bool) -> bool {
        let candidate = if is_dir {
            format!("/{rel}/")
        } else {
            format!("/{rel}")
        };
        self.paths.is_match(&candidate)
    }
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern).with_context(|| format!("bad ignore pattern '{pattern}'"))?,
        );
    }
    builder.build().context("compiling ignore patterns")
}
