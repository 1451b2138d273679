use core::hash::BuildHasherDefault;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;

use anyhow::{bail, Result};
use fxhash::FxHasher;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use syntect::easy::ScopeRegionIterator;
use syntect::parsing::{ParseState, ScopeStack, SyntaxSet};

use crate::config::TreeConfig;
use crate::storage::Storage;

pub type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;

/// One entry in a navigation section.
#[derive(Debug, Clone, Serialize)]
pub struct LinkItem {
    pub icon: String,
    pub title: String,
    pub href: String,
}

/// A navigation group contributed to a file page. Sections from all plugins
/// are merged, ordered by `(importance, title)`.
#[derive(Debug, Clone, Serialize)]
pub struct LinkSection {
    pub importance: i32,
    pub title: String,
    pub items: Vec<LinkItem>,
}

/// Per-file decoration capability returned by a plugin that applies to a
/// file. All offsets are byte offsets over the file's original bytes.
pub trait Htmlifier {
    /// Syntax-region intervals `(start, end, css_class)`.
    fn regions(&self) -> Vec<(usize, usize, String)>;

    /// Cross-reference intervals `(start, end, menu)`. Refs from a single
    /// plugin must not overlap each other; overlaps across plugins are
    /// tolerated and filtered downstream.
    fn refs(&self) -> Vec<(usize, usize, Value)>;

    /// Navigation groups for the page emitter.
    fn links(&self) -> Vec<LinkSection>;
}

/**
 * Plugin
 * The capability surface a language plugin exposes to the build driver.
 * Implement this trait to add your own analyses.
 */
pub trait Plugin {
    // Name of the plugin, for registry lookup and error logging.
    fn name(&self) -> &'static str;

    // Mutate the external build command's environment before it runs; may
    // write auxiliary files into the plugin temp area.
    fn pre_process(&self, _tree: &TreeConfig, _env: &mut HashMap<String, String>) -> Result<()> {
        Ok(())
    }

    // After the external build, ingest any plugin artifacts into the index
    // store (auxiliary tables etc.).
    fn post_process(&self, _tree: &TreeConfig, _store: &Storage) -> Result<()> {
        Ok(())
    }

    // Per-worker warm-up, called once per store connection before any file
    // in the worker's range is decorated.
    fn load(&self, _tree: &TreeConfig, _store: &Storage) -> Result<()> {
        Ok(())
    }

    // Return a decoration capability if this plugin applies to the file,
    // None otherwise.
    fn htmlifier(&self, path: &str, text: &str) -> Option<Box<dyn Htmlifier>>;
}

// Register your plugin here
pub fn enabled_plugins(tree: &TreeConfig, wwwroot: &str) -> Result<Vec<Box<dyn Plugin>>> {
    tree.enabled_plugins
        .iter()
        .map(|name| match name.as_str() {
            "syntax" => Ok(Box::new(SyntaxPlugin) as Box<dyn Plugin>),
            "xref" => Ok(Box::new(XrefPlugin {
                search_root: format!("{}/{}", wwwroot, tree.name),
            }) as Box<dyn Plugin>),
            other => bail!("unknown plugin '{other}' enabled for tree '{}'", tree.name),
        })
        .collect()
}

static SYNTAX_SET: Lazy<SyntaxSet> = Lazy::new(SyntaxSet::load_defaults_newlines);

/// Syntax-region plugin backed by syntect's bundled grammars.
pub struct SyntaxPlugin;

impl Plugin for SyntaxPlugin {
    fn name(&self) -> &'static str {
        "syntax"
    }

    fn htmlifier(&self, path: &str, text: &str) -> Option<Box<dyn Htmlifier>> {
        let ext = Path::new(path)
            .extension()
            .and_then(OsStr::to_str)
            .unwrap_or("");
        let syntax = SYNTAX_SET.find_syntax_by_extension(ext).or_else(|| {
            SYNTAX_SET.find_syntax_by_first_line(text.lines().next().unwrap_or(""))
        })?;
        match scope_regions(syntax, text) {
            Ok(regions) => Some(Box::new(SyntaxHtmlifier { regions })),
            Err(err) => {
                tracing::warn!(path, %err, "syntax highlighting failed; leaving file plain");
                None
            }
        }
    }
}

struct SyntaxHtmlifier {
    regions: Vec<(usize, usize, String)>,
}

impl Htmlifier for SyntaxHtmlifier {
    fn regions(&self) -> Vec<(usize, usize, String)> {
        self.regions.clone()
    }
    fn refs(&self) -> Vec<(usize, usize, Value)> {
        Vec::new()
    }
    fn links(&self) -> Vec<LinkSection> {
        Vec::new()
    }
}

/// Map a scope stack to one of the short CSS classes the stylesheet knows,
/// innermost scope winning. Unmapped text gets no region at all.
fn class_for(stack: &ScopeStack) -> Option<&'static str> {
    for scope in stack.as_slice().iter().rev() {
        let name = scope.build_string();
        let class = if name.starts_with("comment") {
            "c"
        } else if name.starts_with("string") {
            "s"
        } else if name.starts_with("constant.numeric") {
            "m"
        } else if name.starts_with("constant") {
            "n"
        } else if name.starts_with("keyword.operator") {
            "o"
        } else if name.starts_with("keyword") || name.starts_with("storage") {
            "k"
        } else if name.starts_with("entity.name.function") || name.starts_with("support.function")
        {
            "f"
        } else if name.starts_with("entity.name")
            || name.starts_with("support.type")
            || name.starts_with("support.class")
        {
            "t"
        } else {
            continue;
        };
        return Some(class);
    }
    None
}

fn scope_regions(
    syntax: &syntect::parsing::SyntaxReference,
    text: &str,
) -> Result<Vec<(usize, usize, String)>> {
    let mut state = ParseState::new(syntax);
    let mut stack = ScopeStack::new();
    let mut regions: Vec<(usize, usize, String)> = Vec::new();
    let mut offset = 0usize;

    for line in text.split_inclusive('\n') {
        let ops = state.parse_line(line, &SYNTAX_SET)?;
        let mut pos = 0usize;
        for (piece, op) in ScopeRegionIterator::new(&ops, line) {
            stack.apply(op)?;
            if piece.is_empty() {
                continue;
            }
            if let Some(class) = class_for(&stack) {
                let start = offset + pos;
                let end = start + piece.len();
                match regions.last_mut() {
                    // Coalesce adjacent runs of the same class.
                    Some((_, last_end, last_class)) if *last_end == start && last_class.as_str() == class => {
                        *last_end = end;
                    }
                    _ => regions.push((start, end, class.to_string())),
                }
            }
            pos += piece.len();
        }
        offset += line.len();
    }
    Ok(regions)
}

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]{2,}").unwrap());

const XREF_KEYWORDS: &[&str] = &[
    "break", "case", "catch", "class", "const", "continue", "else", "enum", "false", "for",
    "impl", "import", "let", "match", "mod", "new", "null", "pub", "return", "self", "static",
    "struct", "super", "switch", "this", "trait", "true", "type", "use", "void", "while",
];

/// Cross-reference plugin: every identifier occurrence becomes an anchor
/// whose menu links to the site search, and the most prominent identifiers
/// feed a "Symbols" navigation section.
pub struct XrefPlugin {
    search_root: String,
}

const SYMBOL_SECTION_CAP: usize = 25;

impl Plugin for XrefPlugin {
    fn name(&self) -> &'static str {
        "xref"
    }

    fn htmlifier(&self, _path: &str, text: &str) -> Option<Box<dyn Htmlifier>> {
        let mut line_starts = vec![0usize];
        line_starts.extend(text.match_indices('\n').map(|(i, _)| i + 1));

        let mut refs = Vec::new();
        let mut first_seen: FxIndexMap<String, usize> = FxIndexMap::default();
        for m in IDENTIFIER.find_iter(text) {
            let ident = m.as_str();
            if XREF_KEYWORDS.contains(&ident) {
                continue;
            }
            let line = line_starts.partition_point(|&s| s <= m.start());
            first_seen.entry(ident.to_string()).or_insert(line);
            let menu = json!([{
                "html": format!("Search for <code>{ident}</code>"),
                "href": format!("{}/search?q={}", self.search_root, ident),
                "icon": "search",
            }]);
            refs.push((m.start(), m.end(), menu));
        }
        if refs.is_empty() {
            return None;
        }

        let items: Vec<LinkItem> = first_seen
            .iter()
            .take(SYMBOL_SECTION_CAP)
            .map(|(ident, line)| LinkItem {
                icon: "symbol".to_string(),
                title: ident.clone(),
                href: format!("#l{line}"),
            })
            .collect();
        let sections = vec![LinkSection {
            importance: 30,
            title: "Symbols".to_string(),
            items,
        }];
        Some(Box::new(XrefHtmlifier { refs, sections }))
    }
}

struct XrefHtmlifier {
    refs: Vec<(usize, usize, Value)>,
    sections: Vec<LinkSection>,
}

impl Htmlifier for XrefHtmlifier {
    fn regions(&self) -> Vec<(usize, usize, String)> {
        Vec::new()
    }
    fn refs(&self) -> Vec<(usize, usize, Value)> {
        self.refs.clone()
    }
    fn links(&self) -> Vec<LinkSection> {
        self.sections.clone()
    }
}
