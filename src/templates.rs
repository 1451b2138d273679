use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use tinytemplate::TinyTemplate;

use crate::config::{Config, TreeConfig};
use crate::plugins::{FxIndexMap, Htmlifier, LinkItem};

pub static CSS: &str = r#"
body { font-family: sans-serif; margin: 0; }
header { padding: 0.5em 1em; background: #f4f4f4; border-bottom: 1px solid #ddd; }
header a { color: #226; text-decoration: none; }
nav { float: right; width: 16em; padding: 0 1em; font-size: 90%; }
nav h3 { margin-bottom: 0.2em; }
nav ul { list-style: none; margin: 0; padding-left: 0.5em; }
table.file { border-collapse: collapse; font-family: monospace; width: 100%; }
table.file td { padding: 0 0.5em; vertical-align: top; white-space: pre-wrap; }
td.line-number { text-align: right; color: #999; user-select: none; border-right: 1px solid #eee; }
table.listing { border-collapse: collapse; margin: 1em; }
table.listing td { padding: 0.15em 1em; }
a[data-menu] { color: inherit; text-decoration: none; border-bottom: 1px dotted #aac; }
.k { color: #708; }
.s { color: #170; }
.c { color: #a50; font-style: italic; }
.m { color: #164; }
.n { color: #219; }
.o { color: #708; }
.f { color: #00c; }
.t { color: #085; }
footer { clear: both; padding: 0.5em 1em; color: #999; font-size: 80%; }
"#;

pub static TEMPLATE_FILE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{name}</title>
<style>{css}</style>
</head>
<body>
<header>
{{ for crumb in paths_and_names }}/ <a href="{crumb.0}">{crumb.1}</a>
{{ endfor }}</header>
<nav>
{{ for section in sections }}<h3>{section.title}</h3>
<ul>
{{ for item in section.items }}<li><a href="{item.href}" class="icon-{item.icon}">{item.title}</a></li>
{{ endfor }}</ul>
{{ endfor }}</nav>
<table class="file" data-icon="{icon}" data-path="{path}">
<tbody>
{{ for line in lines }}<tr id="l{line.number}"><td class="line-number">{line.number}</td><td class="code">{line.html | format_unescaped}</td></tr>
{{ endfor }}</tbody>
</table>
<footer>Tree {tree} &middot; generated {generated_date}</footer>
</body>
</html>
"#;

pub static TEMPLATE_FOLDER: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{name}</title>
<style>{css}</style>
</head>
<body>
<header>
{{ for crumb in paths_and_names }}/ <a href="{crumb.0}">{crumb.1}</a>
{{ endfor }}</header>
<table class="listing" data-path="{path}">
<tbody>
{{ for folder in folders }}<tr><td class="icon-{folder.icon}"><a href="{folder.href}">{folder.name}/</a></td><td>{folder.modified}</td><td></td></tr>
{{ endfor }}{{ for file in files }}<tr><td class="icon-{file.icon}"><a href="{file.href}">{file.name}</a></td><td>{file.modified}</td><td>{file.size}</td></tr>
{{ endfor }}</tbody>
</table>
<footer>Tree {tree} &middot; generated {generated_date}</footer>
</body>
</html>
"#;

pub static TEMPLATE_TREES_INDEX: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Indexed trees</title>
<style>{css}</style>
</head>
<body>
<header>Indexed trees</header>
<table class="listing">
<tbody>
{{ for t in trees }}<tr><td class="icon-folder"><a href="{wwwroot}/{t}/{directory_index}">{t}</a></td></tr>
{{ endfor }}</tbody>
</table>
<footer>Generated {generated_date}</footer>
</body>
</html>
"#;

// Values are JSON literals; the serving front end evaluates them.
pub static TEMPLATE_CONFIG_PY: &str = r#"# Generated settings. Do not edit; rebuild the site instead.
trees = {trees | format_unescaped}
wwwroot = {wwwroot | format_unescaped}
template_parameters = {template_parameters | format_unescaped}
generated_date = {generated_date | format_unescaped}
directory_index = {directory_index | format_unescaped}
"#;

#[derive(Debug, Serialize)]
pub struct LineCtx {
    pub number: usize,
    pub html: String,
}

#[derive(Debug, Serialize)]
pub struct SectionCtx {
    pub title: String,
    pub items: Vec<LinkItem>,
}

/// A folder row in a directory listing.
#[derive(Debug, Serialize)]
pub struct FolderEntry {
    pub icon: &'static str,
    pub name: String,
    pub modified: String,
    pub href: String,
}

/// A file row in a directory listing.
#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub icon: &'static str,
    pub name: String,
    pub modified: String,
    pub size: u64,
    pub href: String,
}

#[derive(Serialize)]
struct FileContext<'a> {
    css: &'static str,
    wwwroot: &'a str,
    tree: &'a str,
    trees: Vec<String>,
    config: &'a Value,
    generated_date: &'a str,
    paths_and_names: Vec<(String, String)>,
    icon: &'a str,
    path: &'a str,
    name: String,
    lines: Vec<LineCtx>,
    sections: Vec<SectionCtx>,
}

#[derive(Serialize)]
struct FolderContext<'a> {
    css: &'static str,
    wwwroot: &'a str,
    tree: &'a str,
    trees: Vec<String>,
    config: &'a Value,
    generated_date: &'a str,
    paths_and_names: Vec<(String, String)>,
    name: String,
    path: &'a str,
    folders: &'a [FolderEntry],
    files: &'a [FileEntry],
}

#[derive(Serialize)]
struct TreesContext<'a> {
    css: &'static str,
    wwwroot: &'a str,
    trees: Vec<String>,
    config: &'a Value,
    generated_date: &'a str,
    directory_index: &'a str,
}

#[derive(Serialize)]
struct ConfigPyContext {
    trees: String,
    wwwroot: String,
    template_parameters: String,
    generated_date: String,
    directory_index: String,
}

/// The template engine, wired with every page template. Construction is
/// cheap; each decoration worker builds its own.
pub struct PageEmitter {
    tt: TinyTemplate<'static>,
}

impl PageEmitter {
    pub fn new() -> Result<PageEmitter> {
        let mut tt = TinyTemplate::new();
        tt.add_formatter("format_unescaped", tinytemplate::format_unescaped);
        tt.add_template("file.html", TEMPLATE_FILE)?;
        tt.add_template("folder.html", TEMPLATE_FOLDER)?;
        tt.add_template("trees_index.html", TEMPLATE_TREES_INDEX)?;
        tt.add_template("config.py", TEMPLATE_CONFIG_PY)?;
        Ok(PageEmitter { tt })
    }

    pub fn render_file(
        &self,
        config: &Config,
        tree: &TreeConfig,
        icon: &str,
        path: &str,
        lines: Vec<String>,
        sections: Vec<SectionCtx>,
    ) -> Result<String> {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        let context = FileContext {
            css: CSS,
            wwwroot: &config.wwwroot,
            tree: &tree.name,
            trees: config.tree_names(),
            config: &config.template_parameters,
            generated_date: &config.generated_date,
            paths_and_names: linked_pathname(config, tree, path, true),
            icon,
            path,
            name,
            lines: lines
                .into_iter()
                .enumerate()
                .map(|(i, html)| LineCtx { number: i + 1, html })
                .collect(),
            sections,
        };
        Ok(self.tt.render("file.html", &context)?)
    }

    pub fn render_folder(
        &self,
        config: &Config,
        tree: &TreeConfig,
        folder: &str,
        folders: &[FolderEntry],
        files: &[FileEntry],
    ) -> Result<String> {
        let name = if folder.is_empty() {
            tree.name.clone()
        } else {
            folder.rsplit('/').next().unwrap_or(folder).to_string()
        };
        let context = FolderContext {
            css: CSS,
            wwwroot: &config.wwwroot,
            tree: &tree.name,
            trees: config.tree_names(),
            config: &config.template_parameters,
            generated_date: &config.generated_date,
            paths_and_names: linked_pathname(config, tree, folder, false),
            name,
            path: folder,
            folders,
            files,
        };
        Ok(self.tt.render("folder.html", &context)?)
    }

    pub fn render_trees_index(&self, config: &Config) -> Result<String> {
        let context = TreesContext {
            css: CSS,
            wwwroot: &config.wwwroot,
            trees: config.tree_names(),
            config: &config.template_parameters,
            generated_date: &config.generated_date,
            directory_index: &config.directory_index,
        };
        Ok(self.tt.render("trees_index.html", &context)?)
    }

    pub fn render_config_py(&self, config: &Config) -> Result<String> {
        let context = ConfigPyContext {
            trees: serde_json::to_string(&config.tree_names())?,
            wwwroot: serde_json::to_string(&config.wwwroot)?,
            template_parameters: serde_json::to_string(&config.template_parameters)?,
            generated_date: serde_json::to_string(&config.generated_date)?,
            directory_index: serde_json::to_string(&config.directory_index)?,
        };
        Ok(self.tt.render("config.py", &context)?)
    }
}

/// Breadcrumb components for a path: server-relative URL and display name
/// for the tree root and every path segment down to the page itself.
pub fn linked_pathname(
    config: &Config,
    tree: &TreeConfig,
    path: &str,
    is_file: bool,
) -> Vec<(String, String)> {
    let root = format!("{}/{}", config.wwwroot, tree.name);
    let mut components = vec![(
        format!("{root}/{}", config.directory_index),
        tree.name.clone(),
    )];
    if path.is_empty() {
        return components;
    }
    let segments: Vec<&str> = path.split('/').collect();
    for (i, segment) in segments.iter().enumerate() {
        let prefix = segments[..=i].join("/");
        let href = if is_file && i == segments.len() - 1 {
            format!("{root}/{prefix}.html")
        } else {
            format!("{root}/{prefix}/{}", config.directory_index)
        };
        components.push((href, segment.to_string()));
    }
    components
}

/// Merge the navigation links of every htmlifier into ordered sections:
/// sort by `(importance, title)`, then group items under their title.
pub fn build_sections(htmlifiers: &[Box<dyn Htmlifier>]) -> Vec<SectionCtx> {
    let mut links: Vec<_> = htmlifiers.iter().flat_map(|h| h.links()).collect();
    links.sort_by(|a, b| (a.importance, &a.title).cmp(&(b.importance, &b.title)));
    let mut grouped: FxIndexMap<String, Vec<LinkItem>> = FxIndexMap::default();
    for section in links {
        grouped.entry(section.title).or_default().extend(section.items);
    }
    grouped
        .into_iter()
        .map(|(title, items)| SectionCtx { title, items })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::LinkSection;
    use serde_json::json;

    fn test_config() -> (Config, TreeConfig) {
        let tree = TreeConfig {
            name: "demo".to_string(),
            source_folder: "/src".into(),
            object_folder: "/src".into(),
            build_command: None,
            ignore_patterns: Vec::new(),
            ignore_paths: Vec::new(),
            enabled_plugins: vec!["syntax".to_string()],
            target_folder: "/www/demo".into(),
            temp_folder: "/tmp/demo".into(),
            log_folder: "/logs/demo".into(),
        };
        let config = Config {
            nb_jobs: 1,
            wwwroot: "".to_string(),
            generated_date: "today".to_string(),
            directory_index: "index.html".to_string(),
            template_parameters: json!({"brand": "x"}),
            target_folder: "/www".into(),
            temp_folder: "/tmp".into(),
            log_folder: "/logs".into(),
            trees: vec![tree.clone()],
        };
        (config, tree)
    }

    #[test]
    fn file_pages_number_lines_and_keep_markup() {
        let (config, tree) = test_config();
        let emitter = PageEmitter::new().unwrap();
        let html = emitter
            .render_file(
                &config,
                &tree,
                "code",
                "src/main.rs",
                vec![
                    "<span class=\"k\">fn</span> main".to_string(),
                    "".to_string(),
                ],
                Vec::new(),
            )
            .unwrap();
        assert!(html.contains("<td class=\"code\"><span class=\"k\">fn</span> main</td>"));
        assert!(html.contains("id=\"l1\""));
        assert!(html.contains("id=\"l2\""));
        assert!(html.contains("<title>main.rs</title>"));
        assert!(html.contains("href=\"/demo/src/index.html\">src</a>"));
        assert!(html.contains("href=\"/demo/src/main.rs.html\">main.rs</a>"));
    }

    #[test]
    fn breadcrumbs_start_at_the_tree_root() {
        let (config, tree) = test_config();
        let crumbs = linked_pathname(&config, &tree, "", false);
        assert_eq!(
            crumbs,
            [("/demo/index.html".to_string(), "demo".to_string())]
        );
        let crumbs = linked_pathname(&config, &tree, "a/b.c", true);
        assert_eq!(
            crumbs,
            [
                ("/demo/index.html".to_string(), "demo".to_string()),
                ("/demo/a/index.html".to_string(), "a".to_string()),
                ("/demo/a/b.c.html".to_string(), "b.c".to_string()),
            ]
        );
    }

    #[test]
    fn config_py_carries_json_literals() {
        let (config, _tree) = test_config();
        let emitter = PageEmitter::new().unwrap();
        let out = emitter.render_config_py(&config).unwrap();
        assert!(out.contains("trees = [\"demo\"]"));
        assert!(out.contains("wwwroot = \"\""));
        assert!(out.contains("template_parameters = {\"brand\":\"x\"}"));
        assert!(out.contains("directory_index = \"index.html\""));
    }

    #[test]
    fn sections_sort_by_importance_then_title() {
        struct Linker(Vec<LinkSection>);
        impl Htmlifier for Linker {
            fn regions(&self) -> Vec<(usize, usize, String)> {
                Vec::new()
            }
            fn refs(&self) -> Vec<(usize, usize, serde_json::Value)> {
                Vec::new()
            }
            fn links(&self) -> Vec<LinkSection> {
                self.0.clone()
            }
        }
        let item = |title: &str| LinkItem {
            icon: "i".to_string(),
            title: title.to_string(),
            href: "#".to_string(),
        };
        let htmlifiers: Vec<Box<dyn Htmlifier>> = vec![
            Box::new(Linker(vec![LinkSection {
                importance: 50,
                title: "Zeta".to_string(),
                items: vec![item("z1")],
            }])),
            Box::new(Linker(vec![
                LinkSection {
                    importance: 10,
                    title: "Alpha".to_string(),
                    items: vec![item("a1")],
                },
                LinkSection {
                    importance: 50,
                    title: "Zeta".to_string(),
                    items: vec![item("z2")],
                },
            ])),
        ];
        let sections = build_sections(&htmlifiers);
        let titles: Vec<&str> = sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, ["Alpha", "Zeta"]);
        let zeta_items: Vec<&str> = sections[1].items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(zeta_items, ["z1", "z2"]);
    }
}
