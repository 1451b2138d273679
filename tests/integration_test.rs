use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use codesite::{build_instance, BuildOptions, Storage};

const MAIN_RS: &str = "\
fn get_foo() -> i32 {
    0
}

fn get_bar() -> i32 {
    0
}

fn getX() -> i32 {
    get_foo() + get_bar()
}
";

/// Lay down a scratch source tree plus a config file and return the config
/// path. The tree exercises ignore rules, binary detection, and nesting.
fn scratch_site(root: &Path, build_command: &str) -> std::path::PathBuf {
    let source = root.join("source");
    fs::create_dir_all(source.join("src")).unwrap();
    fs::create_dir_all(source.join("obj")).unwrap();
    fs::create_dir_all(source.join("node_modules")).unwrap();
    fs::write(source.join("README.md"), "# Demo\n\nWords here.\n").unwrap();
    fs::write(source.join("src/main.rs"), MAIN_RS).unwrap();
    fs::write(source.join("src/lib.rs"), "pub fn helper() {}\n").unwrap();
    fs::write(source.join("junk.tmp"), "scratch\n").unwrap();
    fs::write(source.join("obj/cached.txt"), "should be ignored\n").unwrap();
    fs::write(source.join("node_modules/dep.js"), "var x = 1;\n").unwrap();
    fs::write(source.join("image.bin"), b"\x89PNG\x00\x00\x01binary").unwrap();

    let config = format!(
        r#"
nb_jobs = 2
generated_date = "test build"
target_folder = "www"
temp_folder = "tmp"
log_folder = "logs"

[trees.demo]
source_folder = "source"
build_command = "{build_command}"
ignore_patterns = ["*.tmp", "node_modules"]
ignore_paths = ["/obj/"]
enabled_plugins = ["syntax", "xref"]
"#
    );
    let config_path = root.join("site.toml");
    fs::write(&config_path, config).unwrap();
    config_path
}

#[test]
fn test_build_simple_site() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = scratch_site(dir.path(), "true");
    build_instance(&config_path, &BuildOptions::default()).unwrap();

    let www = dir.path().join("www");
    let expected = [
        "config.py",
        "trees/index.html",
        "demo/index.html",
        "demo/README.md.html",
        "demo/src/index.html",
        "demo/src/main.rs.html",
        "demo/src/lib.rs.html",
        "demo.sqlite",
    ];
    for rel in expected {
        assert!(www.join(rel).is_file(), "{rel} missing from output");
    }

    let config_py = fs::read_to_string(www.join("config.py")).unwrap();
    assert!(config_py.contains("trees = [\"demo\"]"));
    assert!(config_py.contains("directory_index = \"index.html\""));

    let main_page = fs::read_to_string(www.join("demo/src/main.rs.html")).unwrap();
    assert!(main_page.contains("<span class=\""), "no syntax regions");
    assert!(main_page.contains("data-menu="), "no cross-reference anchors");
    assert!(main_page.contains("get_foo"));
    assert!(main_page.contains("id=\"l1\""));
    assert!(main_page.contains("Symbols"));
}

#[test]
fn test_ignored_and_binary_files_stay_out() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = scratch_site(dir.path(), "true");
    build_instance(&config_path, &BuildOptions::default()).unwrap();

    let www = dir.path().join("www");
    assert!(!www.join("demo/junk.tmp.html").exists());
    assert!(!www.join("demo/obj").exists());
    assert!(!www.join("demo/node_modules").exists());
    assert!(!www.join("demo/image.bin.html").exists());

    let listing = fs::read_to_string(www.join("demo/index.html")).unwrap();
    assert!(listing.contains("src/"));
    assert!(listing.contains("README.md.html"));
    assert!(!listing.contains("junk.tmp"));
    assert!(!listing.contains("image.bin"));

    // Ids are dense and the walk order is deterministic.
    let store = Storage::open_read_only(&www.join("demo.sqlite")).unwrap();
    let rows = store.files_in_range(1, store.max_file_id().unwrap()).unwrap();
    let paths: Vec<&str> = rows.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(paths, ["README.md", "src/lib.rs", "src/main.rs"]);
}

#[test]
fn test_wildcard_search_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = scratch_site(dir.path(), "true");
    build_instance(&config_path, &BuildOptions::default()).unwrap();

    let store = Storage::open_read_only(&dir.path().join("www/demo.sqlite")).unwrap();

    let idents: BTreeSet<String> = store
        .search("get*")
        .unwrap()
        .into_iter()
        .map(|hit| hit.identifier)
        .collect();
    let expected: BTreeSet<String> = ["get_foo", "get_bar", "getX"]
        .into_iter()
        .map(str::to_string)
        .collect();
    assert_eq!(idents, expected);

    let idents: BTreeSet<String> = store
        .search("get_fo?")
        .unwrap()
        .into_iter()
        .map(|hit| hit.identifier)
        .collect();
    assert_eq!(idents, ["get_foo".to_string()].into_iter().collect());

    assert!(store.search("get_").unwrap().is_empty());
}

#[test]
fn test_unknown_tree_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = scratch_site(dir.path(), "true");
    let options = BuildOptions {
        tree: Some("imaginary".to_string()),
        ..Default::default()
    };
    assert!(build_instance(&config_path, &options).is_err());
}

#[test]
fn test_failing_build_command_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = scratch_site(dir.path(), "exit 3");
    assert!(build_instance(&config_path, &BuildOptions::default()).is_err());
    // Indexing ran before the build command, but no file pages were written.
    assert!(!dir.path().join("www/demo/src/main.rs.html").exists());
}
