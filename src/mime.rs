use std::ffi::OsStr;
use std::path::Path;

// How much of a file to sniff for binary content.
const SNIFF_WINDOW: usize = 1024;

/// Decide whether a file is text we should index. A NUL byte in the leading
/// window marks it binary; everything else is decoded lossily downstream.
pub fn is_text(_path: &Path, data: &[u8]) -> bool {
    let window = &data[..data.len().min(SNIFF_WINDOW)];
    !window.contains(&0)
}

/// Stable icon name for a path, derived from its extension. The serving
/// front end maps these to actual images.
pub fn icon(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "rs" | "c" | "h" | "cc" | "cpp" | "hpp" | "cxx" | "py" | "java" | "go" | "rb" | "swift" => {
            "code"
        }
        "js" | "jsx" | "ts" | "tsx" | "html" | "htm" | "css" | "xml" | "svg" => "web",
        "md" | "rst" | "txt" | "adoc" => "text",
        "toml" | "json" | "yaml" | "yml" | "ini" | "cfg" | "lock" => "config",
        "sh" | "bash" | "zsh" | "fish" | "bat" | "ps1" => "script",
        "mk" => "build",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nul_bytes_mark_a_file_binary() {
        assert!(is_text(Path::new("a.txt"), b"plain old text\n"));
        assert!(!is_text(Path::new("a.bin"), b"\x7fELF\x00\x01\x02"));
        assert!(is_text(Path::new("empty"), b""));
    }

    #[test]
    fn nul_beyond_the_sniff_window_is_not_seen() {
        let mut data = vec![b'a'; SNIFF_WINDOW];
        data.push(0);
        assert!(is_text(Path::new("late.bin"), &data));
    }

    #[test]
    fn icons_come_from_extensions() {
        assert_eq!(icon(Path::new("src/main.rs")), "code");
        assert_eq!(icon(Path::new("index.HTML")), "web");
        assert_eq!(icon(Path::new("Cargo.toml")), "config");
        assert_eq!(icon(Path::new("Makefile")), "unknown");
    }
}
