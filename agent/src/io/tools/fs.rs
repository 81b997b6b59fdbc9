//! Workspace-confined file tools: `list_files`, `read_file`, `write_file`, `patch_file`.

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use serde_json::{Value, json};
use walkdir::{DirEntry, WalkDir};

use super::ToolError;

/// Most entries returned by `list_files`.
pub const MAX_LISTED_FILES: usize = 300;

/// Directories never descended into by listing or search.
const SKIPPED_DIRS: &[&str] = &[".git", ".agent", "target"];

#[derive(Debug, Deserialize)]
pub struct ListFilesArgs {
    #[serde(default = "default_path")]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct ReadFileArgs {
    pub path: String,
    #[serde(default = "default_start")]
    pub start: usize,
    #[serde(default = "default_end")]
    pub end: usize,
}

#[derive(Debug, Deserialize)]
pub struct WriteFileArgs {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct PatchFileArgs {
    pub path: String,
    pub find: String,
    pub replace: String,
    #[serde(default)]
    pub expected_replacements: Option<usize>,
}

pub(crate) fn default_path() -> String {
    ".".to_string()
}

fn default_start() -> usize {
    1
}

fn default_end() -> usize {
    200
}

/// Resolve `raw` against `root`, rejecting anything outside it.
///
/// `root` must be canonical. The check is lexical first (`..` handling) and
/// then repeated on the deepest existing ancestor with symlinks resolved.
pub fn resolve_path(root: &Path, raw: &str) -> Result<PathBuf, ToolError> {
    let raw_path = Path::new(raw);
    let joined = if raw_path.is_absolute() {
        raw_path.to_path_buf()
    } else {
        root.join(raw_path)
    };
    let normalized = normalize(&joined);
    let escapes = || ToolError::execution(format!("path escapes workspace: {raw}"));
    if !normalized.starts_with(root) {
        return Err(escapes());
    }

    let mut existing = normalized.as_path();
    while existing.symlink_metadata().is_err() {
        existing = existing.parent().ok_or_else(escapes)?;
    }
    let canonical = existing
        .canonicalize()
        .map_err(|err| ToolError::execution(format!("resolve {raw}: {err}")))?;
    if !canonical.starts_with(root) {
        return Err(escapes());
    }
    Ok(normalized)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Workspace-relative display form of `path` (`/`-separated, `.` for the root).
pub fn relative(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let joined = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Files under `target` in name order, skipping tool and VCS directories.
pub(crate) fn walk_files(target: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(target)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_skipped_dir(entry))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(DirEntry::into_path)
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

pub fn list_files(root: &Path, args: &ListFilesArgs) -> Result<Value, ToolError> {
    let target = resolve_path(root, &args.path)?;
    if !target.exists() {
        return Err(ToolError::execution(format!(
            "path does not exist: {}",
            args.path
        )));
    }
    let files: Vec<String> = walk_files(&target)
        .map(|path| relative(root, &path))
        .collect();
    let count = files.len();
    let files: Vec<String> = files.into_iter().take(MAX_LISTED_FILES).collect();
    Ok(json!({"count": count, "files": files}))
}

pub fn read_file(root: &Path, args: &ReadFileArgs) -> Result<Value, ToolError> {
    if args.start < 1 || args.end < args.start {
        return Err(ToolError::execution(format!(
            "invalid line range {}..{}",
            args.start, args.end
        )));
    }
    let resolved = resolve_path(root, &args.path)?;
    if !resolved.is_file() {
        return Err(ToolError::execution(format!("not a file: {}", args.path)));
    }
    let contents = fs::read_to_string(&resolved)
        .map_err(|err| ToolError::execution(format!("read {}: {err}", args.path)))?;
    let lines: Vec<&str> = contents.lines().collect();
    let snippet = lines
        .iter()
        .skip(args.start - 1)
        .take(args.end - args.start + 1)
        .copied()
        .collect::<Vec<_>>()
        .join("\n");
    Ok(json!({
        "path": relative(root, &resolved),
        "start": args.start,
        "end": args.end,
        "content": snippet,
        "total_lines": lines.len(),
    }))
}

pub fn write_file(root: &Path, args: &WriteFileArgs) -> Result<Value, ToolError> {
    let resolved = resolve_path(root, &args.path)?;
    if resolved.is_dir() {
        return Err(ToolError::execution(format!("is a directory: {}", args.path)));
    }
    if let Some(parent) = resolved.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| ToolError::execution(format!("create parent of {}: {err}", args.path)))?;
    }
    fs::write(&resolved, &args.content)
        .map_err(|err| ToolError::execution(format!("write {}: {err}", args.path)))?;
    Ok(json!({
        "path": relative(root, &resolved),
        "bytes_written": args.content.len(),
    }))
}

pub fn patch_file(root: &Path, args: &PatchFileArgs) -> Result<Value, ToolError> {
    if args.find.is_empty() {
        return Err(ToolError::execution("`find` must not be empty"));
    }
    let resolved = resolve_path(root, &args.path)?;
    if !resolved.is_file() {
        return Err(ToolError::execution(format!("not a file: {}", args.path)));
    }
    let original = fs::read_to_string(&resolved)
        .map_err(|err| ToolError::execution(format!("read {}: {err}", args.path)))?;
    let replacements = original.matches(args.find.as_str()).count();
    if replacements == 0 {
        return Err(ToolError::execution(format!(
            "no matches found for `find` in {}",
            args.path
        )));
    }
    if let Some(expected) = args.expected_replacements
        && expected != replacements
    {
        return Err(ToolError::execution(format!(
            "replacement count mismatch: expected {expected}, found {replacements}"
        )));
    }
    let updated = original.replace(args.find.as_str(), &args.replace);
    fs::write(&resolved, &updated)
        .map_err(|err| ToolError::execution(format!("write {}: {err}", args.path)))?;
    Ok(json!({
        "path": relative(root, &resolved),
        "replacements": replacements,
        "bytes_written": updated.len(),
    }))
}
