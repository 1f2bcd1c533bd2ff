//! Filesystem reconstruction over cached layer tars. Layers apply bottom-up
//! with OCI whiteout semantics; the result is a sorted tree, directories
//! first.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::ImageError;

pub const MAX_NODES: usize = 50_000;
pub const MAX_TOTAL_BYTES: u64 = 5 * 1024 * 1024 * 1024;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

#[derive(Debug, Clone, Serialize)]
pub struct FileNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub size: u64,
    pub mode: u32,
    #[serde(rename = "modTime", skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<String>,
    #[serde(rename = "linkTarget", skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub children: Vec<FileNode>,
}

#[derive(Debug, Clone)]
struct NodeRec {
    node_type: &'static str,
    size: u64,
    mode: u32,
    mod_time: Option<String>,
    link_target: Option<String>,
}

impl NodeRec {
    fn dir() -> Self {
        Self {
            node_type: "dir",
            size: 0,
            mode: 0o755,
            mod_time: None,
            link_target: None,
        }
    }
}

/// Normalise a tar entry name to an absolute, clean path. Entries escaping
/// the root (`..`) are refused.
fn normalize_tar_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim_start_matches("./").trim_end_matches('/');
    let mut parts: Vec<&str> = Vec::new();
    for comp in trimmed.split('/') {
        match comp {
            "" | "." => continue,
            ".." => return None,
            c => parts.push(c),
        }
    }
    if parts.is_empty() {
        Some("/".to_string())
    } else {
        Some(format!("/{}", parts.join("/")))
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "/",
    }
}

fn base_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn join_parent(dir: &str, base: &str) -> String {
    if dir == "/" {
        format!("/{}", base)
    } else {
        format!("{}/{}", dir, base)
    }
}

fn format_mtime(epoch: u64) -> Option<String> {
    chrono::DateTime::from_timestamp(epoch as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// Build the merged tree from layer tar files, bottom layer first.
pub fn build_tree(layer_paths: &[PathBuf]) -> Result<(FileNode, usize, u64), ImageError> {
    build_tree_with_limits(layer_paths, MAX_NODES, MAX_TOTAL_BYTES)
}

pub fn build_tree_with_limits(
    layer_paths: &[PathBuf],
    max_nodes: usize,
    max_bytes: u64,
) -> Result<(FileNode, usize, u64), ImageError> {
    let mut map: BTreeMap<String, NodeRec> = BTreeMap::new();
    let mut accumulated_bytes: u64 = 0;

    for layer_path in layer_paths {
        let file = std::fs::File::open(layer_path)
            .map_err(|e| ImageError::Registry(format!("opening layer: {}", e)))?;
        let mut archive = tar::Archive::new(std::io::BufReader::new(file));
        let entries = archive
            .entries()
            .map_err(|e| ImageError::Registry(format!("reading layer: {}", e)))?;
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let raw = entry.path().ok().map(|p| p.to_string_lossy().into_owned());
            let Some(raw) = raw else { continue };
            let Some(path) = normalize_tar_path(&raw) else {
                continue;
            };
            let base = base_of(&path);

            if base == OPAQUE_WHITEOUT {
                // Clear the enclosing directory; entries later in this same
                // layer re-populate it.
                let dir = parent_of(&path).to_string();
                let prefix = if dir == "/" {
                    "/".to_string()
                } else {
                    format!("{}/", dir)
                };
                map.retain(|p, _| p == &dir || !p.starts_with(&prefix));
                continue;
            }
            if let Some(hidden) = base.strip_prefix(WHITEOUT_PREFIX) {
                let target = join_parent(parent_of(&path), hidden);
                let subtree = format!("{}/", target);
                map.retain(|p, _| p != &target && !p.starts_with(&subtree));
                continue;
            }
            if path == "/" {
                continue;
            }

            let header = entry.header();
            let node = match header.entry_type() {
                tar::EntryType::Directory => NodeRec {
                    node_type: "dir",
                    size: 0,
                    mode: header.mode().unwrap_or(0o755),
                    mod_time: header.mtime().ok().and_then(format_mtime),
                    link_target: None,
                },
                tar::EntryType::Symlink | tar::EntryType::Link => NodeRec {
                    node_type: "symlink",
                    size: 0,
                    mode: header.mode().unwrap_or(0o777),
                    mod_time: header.mtime().ok().and_then(format_mtime),
                    link_target: header
                        .link_name()
                        .ok()
                        .flatten()
                        .map(|l| l.to_string_lossy().into_owned()),
                },
                _ => {
                    let size = header.size().unwrap_or(0);
                    accumulated_bytes = accumulated_bytes.saturating_add(size);
                    if accumulated_bytes > max_bytes {
                        return Err(ImageError::LimitsExceeded(format!(
                            "accumulated size exceeds {} bytes",
                            max_bytes
                        )));
                    }
                    NodeRec {
                        node_type: "file",
                        size,
                        mode: header.mode().unwrap_or(0o644),
                        mod_time: header.mtime().ok().and_then(format_mtime),
                        link_target: None,
                    }
                }
            };

            ensure_parents(&mut map, &path);
            map.insert(path, node);
            if map.len() > max_nodes {
                return Err(ImageError::LimitsExceeded(format!(
                    "file count exceeds {} nodes",
                    max_nodes
                )));
            }
        }
    }

    let total_files = map.len();
    let total_size = map
        .values()
        .filter(|n| n.node_type == "file")
        .map(|n| n.size)
        .sum();
    let root = assemble(&map);
    Ok((root, total_files, total_size))
}

fn ensure_parents(map: &mut BTreeMap<String, NodeRec>, path: &str) {
    let mut dir = parent_of(path).to_string();
    while dir != "/" && !map.contains_key(&dir) {
        map.insert(dir.clone(), NodeRec::dir());
        dir = parent_of(&dir).to_string();
    }
}

fn assemble(map: &BTreeMap<String, NodeRec>) -> FileNode {
    let mut children_of: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for path in map.keys() {
        children_of
            .entry(parent_of(path))
            .or_default()
            .push(path.as_str());
    }
    build_node("/", "/", &NodeRec::dir(), map, &children_of)
}

fn build_node(
    path: &str,
    name: &str,
    rec: &NodeRec,
    map: &BTreeMap<String, NodeRec>,
    children_of: &BTreeMap<&str, Vec<&str>>,
) -> FileNode {
    let mut children: Vec<FileNode> = children_of
        .get(path)
        .map(|kids| {
            kids.iter()
                .map(|child| build_node(child, base_of(child), &map[*child], map, children_of))
                .collect()
        })
        .unwrap_or_default();
    children.sort_by(|a, b| {
        let a_dir = a.node_type == "dir";
        let b_dir = b.node_type == "dir";
        b_dir.cmp(&a_dir).then_with(|| a.name.cmp(&b.name))
    });
    FileNode {
        name: name.to_string(),
        path: path.to_string(),
        node_type: rec.node_type.to_string(),
        size: rec.size,
        mode: rec.mode,
        mod_time: rec.mod_time.clone(),
        link_target: rec.link_target.clone(),
        children,
    }
}

/// Content of one file: the highest layer in which the path appears and is
/// not whited out wins.
pub fn read_file(layer_paths: &[PathBuf], target: &str) -> Result<(Vec<u8>, String), ImageError> {
    let target = normalize_tar_path(target)
        .ok_or_else(|| ImageError::NotFound(format!("invalid path: {}", target)))?;
    if target == "/" {
        return Err(ImageError::NotFound("path is a directory".to_string()));
    }

    let mut content: Option<Vec<u8>> = None;
    for layer_path in layer_paths {
        let file = std::fs::File::open(layer_path)
            .map_err(|e| ImageError::Registry(format!("opening layer: {}", e)))?;
        let mut archive = tar::Archive::new(std::io::BufReader::new(file));
        let entries = archive
            .entries()
            .map_err(|e| ImageError::Registry(format!("reading layer: {}", e)))?;
        for entry in entries {
            let mut entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let raw = entry.path().ok().map(|p| p.to_string_lossy().into_owned());
            let Some(raw) = raw else { continue };
            let Some(path) = normalize_tar_path(&raw) else {
                continue;
            };
            let base = base_of(&path);

            if base == OPAQUE_WHITEOUT {
                let dir = parent_of(&path);
                let prefix = if dir == "/" {
                    "/".to_string()
                } else {
                    format!("{}/", dir)
                };
                if target.starts_with(&prefix) {
                    content = None;
                }
                continue;
            }
            if let Some(hidden) = base.strip_prefix(WHITEOUT_PREFIX) {
                let deleted = join_parent(parent_of(&path), hidden);
                if target == deleted || target.starts_with(&format!("{}/", deleted)) {
                    content = None;
                }
                continue;
            }

            if path == target && entry.header().entry_type() != tar::EntryType::Directory {
                let mut data = Vec::new();
                entry
                    .read_to_end(&mut data)
                    .map_err(|e| ImageError::Registry(format!("reading file content: {}", e)))?;
                content = Some(data);
            }
        }
    }

    match content {
        Some(data) => Ok((data, base_of(&target).to_string())),
        None => Err(ImageError::NotFound(format!("file not found: {}", target))),
    }
}

/// Convenience used by tests and callers that work from a cache directory.
pub fn layer_files(layers_dir: &Path, count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|i| layers_dir.join(format!("layer-{}.tar", i)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tar_path_normalisation() {
        assert_eq!(normalize_tar_path("./etc/passwd").as_deref(), Some("/etc/passwd"));
        assert_eq!(normalize_tar_path("etc/").as_deref(), Some("/etc"));
        assert_eq!(normalize_tar_path("./").as_deref(), Some("/"));
        assert_eq!(normalize_tar_path("a//b/./c").as_deref(), Some("/a/b/c"));
        assert!(normalize_tar_path("../escape").is_none());
        assert!(normalize_tar_path("a/../../b").is_none());
    }

    #[test]
    fn parent_and_base_helpers() {
        assert_eq!(parent_of("/etc/passwd"), "/etc");
        assert_eq!(parent_of("/etc"), "/");
        assert_eq!(base_of("/etc/passwd"), "passwd");
        assert_eq!(join_parent("/", "etc"), "/etc");
        assert_eq!(join_parent("/etc", "shadow"), "/etc/shadow");
    }
}
