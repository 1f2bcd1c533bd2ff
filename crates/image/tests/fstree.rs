#![forbid(unsafe_code)]

use std::path::PathBuf;

use vantage_image::fstree::{build_tree, build_tree_with_limits, read_file, FileNode};
use vantage_image::ImageError;

/// Write a tar layer from `(path, content)` pairs; `None` content makes a
/// directory entry, whiteout markers are empty files.
fn write_layer(dir: &std::path::Path, index: usize, entries: &[(&str, Option<&str>)]) -> PathBuf {
    let path = dir.join(format!("layer-{}.tar", index));
    let file = std::fs::File::create(&path).unwrap();
    let mut builder = tar::Builder::new(file);
    for (name, content) in entries {
        match content {
            Some(data) => {
                let mut header = tar::Header::new_gnu();
                header.set_size(data.len() as u64);
                header.set_mode(0o644);
                header.set_mtime(1_700_000_000);
                if name.contains("..") {
                    set_raw_name(&mut header, name);
                    header.set_cksum();
                    builder.append(&header, data.as_bytes()).unwrap();
                } else {
                    header.set_cksum();
                    builder.append_data(&mut header, name, data.as_bytes()).unwrap();
                }
            }
            None => {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                header.set_mode(0o755);
                header.set_mtime(1_700_000_000);
                if name.contains("..") {
                    set_raw_name(&mut header, name);
                    header.set_cksum();
                    builder.append(&header, std::io::empty()).unwrap();
                } else {
                    header.set_cksum();
                    builder.append_data(&mut header, name, std::io::empty()).unwrap();
                }
            }
        }
    }
    builder.finish().unwrap();
    path
}

/// Write `name` directly into the header's raw name field, bypassing the
/// `tar` crate's path validation so we can construct archives containing
/// `..` components the way a crafted/adversarial archive could.
fn set_raw_name(header: &mut tar::Header, name: &str) {
    let bytes = name.as_bytes();
    let slot = &mut header.as_old_mut().name;
    assert!(bytes.len() < slot.len());
    for b in slot.iter_mut() {
        *b = 0;
    }
    slot[..bytes.len()].copy_from_slice(bytes);
}

fn find<'a>(node: &'a FileNode, path: &str) -> Option<&'a FileNode> {
    if node.path == path {
        return Some(node);
    }
    node.children.iter().find_map(|c| find(c, path))
}

#[test]
fn whiteout_hides_sibling_and_subtree() {
    let dir = tempfile::tempdir().unwrap();
    let l0 = write_layer(
        dir.path(),
        0,
        &[
            ("etc/", None),
            ("etc/passwd", Some("root:x:0:0\n")),
            ("etc/shadow", Some("root:!:19000\n")),
        ],
    );
    let l1 = write_layer(dir.path(), 1, &[("etc/.wh.shadow", Some(""))]);

    let (root, total_files, _) = build_tree(&[l0.clone(), l1.clone()]).unwrap();
    assert!(find(&root, "/etc/passwd").is_some());
    assert!(find(&root, "/etc/shadow").is_none());
    assert_eq!(total_files, 2); // /etc and /etc/passwd

    let (content, name) = read_file(&[l0.clone(), l1.clone()], "/etc/passwd").unwrap();
    assert_eq!(content, b"root:x:0:0\n");
    assert_eq!(name, "passwd");

    match read_file(&[l0, l1], "/etc/shadow") {
        Err(ImageError::NotFound(_)) => {}
        other => panic!("expected not_found, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn opaque_whiteout_clears_then_same_layer_repopulates() {
    let dir = tempfile::tempdir().unwrap();
    let l0 = write_layer(
        dir.path(),
        0,
        &[
            ("app/", None),
            ("app/old-a.txt", Some("a")),
            ("app/old-b.txt", Some("b")),
        ],
    );
    let l1 = write_layer(
        dir.path(),
        1,
        &[("app/.wh..wh..opq", Some("")), ("app/fresh.txt", Some("new"))],
    );

    let (root, _, _) = build_tree(&[l0.clone(), l1.clone()]).unwrap();
    assert!(find(&root, "/app/old-a.txt").is_none());
    assert!(find(&root, "/app/old-b.txt").is_none());
    assert!(find(&root, "/app/fresh.txt").is_some());

    assert!(read_file(&[l0.clone(), l1.clone()], "/app/old-a.txt").is_err());
    let (content, _) = read_file(&[l0, l1], "/app/fresh.txt").unwrap();
    assert_eq!(content, b"new");
}

#[test]
fn later_layer_replaces_earlier_file() {
    let dir = tempfile::tempdir().unwrap();
    let l0 = write_layer(dir.path(), 0, &[("version.txt", Some("v1"))]);
    let l1 = write_layer(dir.path(), 1, &[("version.txt", Some("v2"))]);

    let (root, _, total_size) = build_tree(&[l0.clone(), l1.clone()]).unwrap();
    let node = find(&root, "/version.txt").unwrap();
    assert_eq!(node.node_type, "file");
    assert_eq!(total_size, 2);

    let (content, _) = read_file(&[l0, l1], "/version.txt").unwrap();
    assert_eq!(content, b"v2");
}

#[test]
fn dot_slash_root_entry_yields_nonempty_tree() {
    let dir = tempfile::tempdir().unwrap();
    let l0 = write_layer(dir.path(), 0, &[("./", None), ("./bin/sh", Some("#!"))]);
    let (root, total_files, _) = build_tree(&[l0]).unwrap();
    assert_eq!(root.path, "/");
    assert!(!root.children.is_empty());
    assert!(find(&root, "/bin/sh").is_some());
    assert_eq!(total_files, 2);
}

#[test]
fn parent_escapes_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let l0 = write_layer(
        dir.path(),
        0,
        &[("ok.txt", Some("fine")), ("evil/../../escape.txt", Some("bad"))],
    );
    let (root, _, _) = build_tree(&[l0]).unwrap();
    assert!(find(&root, "/ok.txt").is_some());
    assert!(find(&root, "/escape.txt").is_none());
    assert!(!root.children.iter().any(|c| c.name == "escape.txt"));
}

#[test]
fn tree_sorts_directories_first_then_alphabetical() {
    let dir = tempfile::tempdir().unwrap();
    let l0 = write_layer(
        dir.path(),
        0,
        &[
            ("zz.txt", Some("z")),
            ("aa.txt", Some("a")),
            ("var/", None),
            ("bin/", None),
        ],
    );
    let (root, _, _) = build_tree(&[l0]).unwrap();
    let names: Vec<&str> = root.children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["bin", "var", "aa.txt", "zz.txt"]);
}

#[test]
fn implicit_parent_directories_are_materialised() {
    let dir = tempfile::tempdir().unwrap();
    let l0 = write_layer(dir.path(), 0, &[("usr/local/bin/tool", Some("bin"))]);
    let (root, total_files, _) = build_tree(&[l0]).unwrap();
    for path in ["/usr", "/usr/local", "/usr/local/bin"] {
        assert_eq!(find(&root, path).unwrap().node_type, "dir");
    }
    assert_eq!(total_files, 4);
}

#[test]
fn node_ceiling_aborts_with_limits_error() {
    let dir = tempfile::tempdir().unwrap();
    let entries: Vec<(String, Option<&str>)> = (0..10)
        .map(|i| (format!("file-{}.txt", i), Some("x")))
        .collect();
    let borrowed: Vec<(&str, Option<&str>)> =
        entries.iter().map(|(n, c)| (n.as_str(), *c)).collect();
    let l0 = write_layer(dir.path(), 0, &borrowed);

    match build_tree_with_limits(&[l0.clone()], 5, u64::MAX) {
        Err(ImageError::LimitsExceeded(_)) => {}
        other => panic!("expected limits_exceeded, got {:?}", other.map(|_| ())),
    }
    match build_tree_with_limits(&[l0], usize::MAX, 4) {
        Err(ImageError::LimitsExceeded(_)) => {}
        other => panic!("expected limits_exceeded, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn rebuilding_from_same_layers_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let l0 = write_layer(
        dir.path(),
        0,
        &[("etc/", None), ("etc/hosts", Some("127.0.0.1 localhost\n"))],
    );
    let (a, files_a, size_a) = build_tree(&[l0.clone()]).unwrap();
    let (b, files_b, size_b) = build_tree(&[l0]).unwrap();
    assert_eq!(files_a, files_b);
    assert_eq!(size_a, size_b);
    assert_eq!(
        serde_json::to_value(&a).unwrap(),
        serde_json::to_value(&b).unwrap()
    );
}
