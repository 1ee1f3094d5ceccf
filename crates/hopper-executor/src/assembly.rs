//! Root filesystem assembly.
//!
//! Layers are unpacked into an empty directory in declared order. A later
//! entry replaces whatever an earlier layer put at the same path, even if the
//! type differs: a file can replace a directory (taking its contents with
//! it), a directory can replace a file or symlink. Directories present in
//! both layers are merged.
//!
//! Intermediate directories are created as needed, and a symlink standing
//! where a directory is needed is replaced by a directory, so no entry is
//! ever written through a link.

use hopper_core::executor::ResolvedLayer;
use hopper_store::{LayerEntryKind, LayerReader};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ExecutorError, ExecutorResult};

const DEFAULT_DIRECTORY_MODE: u32 = 0o755;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblyStats {
    pub entries: u64,
    pub bytes: u64,
}

/// Unpack `layers` into `root`, which must exist and be empty.
pub fn assemble(root: &Path, layers: &[ResolvedLayer]) -> ExecutorResult<AssemblyStats> {
    let mut stats = AssemblyStats::default();
    // Applied last, deepest first, so read-only directories can still be
    // filled by later layers.
    let mut directory_modes: BTreeMap<PathBuf, u32> = BTreeMap::new();

    for layer in layers {
        let file = File::open(&layer.path).map_err(|e| {
            ExecutorError::Assembly(format!("opening layer {}: {e}", layer.digest.short()))
        })?;
        let mut reader = LayerReader::new(BufReader::new(file))?;

        while let Some(entry) = reader.next_entry()? {
            let target = root.join(&entry.path);
            prepare_parents(root, &entry.path)?;
            stats.entries += 1;

            match entry.kind {
                LayerEntryKind::Directory => {
                    match fs::symlink_metadata(&target) {
                        Ok(meta) if meta.is_dir() => {}
                        Ok(_) => {
                            fs::remove_file(&target)?;
                            fs::create_dir(&target)?;
                        }
                        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir(&target)?,
                        Err(e) => return Err(e.into()),
                    }
                    directory_modes.insert(target, entry.mode & 0o7777);
                }
                LayerEntryKind::File { .. } => {
                    remove_existing(&target, &mut directory_modes)?;
                    let mut out = OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(entry.mode & 0o7777)
                        .open(&target)?;
                    stats.bytes += io::copy(&mut reader.contents(), &mut out)?;
                    // The umask may have masked bits off at creation.
                    fs::set_permissions(&target, fs::Permissions::from_mode(entry.mode & 0o7777))?;
                }
                LayerEntryKind::Symlink { target: link } => {
                    remove_existing(&target, &mut directory_modes)?;
                    symlink(&link, &target)?;
                }
            }
        }
        debug!(digest = %layer.digest.short(), "Unpacked layer");
    }

    for (path, mode) in directory_modes.iter().rev() {
        fs::set_permissions(path, fs::Permissions::from_mode(*mode))?;
    }
    Ok(stats)
}

/// Make every ancestor of `relative` under `root` a real directory.
fn prepare_parents(root: &Path, relative: &str) -> ExecutorResult<()> {
    let mut current = root.to_path_buf();
    let mut components = relative.split('/').peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                fs::remove_file(&current)?;
                create_directory(&current)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => create_directory(&current)?,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn create_directory(path: &Path) -> ExecutorResult<()> {
    fs::create_dir(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(DEFAULT_DIRECTORY_MODE))?;
    Ok(())
}

fn remove_existing(target: &Path, directory_modes: &mut BTreeMap<PathBuf, u32>) -> ExecutorResult<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => {
            remove_tree(target)?;
            directory_modes.retain(|path, _| !path.starts_with(target));
        }
        Ok(_) => fs::remove_file(target)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Give the owner full access to every directory under `dir` so the tree
/// can be removed.
fn make_writable(dir: &Path) -> ExecutorResult<()> {
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mode = fs::symlink_metadata(&current)?.permissions().mode();
        fs::set_permissions(&current, fs::Permissions::from_mode(mode | 0o700))?;
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                pending.push(entry.path());
            }
        }
    }
    Ok(())
}

/// Remove a directory tree, including directories left read-only.
pub(crate) fn remove_tree(path: &Path) -> ExecutorResult<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            make_writable(path)?;
            fs::remove_dir_all(path)?;
        }
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::write_layer;
    use hopper_store::LayerBuilder;

    #[test]
    fn test_later_layer_shadows_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir(&root).unwrap();

        let mut lower = LayerBuilder::new();
        lower
            .add_directory("etc", 0o755)
            .unwrap()
            .add_file("etc/conf", 0o644, b"one")
            .unwrap()
            .add_file("etc/keep", 0o644, b"kept")
            .unwrap()
            .add_file("bin/tool", 0o755, b"v1")
            .unwrap()
            .add_file("data/x", 0o644, b"x")
            .unwrap()
            .add_symlink("link", "etc/conf")
            .unwrap();
        let mut upper = LayerBuilder::new();
        upper
            .add_file("etc/conf", 0o600, b"two")
            .unwrap()
            .add_directory("bin/tool", 0o755)
            .unwrap()
            .add_file("bin/tool/inner", 0o644, b"inner")
            .unwrap()
            .add_file("data", 0o644, b"now a file")
            .unwrap()
            .add_file("link", 0o644, b"no longer a link")
            .unwrap();

        let layers = vec![
            write_layer(dir.path(), "lower", lower),
            write_layer(dir.path(), "upper", upper),
        ];
        let stats = assemble(&root, &layers).unwrap();
        assert_eq!(stats.entries, 11);

        assert_eq!(fs::read_to_string(root.join("etc/conf")).unwrap(), "two");
        assert_eq!(
            fs::metadata(root.join("etc/conf")).unwrap().permissions().mode() & 0o777,
            0o600
        );
        assert_eq!(fs::read_to_string(root.join("etc/keep")).unwrap(), "kept");
        assert!(root.join("bin/tool").is_dir());
        assert_eq!(fs::read_to_string(root.join("bin/tool/inner")).unwrap(), "inner");
        assert!(root.join("data").is_file());
        assert!(!fs::symlink_metadata(root.join("link")).unwrap().is_symlink());
        assert_eq!(fs::read_to_string(root.join("link")).unwrap(), "no longer a link");
    }

    #[test]
    fn test_never_writes_through_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let outside = dir.path().join("outside");
        fs::create_dir(&root).unwrap();
        fs::create_dir(&outside).unwrap();

        let mut lower = LayerBuilder::new();
        lower.add_symlink("escape", outside.to_str().unwrap()).unwrap();
        let mut upper = LayerBuilder::new();
        upper.add_file("escape/pwned", 0o644, b"gotcha").unwrap();

        let layers = vec![
            write_layer(dir.path(), "lower", lower),
            write_layer(dir.path(), "upper", upper),
        ];
        assemble(&root, &layers).unwrap();

        assert!(fs::symlink_metadata(root.join("escape")).unwrap().is_dir());
        assert!(root.join("escape/pwned").is_file());
        assert!(!outside.join("pwned").exists());
    }

    #[test]
    fn test_read_only_directory_is_filled_and_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir(&root).unwrap();

        let mut lower = LayerBuilder::new();
        lower
            .add_directory("ro", 0o555)
            .unwrap()
            .add_file("ro/a", 0o444, b"a")
            .unwrap();
        let mut middle = LayerBuilder::new();
        middle.add_file("ro/b", 0o444, b"b").unwrap();
        let layers = vec![
            write_layer(dir.path(), "lower", lower),
            write_layer(dir.path(), "middle", middle),
        ];
        assemble(&root, &layers).unwrap();
        assert!(root.join("ro/b").is_file());
        assert_eq!(
            fs::metadata(root.join("ro")).unwrap().permissions().mode() & 0o777,
            0o555
        );
        remove_tree(&root).unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_missing_layer_file() {
        let dir = tempfile::tempdir().unwrap();
        let layer = ResolvedLayer {
            digest: hopper_core::Digest::of(b"gone"),
            path: dir.path().join("gone"),
        };
        let err = assemble(dir.path(), &[layer]).unwrap_err();
        assert!(matches!(err, ExecutorError::Assembly(_)));
    }
}
