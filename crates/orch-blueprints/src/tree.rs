//! Directory tree copying shared by save, fetch and the engine.

use std::fs;
use std::io;
use std::path::Path;

use orch_connector::git::GIT_DIR;
use walkdir::WalkDir;

/// Copy the contents of `src` into `dest`, skipping any nested `.git`.
///
/// `dest` is created if missing; existing files are overwritten. Returns
/// the number of files copied.
pub async fn copy_tree(src: &Path, dest: &Path) -> io::Result<u64> {
    let (src, dest) = (src.to_path_buf(), dest.to_path_buf());
    tokio::task::spawn_blocking(move || copy_tree_blocking(&src, &dest))
        .await
        .map_err(io::Error::other)?
}

fn copy_tree_blocking(src: &Path, dest: &Path) -> io::Result<u64> {
    fs::create_dir_all(dest)?;
    let mut copied = 0;
    let walker = WalkDir::new(src)
        .min_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| e.file_name() != GIT_DIR);
    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}
