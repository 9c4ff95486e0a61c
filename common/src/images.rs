use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{Error, Result};

/// Lists the files in `dir` with extension `ext` (a leading dot is ignored),
/// sorted by path. Subdirectories are not descended into.
pub fn discover_images(dir: impl AsRef<Path>, ext: &str) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let ext = ext.trim_start_matches('.');

    let mut images = vec![];
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == ext) {
            images.push(path);
        }
    }
    images.sort();

    log::info!(
        "found {} `.{ext}` images in `{}`",
        images.len(),
        dir.display()
    );

    if images.is_empty() {
        return Err(Error::NoImages {
            dir: dir.to_path_buf(),
            ext: ext.to_owned(),
        });
    }

    Ok(images)
}
