//! Moving a finished artifact to its public location.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::PublishError;
use crate::feed::FeedDefinition;

/// Moves `src` to `dst`, trying `rename` first and falling back to
/// copy + delete across filesystems.
pub fn move_file(src: &Path, dst: &Path) -> Result<(), PublishError> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    let map_err = |e| PublishError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    };
    fs::copy(src, dst).map_err(map_err)?;
    fs::remove_file(src).map_err(map_err)?;
    Ok(())
}

/// Publishes `temp` at `dest`. Readers of `dest` see either the previous
/// file or the complete new one: a cross-device move is staged next to
/// `dest` and renamed into place.
pub fn promote(temp: &Path, dest: &Path) -> Result<PathBuf, PublishError> {
    ensure_parent(dest)?;

    if fs::rename(temp, dest).is_ok() {
        return Ok(dest.to_path_buf());
    }

    let staging = staging_path(dest);
    move_file(temp, &staging)?;
    fs::rename(&staging, dest).map_err(|e| PublishError::MoveFile {
        from: staging.clone(),
        to: dest.to_path_buf(),
        source: e,
    })?;
    Ok(dest.to_path_buf())
}

/// Replaces `path` with a gzip-compressed `<path>.gz` and returns the new path.
pub fn gzip_file(path: &Path) -> Result<PathBuf, PublishError> {
    let mut target = path.as_os_str().to_owned();
    target.push(".gz");
    let target = PathBuf::from(target);
    let staging = staging_path(&target);

    let compress_err = |e| PublishError::Compress {
        path: path.to_path_buf(),
        source: e,
    };

    let compress = || -> io::Result<()> {
        let mut reader = BufReader::new(File::open(path)?);
        let out = BufWriter::new(File::create(&staging)?);
        let mut encoder = GzEncoder::new(out, Compression::default());
        io::copy(&mut reader, &mut encoder)?;
        let mut out = encoder.finish()?;
        out.flush()?;
        out.get_ref().sync_all()
    };
    if let Err(e) = compress() {
        let _ = fs::remove_file(&staging);
        return Err(compress_err(e));
    }

    fs::rename(&staging, &target).map_err(compress_err)?;
    fs::remove_file(path).map_err(compress_err)?;
    Ok(target)
}

pub fn file_size(path: &Path) -> Result<u64, PublishError> {
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| PublishError::Metadata {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Public URL of a published file: under the feed's base URL when it has
/// one, otherwise a `file://` URL.
pub fn file_url(feed: &FeedDefinition, published: &Path) -> String {
    let name = published
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match feed.public_base_url.as_deref() {
        Some(base) => format!("{}/{}", base.trim_end_matches('/'), name),
        None => format!("file://{}", published.display()),
    }
}

fn ensure_parent(path: &Path) -> Result<(), PublishError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| PublishError::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })
        }
        _ => Ok(()),
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".publishing");
    PathBuf::from(staging)
}
