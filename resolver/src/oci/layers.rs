//! OCI layer reading utilities.
//!
//! Bundle layers are tar archives, optionally gzip-compressed. The resolver
//! only ever needs a single small file out of them, so layers are scanned in
//! memory instead of being unpacked to disk.

use std::io::Read;

use bundlegraph_core::error::{BundleError, Result};
use flate2::read::GzDecoder;
use tar::Archive;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Read the file at `path` out of a (possibly gzipped) tar layer.
///
/// Returns `Ok(None)` when the layer does not contain the file.
pub fn read_layer_file(layer: &[u8], path: &str) -> Result<Option<Vec<u8>>> {
    if layer.starts_with(&GZIP_MAGIC) {
        scan_archive(Archive::new(GzDecoder::new(layer)), path)
    } else {
        scan_archive(Archive::new(layer), path)
    }
}

fn scan_archive<R: Read>(mut archive: Archive<R>, wanted: &str) -> Result<Option<Vec<u8>>> {
    let wanted = normalize(wanted);
    let entries = archive
        .entries()
        .map_err(|e| BundleError::SerializationError(format!("Failed to read layer: {}", e)))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| {
            BundleError::SerializationError(format!("Failed to read layer entry: {}", e))
        })?;
        let entry_path = entry
            .path()
            .map_err(|e| BundleError::SerializationError(format!("Bad layer entry path: {}", e)))?
            .to_string_lossy()
            .into_owned();

        if normalize(&entry_path) == wanted {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            tracing::debug!(path = %wanted, size = data.len(), "Read file from layer");
            return Ok(Some(data));
        }
    }

    Ok(None)
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches("./").trim_start_matches('/')
}
