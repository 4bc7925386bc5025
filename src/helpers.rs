use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::error;

const HEX_CHARS: &[u8] = b"0123456789abcdef";

/// Random lowercase hex string, used for room internal ids and track ids.
pub fn random_hex_string(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| HEX_CHARS[rng.gen_range(0..HEX_CHARS.len())] as char)
        .collect()
}

/// Create `path` (and parents) if missing. Failure is logged, not fatal:
/// recording simply won't find its target directory.
pub fn ensure_dir(path: &str) {
    if !Path::new(path).exists() {
        if let Err(e) = std::fs::create_dir_all(path) {
            error!(path = %path, error = %e, "create_dir_failed");
        }
    }
}

/// Resolve `name` relatively to the configured project root.
pub fn project_path(project_root: &str, name: &str) -> PathBuf {
    Path::new(project_root).join(name)
}
