//! Project `.env` loading. Parsing is delegated to the `dotenv` crate; this
//! module only locates the file and collects the pairs into a map, so the
//! precedence decision stays in `lib`.

use std::collections::HashMap;
use std::path::Path;

use crate::LoadError;

/// Collects KEY=VALUE pairs from `.env` in `override_dir` (or the current
/// directory). No file, or no resolvable directory, yields an empty map; a
/// malformed file is an error.
pub fn load_env_map(override_dir: Option<&Path>) -> Result<HashMap<String, String>, LoadError> {
    let dir = match override_dir.map(Path::to_path_buf).or_else(|| std::env::current_dir().ok()) {
        Some(dir) => dir,
        None => return Ok(HashMap::new()),
    };
    let path = dir.join(".env");
    if !path.is_file() {
        return Ok(HashMap::new());
    }

    let entries =
        dotenv::from_path_iter(&path).map_err(|e| LoadError::Dotenv(e.to_string()))?;
    let mut out = HashMap::new();
    for entry in entries {
        let (key, value) = entry.map_err(|e| LoadError::Dotenv(e.to_string()))?;
        out.insert(key, value);
    }
    Ok(out)
}
