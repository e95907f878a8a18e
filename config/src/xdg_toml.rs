//! XDG config file: the `[env]` table of `~/.config/<app>/config.toml`.

use std::collections::HashMap;

use crate::LoadError;

/// Reads the app's `config.toml` and returns its `[env]` table. A missing
/// file, a missing table, or non-string values all degrade to fewer entries
/// rather than errors; only an unreadable or unparsable file fails.
pub fn load_env_map(app_name: &str) -> Result<HashMap<String, String>, LoadError> {
    let Some(config_dir) = dirs::config_dir() else {
        return Err(LoadError::XdgPath(
            "no config directory on this platform".into(),
        ));
    };
    let path = config_dir.join(app_name).join("config.toml");
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(LoadError::XdgRead(e)),
    };
    parse_env_table(&content)
}

fn parse_env_table(content: &str) -> Result<HashMap<String, String>, LoadError> {
    let document: toml::Value = toml::from_str(content)?;
    let mut out = HashMap::new();
    if let Some(env) = document.get("env").and_then(toml::Value::as_table) {
        for (key, value) in env {
            if let Some(value) = value.as_str() {
                out.insert(key.clone(), value.to_string());
            }
        }
    }
    Ok(out)
}
