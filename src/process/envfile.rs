//! Dotenv-style env definition files.

use std::collections::BTreeMap;
use std::path::Path;

/// Env files read from a runtime directory, in precedence order.
pub const ENV_FILES: [&str; 2] = [".env.local", ".env"];

/// Parse dotenv content into `(key, value)` pairs in file order. Malformed lines are skipped.
pub fn parse_env(content: &str) -> Vec<(String, String)> {
    dotenvy::from_read_iter(content.as_bytes())
        .filter_map(|item| match item {
            Ok(pair) => Some(pair),
            Err(e) => {
                log::debug!("Skipping env line: {}", e);
                None
            }
        })
        .collect()
}

/// Merge the env files found in `dir`. The first definition of a key wins.
pub fn load_env_files(dir: &Path) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for name in ENV_FILES {
        let path = dir.join(name);
        if !path.is_file() {
            continue;
        }
        let iter = match dotenvy::from_path_iter(&path) {
            Ok(iter) => iter,
            Err(e) => {
                log::warn!("Failed to read {:?}: {}", path, e);
                continue;
            }
        };
        for item in iter {
            match item {
                Ok((key, value)) => {
                    vars.entry(key).or_insert(value);
                }
                Err(e) => log::warn!("Skipping malformed line in {:?}: {}", path, e),
            }
        }
    }
    vars
}
