use crate::model::Config;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Load a validated configuration document. The external loader owns
/// schema validation and friendly diagnostics; this read is expected to
/// succeed on any document it produced.
pub fn load_config(path: &Path) -> Result<Config> {
    let file = File::open(path).with_context(|| format!("cannot open configuration at {:?}", path))?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader).with_context(|| format!("cannot parse configuration at {:?}", path))
}

pub fn store_config(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).with_context(|| format!("cannot create {:?}", parent))?;
        }
    }
    let file = File::create(path).with_context(|| format!("cannot write configuration at {:?}", path))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, config).context("cannot serialize configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config: Config = serde_json::from_str(r#"{ "volumes": [ { "path": "/home" } ] }"#).unwrap();

        store_config(&path, &config).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.volumes[0].path, std::path::PathBuf::from("/home"));
    }

    #[test]
    fn load_missing_config_fails_with_context() {
        let err = load_config(Path::new("/nonexistent/snapship.json")).unwrap_err();
        assert!(err.to_string().contains("cannot open configuration"));
    }
}
