//! JSON persistence in the user config directory
//!
//! Files are written to a sibling temp file and renamed into place, so a
//! crash mid-write never leaves half a settings file behind.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::config::app::NAME;
use crate::error::{AppError, Result};

/// `<config dir>/umbra`
pub fn config_dir() -> Result<PathBuf> {
    dirs::config_dir().map(|p| p.join(NAME)).ok_or_else(|| {
        AppError::Config("No config directory for this user (is HOME set?)".to_string())
    })
}

/// Turn an I/O failure on `path` into a config error a user can act on
fn describe(action: &str, path: &Path, e: io::Error) -> AppError {
    let msg = match e.kind() {
        ErrorKind::PermissionDenied => format!("Permission denied: cannot {action} {path:?}"),
        ErrorKind::NotFound => format!("Cannot {action} {path:?}: parent path does not exist"),
        ErrorKind::ReadOnlyFilesystem => {
            format!("Cannot {action} {path:?}: filesystem is read-only")
        }
        _ => format!("Failed to {action} {path:?}: {e}"),
    };
    AppError::Config(msg)
}

/// Parse a JSON file. A missing or blank file is `None`.
pub fn load_from<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(describe("read", path, e)),
    };
    if content.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| AppError::Config(format!("Failed to parse {path:?}: {e}")))
}

/// Write `data` as pretty JSON, creating parent directories as needed
pub fn save_to<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| describe("create directory", parent, e))?;
    }

    let json = serde_json::to_string_pretty(data)
        .map_err(|e| AppError::Config(format!("Failed to serialize {path:?}: {e}")))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, json).map_err(|e| describe("write to", &tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        describe("replace", path, e)
    })
}

/// Load `filename` from the config directory
pub fn load<T: DeserializeOwned>(filename: &str) -> Result<Option<T>> {
    load_from(&config_dir()?.join(filename))
}

/// Save `filename` into the config directory
pub fn save<T: Serialize>(filename: &str, data: &T) -> Result<()> {
    save_to(&config_dir()?.join(filename), data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        value: i32,
    }

    fn sample() -> Sample {
        Sample {
            name: "umbra".into(),
            value: 7,
        }
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        save_to(&path, &sample()).unwrap();
        assert_eq!(load_from::<Sample>(&path).unwrap(), Some(sample()));
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        save_to(&path, &sample()).unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("sample.json")]);
    }

    #[test]
    fn missing_and_blank_files_are_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert_eq!(load_from::<Sample>(&path).unwrap(), None);

        fs::write(&path, "  \n").unwrap();
        assert_eq!(load_from::<Sample>(&path).unwrap(), None);
    }

    #[test]
    fn invalid_json_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ nope").unwrap();
        let err = load_from::<Sample>(&path).unwrap_err().to_string();
        assert!(err.contains("broken.json"), "{err}");
    }

    #[test]
    fn creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("sample.json");
        save_to(&path, &sample()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        save_to(&path, &sample()).unwrap();
        let newer = Sample {
            name: "newer".into(),
            value: 8,
        };
        save_to(&path, &newer).unwrap();
        assert_eq!(load_from::<Sample>(&path).unwrap(), Some(newer));
    }
}
