//! This module maintains the worker settings loaded from the JSON file
//! named by `--settings`.
//!

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use judge::{Language, LanguageCatalog};

error_chain::error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        Io(::std::io::Error);
        Json(::serde_json::Error);
    }

    errors {
        InvalidSettingsFile {
            description("invalid settings file")
        }
    }
}

/// Template written next to a missing settings file so the operator has
/// something to edit.
pub const SETTINGS_TEMPLATE: &str = r#"{
    "name": "judge-worker",
    "parallelism": 2,
    "cpu_usage": 100,
    "auth": "replace-this-token",
    "docker_host": "tcp://127.0.0.1:2375",
    "languages": {
        "1": {
            "SourceFileName": "main.c",
            "Compile": true,
            "CompileCmd": ["gcc", "/work/main.c", "-O2", "-o", "/work/a.out"],
            "CompileImage": "judge/gcc",
            "ExecCmd": ["/work/a.out"],
            "ExecImage": "judge/gcc"
        }
    }
}
"#;

/// JSON skeleton of one language catalog entry, printed by `--genlang`.
pub const LANGUAGE_TEMPLATE: &str = r#"{
    "SourceFileName": "main.c",
    "Compile": true,
    "CompileCmd": ["gcc", "/work/main.c", "-O2", "-o", "/work/a.out"],
    "CompileImage": "judge/gcc",
    "ExecCmd": ["/work/a.out"],
    "ExecImage": "judge/gcc"
}"#;

/// Worker wide settings.
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Display name of this worker.
    pub name: String,

    /// Number of submissions judged concurrently, advertised to the
    /// dispatcher on connect.
    pub parallelism: u32,

    /// CPU share granted to each judge container, as a percentage of one
    /// core.
    pub cpu_usage: u32,

    /// Bearer token presented when dialing the dispatcher.
    pub auth: String,

    /// Endpoint of the container daemon.
    #[serde(default = "default_docker_host")]
    pub docker_host: String,

    /// The language catalog, by numeric language identifier.
    #[serde(default)]
    pub languages: HashMap<i64, Language>
}

/// The default container daemon endpoint.
fn default_docker_host() -> String {
    "tcp://127.0.0.1:2375".to_owned()
}

impl Settings {
    /// Load settings from the given JSON file.
    pub fn from_file<P>(path: P) -> Result<Settings>
        where P: AsRef<Path> {
        let content = std::fs::read_to_string(path.as_ref())
            .chain_err(|| ErrorKind::InvalidSettingsFile)
            ?;
        serde_json::from_str(&content)
            .chain_err(|| ErrorKind::InvalidSettingsFile)
    }

    /// Build the language catalog from the settings.
    pub fn catalog(&self) -> LanguageCatalog {
        LanguageCatalog::new(self.languages.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_is_a_valid_settings_file() {
        let settings: Settings = serde_json::from_str(SETTINGS_TEMPLATE).unwrap();

        assert_eq!("judge-worker", settings.name);
        assert_eq!(2, settings.parallelism);
        assert_eq!(100, settings.cpu_usage);
        assert_eq!("tcp://127.0.0.1:2375", settings.docker_host);

        let catalog = settings.catalog();
        let language = catalog.find(1).unwrap();
        assert_eq!("main.c", language.source_file_name);
        assert!(language.compile);
        assert_eq!("judge/gcc", language.exec_image);
    }

    #[test]
    fn language_template_is_a_valid_entry() {
        let language: Language = serde_json::from_str(LANGUAGE_TEMPLATE).unwrap();
        assert_eq!("main.c", language.source_file_name);
        assert_eq!(vec!["/work/a.out"], language.exec_cmd);
    }

    #[test]
    fn docker_host_falls_back_to_the_local_daemon() {
        let settings: Settings = serde_json::from_str(r#"{
            "name": "w",
            "parallelism": 1,
            "cpu_usage": 50,
            "auth": "t",
            "languages": {}
        }"#).unwrap();

        assert_eq!("tcp://127.0.0.1:2375", settings.docker_host);
        assert!(settings.catalog().is_empty());
    }

    #[test]
    fn malformed_settings_are_rejected() {
        assert!(serde_json::from_str::<Settings>("{\"name\": 3}").is_err());
    }
}
