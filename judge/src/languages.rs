//! This module implements the language catalog the worker resolves
//! submission language identifiers against.
//!

use std::collections::HashMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One language environment of the catalog.
///
/// The field names of the serialized form are part of the settings file
/// schema.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Language {
    /// Name the submitted source is materialized under in the work
    /// directory.
    #[cfg_attr(feature = "serde", serde(rename = "SourceFileName"))]
    pub source_file_name: String,

    /// Whether the language needs a compile phase.
    #[cfg_attr(feature = "serde", serde(rename = "Compile"))]
    pub compile: bool,

    /// Argument vector of the compile phase.
    #[cfg_attr(feature = "serde", serde(rename = "CompileCmd", default))]
    pub compile_cmd: Vec<String>,

    /// Image the compile phase runs in.
    #[cfg_attr(feature = "serde", serde(rename = "CompileImage", default))]
    pub compile_image: String,

    /// Argument vector of the execute phase.
    #[cfg_attr(feature = "serde", serde(rename = "ExecCmd"))]
    pub exec_cmd: Vec<String>,

    /// Image the execute phase runs in.
    #[cfg_attr(feature = "serde", serde(rename = "ExecImage"))]
    pub exec_image: String
}

/// The language catalog. Read-only once the worker has started.
pub struct LanguageCatalog {
    /// Language environments by their numeric identifier.
    languages: HashMap<i64, Language>
}

impl LanguageCatalog {
    /// Create a catalog over the given language map.
    pub fn new(languages: HashMap<i64, Language>) -> LanguageCatalog {
        LanguageCatalog { languages }
    }

    /// Look up a language environment by its identifier.
    pub fn find(&self, id: i64) -> Option<&Language> {
        self.languages.get(&id)
    }

    /// Number of language environments in the catalog.
    pub fn len(&self) -> usize {
        self.languages.len()
    }

    /// Determine whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Language {
        Language {
            source_file_name: "main.c".to_owned(),
            compile: true,
            compile_cmd: vec!["gcc".to_owned(), "/work/main.c".to_owned()],
            compile_image: "judge/gcc".to_owned(),
            exec_cmd: vec!["/work/a.out".to_owned()],
            exec_image: "judge/gcc".to_owned()
        }
    }

    #[test]
    fn find_resolves_known_identifiers() {
        let mut languages = HashMap::new();
        languages.insert(3, sample());
        let catalog = LanguageCatalog::new(languages);

        assert!(catalog.find(3).is_some());
        assert!(catalog.find(4).is_none());
        assert_eq!(1, catalog.len());
    }
}
