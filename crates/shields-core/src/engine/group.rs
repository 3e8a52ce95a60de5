//! Inputs of a compile pass

use serde::{Deserialize, Serialize};
use shields_types::{FileInfo, FilterListInfo, ResourcesInfo, Source};

/// The filter list files and resources one engine is compiled from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterListGroup {
    /// Files in compile order
    pub files: Vec<FileInfo>,
    pub resources_info: Option<ResourcesInfo>,
}

impl FilterListGroup {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn fingerprint(&self) -> CompileFingerprint {
        CompileFingerprint {
            infos: self
                .files
                .iter()
                .map(|file_info| file_info.filter_list_info.clone())
                .collect(),
            resources_version: self
                .resources_info
                .as_ref()
                .map(|resources| resources.version.clone()),
        }
    }
}

/// Identity of a compile: which list versions and which resources version.
///
/// Two compiles with equal fingerprints produce the same engine, so the
/// second one is skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileFingerprint {
    pub infos: Vec<FilterListInfo>,
    #[serde(default)]
    pub resources_version: Option<String>,
}

impl CompileFingerprint {
    pub fn contains(&self, source: &Source) -> bool {
        self.infos.iter().any(|info| &info.source == source)
    }

    /// Sources this fingerprint was compiled from
    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.infos.iter().map(|info| &info.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_tracks_versions_and_resources() {
        let mut group = FilterListGroup {
            files: vec![FileInfo::new(Source::filter_list("a"), "1.0.0", "/a/1.0.0/list.txt")],
            resources_info: None,
        };
        let first = group.fingerprint();
        assert!(first.contains(&Source::filter_list("a")));
        assert!(!first.contains(&Source::filter_list("b")));

        group.resources_info = Some(ResourcesInfo::from_file_path("/resources/2/resources.json"));
        assert_ne!(group.fingerprint(), first);

        // Moving the same version to another path does not change identity
        let moved = FilterListGroup {
            files: vec![FileInfo::new(Source::filter_list("a"), "1.0.0", "/elsewhere/list.txt")],
            resources_info: None,
        };
        assert_eq!(moved.fingerprint(), first);
    }
}
