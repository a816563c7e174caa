// Plugin catalog - the immutable plugins.json database

use crate::plugins::error::PluginError;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Archive (or raw binary) format of a forced download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    /// A compiled SourceMod plugin, installed as-is
    Smx,
}

impl ArchiveFormat {
    /// File extension used for the downloaded file, including the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => ".zip",
            ArchiveFormat::TarGz => ".tar.gz",
            ArchiveFormat::Smx => ".smx",
        }
    }

    pub fn is_archive(&self) -> bool {
        !matches!(self, ArchiveFormat::Smx)
    }

    /// Detect the format from a file name such as "plugin.zip"
    pub fn from_file_name(name: &str) -> Option<Self> {
        let lower = name.trim().to_lowercase();
        if lower.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if lower.ends_with(".smx") {
            Some(ArchiveFormat::Smx)
        } else {
            None
        }
    }
}

impl TryFrom<String> for ArchiveFormat {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim_start_matches('.') {
            "zip" => Ok(ArchiveFormat::Zip),
            "tar.gz" | "tgz" => Ok(ArchiveFormat::TarGz),
            "smx" => Ok(ArchiveFormat::Smx),
            other => Err(format!("unsupported download format \"{}\"", other)),
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

/// Administrator override for an ambiguous scrape: pick `index` and expect
/// exactly `expected_count` candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "(usize, usize)")]
pub struct ForcedSelection {
    pub index: usize,
    pub expected_count: usize,
}

impl From<(usize, usize)> for ForcedSelection {
    fn from((index, expected_count): (usize, usize)) -> Self {
        Self {
            index,
            expected_count,
        }
    }
}

/// A function call on a registered custom installer, with typed arguments
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstallerCall {
    pub function: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcedDownload {
    pub url: String,
    pub archive_format: ArchiveFormat,
    pub strip_leading_directory: bool,
    pub install_location: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomInstall {
    pub script_reference: String,
    pub function_to_call: Option<InstallerCall>,
    pub defer_until_post_install: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadScrape {
    pub thread_url: String,
    pub forced_attachment_selection: Option<ForcedSelection>,
    pub forced_compiler_selection: Option<ForcedSelection>,
    pub extract_to_override: Option<PathBuf>,
}

/// How a plugin is acquired. Decided once when the catalog is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionStrategy {
    ForcedDownload(ForcedDownload),
    CustomInstall(CustomInstall),
    ThreadScrape(ThreadScrape),
}

impl AcquisitionStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            AcquisitionStrategy::ForcedDownload(_) => "forced download",
            AcquisitionStrategy::CustomInstall(_) => "custom install",
            AcquisitionStrategy::ThreadScrape(_) => "thread scrape",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionalFeature {
    pub requires: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub strategy: AcquisitionStrategy,
    pub requires: BTreeSet<String>,
    pub optional_features: BTreeMap<String, OptionalFeature>,
}

// On-disk shape of plugins.json. The strategy is inferred from which keys are
// present, exactly once, in `into_descriptor`.
#[derive(Debug, Deserialize)]
struct CatalogDocument {
    plugins: BTreeMap<String, RawDescriptor>,
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    force_download: Option<RawForcedDownload>,
    #[serde(default)]
    custom_install: Option<RawCustomInstall>,
    #[serde(default)]
    thread_url: Option<String>,
    #[serde(default)]
    force_attachment_selection: Option<ForcedSelection>,
    #[serde(default)]
    force_compiler_selection: Option<ForcedSelection>,
    #[serde(default)]
    extract_to: Option<String>,
    #[serde(default)]
    requires: BTreeSet<String>,
    #[serde(default)]
    optional_features: BTreeMap<String, RawFeature>,
}

#[derive(Debug, Deserialize)]
struct RawForcedDownload {
    url: String,
    format: ArchiveFormat,
    #[serde(default)]
    strip_leading_dir: bool,
    install_location: String,
}

#[derive(Debug, Deserialize)]
struct RawCustomInstall {
    installer: String,
    #[serde(default)]
    call: Option<InstallerCall>,
    #[serde(default)]
    post_installation: bool,
}

#[derive(Debug, Deserialize)]
struct RawFeature {
    #[serde(default)]
    requires: BTreeSet<String>,
}

impl RawDescriptor {
    fn into_descriptor(self, name: &str) -> Result<PluginDescriptor, PluginError> {
        let malformed = |reason: &str| PluginError::MalformedDescriptor {
            plugin: name.to_string(),
            reason: reason.to_string(),
        };

        let populated = [
            self.force_download.is_some(),
            self.custom_install.is_some(),
            self.thread_url.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count();
        if populated != 1 {
            return Err(malformed(
                "exactly one of \"force_download\", \"custom_install\" or \"thread_url\" must be set",
            ));
        }

        let scrape_only = self.force_attachment_selection.is_some()
            || self.force_compiler_selection.is_some()
            || self.extract_to.is_some();
        if scrape_only && self.thread_url.is_none() {
            return Err(malformed(
                "selection overrides and \"extract_to\" only apply to thread downloads",
            ));
        }

        let strategy = if let Some(fd) = self.force_download {
            AcquisitionStrategy::ForcedDownload(ForcedDownload {
                url: fd.url,
                archive_format: fd.format,
                strip_leading_directory: fd.strip_leading_dir,
                install_location: relative_path(name, "install_location", &fd.install_location)?,
            })
        } else if let Some(ci) = self.custom_install {
            if ci.installer.trim().is_empty() {
                return Err(malformed("\"custom_install.installer\" cannot be empty"));
            }
            AcquisitionStrategy::CustomInstall(CustomInstall {
                script_reference: ci.installer,
                function_to_call: ci.call,
                defer_until_post_install: ci.post_installation,
            })
        } else {
            let thread_url = self.thread_url.unwrap_or_default();
            if thread_url.trim().is_empty() {
                return Err(malformed("\"thread_url\" cannot be empty"));
            }
            let extract_to_override = match self.extract_to {
                Some(path) => Some(relative_path(name, "extract_to", &path)?),
                None => None,
            };
            AcquisitionStrategy::ThreadScrape(ThreadScrape {
                thread_url,
                forced_attachment_selection: self.force_attachment_selection,
                forced_compiler_selection: self.force_compiler_selection,
                extract_to_override,
            })
        };

        Ok(PluginDescriptor {
            name: name.to_string(),
            description: self.description,
            strategy,
            requires: self.requires,
            optional_features: self
                .optional_features
                .into_iter()
                .map(|(feature, raw)| {
                    (
                        feature,
                        OptionalFeature {
                            requires: raw.requires,
                        },
                    )
                })
                .collect(),
        })
    }
}

// Install locations are always relative to the container data directory
fn relative_path(plugin: &str, field: &str, raw: &str) -> Result<PathBuf, PluginError> {
    let path = PathBuf::from(raw);
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::RootDir | Component::Prefix(_) | Component::ParentDir
        )
    });
    if escapes {
        return Err(PluginError::MalformedDescriptor {
            plugin: plugin.to_string(),
            reason: format!("\"{}\" must be a relative path inside the server tree: {}", field, raw),
        });
    }
    Ok(path)
}

/// Read-only mapping from plugin name to its acquisition descriptor
#[derive(Debug, Clone)]
pub struct PluginCatalog {
    plugins: BTreeMap<String, PluginDescriptor>,
}

impl PluginCatalog {
    /// Load the catalog from a plugins.json file
    pub fn load(path: &Path) -> Result<Self, PluginError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| PluginError::io(path, e))?;
        let catalog = Self::from_json(&content)?;
        tracing::info!("Loaded {} plugin(s) from {:?}", catalog.len(), path);
        Ok(catalog)
    }

    /// Parse and validate a catalog document
    pub fn from_json(json: &str) -> Result<Self, PluginError> {
        let document: CatalogDocument = serde_json::from_str(json)
            .map_err(|e| PluginError::InvalidCatalog(e.to_string()))?;

        let mut plugins = BTreeMap::new();
        for (name, raw) in document.plugins {
            let descriptor = raw.into_descriptor(&name)?;
            plugins.insert(name, descriptor);
        }

        let catalog = Self { plugins };
        catalog.check_references()?;
        catalog.check_acyclic()?;
        Ok(catalog)
    }

    pub fn lookup(&self, name: &str) -> Result<&PluginDescriptor, PluginError> {
        self.plugins
            .get(name)
            .ok_or_else(|| PluginError::UnknownPlugin(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    // Every requirement edge, unconditional and per-feature
    fn edges<'a>(descriptor: &'a PluginDescriptor) -> impl Iterator<Item = &'a String> {
        descriptor.requires.iter().chain(
            descriptor
                .optional_features
                .values()
                .flat_map(|f| f.requires.iter()),
        )
    }

    fn check_references(&self) -> Result<(), PluginError> {
        for descriptor in self.plugins.values() {
            for required in Self::edges(descriptor) {
                if !self.plugins.contains_key(required) {
                    return Err(PluginError::MalformedDescriptor {
                        plugin: descriptor.name.clone(),
                        reason: format!("requires unknown plugin \"{}\"", required),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_acyclic(&self) -> Result<(), PluginError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            catalog: &'a PluginCatalog,
            name: &'a str,
            marks: &mut HashMap<&'a str, Mark>,
            path: &mut Vec<&'a str>,
        ) -> Result<(), PluginError> {
            match marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|p| *p == name).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|p| p.to_string()).collect();
                    cycle.push(name.to_string());
                    return Err(PluginError::CyclicRequirement(cycle));
                }
                None => {}
            }

            marks.insert(name, Mark::Visiting);
            path.push(name);
            if let Some(descriptor) = catalog.plugins.get(name) {
                for next in PluginCatalog::edges(descriptor) {
                    visit(catalog, next, marks, path)?;
                }
            }
            path.pop();
            marks.insert(name, Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        for name in self.plugins.keys() {
            visit(self, name, &mut marks, &mut Vec::new())?;
        }
        Ok(())
    }
}
