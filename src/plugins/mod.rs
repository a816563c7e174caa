pub mod builtin;
pub mod catalog;
pub mod deferred;
pub mod error;
pub mod fetcher;
pub mod installers;
pub mod planner;
pub mod scrape;
pub mod selector;
pub mod sourcemod;

pub use catalog::{
    AcquisitionStrategy, ArchiveFormat, CustomInstall, ForcedDownload, ForcedSelection,
    InstallerCall, PluginCatalog, PluginDescriptor, ThreadScrape,
};
pub use deferred::DeferredQueue;
pub use error::PluginError;
pub use fetcher::PluginFetcher;
pub use installers::{CustomInstaller, InstallContext, InstallerRegistry};
pub use planner::{InstallationRequest, Planner, PluginToken, ResolvedPluginSet};
pub use selector::{select, CandidateKind, SelectionPolicy};
