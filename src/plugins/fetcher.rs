// Plugin fetcher - acquires and installs resolved plugins by strategy

use crate::archive::{extract_archive, ExtractOptions};
use crate::plugins::catalog::{
    AcquisitionStrategy, ArchiveFormat, CustomInstall, ForcedDownload, PluginCatalog, ThreadScrape,
};
use crate::plugins::deferred::DeferredQueue;
use crate::plugins::error::PluginError;
use crate::plugins::installers::{InstallContext, InstallerRegistry};
use crate::plugins::planner::{InstallationRequest, Planner};
use crate::plugins::scrape::{resolve_download_url, scrape_links};
use crate::plugins::selector::{select, CandidateKind, SelectionPolicy};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Where attachment archives land when the catalog gives no `extract_to`
const DEFAULT_ATTACHMENT_ROOT: &str = "tf";
/// Where compiled plugins land when the catalog gives no `extract_to`
const DEFAULT_PLUGIN_DIR: &str = "tf/addons/sourcemod/plugins";

pub struct PluginFetcher<'a> {
    catalog: &'a PluginCatalog,
    registry: &'a InstallerRegistry,
    ctx: InstallContext<'a>,
    /// Allow overwriting files left by a previous run
    reuse_existing: bool,
    installed: BTreeSet<String>,
    deferred: DeferredQueue,
}

impl<'a> PluginFetcher<'a> {
    pub fn new(
        catalog: &'a PluginCatalog,
        registry: &'a InstallerRegistry,
        ctx: InstallContext<'a>,
        reuse_existing: bool,
    ) -> Self {
        Self {
            catalog,
            registry,
            ctx,
            reuse_existing,
            installed: BTreeSet::new(),
            deferred: DeferredQueue::new(),
        }
    }

    /// Expand and install every token of a request, in request order.
    /// A plugin pulled in by several tokens is only installed once.
    /// Returns the plugins installed or deferred.
    pub async fn install_request(
        &mut self,
        request: &InstallationRequest,
        planner: &Planner<'_>,
    ) -> Result<Vec<String>, PluginError> {
        let mut done = Vec::new();
        for token in &request.tokens {
            let resolved = planner.expand_token(token)?;
            tracing::info!("Request {} resolves to {:?}", token, resolved);

            for name in resolved {
                if self.installed.contains(&name) {
                    tracing::debug!("{} already installed in this run", name);
                    continue;
                }
                self.install_plugin(&name).await?;
                done.push(name);
            }
        }
        Ok(done)
    }

    /// Install a single plugin by catalog name
    pub async fn install_plugin(&mut self, name: &str) -> Result<(), PluginError> {
        let catalog = self.catalog;
        let descriptor = catalog.lookup(name)?;
        tracing::info!(
            "Downloading and installing plugin: {} ({})",
            name,
            descriptor.strategy.label()
        );

        match &descriptor.strategy {
            AcquisitionStrategy::ForcedDownload(download) => {
                self.forced_download(name, download).await?
            }
            AcquisitionStrategy::CustomInstall(custom) => self.custom_install(name, custom).await?,
            AcquisitionStrategy::ThreadScrape(scrape) => self.thread_scrape(name, scrape).await?,
        }

        self.installed.insert(name.to_string());
        Ok(())
    }

    /// Installs deferred during this run, to be drained once the server is up
    pub fn into_deferred(self) -> DeferredQueue {
        self.deferred
    }

    pub fn deferred(&self) -> &DeferredQueue {
        &self.deferred
    }

    fn download_path(&self, name: &str, format: ArchiveFormat) -> PathBuf {
        self.ctx
            .downloads_dir
            .join(format!("{}{}", name, format.extension()))
    }

    async fn forced_download(
        &self,
        name: &str,
        download: &ForcedDownload,
    ) -> Result<(), PluginError> {
        let dest = self.download_path(name, download.archive_format);
        self.ctx.http.download_to_file(&download.url, &dest).await?;

        let target = self.ctx.data_dir.join(&download.install_location);
        if download.archive_format.is_archive() {
            let options = ExtractOptions {
                strip_leading_directory: download.strip_leading_directory,
                ..Default::default()
            };
            extract_archive(&dest, download.archive_format, &target, &options)?;
        } else {
            self.place_binary(&dest, &target, name)?;
        }
        Ok(())
    }

    async fn custom_install(
        &mut self,
        name: &str,
        custom: &CustomInstall,
    ) -> Result<(), PluginError> {
        if custom.defer_until_post_install {
            if !self.registry.contains(&custom.script_reference) {
                return Err(PluginError::UnknownInstaller(custom.script_reference.clone()));
            }
            self.deferred.enqueue(name, custom.clone());
            return Ok(());
        }
        self.registry.run(custom, &self.ctx).await
    }

    async fn thread_scrape(&self, name: &str, scrape: &ThreadScrape) -> Result<(), PluginError> {
        let thread_url = scrape.thread_url.as_str();
        tracing::info!("Looking for download links on {}", thread_url);
        let page = self.ctx.http.get_text(thread_url).await?;
        let links = scrape_links(&page);

        let attachments = links.attachment_hrefs();
        let policy = SelectionPolicy::new(
            CandidateKind::Attachment,
            scrape.forced_attachment_selection,
            thread_url,
        );
        match select(&attachments, &policy) {
            Ok(href) => {
                let format = links.attachment_format(href).unwrap_or(ArchiveFormat::Zip);
                let url = resolve_download_url(thread_url, href)?;
                tracing::info!("Got download URL from thread: {}", url);

                let dest = self.download_path(name, format);
                self.ctx.http.download_to_file(&url, &dest).await?;
                let root = scrape
                    .extract_to_override
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_ATTACHMENT_ROOT));
                extract_archive(
                    &dest,
                    format,
                    &self.ctx.data_dir.join(root),
                    &ExtractOptions::default(),
                )?;
                return Ok(());
            }
            Err(PluginError::NoCandidates { .. }) => {
                tracing::warn!("No attachment URLs found, falling back to plugin compiler links...");
            }
            Err(e) => return Err(e),
        }

        let policy = SelectionPolicy::new(
            CandidateKind::Compiler,
            scrape.forced_compiler_selection,
            thread_url,
        );
        let compiler_url = match select(&links.compilers, &policy) {
            Ok(url) => url,
            Err(PluginError::NoCandidates { .. }) => {
                return Err(PluginError::NoDownloadSource(thread_url.to_string()))
            }
            Err(e) => return Err(e),
        };
        let url = resolve_download_url(thread_url, compiler_url)?;
        tracing::info!("Got plugin compiler URL from thread: {}", url);

        let dest = self.download_path(name, ArchiveFormat::Smx);
        self.ctx.http.download_to_file(&url, &dest).await?;
        let dir = scrape
            .extract_to_override
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PLUGIN_DIR));
        self.place_binary(&dest, &self.ctx.data_dir.join(dir), name)
    }

    /// Move a downloaded plugin binary to `<dir>/<name>.smx`
    fn place_binary(&self, downloaded: &Path, dir: &Path, name: &str) -> Result<(), PluginError> {
        let target = dir.join(format!("{}{}", name, ArchiveFormat::Smx.extension()));
        if target.exists() {
            if !self.reuse_existing {
                return Err(PluginError::DestinationExists(target));
            }
            tracing::warn!("Replacing existing plugin binary {:?}", target);
        }

        fs::create_dir_all(dir).map_err(|e| PluginError::io(dir, e))?;
        if fs::rename(downloaded, &target).is_err() {
            // Downloads and data may live on different filesystems
            fs::copy(downloaded, &target).map_err(|e| PluginError::io(&target, e))?;
            fs::remove_file(downloaded).map_err(|e| PluginError::io(downloaded, e))?;
        }
        tracing::info!("Installed {:?}", target);
        Ok(())
    }
}
