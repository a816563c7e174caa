// Profiles - copy, append and reconfigure server files from profiles/<name>/

use crate::archive::copy_tree;
use crate::config::processor::{append_file, reconfigure_file};
use crate::config::settings::ProfileSettings;
use crate::docker::DockerManager;
use crate::provision::identity::RunIdentity;
use crate::provision::{run_checked, ProvisionError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Applied before the selected profile on every run
pub const GLOBAL_PROFILE: &str = "global";

const DIRECT_COPY: &str = "direct-copy";
const APPEND_TO: &str = "append-to";
const RECONFIGURE: &str = "reconfigure";

/// A profile directory under `profiles/`
#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    pub dir: PathBuf,
}

impl Profile {
    pub fn new(profiles_root: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            dir: profiles_root.join(name),
        }
    }

    /// The global profile followed by the selected one
    pub fn chain(profiles_root: &Path, selected: &str) -> Vec<Profile> {
        let mut chain = vec![Profile::new(profiles_root, GLOBAL_PROFILE)];
        if selected != GLOBAL_PROFILE {
            chain.push(Profile::new(profiles_root, selected));
        }
        chain
    }

    /// Copy `direct-copy/` over the data directory, then append each file
    /// under `append-to/` to its counterpart in the data directory.
    pub fn apply(&self, data_dir: &Path) -> Result<(), ProvisionError> {
        tracing::info!("Applying configurations from the \"{}\" profile...", self.name);

        let copy_dir = self.dir.join(DIRECT_COPY);
        if copy_dir.is_dir() {
            tracing::info!("Direct-copying files...");
            copy_tree(&copy_dir, data_dir)?;
        }

        for (source, rel) in profile_files(&self.dir.join(APPEND_TO))? {
            append_file(&source, &data_dir.join(rel))?;
        }
        Ok(())
    }

    /// Merge `reconfigure/` files into the plugin configs the server generated
    pub fn reconfigure(&self, data_dir: &Path) -> Result<usize, ProvisionError> {
        let files = profile_files(&self.dir.join(RECONFIGURE))?;
        for (source, rel) in &files {
            reconfigure_file(source, &data_dir.join(rel))?;
        }
        Ok(files.len())
    }
}

// Regular files under `dir` with their paths relative to it. Missing dir is empty.
fn profile_files(dir: &Path) -> Result<Vec<(PathBuf, PathBuf)>, ProvisionError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| ProvisionError::io(dir, e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        files.push((entry.path().to_path_buf(), rel));
    }
    Ok(files)
}

/// What a preinstall hook may use. The container exists but is stopped.
pub struct HookContext<'a> {
    pub identity: &'a RunIdentity,
    pub data_dir: &'a Path,
    pub docker: &'a DockerManager,
    pub container_id: &'a str,
    pub settings: &'a ProfileSettings,
}

#[async_trait]
pub trait PreinstallHook: Send + Sync {
    async fn run(&self, ctx: &HookContext<'_>) -> Result<(), ProvisionError>;
}

#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<String, Box<dyn PreinstallHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("daemon_setup", Box::new(DaemonSetup));
        registry
    }

    pub fn register(&mut self, name: &str, hook: Box<dyn PreinstallHook>) {
        self.hooks.insert(name.to_string(), hook);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hooks.contains_key(name)
    }

    /// Run the named hooks in order
    pub async fn run_all(&self, names: &[String], ctx: &HookContext<'_>) -> Result<(), ProvisionError> {
        for name in names {
            let hook = self
                .hooks
                .get(name)
                .ok_or_else(|| ProvisionError::UnknownHook(name.clone()))?;
            tracing::info!("Running preinstall hook: {}", name);
            hook.run(ctx).await?;
        }
        Ok(())
    }
}

/// Writes the files the map rotation daemon reads
pub fn write_rotation_files(
    data_dir: &Path,
    identity: &RunIdentity,
    rotation_offset: u32,
) -> Result<(), ProvisionError> {
    let info = data_dir.join("container-info.dat");
    fs::write(&info, format!("{}-{}\n", identity.region(), identity.instance()))
        .map_err(|e| ProvisionError::io(&info, e))?;

    // First instance in a region rotates from the configured offset
    let offset = data_dir.join("offset.dat");
    fs::write(&offset, format!("{}\n", identity.instance_index() + rotation_offset))
        .map_err(|e| ProvisionError::io(&offset, e))?;
    Ok(())
}

/// Installs the profile's rotation daemon and spawns it from the entry script
pub struct DaemonSetup;

#[async_trait]
impl PreinstallHook for DaemonSetup {
    async fn run(&self, ctx: &HookContext<'_>) -> Result<(), ProvisionError> {
        let daemon = &ctx.settings.daemon;
        tracing::info!("Installing {} for {}", daemon, ctx.identity.container_name());
        write_rotation_files(ctx.data_dir, ctx.identity, ctx.settings.rotation_offset)?;

        // The daemon was copied into the data dir already; installing its
        // dependencies needs a running container
        ctx.docker.start_container(ctx.container_id).await?;
        run_checked(ctx.docker, ctx.container_id, "root", "apt install python3-pip -y").await?;
        run_checked(
            ctx.docker,
            ctx.container_id,
            "steam",
            "pip3 install python-daemon requests schedule",
        )
        .await?;
        let spawn = format!(
            r"sed -i 's_\#!/bin/bash_&\n\n./tf-dedicated/{}\n_' entry.sh",
            daemon
        );
        run_checked(ctx.docker, ctx.container_id, "steam", &spawn).await?;
        ctx.docker.stop_container(ctx.container_id).await?;
        Ok(())
    }
}
