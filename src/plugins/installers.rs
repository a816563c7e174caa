// Custom installer registry - named handlers looked up by catalog entries

use crate::config::SbppSettings;
use crate::http::HttpFetch;
use crate::plugins::catalog::{CustomInstall, InstallerCall};
use crate::plugins::error::PluginError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;

/// Everything an installer may touch, passed explicitly
#[derive(Clone, Copy)]
pub struct InstallContext<'a> {
    pub http: &'a dyn HttpFetch,
    /// Host directory mounted as the server root inside the container
    pub data_dir: &'a Path,
    pub downloads_dir: &'a Path,
    /// Directory of the selected profile
    pub profile_dir: &'a Path,
    pub instance_number: u32,
    pub sbpp: Option<&'a SbppSettings>,
}

#[async_trait]
pub trait CustomInstaller: Send + Sync {
    /// Run the installer. `call` carries the optional function and arguments
    /// from the catalog entry.
    async fn install(
        &self,
        ctx: &InstallContext<'_>,
        call: Option<&InstallerCall>,
    ) -> Result<(), PluginError>;
}

#[derive(Default)]
pub struct InstallerRegistry {
    installers: HashMap<String, Box<dyn CustomInstaller>>,
}

impl InstallerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the installers shipped with this tool
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::plugins::builtin::register_builtins(&mut registry);
        registry
    }

    pub fn register(&mut self, name: &str, installer: Box<dyn CustomInstaller>) {
        if self.installers.insert(name.to_string(), installer).is_some() {
            tracing::warn!("Replacing custom installer: {}", name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.installers.contains_key(name)
    }

    /// Look up the installer named by the descriptor and run it
    pub async fn run(
        &self,
        install: &CustomInstall,
        ctx: &InstallContext<'_>,
    ) -> Result<(), PluginError> {
        let installer = self
            .installers
            .get(&install.script_reference)
            .ok_or_else(|| PluginError::UnknownInstaller(install.script_reference.clone()))?;

        match &install.function_to_call {
            Some(call) => tracing::info!(
                "Running custom installer {} ({})",
                install.script_reference,
                describe_call(call)
            ),
            None => tracing::info!("Running custom installer {}", install.script_reference),
        }
        installer
            .install(ctx, install.function_to_call.as_ref())
            .await
    }
}

// Argument values may hold webhook URLs or passwords, so only keys are shown
fn describe_call(call: &InstallerCall) -> String {
    let keys: Vec<&str> = call.args.keys().map(String::as_str).collect();
    format!("{}, args: [{}]", call.function, keys.join(", "))
}

/// Fails when an installer that takes no function is given one
pub(crate) fn reject_call(installer: &str, call: Option<&InstallerCall>) -> Result<(), PluginError> {
    match call {
        Some(call) => Err(PluginError::UnknownInstallerFunction {
            installer: installer.to_string(),
            function: call.function.clone(),
        }),
        None => Ok(()),
    }
}
