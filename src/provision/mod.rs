// Provisioning pipeline - creates, configures and starts one TF2 server container

pub mod identity;
pub mod profile;

use crate::archive::ArchiveError;
use crate::config::processor::edit_file;
use crate::config::{build_env_vars, ConfigEditError, ServerVariables, Settings, SettingsError};
use crate::docker::{ContainerSpec, DockerError, DockerManager};
use crate::http::{HttpClient, HttpError};
use crate::plugins::builtin::SOURCEBANS;
use crate::plugins::sourcemod::{disable_bundled, enable_bundled};
use crate::plugins::{
    CustomInstall, DeferredQueue, InstallContext, InstallationRequest, InstallerRegistry,
    PluginCatalog, PluginError, PluginFetcher, Planner,
};
use crate::probe::{wait_until_reachable, A2sProbe, ProbeError, ServerReachable};
use identity::{resolve_password, RunIdentity};
use profile::{HookContext, HookRegistry, Profile};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SERVER_CFG: &str = "tf/cfg/server.cfg";
const LOGIN_TOKEN_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    ConfigEdit(#[from] ConfigEditError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("Readiness probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Invalid server identity: {0}")]
    InvalidIdentity(String),

    #[error(
        "Found {} pre-existing container(s) named \"{name}\": {ids:?}\nDelete them, pick another identifier or pass --overwrite",
        .ids.len()
    )]
    ContainerExists { name: String, ids: Vec<String> },

    #[error(
        "A data directory for this container already exists: {}\nDelete it, or pass --erase or --force-reuse",
        .0.display()
    )]
    DataDirExists(PathBuf),

    #[error("Command \"{command}\" exited with code {exit_code}:\n{output}")]
    CommandFailed {
        command: String,
        exit_code: i64,
        output: String,
    },

    #[error("No preinstall hook named \"{0}\"")]
    UnknownHook(String),

    #[error("Failed to detect the host IP address: {0}\nPass it with --host-ip")]
    HostIp(String),

    #[error("Filesystem error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProvisionError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Run a command in the container and fail unless it exits with 0
pub(crate) async fn run_checked(
    docker: &DockerManager,
    container_id: &str,
    user: &str,
    command: &str,
) -> Result<(), ProvisionError> {
    let result = docker.exec(container_id, user, command).await?;
    for line in result.output.lines() {
        tracing::info!("[{}] {}", user, line);
    }
    if !result.success() {
        return Err(ProvisionError::CommandFailed {
            command: command.to_string(),
            exit_code: result.exit_code,
            output: result.output,
        });
    }
    Ok(())
}

/// Command-line switches for one provisioning run
#[derive(Debug, Clone, Default)]
pub struct ProvisionOptions {
    pub cpu_affinity: Option<String>,
    pub with_sbpp: bool,
    pub overwrite: bool,
    pub erase: bool,
    pub force_reuse: bool,
    pub skip_apt: bool,
    pub no_wait: bool,
    pub host_ip: Option<IpAddr>,
}

/// Working directories of a run, all relative to the project root
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub root: PathBuf,
    pub data_dir: PathBuf,
    pub passwords_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub profiles_dir: PathBuf,
}

impl RunPaths {
    pub fn new(root: &Path, container_name: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            data_dir: root.join("container-data").join(container_name),
            passwords_dir: root.join("container-passwords"),
            downloads_dir: root.join("downloads"),
            profiles_dir: root.join("profiles"),
        }
    }
}

/// Prepare the data directory. Returns true when an existing one is reused.
pub fn prepare_data_dir(data_dir: &Path, options: &ProvisionOptions) -> Result<bool, ProvisionError> {
    let mut reuse = false;
    if data_dir.exists() {
        if options.erase {
            tracing::warn!("Erasing existing container data!");
            fs::remove_dir_all(data_dir).map_err(|e| ProvisionError::io(data_dir, e))?;
        } else if options.force_reuse {
            tracing::warn!("Reusing existing container data directory {:?}", data_dir);
            reuse = true;
        } else {
            return Err(ProvisionError::DataDirExists(data_dir.to_path_buf()));
        }
    }
    fs::create_dir_all(data_dir).map_err(|e| ProvisionError::io(data_dir, e))?;
    Ok(reuse)
}

/// Address of the default route's interface, found by connecting a UDP socket.
/// Nothing is sent.
pub async fn detect_host_ip() -> Result<IpAddr, ProvisionError> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| ProvisionError::HostIp(e.to_string()))?;
    socket
        .connect("8.8.8.8:53")
        .await
        .map_err(|e| ProvisionError::HostIp(e.to_string()))?;
    let addr = socket
        .local_addr()
        .map_err(|e| ProvisionError::HostIp(e.to_string()))?;
    Ok(addr.ip())
}

pub struct Provisioner {
    identity: RunIdentity,
    settings: Settings,
    options: ProvisionOptions,
    paths: RunPaths,
    docker: DockerManager,
    installers: InstallerRegistry,
    hooks: HookRegistry,
}

impl Provisioner {
    pub async fn new(
        root: &Path,
        identity: RunIdentity,
        settings: Settings,
        options: ProvisionOptions,
    ) -> Result<Self, ProvisionError> {
        let docker = DockerManager::new().await?;
        docker.ping().await?;
        let paths = RunPaths::new(root, &identity.container_name());
        Ok(Self {
            identity,
            settings,
            options,
            paths,
            docker,
            installers: InstallerRegistry::with_builtins(),
            hooks: HookRegistry::with_builtins(),
        })
    }

    /// Provision the server end to end
    pub async fn run(&self) -> Result<(), ProvisionError> {
        let name = self.identity.container_name();
        if let Some(unknown) = self
            .settings
            .profile
            .preinstall_hooks
            .iter()
            .find(|hook| !self.hooks.contains(hook))
        {
            return Err(ProvisionError::UnknownHook(unknown.clone()));
        }

        let host_ip = match self.options.host_ip {
            Some(ip) => ip,
            None => {
                let ip = detect_host_ip().await?;
                tracing::info!(
                    "Auto-detected the host IP address as {}. If this is incorrect, override it with --host-ip.",
                    ip
                );
                ip
            }
        };

        tracing::info!("Using container name {}; checking for pre-existing containers...", name);
        self.clear_existing(&name).await?;

        let reuse = prepare_data_dir(&self.paths.data_dir, &self.options)?;
        for dir in [&self.paths.passwords_dir, &self.paths.downloads_dir] {
            fs::create_dir_all(dir).map_err(|e| ProvisionError::io(dir, e))?;
        }
        // Docker needs an absolute bind source
        let data_dir = fs::canonicalize(&self.paths.data_dir)
            .map_err(|e| ProvisionError::io(&self.paths.data_dir, e))?;

        let vars = self.server_variables(&name)?;
        let env = build_env_vars(&self.settings, &vars);
        let mut hostname = vars.hostname.clone();
        if self.settings.container.append_identifier_to_hostname {
            hostname = self.identity.hostname_with_identifier(&hostname);
        }

        // Base install
        let container = &self.settings.container;
        self.docker.pull_image(&container.image).await?;
        let spec = ContainerSpec {
            name: &name,
            image: &container.image,
            env: &env,
            cpuset: self.options.cpu_affinity.as_deref(),
            data_path: &data_dir,
            mount_path: &container.mount_path,
        };
        let id = self.docker.create_container(&spec).await?;
        self.docker.start_container(&id).await?;
        tracing::info!("Waiting for the image to install the TF2 server with SourceMod...");
        self.docker.wait_for_log_line(&id, &container.ready_message).await?;
        tracing::info!("======== SRCDS installed! ========");

        if !self.options.skip_apt {
            tracing::info!("======== Upgrading the base system and installing extra packages... ========");
            for command in &container.apt_commands {
                run_checked(&self.docker, &id, "root", command).await?;
            }
        }

        tracing::info!("======== Killing the container for server configuration... ========");
        self.docker.kill_container(&id).await?;

        // Configuration
        edit_file(&data_dir, SERVER_CFG, "^hostname.*", &format!("hostname {}", hostname))?;
        edit_file(
            &data_dir,
            SERVER_CFG,
            "^rcon_password.*",
            &format!("rcon_password {}", vars.rcon_password),
        )?;

        let profiles = Profile::chain(&self.paths.profiles_dir, self.identity.profile());
        for profile in &profiles {
            profile.apply(&data_dir)?;
        }

        let hook_ctx = HookContext {
            identity: &self.identity,
            data_dir: &data_dir,
            docker: &self.docker,
            container_id: &id,
            settings: &self.settings.profile,
        };
        self.hooks
            .run_all(&self.settings.profile.preinstall_hooks, &hook_ctx)
            .await?;

        // Plugins
        let http = HttpClient::new()?;
        let profile_dir = self.paths.profiles_dir.join(self.identity.profile());
        let install_ctx = InstallContext {
            http: &http,
            data_dir: &data_dir,
            downloads_dir: &self.paths.downloads_dir,
            profile_dir: &profile_dir,
            instance_number: self.identity.instance(),
            sbpp: self.settings.sbpp.as_ref(),
        };
        let mut deferred = self.install_plugins(&data_dir, &install_ctx, reuse).await?;

        tracing::info!("======== Plugin installation complete, starting the container... ========");
        self.docker.start_container(&id).await?;

        let addr = SocketAddr::new(host_ip, vars.port);
        let probe = A2sProbe::default();
        let reachable: ServerReachable = wait_until_reachable(&probe, addr).await?;

        tracing::info!("======== Reconfiguring plugins... ========");
        deferred.drain(&reachable, &self.installers, &install_ctx).await?;
        if let Some(selected) = profiles.last() {
            let merged = selected.reconfigure(&data_dir)?;
            tracing::info!("Merged {} reconfigure file(s) from \"{}\"", merged, selected.name);
        }

        tracing::info!("======== Configuration complete, restarting the container... ========");
        self.docker.restart_container(&id).await?;

        if !self.options.no_wait {
            wait_until_reachable(&probe, addr).await?;
        }
        tracing::info!("{} is ready at {}", name, addr);
        Ok(())
    }

    async fn clear_existing(&self, name: &str) -> Result<(), ProvisionError> {
        let existing = self.docker.list_by_name(name).await?;
        if existing.is_empty() {
            tracing::info!("No conflictingly named containers found.");
            return Ok(());
        }

        let ids: Vec<String> = existing.iter().filter_map(|c| c.id.clone()).collect();
        if !self.options.overwrite {
            return Err(ProvisionError::ContainerExists {
                name: name.to_string(),
                ids,
            });
        }

        tracing::warn!("Overwriting pre-existing containers!");
        for container in &existing {
            let Some(id) = container.id.as_deref() else {
                continue;
            };
            if container.state.as_deref() == Some("running") {
                self.docker.kill_container(id).await?;
            }
            self.docker.remove_container(id).await?;
        }
        Ok(())
    }

    fn server_variables(&self, name: &str) -> Result<ServerVariables, ProvisionError> {
        let srcds = &self.settings.srcds;
        let password = resolve_password(&srcds.pw, "SRCDS_PW", name, &self.paths.passwords_dir)?;
        let rcon_password =
            resolve_password(&srcds.rconpw, "SRCDS_RCONPW", name, &self.paths.passwords_dir)?;

        let port = self.identity.port(srcds.start_port)?;
        let tv_port = self.identity.port(srcds.tv_start_port)?;
        tracing::info!("SRCDS port set to {}, SourceTV port set to {}", port, tv_port);

        if self.settings.credentials.login_token.len() != LOGIN_TOKEN_LEN {
            tracing::warn!(
                "No game server login token configured (credentials.login_token). \
                 Without one the server may not be listed or reachable. \
                 Create one at https://steamcommunity.com/dev/managegameservers"
            );
        }

        Ok(ServerVariables {
            port,
            tv_port,
            hostname: srcds.hostname.clone(),
            password,
            rcon_password,
        })
    }

    async fn install_plugins(
        &self,
        data_dir: &Path,
        ctx: &InstallContext<'_>,
        reuse: bool,
    ) -> Result<DeferredQueue, ProvisionError> {
        let plugins = &self.settings.plugins;
        tracing::info!("======== Installing plugins... ========");

        enable_bundled(data_dir, &plugins.enable)?;
        disable_bundled(data_dir, &plugins.disable)?;

        let request = InstallationRequest::parse(&plugins.requested)?;
        let catalog = if request.is_empty() {
            None
        } else {
            Some(PluginCatalog::load(&self.paths.root.join(&plugins.catalog))?)
        };

        let mut deferred = DeferredQueue::new();
        if let Some(catalog) = &catalog {
            let planner = Planner::new(catalog, plugins.expand_requires_unconditionally);
            let mut fetcher = PluginFetcher::new(catalog, &self.installers, *ctx, reuse);
            let installed = fetcher.install_request(&request, &planner).await?;
            tracing::info!("Installed {} plugin(s)", installed.len());
            deferred = fetcher.into_deferred();
        }

        if self.options.with_sbpp {
            let install = CustomInstall {
                script_reference: SOURCEBANS.to_string(),
                function_to_call: None,
                defer_until_post_install: false,
            };
            self.installers.run(&install, ctx).await?;
        }
        Ok(deferred)
    }
}
