// Provisioner settings - layered TOML files plus environment overrides

use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Settings files read from the working directory, later files win
const SETTINGS_FILES: &[&str] = &[
    "default-settings.toml",
    "settings.toml",
    "sample-credentials.toml",
    "credentials.toml",
];

const ENV_PREFIX: &str = "TF2_PROVISION";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid setting {key}: {reason}")]
    Invalid { key: String, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub container: ContainerSettings,
    #[serde(default)]
    pub srcds: SrcdsSettings,
    #[serde(default)]
    pub credentials: CredentialSettings,
    #[serde(default)]
    pub plugins: PluginSettings,
    #[serde(default)]
    pub sbpp: Option<SbppSettings>,
    #[serde(default)]
    pub profile: ProfileSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerSettings {
    #[serde(default = "default_image")]
    pub image: String,
    /// Log line printed by the image once the server files are installed
    #[serde(default = "default_ready_message")]
    pub ready_message: String,
    /// Where the data directory is mounted inside the container
    #[serde(default = "default_mount_path")]
    pub mount_path: String,
    #[serde(default = "default_apt_commands")]
    pub apt_commands: Vec<String>,
    #[serde(default)]
    pub append_identifier_to_hostname: bool,
}

fn default_image() -> String {
    "cm2network/tf2:sourcemod".to_string()
}

fn default_ready_message() -> String {
    "Success! App '232250' already up to date.".to_string()
}

fn default_mount_path() -> String {
    "/home/steam/tf-dedicated/".to_string()
}

fn default_apt_commands() -> Vec<String> {
    vec![
        "apt update".to_string(),
        "apt full-upgrade -y".to_string(),
        "apt install net-tools procps vim -y".to_string(),
        "apt autoremove --purge -y".to_string(),
    ]
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            image: default_image(),
            ready_message: default_ready_message(),
            mount_path: default_mount_path(),
            apt_commands: default_apt_commands(),
            append_identifier_to_hostname: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SrcdsSettings {
    #[serde(default = "default_start_port")]
    pub start_port: u16,
    #[serde(default = "default_tv_start_port")]
    pub tv_start_port: u16,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Server password, or "random"
    #[serde(default)]
    pub pw: String,
    /// RCON password, or "random"
    #[serde(default = "default_random")]
    pub rconpw: String,
    /// Extra variables passed to the image as SRCDS_<KEY>
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_start_port() -> u16 {
    27015
}

fn default_tv_start_port() -> u16 {
    27020
}

fn default_hostname() -> String {
    "TF2 Server".to_string()
}

fn default_random() -> String {
    "random".to_string()
}

impl Default for SrcdsSettings {
    fn default() -> Self {
        Self {
            start_port: default_start_port(),
            tv_start_port: default_tv_start_port(),
            hostname: default_hostname(),
            pw: String::new(),
            rconpw: default_random(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialSettings {
    /// Game server login token from steamcommunity.com/dev/managegameservers
    #[serde(default)]
    pub login_token: String,
    #[serde(default)]
    pub steam_web_api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginSettings {
    #[serde(default = "default_catalog")]
    pub catalog: PathBuf,
    /// Comma-separated plugin requests, e.g. "nativevotes, mapchooser[nominations]"
    #[serde(default)]
    pub requested: String,
    /// Bundled SourceMod plugins to move out of plugins/disabled
    #[serde(default)]
    pub enable: String,
    /// Bundled SourceMod plugins to delete
    #[serde(default)]
    pub disable: String,
    #[serde(default)]
    pub expand_requires_unconditionally: bool,
}

fn default_catalog() -> PathBuf {
    PathBuf::from("plugins.json")
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            catalog: default_catalog(),
            requested: String::new(),
            enable: String::new(),
            disable: String::new(),
            expand_requires_unconditionally: false,
        }
    }
}

/// SourceBans++ database and web panel settings
#[derive(Debug, Clone, Deserialize)]
pub struct SbppSettings {
    pub db_host: String,
    #[serde(default = "default_db_port")]
    pub db_port: u16,
    pub db_name: String,
    pub db_user: String,
    pub db_pass: String,
    #[serde(default = "default_table_prefix")]
    pub db_table_prefix: String,
    pub webpanel_url: String,
}

fn default_db_port() -> u16 {
    3306
}

fn default_table_prefix() -> String {
    "sb".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileSettings {
    /// Named setup hooks run after profile files are copied
    #[serde(default)]
    pub preinstall_hooks: Vec<String>,
    /// Daemon script in the data directory started by the entry script
    #[serde(default = "default_daemon")]
    pub daemon: String,
    /// Added to the map rotation offset of every instance
    #[serde(default)]
    pub rotation_offset: u32,
}

fn default_daemon() -> String {
    "varietyd".to_string()
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            preinstall_hooks: Vec::new(),
            daemon: default_daemon(),
            rotation_offset: 0,
        }
    }
}

impl Settings {
    /// Load layered settings from `root`, then the profile, then the environment
    pub fn load(root: &Path, profile: &str) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();
        for name in SETTINGS_FILES {
            builder = builder.add_source(File::from(root.join(name)).required(false));
        }
        let profile_settings = root.join("profiles").join(profile).join("settings.toml");
        builder = builder.add_source(File::from(profile_settings).required(false));
        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.container.image.trim().is_empty() {
            return Err(SettingsError::Invalid {
                key: "container.image".to_string(),
                reason: "cannot be empty".to_string(),
            });
        }
        if self.container.ready_message.trim().is_empty() {
            return Err(SettingsError::Invalid {
                key: "container.ready_message".to_string(),
                reason: "cannot be empty".to_string(),
            });
        }
        for key in self.srcds.env.keys() {
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(SettingsError::Invalid {
                    key: format!("srcds.env.{}", key),
                    reason: "must be alphanumeric".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Run-specific values that end up in the container environment
#[derive(Debug, Clone)]
pub struct ServerVariables {
    pub port: u16,
    pub tv_port: u16,
    pub hostname: String,
    pub password: String,
    pub rcon_password: String,
}

/// Build the environment for the image's first run
pub fn build_env_vars(
    settings: &Settings,
    vars: &ServerVariables,
) -> HashMap<String, String> {
    let mut env = HashMap::new();

    for (key, value) in &settings.srcds.env {
        let key = key.to_uppercase();
        let key = if key.starts_with("SRCDS_") {
            key
        } else {
            format!("SRCDS_{}", key)
        };
        env.insert(key, value.clone());
    }

    env.insert("SRCDS_PORT".to_string(), vars.port.to_string());
    env.insert("SRCDS_TV_PORT".to_string(), vars.tv_port.to_string());
    env.insert("SRCDS_HOSTNAME".to_string(), vars.hostname.clone());
    env.insert("SRCDS_PW".to_string(), vars.password.clone());
    env.insert("SRCDS_RCONPW".to_string(), vars.rcon_password.clone());
    env.insert("SRCDS_TOKEN".to_string(), settings.credentials.login_token.clone());
    env.insert(
        "SRCDS_WORKSHOP_AUTHKEY".to_string(),
        settings.credentials.steam_web_api_key.clone(),
    );

    env
}
