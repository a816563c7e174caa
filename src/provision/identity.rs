// Run identity - container naming, ports and generated passwords for one server

use crate::provision::ProvisionError;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Profile, region and instance number of the server being provisioned
///
/// Only built through `new`, so `instance` is never 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentity {
    profile: String,
    region: String,
    instance: u32,
}

fn lowercase_alpha(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_lowercase())
}

impl RunIdentity {
    pub fn new(profile: &str, region: &str, instance: u32) -> Result<Self, ProvisionError> {
        if !lowercase_alpha(profile) {
            return Err(ProvisionError::InvalidIdentity(format!(
                "profile name \"{}\" must be lowercase letters only",
                profile
            )));
        }
        if !lowercase_alpha(region) {
            return Err(ProvisionError::InvalidIdentity(format!(
                "region name \"{}\" must be lowercase letters only",
                region
            )));
        }
        if instance == 0 {
            return Err(ProvisionError::InvalidIdentity(
                "instance number must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            profile: profile.to_string(),
            region: region.to_string(),
            instance,
        })
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Instance number, at least 1
    pub fn instance(&self) -> u32 {
        self.instance
    }

    /// Zero-based position of this instance within its region
    pub fn instance_index(&self) -> u32 {
        self.instance.saturating_sub(1)
    }

    /// e.g. "tf2-default-dallas-1"
    pub fn container_name(&self) -> String {
        format!("tf2-{}-{}-{}", self.profile, self.region, self.instance)
    }

    /// Each instance in a region gets the next port up from `start`
    pub fn port(&self, start: u16) -> Result<u16, ProvisionError> {
        u32::from(start)
            .checked_add(self.instance_index())
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| {
                ProvisionError::InvalidIdentity(format!(
                    "instance {} pushes port {} out of range",
                    self.instance, start
                ))
            })
    }

    /// Hostname with " | region | instance" appended
    pub fn hostname_with_identifier(&self, hostname: &str) -> String {
        format!("{} | {} | {}", hostname, self.region, self.instance)
    }
}

pub fn generate_password() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Resolve a password setting. "random" is replaced with a generated password,
/// which is saved to `<dir>/<container>_<key>.txt`.
pub fn resolve_password(
    value: &str,
    key: &str,
    container_name: &str,
    passwords_dir: &Path,
) -> Result<String, ProvisionError> {
    if value != "random" {
        return Ok(value.to_string());
    }

    let password = generate_password();
    let path: PathBuf = passwords_dir.join(format!("{}_{}.txt", container_name, key));
    fs::write(&path, format!("{}\n", password)).map_err(|e| ProvisionError::io(&path, e))?;
    tracing::info!(
        "The {} has been randomized and saved to {:?}",
        key,
        path
    );
    Ok(password)
}
