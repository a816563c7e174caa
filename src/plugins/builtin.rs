// Built-in custom installers - SourceBans++, SteamWorks and their config steps

use crate::archive::{extract_archive, ExtractOptions};
use crate::config::processor::{edit_file, insert_before_final_brace, keyvalues_block, resolve_in};
use crate::config::SbppSettings;
use crate::plugins::catalog::{ArchiveFormat, InstallerCall};
use crate::plugins::error::PluginError;
use crate::plugins::installers::{reject_call, CustomInstaller, InstallContext, InstallerRegistry};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::Path;

pub const SOURCEBANS: &str = "sourcebans-pp";
pub const STEAMWORKS: &str = "steamworks";
pub const CONFIGURE_SOURCEBANS: &str = "configure-sbpp";
pub const CONFIGURE_STAC_DISCORD: &str = "configure-stac-discord";

const SBPP_RELEASES_URL: &str = "https://github.com/sbpp/sourcebans-pp/releases";
const STEAMWORKS_BUILDS_URL: &str = "https://users.alliedmods.net/~kyles/builds/SteamWorks/";

const DATABASES_CFG: &str = "tf/addons/sourcemod/configs/databases.cfg";
const SOURCEBANS_CFG: &str = "tf/addons/sourcemod/configs/sourcebans/sourcebans.cfg";
const DISCORD_CFG: &str = "tf/addons/sourcemod/configs/discord.cfg";
const DEFAULT_WEBHOOK_FILE: &str = "stac-webhook-url.txt";

lazy_static! {
    static ref SBPP_PLUGIN_RELEASE: Regex = Regex::new(
        r#"href="(/sbpp/sourcebans-pp/releases/download/[0-9.]+/sourcebans-pp-[0-9.]+\.plugin-only\.tar\.gz)""#
    )
    .expect("static regex");
    static ref STEAMWORKS_BUILD: Regex =
        Regex::new(r#"href="(SteamWorks-git(\d+)-linux\.tar\.gz)""#).expect("static regex");
}

pub fn register_builtins(registry: &mut InstallerRegistry) {
    registry.register(SOURCEBANS, Box::new(SourceBansInstaller));
    registry.register(STEAMWORKS, Box::new(SteamWorksInstaller));
    registry.register(CONFIGURE_SOURCEBANS, Box::new(ConfigureSourceBans));
    registry.register(CONFIGURE_STAC_DISCORD, Box::new(ConfigureStacDiscord));
}

fn require_sbpp<'a>(installer: &str, ctx: &InstallContext<'a>) -> Result<&'a SbppSettings, PluginError> {
    ctx.sbpp
        .ok_or_else(|| PluginError::installer(installer, "no [sbpp] settings configured"))
}

/// Download a tarball rooted at `addons/` and merge it into the server's addons
async fn install_addons_tarball(
    ctx: &InstallContext<'_>,
    url: &str,
    file_name: &str,
    normalize_permissions: bool,
) -> Result<(), PluginError> {
    let archive = ctx.downloads_dir.join(file_name);
    ctx.http.download_to_file(url, &archive).await?;

    let options = ExtractOptions {
        strip_leading_directory: true,
        expect_root: Some("addons"),
        normalize_permissions,
    };
    extract_archive(
        &archive,
        ArchiveFormat::TarGz,
        &ctx.data_dir.join("tf/addons"),
        &options,
    )?;
    Ok(())
}

/// Latest SourceBans++ server plugin plus its database entry
pub struct SourceBansInstaller;

#[async_trait]
impl CustomInstaller for SourceBansInstaller {
    async fn install(
        &self,
        ctx: &InstallContext<'_>,
        call: Option<&InstallerCall>,
    ) -> Result<(), PluginError> {
        reject_call(SOURCEBANS, call)?;
        let sbpp = require_sbpp(SOURCEBANS, ctx)?;

        tracing::info!("Looking up the latest SourceBans++ release...");
        let page = ctx.http.get_text(SBPP_RELEASES_URL).await?;
        let latest = SBPP_PLUGIN_RELEASE
            .captures(&page)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| {
                PluginError::installer(SOURCEBANS, format!("no plugin-only release found on {}", SBPP_RELEASES_URL))
            })?;
        let url = format!("https://github.com{}", latest);
        tracing::info!("Latest SourceBans++ plugin: {}", url);

        install_addons_tarball(ctx, &url, "sourcebans-pp-latest.plugin-only.tar.gz", true).await?;

        let port = sbpp.db_port.to_string();
        // SourceMod waits 60s when the timeout is left at 0
        let block = keyvalues_block(
            "sourcebans",
            &[
                ("driver", "default"),
                ("host", sbpp.db_host.as_str()),
                ("database", sbpp.db_name.as_str()),
                ("user", sbpp.db_user.as_str()),
                ("pass", sbpp.db_pass.as_str()),
                ("timeout", "10"),
                ("port", port.as_str()),
            ],
        );
        insert_before_final_brace(ctx.data_dir, DATABASES_CFG, &block)?;
        tracing::info!("SourceBans++ installed");
        Ok(())
    }
}

/// Newest Linux build of the SteamWorks extension
pub struct SteamWorksInstaller;

#[async_trait]
impl CustomInstaller for SteamWorksInstaller {
    async fn install(
        &self,
        ctx: &InstallContext<'_>,
        call: Option<&InstallerCall>,
    ) -> Result<(), PluginError> {
        reject_call(STEAMWORKS, call)?;

        let page = ctx.http.get_text(STEAMWORKS_BUILDS_URL).await?;
        let latest = STEAMWORKS_BUILD
            .captures_iter(&page)
            .filter_map(|c| {
                let build: u64 = c.get(2)?.as_str().parse().ok()?;
                Some((build, c.get(1)?.as_str().to_string()))
            })
            .max_by_key(|(build, _)| *build)
            .map(|(_, file)| file)
            .ok_or_else(|| {
                PluginError::installer(STEAMWORKS, format!("no Linux builds listed on {}", STEAMWORKS_BUILDS_URL))
            })?;
        tracing::info!("Latest SteamWorks build: {}", latest);

        let url = format!("{}{}", STEAMWORKS_BUILDS_URL, latest);
        install_addons_tarball(ctx, &url, "steamworks-latest.tar.gz", false).await?;
        tracing::info!("SteamWorks installed");
        Ok(())
    }
}

/// Points the SourceBans++ plugin at this server's table prefix, id and web panel
pub struct ConfigureSourceBans;

#[async_trait]
impl CustomInstaller for ConfigureSourceBans {
    async fn install(
        &self,
        ctx: &InstallContext<'_>,
        call: Option<&InstallerCall>,
    ) -> Result<(), PluginError> {
        reject_call(CONFIGURE_SOURCEBANS, call)?;
        let sbpp = require_sbpp(CONFIGURE_SOURCEBANS, ctx)?;

        let edits = [
            (
                r#""DatabasePrefix"[ \t]+"[^"]*""#,
                format!("\"DatabasePrefix\"\t\"{}\"", sbpp.db_table_prefix),
            ),
            (
                r#""ServerID"[ \t]+"[^"]*""#,
                format!("\"ServerID\"\t\t\"{}\"", ctx.instance_number),
            ),
            (
                r#""Website"[ \t]+"[^"]*""#,
                format!("\"Website\"\t\t\t\"{}\"", sbpp.webpanel_url),
            ),
        ];
        for (pattern, replacement) in &edits {
            edit_file(ctx.data_dir, SOURCEBANS_CFG, pattern, replacement)?;
        }
        tracing::info!("SourceBans++ plugin configured");
        Ok(())
    }
}

/// Adds the StAC webhook to discord.cfg.
///
/// Function `set_webhook` takes either `url`, or `url_file` naming a file in
/// the profile's direct-copy tree. Without a call the default file is used.
pub struct ConfigureStacDiscord;

impl ConfigureStacDiscord {
    fn webhook_url(ctx: &InstallContext<'_>, call: Option<&InstallerCall>) -> Result<String, PluginError> {
        if let Some(call) = call {
            if call.function != "set_webhook" {
                return Err(PluginError::UnknownInstallerFunction {
                    installer: CONFIGURE_STAC_DISCORD.to_string(),
                    function: call.function.clone(),
                });
            }
            if let Some(url) = call.args.get("url") {
                return Ok(url.trim().to_string());
            }
        }

        let file = call
            .and_then(|c| c.args.get("url_file"))
            .map(String::as_str)
            .unwrap_or(DEFAULT_WEBHOOK_FILE);
        let path = resolve_in(&ctx.profile_dir.join("direct-copy"), Path::new(file))?;
        let url = std::fs::read_to_string(&path).map_err(|e| PluginError::io(&path, e))?;
        Ok(url.trim().to_string())
    }
}

#[async_trait]
impl CustomInstaller for ConfigureStacDiscord {
    async fn install(
        &self,
        ctx: &InstallContext<'_>,
        call: Option<&InstallerCall>,
    ) -> Result<(), PluginError> {
        let url = Self::webhook_url(ctx, call)?;
        if url.is_empty() {
            return Err(PluginError::installer(CONFIGURE_STAC_DISCORD, "webhook URL is empty"));
        }
        let block = keyvalues_block("stac", &[("url", url.as_str())]);
        insert_before_final_brace(ctx.data_dir, DISCORD_CFG, &block)?;
        tracing::info!("StAC Discord webhook configured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::fake::{tar_gz, FakeHttp};
    use crate::plugins::catalog::CustomInstall;
    use std::fs;

    fn sbpp() -> SbppSettings {
        SbppSettings {
            db_host: "db.example.com".to_string(),
            db_port: 3306,
            db_name: "sourcebans".to_string(),
            db_user: "sb".to_string(),
            db_pass: "hunter2".to_string(),
            db_table_prefix: "sbpp".to_string(),
            webpanel_url: "https://bans.example.com/".to_string(),
        }
    }

    fn context<'a>(
        http: &'a FakeHttp,
        root: &'a Path,
        sbpp: Option<&'a SbppSettings>,
    ) -> InstallContext<'a> {
        InstallContext {
            http,
            data_dir: root,
            downloads_dir: root,
            profile_dir: root,
            instance_number: 2,
            sbpp,
        }
    }

    fn custom(name: &str, call: Option<InstallerCall>) -> CustomInstall {
        CustomInstall {
            script_reference: name.to_string(),
            function_to_call: call,
            defer_until_post_install: false,
        }
    }

    #[tokio::test]
    async fn test_sourcebans_install() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let downloads = dir.path().join("downloads");
        fs::create_dir_all(data.join("tf/addons/sourcemod/configs")).unwrap();
        fs::create_dir_all(&downloads).unwrap();
        fs::write(
            data.join(DATABASES_CFG),
            "\"Databases\"\n{\n\t\"driver_default\"\t\"mysql\"\n}\n",
        )
        .unwrap();

        let release = "/sbpp/sourcebans-pp/releases/download/1.8.0/sourcebans-pp-1.8.0.plugin-only.tar.gz";
        let http = FakeHttp::new()
            .page(
                SBPP_RELEASES_URL,
                &format!(
                    r#"<a href="{}">plugin</a><a href="/sbpp/sourcebans-pp/releases/download/1.7.0/sourcebans-pp-1.7.0.plugin-only.tar.gz">old</a>"#,
                    release
                ),
            )
            .file(
                &format!("https://github.com{}", release),
                tar_gz(&[("addons/sourcemod/plugins/sbpp_main.smx", "smx")]),
            );
        let settings = sbpp();
        let ctx = InstallContext {
            downloads_dir: &downloads,
            ..context(&http, &data, Some(&settings))
        };

        InstallerRegistry::with_builtins()
            .run(&custom(SOURCEBANS, None), &ctx)
            .await
            .unwrap();

        assert!(data.join("tf/addons/sourcemod/plugins/sbpp_main.smx").is_file());
        let databases = fs::read_to_string(data.join(DATABASES_CFG)).unwrap();
        assert!(databases.contains("\t\"sourcebans\"\n"));
        assert!(databases.contains("\t\t\"host\"\t\"db.example.com\"\n"));
        assert!(databases.contains("\t\t\"timeout\"\t\"10\"\n"));
        assert!(databases.ends_with("\t}\n}"));
    }

    #[tokio::test]
    async fn test_sourcebans_requires_settings() {
        let dir = tempfile::tempdir().unwrap();
        let http = FakeHttp::new();
        let err = InstallerRegistry::with_builtins()
            .run(&custom(SOURCEBANS, None), &context(&http, dir.path(), None))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::InstallerFailed { .. }));
        assert!(http.requested().is_empty());
    }

    #[tokio::test]
    async fn test_steamworks_picks_newest_build() {
        let dir = tempfile::tempdir().unwrap();
        let page = r#"
            <a href="SteamWorks-git121-linux.tar.gz">SteamWorks-git121-linux.tar.gz</a>
            <a href="SteamWorks-git132-linux.tar.gz">SteamWorks-git132-linux.tar.gz</a>
            <a href="SteamWorks-git132-windows.zip">SteamWorks-git132-windows.zip</a>
            <a href="SteamWorks-git99-linux.tar.gz">SteamWorks-git99-linux.tar.gz</a>
        "#;
        let newest = format!("{}SteamWorks-git132-linux.tar.gz", STEAMWORKS_BUILDS_URL);
        let http = FakeHttp::new().page(STEAMWORKS_BUILDS_URL, page).file(
            &newest,
            tar_gz(&[("addons/sourcemod/extensions/SteamWorks.ext.so", "so")]),
        );

        InstallerRegistry::with_builtins()
            .run(&custom(STEAMWORKS, None), &context(&http, dir.path(), None))
            .await
            .unwrap();

        assert_eq!(http.requested(), vec![STEAMWORKS_BUILDS_URL.to_string(), newest]);
        assert!(dir
            .path()
            .join("tf/addons/sourcemod/extensions/SteamWorks.ext.so")
            .is_file());
    }

    #[tokio::test]
    async fn test_configure_sourcebans() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join(SOURCEBANS_CFG);
        fs::create_dir_all(cfg.parent().unwrap()).unwrap();
        fs::write(
            &cfg,
            "\"SourceBans\"\n{\n\t\"Config\"\n\t{\n\t\t\"Website\"\t\t\t\"http://www.yourwebsite.net/\"\n\t\t\"DatabasePrefix\"\t\"sb\"\n\t\t\"ServerID\"\t\t\"-1\"\n\t}\n}\n",
        )
        .unwrap();
        let http = FakeHttp::new();
        let settings = sbpp();

        InstallerRegistry::with_builtins()
            .run(
                &custom(CONFIGURE_SOURCEBANS, None),
                &context(&http, dir.path(), Some(&settings)),
            )
            .await
            .unwrap();

        let result = fs::read_to_string(&cfg).unwrap();
        assert!(result.contains("\"Website\"\t\t\t\"https://bans.example.com/\""));
        assert!(result.contains("\"DatabasePrefix\"\t\"sbpp\""));
        assert!(result.contains("\"ServerID\"\t\t\"2\""));
    }

    #[tokio::test]
    async fn test_stac_webhook_from_profile_file() {
        let dir = tempfile::tempdir().unwrap();
        let discord = dir.path().join(DISCORD_CFG);
        fs::create_dir_all(discord.parent().unwrap()).unwrap();
        fs::write(&discord, "\"Discord\"\n{\n}\n").unwrap();
        fs::create_dir_all(dir.path().join("direct-copy")).unwrap();
        fs::write(
            dir.path().join("direct-copy").join(DEFAULT_WEBHOOK_FILE),
            "https://discord.com/api/webhooks/1/abc\n",
        )
        .unwrap();
        let http = FakeHttp::new();

        InstallerRegistry::with_builtins()
            .run(
                &custom(CONFIGURE_STAC_DISCORD, None),
                &context(&http, dir.path(), None),
            )
            .await
            .unwrap();

        assert_eq!(
            fs::read_to_string(&discord).unwrap(),
            "\"Discord\"\n{\n\n\t\"stac\"\n\t{\n\t\t\"url\"\t\"https://discord.com/api/webhooks/1/abc\"\n\t}\n}"
        );
    }

    #[tokio::test]
    async fn test_stac_webhook_unknown_function() {
        let dir = tempfile::tempdir().unwrap();
        let http = FakeHttp::new();
        let call = InstallerCall {
            function: "set_colour".to_string(),
            args: Default::default(),
        };

        let err = InstallerRegistry::with_builtins()
            .run(
                &custom(CONFIGURE_STAC_DISCORD, Some(call)),
                &context(&http, dir.path(), None),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::UnknownInstallerFunction { function, .. } if function == "set_colour"));
    }
}
