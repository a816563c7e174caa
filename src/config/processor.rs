// Config file processor - pattern edits on server config files inside the data directory

use lazy_static::lazy_static;
use regex::{NoExpand, Regex, RegexBuilder};
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

lazy_static! {
    // Closing brace of a KeyValues file plus trailing newlines
    static ref FINAL_BRACE: Regex = Regex::new(r"\}\n*\z").expect("static regex");
}

#[derive(Error, Debug)]
pub enum ConfigEditError {
    #[error("Failed to access config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid edit pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Config path must be relative to the server root: {}", .0.display())]
    NotRelative(PathBuf),

    #[error("No closing brace found in {}", .0.display())]
    NoClosingBrace(PathBuf),
}

/// Resolve `rel` under `base`, refusing absolute paths and `..`
pub fn resolve_in(base: &Path, rel: &Path) -> Result<PathBuf, ConfigEditError> {
    let ok = rel
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !ok || rel.as_os_str().is_empty() {
        return Err(ConfigEditError::NotRelative(rel.to_path_buf()));
    }
    Ok(base.join(rel))
}

fn read(path: &Path) -> Result<String, ConfigEditError> {
    std::fs::read_to_string(path).map_err(|source| ConfigEditError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write(path: &Path, content: &str) -> Result<(), ConfigEditError> {
    std::fs::write(path, content).map_err(|source| ConfigEditError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Replace every match of a multi-line `pattern` with the literal `replacement`
pub fn replace_pattern(
    content: &str,
    pattern: &str,
    replacement: &str,
) -> Result<String, ConfigEditError> {
    let re = RegexBuilder::new(pattern)
        .multi_line(true)
        .build()
        .map_err(|source| ConfigEditError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
    Ok(re.replace_all(content, NoExpand(replacement)).into_owned())
}

/// Apply [`replace_pattern`] to a file under the server root.
/// Returns Ok(true) if the file changed.
pub fn edit_file(
    base: &Path,
    rel: impl AsRef<Path>,
    pattern: &str,
    replacement: &str,
) -> Result<bool, ConfigEditError> {
    let path = resolve_in(base, rel.as_ref())?;
    let content = read(&path)?;
    let new_content = replace_pattern(&content, pattern, replacement)?;

    if new_content != content {
        write(&path, &new_content)?;
        tracing::info!("Updated config file: {:?}", path);
        Ok(true)
    } else {
        tracing::warn!("Pattern {:?} matched nothing in {:?}", pattern, path);
        Ok(false)
    }
}

/// Insert a KeyValues block just before the closing brace of the file
pub fn insert_before_final_brace(
    base: &Path,
    rel: impl AsRef<Path>,
    block: &str,
) -> Result<(), ConfigEditError> {
    let path = resolve_in(base, rel.as_ref())?;
    let content = read(&path)?;
    if !FINAL_BRACE.is_match(&content) {
        return Err(ConfigEditError::NoClosingBrace(path));
    }
    let replacement = format!("{}}}", block);
    let new_content = FINAL_BRACE.replace(&content, NoExpand(&replacement));
    write(&path, &new_content)?;
    tracing::info!("Inserted block into {:?}", path);
    Ok(())
}

/// Format a KeyValues section the way SourceMod's own configs are laid out
pub fn keyvalues_block(name: &str, entries: &[(&str, &str)]) -> String {
    let mut block = format!("\n\t\"{}\"\n\t{{\n", name);
    for (key, value) in entries {
        block.push_str(&format!("\t\t\"{}\"\t\"{}\"\n", key, value));
    }
    block.push_str("\t}\n");
    block
}

/// Merge reconfigure overrides into a file's contents. Every non-empty,
/// non-comment override line replaces the lines that start with its first word.
pub fn merge_overrides(content: &str, overrides: &str) -> Result<String, ConfigEditError> {
    let mut merged = content.to_string();
    for line in overrides.lines() {
        if line.trim().is_empty() || line.starts_with("//") {
            continue;
        }
        let key = line.split(' ').next().unwrap_or(line);
        tracing::debug!("Substituting lines starting with \"{}\"", key);
        merged = replace_pattern(&merged, &format!("^{}.*", regex::escape(key)), line)?;
    }
    Ok(merged)
}

/// Merge an override file into the matching server file
pub fn reconfigure_file(overrides: &Path, target: &Path) -> Result<(), ConfigEditError> {
    let merged = merge_overrides(&read(target)?, &read(overrides)?)?;
    write(target, &merged)?;
    tracing::info!("Reconfigured {:?} from {:?}", target, overrides);
    Ok(())
}

/// Append a profile file to the matching server file, separated by a newline
pub fn append_file(addition: &Path, target: &Path) -> Result<(), ConfigEditError> {
    let mut content = read(target)?;
    content.push('\n');
    content.push_str(&read(addition)?);
    write(target, &content)?;
    tracing::info!("Appended {:?} to {:?}", addition, target);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_server_cfg_replacement() {
        let content = "// server.cfg\nhostname \"Team Fortress\"\nrcon_password \"\"\nsv_cheats 0\n";
        let result = replace_pattern(content, "^hostname.*", "hostname My $1 Server").unwrap();
        assert!(result.contains("hostname My $1 Server\n"));
        assert!(result.contains("rcon_password \"\""));
    }

    #[test]
    fn test_edit_file_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            edit_file(dir.path(), "../server.cfg", "a", "b"),
            Err(ConfigEditError::NotRelative(_))
        ));
        assert!(matches!(
            edit_file(dir.path(), "/etc/passwd", "a", "b"),
            Err(ConfigEditError::NotRelative(_))
        ));
    }

    #[test]
    fn test_insert_before_final_brace() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("databases.cfg"),
            "\"Databases\"\n{\n\t\"driver_default\"\t\"mysql\"\n}\n\n",
        )
        .unwrap();

        let block = keyvalues_block("sourcebans", &[("driver", "default"), ("host", "db")]);
        insert_before_final_brace(dir.path(), "databases.cfg", &block).unwrap();

        let result = fs::read_to_string(dir.path().join("databases.cfg")).unwrap();
        assert_eq!(
            result,
            "\"Databases\"\n{\n\t\"driver_default\"\t\"mysql\"\n\n\t\"sourcebans\"\n\t{\n\t\t\"driver\"\t\"default\"\n\t\t\"host\"\t\"db\"\n\t}\n}"
        );
    }

    #[test]
    fn test_merge_overrides() {
        let content = "sm_nextmap_enabled 0\nsm_vote_delay 30\nsm_vote_delay_extra 5\nother 1\n";
        let overrides = "// comment\n\nsm_vote_delay 10\nsm_nextmap_enabled 1\n";
        let merged = merge_overrides(content, overrides).unwrap();
        // Keys match by prefix
        assert_eq!(
            merged,
            "sm_nextmap_enabled 1\nsm_vote_delay 10\nsm_vote_delay 10\nother 1\n"
        );
    }

    #[test]
    fn test_append_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("mapcycle.txt");
        let addition = dir.path().join("extra.txt");
        fs::write(&target, "cp_badlands\n").unwrap();
        fs::write(&addition, "koth_harvest\n").unwrap();

        append_file(&addition, &target).unwrap();
        assert_eq!(
            fs::read_to_string(&target).unwrap(),
            "cp_badlands\n\nkoth_harvest\n"
        );
    }
}
