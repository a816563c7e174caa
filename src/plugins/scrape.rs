// Forum thread scraping - pulls download candidates out of a plugin thread page

use crate::plugins::catalog::ArchiveFormat;
use crate::plugins::error::PluginError;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Url;
use scraper::{Html, Selector};

lazy_static! {
    static ref LINKS: Selector = Selector::parse("a[href]").expect("static selector");
    static ref ATTACHMENT_LINK: Regex =
        Regex::new(r"^(?:https?://forums\.alliedmods\.net)?/?attachment\.php\?").expect("static regex");
    static ref COMPILER_LINK: Regex =
        Regex::new(r"^https://www\.sourcemod\.net/vbcompiler\.php\?file_id=\d+$").expect("static regex");
}

/// An attachment link and the archive format its file name advertises
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentLink {
    pub href: String,
    pub format: ArchiveFormat,
}

/// Both candidate sets found on a thread page, in page order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapedLinks {
    pub attachments: Vec<AttachmentLink>,
    pub compilers: Vec<String>,
}

impl ScrapedLinks {
    pub fn attachment_hrefs(&self) -> Vec<String> {
        self.attachments.iter().map(|a| a.href.clone()).collect()
    }

    pub fn attachment_format(&self, href: &str) -> Option<ArchiveFormat> {
        self.attachments
            .iter()
            .find(|a| a.href == href)
            .map(|a| a.format)
    }
}

/// Extract attachment archives and plugin compiler links from a thread page.
///
/// An attachment only counts when its link text names a zip or tarball; the
/// compiled-plugin links are the forum's "Get Plugin" links.
pub fn scrape_links(page: &str) -> ScrapedLinks {
    let document = Html::parse_document(page);
    let mut links = ScrapedLinks::default();

    for anchor in document.select(&LINKS) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let href = href.trim();

        if ATTACHMENT_LINK.is_match(href) {
            let text: String = anchor.text().collect();
            match ArchiveFormat::from_file_name(&text) {
                Some(format) if format.is_archive() => links.attachments.push(AttachmentLink {
                    href: href.to_string(),
                    format,
                }),
                _ => tracing::debug!("Ignoring non-archive attachment {:?} ({})", text.trim(), href),
            }
        } else if COMPILER_LINK.is_match(href) {
            links.compilers.push(href.to_string());
        }
    }

    links
}

/// Decode any leftover percent escaping in a selected link and make it
/// absolute relative to the thread it was found on.
pub fn resolve_download_url(thread_url: &str, href: &str) -> Result<String, PluginError> {
    let invalid = |reason: String| PluginError::InvalidUrl {
        url: href.to_string(),
        reason,
    };

    let decoded = urlencoding::decode(href).map_err(|e| invalid(e.to_string()))?;
    let base = Url::parse(thread_url).map_err(|e| invalid(format!("bad thread URL: {}", e)))?;
    let url = base.join(&decoded).map_err(|e| invalid(e.to_string()))?;
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREAD: &str = "https://forums.alliedmods.net/showthread.php?t=156974";

    const PAGE: &str = r#"
        <html><body>
        <div class="attachments">
            <a href="attachment.php?s=abc&amp;attachmentid=1001&amp;d=1600000000">mapchooser_extended-1.10.2.zip</a>
            <a href="attachment.php?s=abc&amp;attachmentid=1002&amp;d=1600000001">screenshot.png</a>
            <a href="attachment.php?attachmentid=1003&amp;d=1600000002"><img src="zip.gif"></a>
            <a href="attachment.php?attachmentid=1004&amp;d=1600000003">translations.tar.gz</a>
            <a href="https://www.sourcemod.net/vbcompiler.php?file_id=12345">Get Plugin</a>
            <a href="https://www.sourcemod.net/vbcompiler.php?file_id=12346">Get Plugin</a>
            <a href="showthread.php?t=1">another thread</a>
        </div>
        </body></html>
    "#;

    #[test]
    fn test_scrape_both_candidate_sets() {
        let links = scrape_links(PAGE);
        assert_eq!(
            links.attachment_hrefs(),
            vec![
                "attachment.php?s=abc&attachmentid=1001&d=1600000000".to_string(),
                "attachment.php?attachmentid=1004&d=1600000003".to_string(),
            ]
        );
        assert_eq!(
            links.attachment_format("attachment.php?attachmentid=1004&d=1600000003"),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(
            links.compilers,
            vec![
                "https://www.sourcemod.net/vbcompiler.php?file_id=12345",
                "https://www.sourcemod.net/vbcompiler.php?file_id=12346",
            ]
        );
    }

    #[test]
    fn test_scrape_empty_page() {
        assert_eq!(scrape_links("<html></html>"), ScrapedLinks::default());
    }

    #[test]
    fn test_resolve_relative_attachment() {
        let url = resolve_download_url(THREAD, "attachment.php?attachmentid=1001%26d%3D16").unwrap();
        assert_eq!(
            url,
            "https://forums.alliedmods.net/attachment.php?attachmentid=1001&d=16"
        );
    }

    #[test]
    fn test_resolve_absolute_link() {
        let url = resolve_download_url(
            THREAD,
            "https://www.sourcemod.net/vbcompiler.php?file_id=12345",
        )
        .unwrap();
        assert_eq!(url, "https://www.sourcemod.net/vbcompiler.php?file_id=12345");
    }
}
