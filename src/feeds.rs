//! robots.txt, sitemap and RSS rendering for the public catalog.

use std::fmt::Write as _;

use crate::catalog::Video;

/// Videos included in the RSS feed.
pub const RSS_ITEM_LIMIT: u32 = 50;
/// Characters of a description kept in an RSS item.
pub const RSS_DESCRIPTION_CHARS: usize = 300;

pub fn watch_url(base_url: &str, slug: &str) -> String {
    format!("{base_url}/v/{slug}")
}

pub fn robots_txt(base_url: &str) -> String {
    format!("User-agent: *\nAllow: /\nSitemap: {base_url}/sitemap.xml\n")
}

pub fn sitemap_xml(base_url: &str, videos: &[Video]) -> String {
    let mut out = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <urlset xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\">\n",
    );
    let _ = writeln!(out, "  <url><loc>{}/</loc></url>", xml_escape(base_url));
    for video in videos {
        let _ = writeln!(
            out,
            "  <url>\n    <loc>{}</loc>\n    <lastmod>{}</lastmod>\n  </url>",
            xml_escape(&watch_url(base_url, &video.slug)),
            video.updated_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        );
    }
    out.push_str("</urlset>\n");
    out
}

pub fn rss_xml(site_name: &str, base_url: &str, videos: &[Video]) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<rss version=\"2.0\"><channel>\n");
    let _ = writeln!(out, "  <title>{}</title>", xml_escape(site_name));
    let _ = writeln!(out, "  <link>{}</link>", xml_escape(base_url));
    out.push_str("  <description>Latest videos</description>\n");
    for video in videos {
        let link = xml_escape(&watch_url(base_url, &video.slug));
        let description: String = video
            .description
            .as_deref()
            .unwrap_or_default()
            .chars()
            .take(RSS_DESCRIPTION_CHARS)
            .collect();
        let _ = writeln!(
            out,
            "  <item>\n    <title>{}</title>\n    <link>{link}</link>\n    <guid>{link}</guid>\n    <pubDate>{}</pubDate>\n    <description>{}</description>\n  </item>",
            xml_escape(&video.title),
            video.created_at.to_rfc2822(),
            xml_escape(&description),
        );
    }
    out.push_str("</channel></rss>\n");
    out
}

fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn video(slug: &str, title: &str, description: Option<&str>) -> Video {
        Video {
            id: 1,
            title: title.into(),
            slug: slug.into(),
            description: description.map(str::to_string),
            tags: None,
            filename: "secret.mp4".into(),
            mime: "video/mp4".into(),
            size_bytes: 10,
            is_published: true,
            views: 0,
            created_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2024, 2, 3, 4, 5, 6).unwrap(),
        }
    }

    #[test]
    fn robots_points_at_sitemap() {
        assert_eq!(
            robots_txt("https://videy.test"),
            "User-agent: *\nAllow: /\nSitemap: https://videy.test/sitemap.xml\n"
        );
    }

    #[test]
    fn sitemap_lists_root_and_watch_pages() {
        let xml = sitemap_xml("https://videy.test", &[video("cats", "Cats", None)]);
        assert!(xml.contains("<loc>https://videy.test/</loc>"));
        assert!(xml.contains("<loc>https://videy.test/v/cats</loc>"));
        assert!(xml.contains("<lastmod>2024-02-03T04:05:06Z</lastmod>"));
        assert!(!xml.contains("secret.mp4"));
    }

    #[test]
    fn rss_escapes_and_truncates() {
        let long = "d".repeat(400);
        let xml = rss_xml(
            "Tom & Jerry",
            "https://videy.test",
            &[video("a", "<b>Bold</b>", Some(&long))],
        );
        assert!(xml.contains("<title>Tom &amp; Jerry</title>"));
        assert!(xml.contains("<title>&lt;b&gt;Bold&lt;/b&gt;</title>"));
        assert!(xml.contains("<guid>https://videy.test/v/a</guid>"));
        assert!(xml.contains("<pubDate>Tue, 2 Jan 2024 03:04:05 +0000</pubDate>"));
        let expected = format!("<description>{}</description>", "d".repeat(300));
        assert!(xml.contains(&expected));
        assert!(!xml.contains(&"d".repeat(301)));
    }
}
