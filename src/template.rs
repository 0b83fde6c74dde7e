//! Section template for one article in the book.
//!
//! Each section shows the article title, a row of action links (source,
//! Favorite, Archive), the extracted content, and the links again at the
//! bottom so they are reachable without scrolling back on an e-reader.
//!
//! Callers can override the default via
//! [`crate::config::RunConfig::section_template`]. Placeholders:
//!
//! | Placeholder   | Replaced with                        | Escaped |
//! |---------------|--------------------------------------|---------|
//! | `{{title}}`   | article title                        | yes     |
//! | `{{actions}}` | `<a>` links joined by ` · `          | link text and href |
//! | `{{content}}` | embedded HTML body                   | no      |

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static RE_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{(title|actions|content)\}\}").unwrap());

/// Default section layout.
pub const DEFAULT_SECTION_TEMPLATE: &str = r#"<h1>{{title}}</h1>
<p class="actions">{{actions}}</p>
<hr />
{{content}}
<hr />
<p class="actions">{{actions}}</p>
"#;

/// Render one section. `actions` are `(label, href)` pairs.
pub fn render_section(
    template: &str,
    title: &str,
    actions: &[(String, String)],
    content: &str,
) -> String {
    let links = actions
        .iter()
        .map(|(label, href)| {
            format!(
                r#"<a href="{}">{}</a>"#,
                escape_html(href),
                escape_html(label)
            )
        })
        .collect::<Vec<_>>()
        .join(" · ");

    let title = escape_html(title);
    // Single pass: substituted text is never scanned for placeholders.
    RE_PLACEHOLDER
        .replace_all(template, |caps: &Captures| match &caps[1] {
            "title" => title.clone(),
            "actions" => links.clone(),
            _ => content.to_string(),
        })
        .into_owned()
}

/// Escape text for use in HTML element content and quoted attributes.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_template_has_all_placeholders() {
        assert!(DEFAULT_SECTION_TEMPLATE.contains("{{title}}"));
        assert!(DEFAULT_SECTION_TEMPLATE.contains("{{content}}"));
        assert_eq!(DEFAULT_SECTION_TEMPLATE.matches("{{actions}}").count(), 2);
    }

    #[test]
    fn renders_links_before_and_after_content() {
        let actions = vec![
            ("source".to_string(), "https://example.com/a?x=1&y=2".to_string()),
            ("Archive".to_string(), "https://getpocket.com/v3/send".to_string()),
        ];
        let html = render_section(DEFAULT_SECTION_TEMPLATE, "Cats & Dogs", &actions, "<p>body</p>");

        assert!(html.contains("<h1>Cats &amp; Dogs</h1>"));
        assert!(html.contains(r#"<a href="https://example.com/a?x=1&amp;y=2">source</a>"#));
        assert_eq!(html.matches(">Archive</a>").count(), 2);
        let body = html.find("<p>body</p>").unwrap();
        assert!(html.find("source</a>").unwrap() < body);
        assert!(html.rfind("source</a>").unwrap() > body);
    }

    #[test]
    fn content_placeholders_are_not_expanded() {
        let html = render_section("{{content}}|{{title}}", "T", &[], "{{title}}");
        assert_eq!(html, "{{title}}|T");
    }

    #[test]
    fn title_placeholders_are_not_expanded() {
        let actions = vec![("Source".to_string(), "https://x.org/{{content}}".to_string())];
        let html = render_section(
            "<h1>{{title}}</h1>{{actions}}<div>{{content}}</div>",
            "On {{content}} and {{actions}}",
            &actions,
            "<p>body</p>",
        );
        assert_eq!(
            html,
            r#"<h1>On {{content}} and {{actions}}</h1><a href="https://x.org/{{content}}">Source</a><div><p>body</p></div>"#
        );
    }

    #[test]
    fn escapes_quotes() {
        assert_eq!(escape_html(r#"a"b'c"#), "a&quot;b&#39;c");
    }
}
