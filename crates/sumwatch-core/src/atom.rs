//! Atom 1.0 feed model for the alert surfaces.
//!
//! The feeds are small fixed documents, so they are rendered directly
//! rather than through an XML library.

/// An Atom feed.
#[derive(Debug, Clone, Default)]
pub struct Feed {
    /// Permanent feed identifier (its canonical URL).
    pub id: String,

    /// Feed title.
    pub title: String,

    /// RFC 3339 time of the newest entry.
    pub updated: String,

    /// Feed author name.
    pub author: String,

    /// Self link.
    pub link: String,

    /// Feed entries, newest first.
    pub entries: Vec<Entry>,
}

/// One item within a [`Feed`].
#[derive(Debug, Clone)]
pub struct Entry {
    /// Entry title.
    pub title: String,

    /// Permanent entry identifier.
    pub id: String,

    /// RFC 3339 time the entry was last updated.
    pub updated: String,

    /// Plain-text entry body.
    pub content: String,
}

fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

impl Feed {
    /// Renders the feed as an Atom 1.0 XML document.
    #[must_use]
    pub fn to_xml(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        xml.push_str("<feed xmlns=\"http://www.w3.org/2005/Atom\">\n");
        xml.push_str(&format!("  <id>{}</id>\n", escape(&self.id)));
        xml.push_str(&format!("  <title>{}</title>\n", escape(&self.title)));
        xml.push_str(&format!("  <updated>{}</updated>\n", escape(&self.updated)));
        xml.push_str(&format!(
            "  <author><name>{}</name></author>\n",
            escape(&self.author)
        ));
        xml.push_str(&format!(
            "  <link rel=\"self\" href=\"{}\"/>\n",
            escape(&self.link)
        ));
        for entry in &self.entries {
            xml.push_str("  <entry>\n");
            xml.push_str(&format!("    <title>{}</title>\n", escape(&entry.title)));
            xml.push_str(&format!("    <id>{}</id>\n", escape(&entry.id)));
            xml.push_str(&format!(
                "    <updated>{}</updated>\n",
                escape(&entry.updated)
            ));
            xml.push_str(&format!(
                "    <content type=\"text\">{}</content>\n",
                escape(&entry.content)
            ));
            xml.push_str("  </entry>\n");
        }
        xml.push_str("</feed>\n");
        xml
    }
}
