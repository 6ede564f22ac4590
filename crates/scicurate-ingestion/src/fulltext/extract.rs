//! Body-text extraction from the formats full-text sources return.
//!
//! Every extractor puts section headings on their own lines so the structural
//! validator can recognise them.

use anyhow::Result;
use quick_xml::events::Event;
use quick_xml::Reader;
use scraper::{ElementRef, Html, Node, Selector};
use tracing::warn;

/// Body text of a JATS (PMC / Europe PMC) article, or `None` when the document
/// carries no `<body>` (abstract-only deposits, error payloads).
pub fn jats_body_text(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut out = String::new();
    let mut body_depth = 0usize;
    let mut skip_depth = 0usize;
    let mut saw_body = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"body" => {
                    body_depth += 1;
                    saw_body = true;
                }
                b"xref" | b"table-wrap" | b"fig" | b"disp-formula" if body_depth > 0 => skip_depth += 1,
                b"title" | b"sec" if body_depth > 0 && skip_depth == 0 => push_break(&mut out),
                _ => {}
            },
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"body" => body_depth = body_depth.saturating_sub(1),
                b"xref" | b"table-wrap" | b"fig" | b"disp-formula" if body_depth > 0 => {
                    skip_depth = skip_depth.saturating_sub(1)
                }
                b"title" | b"p" if body_depth > 0 && skip_depth == 0 => push_break(&mut out),
                _ => {}
            },
            Ok(Event::Text(ref e)) if body_depth > 0 && skip_depth == 0 => {
                let text = e.unescape().unwrap_or_default();
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push(' ');
                }
                out.push_str(text.trim());
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!("JATS parse error: {}", e);
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    let text = out.trim().to_string();
    (saw_body && !text.is_empty()).then_some(text)
}

fn push_break(out: &mut String) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

const ARTICLE_ROOTS: &[&str] = &["article", "main", "[role=main]", "#content", "body"];

/// Article-focused text from a publisher or repository HTML page: headings and
/// paragraphs under the most specific content root.
pub fn html_article_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let blocks = Selector::parse("h1, h2, h3, h4, p, li").expect("static selector");

    let root = ARTICLE_ROOTS
        .iter()
        .filter_map(|sel| Selector::parse(sel).ok())
        .find_map(|sel| doc.select(&sel).next());

    let Some(root) = root else { return String::new() };

    root.select(&blocks)
        .map(|el| el.text().collect::<Vec<_>>().join(" "))
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "li", "h1", "h2", "h3", "h4", "h5", "h6", "section", "td", "th", "br", "tr",
];

/// Raw visible text of a whole page, one block element per line. Last resort
/// for landing pages with no recognisable article container.
pub fn html_page_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let body = Selector::parse("body").expect("static selector");
    let Some(root) = doc.select(&body).next() else { return String::new() };

    let mut out = String::new();
    collect_visible(root, &mut out);
    out.lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collect_visible(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(t) => {
                out.push_str(t);
                out.push(' ');
            }
            Node::Element(e) => {
                if matches!(e.name(), "script" | "style" | "noscript" | "nav" | "footer") {
                    continue;
                }
                if let Some(child_el) = ElementRef::wrap(child) {
                    collect_visible(child_el, out);
                }
                if BLOCK_TAGS.contains(&e.name()) {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

/// True when both the declared content type and the magic bytes say PDF.
pub fn is_pdf(content_type: Option<&str>, bytes: &[u8]) -> bool {
    let declared = content_type
        .map(|ct| ct.to_ascii_lowercase().contains("application/pdf"))
        .unwrap_or(false);
    declared && bytes.starts_with(b"%PDF")
}

/// Text of every page of an in-memory PDF.
pub fn pdf_text(bytes: &[u8]) -> Result<String> {
    let pdf = lopdf::Document::load_mem(bytes)?;
    let pages: Vec<u32> = pdf.get_pages().keys().copied().collect();
    let text = pdf.extract_text(&pages)?;
    Ok(text)
}

/// [`pdf_text`] on the blocking pool. A parser panic comes back as an error
/// for this document only.
pub async fn pdf_text_blocking(bytes: Vec<u8>) -> Result<String> {
    tokio::task::spawn_blocking(move || pdf_text(&bytes))
        .await
        .map_err(|e| anyhow::anyhow!("PDF parser aborted: {e}"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jats_body_headings_on_own_lines() {
        let xml = r#"<article><front><article-meta><abstract><p>Abstract only.</p></abstract></article-meta></front>
<body>
  <sec><title>Introduction</title><p>Creatine is studied <xref ref-type="bibr">12</xref> widely.</p></sec>
  <sec><title>Methods</title><p>We did things.</p>
    <table-wrap><caption><p>Table text</p></caption></table-wrap></sec>
</body></article>"#;
        let text = jats_body_text(xml).unwrap();
        assert!(text.starts_with("Introduction\n"));
        assert!(text.contains("\nMethods\n"));
        assert!(text.contains("Creatine is studied widely."));
        assert!(!text.contains("Abstract only"));
        assert!(!text.contains("Table text"));
        assert!(!text.contains("12"));
    }

    #[test]
    fn test_jats_without_body_is_none() {
        let xml = "<article><front><abstract><p>Only an abstract.</p></abstract></front></article>";
        assert!(jats_body_text(xml).is_none());
        assert!(jats_body_text("<error>not found</error>").is_none());
    }

    #[test]
    fn test_html_article_prefers_article_root() {
        let html = r#"<html><body><nav><p>Menu</p></nav>
            <article><h2>Results</h2><p>Effect  was large.</p></article></body></html>"#;
        assert_eq!(html_article_text(html), "Results\nEffect was large.");
    }

    #[test]
    fn test_html_page_text_skips_scripts() {
        let html = r#"<html><head><title>t</title></head><body>
            <script>var x = 1;</script><div>Discussion</div><div>Visible   text</div></body></html>"#;
        assert_eq!(html_page_text(html), "Discussion\nVisible text");
    }

    #[test]
    fn test_pdf_detection_needs_header_and_magic() {
        assert!(is_pdf(Some("application/pdf"), b"%PDF-1.7 ..."));
        assert!(!is_pdf(Some("text/html"), b"%PDF-1.7"));
        assert!(!is_pdf(Some("application/pdf"), b"<html>"));
        assert!(!is_pdf(None, b"%PDF"));
    }

    #[tokio::test]
    async fn test_truncated_pdf_is_an_error_not_a_crash() {
        assert!(pdf_text_blocking(b"%PDF".to_vec()).await.is_err());
        assert!(pdf_text_blocking(b"%PDF-1.7\n".to_vec()).await.is_err());
    }
}
