//! MIME-dispatched text extraction.
//!
//! Takes a raw file payload plus its content type and returns plain text
//! ready for chunking. PDF page breaks are preserved as `[Page N]` markers
//! so the chunker can attach page metadata. DOCX extraction reads
//! `word/document.xml` with bounded entry reads (zip-bomb protection).
//! HTML extraction selects the main content region and converts it to
//! markdown; the crawler reuses the same conversion.

use std::io::Read;

use scraper::{ElementRef, Html, Selector};

use crate::error::{Error, Result};
use crate::models::Metadata;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_HTML: &str = "text/html";
pub const MIME_PLAIN: &str = "text/plain";

/// Maximum decompressed bytes to read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Extraction output: plain text plus extraction-level metadata.
#[derive(Debug, Clone)]
pub struct Extracted {
    pub text: String,
    pub metadata: Metadata,
}

/// Extract plain text from a file payload, dispatching on MIME type.
pub fn extract(bytes: &[u8], mime: &str) -> Result<Extracted> {
    // Parameters like `; charset=utf-8` don't affect dispatch.
    let base = mime.split(';').next().unwrap_or(mime).trim();

    match base {
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes),
        MIME_HTML => extract_html(bytes),
        MIME_MARKDOWN | MIME_PLAIN => extract_plain(bytes),
        other if other.starts_with("text/") => extract_plain(bytes),
        other => Err(Error::UnsupportedType(other.to_string())),
    }
}

fn extract_plain(bytes: &[u8]) -> Result<Extracted> {
    let text = String::from_utf8_lossy(bytes).into_owned();
    Ok(Extracted {
        text,
        metadata: Metadata::default(),
    })
}

fn extract_pdf(bytes: &[u8]) -> Result<Extracted> {
    let raw = pdf_extract::extract_text_from_mem(bytes).map_err(|e| Error::Extraction {
        stage: "pdf",
        message: e.to_string(),
    })?;

    // Form feeds separate pages; rewrite them as [Page N] markers the
    // chunker understands.
    let mut metadata = Metadata::default();
    if raw.contains('\u{c}') {
        let pages: Vec<&str> = raw.split('\u{c}').collect();
        metadata.extra.insert(
            "page_count".to_string(),
            serde_json::Value::from(pages.len()),
        );
        let text = pages
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.trim().is_empty())
            .map(|(i, p)| format!("[Page {}]\n{}", i + 1, p.trim()))
            .collect::<Vec<_>>()
            .join("\n\n");
        return Ok(Extracted { text, metadata });
    }

    Ok(Extracted {
        text: raw,
        metadata,
    })
}

fn extract_docx(bytes: &[u8]) -> Result<Extracted> {
    let ooxml_err = |e: String| Error::Extraction {
        stage: "docx",
        message: e,
    };

    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ooxml_err(e.to_string()))?;

    let mut doc_xml = Vec::new();
    {
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|e| ooxml_err(e.to_string()))?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)
            .map_err(|e| ooxml_err(e.to_string()))?;
        if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(ooxml_err("word/document.xml exceeds size limit".to_string()));
        }
    }

    let text = extract_w_text(&doc_xml)?;
    Ok(Extracted {
        text,
        metadata: Metadata::default(),
    })
}

/// Pull text runs (`<w:t>`) out of the document XML, emitting paragraph
/// breaks at `<w:p>` boundaries so the chunker sees real paragraphs.
fn extract_w_text(xml: &[u8]) -> Result<String> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_t = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_t = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_t => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => {
                    if !out.ends_with("\n\n") && !out.is_empty() {
                        out.push_str("\n\n");
                    }
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => {
                return Err(Error::Extraction {
                    stage: "docx",
                    message: e.to_string(),
                })
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(out.trim().to_string())
}

fn extract_html(bytes: &[u8]) -> Result<Extracted> {
    let html = String::from_utf8_lossy(bytes);
    let text = html_to_markdown(&html);
    Ok(Extracted {
        text,
        metadata: Metadata::default(),
    })
}

/// Ordered selector preference for the main content region of a page.
const CONTENT_SELECTORS: &[&str] = &["main", "article", ".content", "#content", "body"];

/// Select the main content of an HTML document and convert it to
/// markdown. Returns an empty string when no content region has text.
pub fn html_to_markdown(html: &str) -> String {
    let doc = Html::parse_document(html);

    for sel in CONTENT_SELECTORS {
        let selector = match Selector::parse(sel) {
            Ok(s) => s,
            Err(_) => continue,
        };
        if let Some(element) = doc.select(&selector).next() {
            let md = element_to_markdown(element);
            if !md.trim().is_empty() {
                return md.trim().to_string();
            }
        }
    }
    String::new()
}

/// The page `<title>`, when present.
pub fn html_title(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let selector = Selector::parse("title").ok()?;
    doc.select(&selector)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

/// All `href` values of anchors in the document.
pub fn html_links(html: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let selector = match Selector::parse("a[href]") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    doc.select(&selector)
        .filter_map(|a| a.value().attr("href").map(str::to_string))
        .collect()
}

fn element_to_markdown(element: ElementRef) -> String {
    let mut out = String::new();
    render_children(element, &mut out);
    // Collapse runs of blank lines left by skipped elements.
    let mut collapsed = String::with_capacity(out.len());
    let mut blank = 0;
    for line in out.lines() {
        if line.trim().is_empty() {
            blank += 1;
            if blank > 1 {
                continue;
            }
        } else {
            blank = 0;
        }
        collapsed.push_str(line.trim_end());
        collapsed.push('\n');
    }
    collapsed
}

fn render_children(element: ElementRef, out: &mut String) {
    for child in element.children() {
        match child.value() {
            scraper::Node::Text(text) => {
                let t = text.trim();
                if !t.is_empty() {
                    if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                        out.push(' ');
                    }
                    out.push_str(t);
                }
            }
            scraper::Node::Element(_) => {
                if let Some(el) = ElementRef::wrap(child) {
                    render_element(el, out);
                }
            }
            _ => {}
        }
    }
}

fn render_element(el: ElementRef, out: &mut String) {
    let name = el.value().name();
    match name {
        "script" | "style" | "nav" | "header" | "footer" | "noscript" => {}
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = name.as_bytes()[1] - b'0';
            out.push_str("\n\n");
            for _ in 0..level {
                out.push('#');
            }
            out.push(' ');
            out.push_str(el.text().collect::<String>().trim());
            out.push_str("\n\n");
        }
        "p" | "div" | "section" | "table" | "tr" => {
            out.push_str("\n\n");
            render_children(el, out);
            out.push_str("\n\n");
        }
        "li" => {
            out.push_str("\n- ");
            render_children(el, out);
        }
        "ul" | "ol" => {
            render_children(el, out);
            out.push_str("\n\n");
        }
        "pre" => {
            out.push_str("\n\n```\n");
            out.push_str(el.text().collect::<String>().trim_end());
            out.push_str("\n```\n\n");
        }
        "code" => {
            out.push('`');
            out.push_str(&el.text().collect::<String>());
            out.push('`');
        }
        "a" => {
            let text = el.text().collect::<String>();
            let text = text.trim();
            if !text.is_empty() {
                match el.value().attr("href") {
                    Some(href) if href.starts_with("http") => {
                        if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                            out.push(' ');
                        }
                        out.push_str(&format!("[{}]({})", text, href));
                    }
                    _ => {
                        if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                            out.push(' ');
                        }
                        out.push_str(text);
                    }
                }
            }
        }
        "br" => out.push('\n'),
        "strong" | "b" => {
            out.push_str("**");
            render_children(el, out);
            out.push_str("**");
        }
        "em" | "i" => {
            out.push('*');
            render_children(el, out);
            out.push('*');
        }
        "blockquote" => {
            out.push_str("\n\n> ");
            render_children(el, out);
            out.push_str("\n\n");
        }
        _ => render_children(el, out),
    }
}
