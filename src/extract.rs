//! Plain-text extraction from binary and markup formats.
//!
//! Loaders hand raw bytes to these functions and get UTF-8 text back. Nothing
//! here panics on malformed input; every failure is an [`ExtractError`] so
//! the pipeline can skip the file and move on.

use std::io::Read;

use quick_xml::events::Event;
use scraper::{Html, Selector};
use thiserror::Error;

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("CSV parsing failed: {0}")]
    Csv(String),
    #[error("invalid sidecar metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

pub fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

/// Text of a Word document: every `<w:t>` run in `word/document.xml`.
pub fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let xml = read_zip_entry(&mut archive, "word/document.xml")?;
    collect_text_runs(&xml, "")
}

/// Text of a presentation: `<a:t>` runs of every slide, in slide order.
pub fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let mut slides: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    slides.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut pages = Vec::with_capacity(slides.len());
    for name in slides {
        let xml = read_zip_entry(&mut archive, &name)?;
        let text = collect_text_runs(&xml, " ")?;
        if !text.is_empty() {
            pages.push(text);
        }
    }
    Ok(pages.join("\n\n"))
}

fn open_zip(bytes: &[u8]) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry.take(MAX_XML_ENTRY_BYTES).read_to_end(&mut out)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Concatenates the text of every element with local name `t`. Runs inside
/// one paragraph (`p`) are joined with `run_sep`; paragraphs with a newline.
fn collect_text_runs(xml: &[u8], run_sep: &str) -> Result<String, ExtractError> {
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_t = false;

    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => {
                if !current.is_empty() {
                    current.push_str(run_sep);
                }
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" if !current.is_empty() => paragraphs.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }
    Ok(paragraphs.join("\n"))
}

/// Text and list-valued metadata pulled out of an HTML page.
#[derive(Debug, Default, PartialEq)]
pub struct HtmlExtract {
    pub title: Option<String>,
    pub text: String,
    pub link_urls: Vec<String>,
    pub link_texts: Vec<String>,
    pub emphasized_text_contents: Vec<String>,
    pub emphasized_text_tags: Vec<String>,
}

pub fn extract_html(source: &str) -> HtmlExtract {
    let document = Html::parse_document(source);
    let mut out = HtmlExtract::default();

    if let Ok(sel) = Selector::parse("title") {
        out.title = document
            .select(&sel)
            .next()
            .map(|t| t.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty());
    }

    let root = Selector::parse("body")
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .unwrap_or_else(|| document.root_element());

    let mut lines = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|e| matches!(e.name(), "script" | "style" | "noscript" | "head"))
        });
        let trimmed = text.trim();
        if !hidden && !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }
    out.text = lines.join("\n");

    if let Ok(sel) = Selector::parse("a[href]") {
        for link in root.select(&sel) {
            if let Some(href) = link.value().attr("href") {
                out.link_urls.push(href.to_string());
                out.link_texts
                    .push(link.text().collect::<String>().trim().to_string());
            }
        }
    }

    if let Ok(sel) = Selector::parse("em, strong, b, i") {
        for el in root.select(&sel) {
            let content = el.text().collect::<String>().trim().to_string();
            if !content.is_empty() {
                out.emphasized_text_contents.push(content);
                out.emphasized_text_tags.push(el.value().name().to_string());
            }
        }
    }

    out
}

/// Parses CSV text into `(header, rows)`. Handles quoted fields, doubled
/// quotes and embedded newlines.
pub fn parse_csv(text: &str) -> Result<(Vec<String>, Vec<Vec<String>>), ExtractError> {
    let mut records: Vec<Vec<String>> = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err(ExtractError::Csv("unterminated quoted field".to_string()));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    records.retain(|r| !(r.len() == 1 && r[0].trim().is_empty()));

    let mut iter = records.into_iter();
    let header = iter
        .next()
        .ok_or_else(|| ExtractError::Csv("missing header row".to_string()))?;
    Ok((header, iter.collect()))
}
