//! Native text extraction for source documents (plain text, Markdown,
//! OOXML word-processor files, text-layer PDFs).
//!
//! Extraction is pipeline-layer: the router supplies a
//! [`RouteDecision`]; this module returns flattened UTF-8 text plus a
//! structural outline (heading list). Scanned documents never reach
//! this module — the router sends them to [`crate::ocr`].

use std::io::Read;

use crate::models::{ExtractedText, FileKind, OutlineEntry, RouteDecision};

/// Maximum decompressed bytes to read from a single ZIP entry
/// (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Extraction error. No panic on corrupt input; the orchestrator marks
/// the document failed and moves on.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("OCR engine unavailable: {0}")]
    OcrUnavailable(String),
    #[error("OCR failed: {0}")]
    OcrFailed(String),
    #[error("document produced no extractable text")]
    Empty,
}

/// Extract flattened text and outline from a natively-parseable
/// document.
pub fn extract_native(decision: &RouteDecision) -> Result<ExtractedText, ExtractError> {
    let path = &decision.document.path;
    let (text, outline) = match decision.document.kind {
        FileKind::Text => (std::fs::read_to_string(path)?, Vec::new()),
        FileKind::Markdown => {
            let text = std::fs::read_to_string(path)?;
            let outline = markdown_outline(&text);
            (text, outline)
        }
        FileKind::Word => {
            let bytes = std::fs::read(path)?;
            extract_docx(&bytes)?
        }
        FileKind::Pdf => {
            let bytes = std::fs::read(path)?;
            let text = pdf_extract::extract_text_from_mem(&bytes)
                .map_err(|e| ExtractError::Pdf(e.to_string()))?;
            (text, Vec::new())
        }
        FileKind::Image => {
            // Router invariant: images always go to OCR.
            unreachable!("images are routed to the OCR extractor")
        }
    };

    if text.trim().is_empty() {
        return Err(ExtractError::Empty);
    }

    Ok(ExtractedText {
        document_id: decision.document.id.clone(),
        text,
        outline,
    })
}

/// Collect ATX headings (`#`..`######`) into an outline with character
/// offsets into the text.
pub fn markdown_outline(text: &str) -> Vec<OutlineEntry> {
    let mut outline = Vec::new();
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end();
        let hashes = trimmed.chars().take_while(|c| *c == '#').count();
        if (1..=6).contains(&hashes) {
            let title = trimmed[hashes..].trim();
            if !title.is_empty() {
                outline.push(OutlineEntry {
                    level: hashes as u8,
                    title: title.to_string(),
                    offset,
                });
            }
        }
        offset += line.chars().count();
    }
    outline
}

/// Extract a docx: paragraph runs flattened to text separated by blank
/// lines, with `Heading<N>`-styled paragraphs rendered as markdown-like
/// headings and recorded in the outline.
fn extract_docx(bytes: &[u8]) -> Result<(String, Vec<OutlineEntry>), ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;

    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Ooxml("word/document.xml not found".to_string()))?;
    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }

    flatten_document_xml(&doc_xml)
}

/// Walk `word/document.xml`, joining `<w:t>` runs per paragraph and
/// reading each paragraph's `<w:pStyle w:val="HeadingN"/>`.
fn flatten_document_xml(xml: &[u8]) -> Result<(String, Vec<OutlineEntry>), ExtractError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut out = String::new();
    let mut outline = Vec::new();
    let mut para = String::new();
    let mut heading_level: Option<u8> = None;
    let mut in_text_run = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => {
                    para.clear();
                    heading_level = None;
                }
                b"t" => in_text_run = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"pStyle" {
                    heading_level = e
                        .attributes()
                        .flatten()
                        .find(|a| a.key.local_name().as_ref() == b"val")
                        .and_then(|a| heading_style_level(&a.value));
                }
            }
            Ok(Event::Text(t)) if in_text_run => {
                para.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text_run = false,
                b"p" => {
                    let text = para.trim();
                    if !text.is_empty() {
                        if !out.is_empty() {
                            out.push_str("\n\n");
                        }
                        if let Some(level) = heading_level {
                            outline.push(OutlineEntry {
                                level,
                                title: text.to_string(),
                                offset: out.chars().count(),
                            });
                            out.push_str(&"#".repeat(level as usize));
                            out.push(' ');
                        }
                        out.push_str(text);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok((out, outline))
}

/// `Heading1`..`Heading9` → level; anything else is body text.
fn heading_style_level(val: &[u8]) -> Option<u8> {
    let s = std::str::from_utf8(val).ok()?;
    let rest = s.strip_prefix("Heading")?;
    let level: u8 = rest.parse().ok()?;
    (1..=9).contains(&level).then_some(level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_bytes(document_xml: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            zip.start_file(
                "word/document.xml",
                zip::write::SimpleFileOptions::default(),
            )
            .unwrap();
            zip.write_all(document_xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn invalid_zip_is_ooxml_error() {
        let err = extract_docx(b"not a zip").unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn docx_without_document_xml_is_ooxml_error() {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            zip.start_file("other.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"<x/>").unwrap();
            zip.finish().unwrap();
        }
        let err = extract_docx(&buf).unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn docx_paragraphs_and_headings_flatten() {
        let xml = r#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>
<w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Expense Policy</w:t></w:r></w:p>
<w:p><w:r><w:t>Travel costs are </w:t></w:r><w:r><w:t>reimbursed with receipts.</w:t></w:r></w:p>
<w:p><w:pPr><w:pStyle w:val="Heading2"/></w:pPr><w:r><w:t>Limits</w:t></w:r></w:p>
<w:p><w:r><w:t>Hotel caps apply.</w:t></w:r></w:p>
</w:body></w:document>"#;
        let (text, outline) = extract_docx(&docx_bytes(xml)).unwrap();
        assert!(text.starts_with("# Expense Policy"));
        assert!(text.contains("Travel costs are reimbursed with receipts."));
        assert!(text.contains("## Limits"));
        assert_eq!(outline.len(), 2);
        assert_eq!(outline[0].level, 1);
        assert_eq!(outline[0].title, "Expense Policy");
        assert_eq!(outline[1].level, 2);
        assert_eq!(outline[1].title, "Limits");
        // Outline offsets point at the heading markers in the text.
        let chars: Vec<char> = text.chars().collect();
        assert_eq!(chars[outline[1].offset], '#');
    }

    #[test]
    fn markdown_outline_levels_and_offsets() {
        let text = "# Top\n\nbody\n\n## Sub heading\n\nmore\n### Deep\n";
        let outline = markdown_outline(text);
        assert_eq!(outline.len(), 3);
        assert_eq!(outline[0], OutlineEntry {
            level: 1,
            title: "Top".to_string(),
            offset: 0,
        });
        assert_eq!(outline[1].level, 2);
        assert_eq!(outline[1].title, "Sub heading");
        let chars: Vec<char> = text.chars().collect();
        assert_eq!(chars[outline[1].offset], '#');
        assert_eq!(outline[2].level, 3);
    }

    #[test]
    fn heading_style_parsing() {
        assert_eq!(heading_style_level(b"Heading1"), Some(1));
        assert_eq!(heading_style_level(b"Heading9"), Some(9));
        assert_eq!(heading_style_level(b"Heading10"), None);
        assert_eq!(heading_style_level(b"BodyText"), None);
    }
}
