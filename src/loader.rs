//! Document loader: opaque text extraction for source files.
//!
//! The pipeline treats extraction as a black box that turns a file path into
//! plain UTF-8 text. PDF bodies go through `pdf-extract`; DOCX bodies are
//! unzipped and their `w:t` runs concatenated; everything else is read as
//! UTF-8 text. Unreadable or empty-after-extraction files are rejected with
//! `InvalidInput` so the indexer can fail the document up front.

use std::io::Read;
use std::path::Path;

use crate::error::{PipelineError, Result};

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Extract plain text from the file at `path`.
///
/// Fails with `InvalidInput` when the file is missing, malformed, or yields
/// no text after extraction.
pub fn load_text(path: &Path) -> Result<String> {
    if !path.is_file() {
        return Err(PipelineError::invalid(format!(
            "not a readable file: {}",
            path.display()
        )));
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let text = match ext.as_str() {
        "pdf" => {
            let bytes = std::fs::read(path)?;
            pdf_extract::extract_text_from_mem(&bytes).map_err(|e| {
                PipelineError::invalid(format!("PDF extraction failed for {}: {}", path.display(), e))
            })?
        }
        "docx" => {
            let bytes = std::fs::read(path)?;
            extract_docx(&bytes).map_err(|e| {
                PipelineError::invalid(format!(
                    "DOCX extraction failed for {}: {}",
                    path.display(),
                    e
                ))
            })?
        }
        _ => std::fs::read_to_string(path).map_err(|e| {
            PipelineError::invalid(format!("not valid UTF-8 text: {}: {}", path.display(), e))
        })?,
    };

    if text.trim().is_empty() {
        return Err(PipelineError::invalid(format!(
            "document is empty after extraction: {}",
            path.display()
        )));
    }

    Ok(text)
}

fn extract_docx(bytes: &[u8]) -> anyhow::Result<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))?;
    let mut doc_xml = Vec::new();
    {
        let entry = archive.by_name("word/document.xml")?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)?;
        if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            anyhow::bail!("word/document.xml exceeds size limit");
        }
    }
    extract_text_runs(&doc_xml)
}

/// Pull the text out of `w:t` runs, inserting newlines at paragraph ends so
/// downstream chunking and questionnaire parsing see line structure.
fn extract_text_runs(xml: &[u8]) -> anyhow::Result<String> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        out.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"p" {
                    out.push('\n');
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => anyhow::bail!("malformed document.xml: {}", e),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_with_paragraphs(paragraphs: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            writer
                .start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            let body: String = paragraphs
                .iter()
                .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
                .collect();
            let xml = format!(
                "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
                body
            );
            writer.write_all(xml.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn plain_text_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "Some reference material.").unwrap();
        assert_eq!(load_text(&path).unwrap(), "Some reference material.");
    }

    #[test]
    fn missing_file_is_invalid_input() {
        let err = load_text(Path::new("/nonexistent/file.txt")).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[test]
    fn empty_file_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        std::fs::write(&path, "   \n").unwrap();
        let err = load_text(&path).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[test]
    fn corrupt_pdf_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, "not a pdf").unwrap();
        let err = load_text(&path).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.docx");
        std::fs::write(&path, docx_with_paragraphs(&["First line", "Second line"])).unwrap();
        let text = load_text(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["First line", "Second line"]);
    }

    #[test]
    fn corrupt_docx_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.docx");
        std::fs::write(&path, "not a zip").unwrap();
        let err = load_text(&path).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }
}
