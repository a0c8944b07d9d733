//! Text extraction for the supported document formats (pdf, docx, txt).
//!
//! Ingestion supplies raw bytes plus the stored file-type tag; this module
//! returns plain UTF-8 text. A parse failure means the document yields no
//! extractable characters, which the pipeline treats as [`Error::EmptyInput`].

use std::io::Read;

use crate::error::{Error, Result};
use crate::models::FileType;

/// Decompressed-bytes cap for a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Extract plain text from document bytes.
pub fn extract_text(bytes: &[u8], file_type: FileType) -> Result<String> {
    match file_type {
        FileType::Pdf => extract_pdf(bytes),
        FileType::Docx => extract_docx(bytes),
        FileType::Txt => Ok(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| {
        tracing::debug!("pdf extraction failed: {e}");
        Error::EmptyInput
    })
}

fn extract_docx(bytes: &[u8]) -> Result<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| {
        tracing::debug!("docx open failed: {e}");
        Error::EmptyInput
    })?;

    let mut doc_xml = Vec::new();
    {
        let entry = archive.by_name("word/document.xml").map_err(|e| {
            tracing::debug!("word/document.xml missing: {e}");
            Error::EmptyInput
        })?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)
            .map_err(|_| Error::EmptyInput)?;
    }
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(Error::EmptyInput);
    }

    extract_w_t_elements(&doc_xml)
}

/// Collect the text of every `w:t` run element, space separated.
fn extract_w_t_elements(xml: &[u8]) -> Result<String> {
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
                        if !out.is_empty() {
                            out.push(' ');
                        }
                        out.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(_) => return Err(Error::EmptyInput),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}
