use std::io::{Cursor, Read, Seek};

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::ProcessError;

use super::TextExtractor;

/// Separates pages in extracted text. The chunker turns it back into page numbers.
pub const PAGE_BREAK: char = '\u{000C}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Text,
    Pdf,
    Docx,
}

impl DocumentFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "txt" | "text" | "md" | "markdown" | "csv" => Some(DocumentFormat::Text),
            "pdf" => Some(DocumentFormat::Pdf),
            "docx" => Some(DocumentFormat::Docx),
            _ => None,
        }
    }
}

/// Extracts text from one document format.
pub trait FormatExtractor: Send + Sync {
    fn extract_text(&self, bytes: &[u8]) -> Result<String, ProcessError>;
    fn supports(&self, format: DocumentFormat) -> bool;
}

/// Routes by file extension and enforces the result ceiling.
pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn FormatExtractor>>,
    max_text_bytes: usize,
}

impl ExtractorRegistry {
    pub fn new(max_text_bytes: usize) -> Self {
        Self {
            extractors: vec![
                Box::new(PlainTextExtractor),
                Box::new(PdfExtractor),
                Box::new(DocxExtractor),
            ],
            max_text_bytes,
        }
    }
}

impl TextExtractor for ExtractorRegistry {
    fn extract(&self, bytes: &[u8], extension: &str) -> Result<String, ProcessError> {
        let format = DocumentFormat::from_extension(extension)
            .ok_or_else(|| ProcessError::UnsupportedFormat(extension.to_string()))?;

        let extractor = self
            .extractors
            .iter()
            .find(|e| e.supports(format))
            .ok_or_else(|| ProcessError::UnsupportedFormat(extension.to_string()))?;

        let text = extractor.extract_text(bytes)?;
        if text.len() > self.max_text_bytes {
            return Err(ProcessError::TextTooLarge {
                size: text.len(),
                limit: self.max_text_bytes,
            });
        }
        if text.chars().all(|c| c.is_whitespace()) {
            return Err(ProcessError::EmptyText);
        }
        Ok(text)
    }
}

pub struct PlainTextExtractor;

impl FormatExtractor for PlainTextExtractor {
    fn extract_text(&self, bytes: &[u8]) -> Result<String, ProcessError> {
        let text = String::from_utf8(bytes.to_vec())
            .map_err(|e| ProcessError::TextExtraction(format!("not valid UTF-8: {}", e)))?;
        Ok(text.trim_start_matches('\u{FEFF}').to_string())
    }

    fn supports(&self, format: DocumentFormat) -> bool {
        matches!(format, DocumentFormat::Text)
    }
}

pub struct PdfExtractor;

impl FormatExtractor for PdfExtractor {
    fn extract_text(&self, bytes: &[u8]) -> Result<String, ProcessError> {
        let _span = tracing::info_span!("extract.pdf").entered();

        let doc = lopdf::Document::load_mem(bytes)
            .map_err(|e| ProcessError::PdfProcessing(format!("Failed to load PDF: {}", e)))?;

        let mut pages = Vec::new();
        for (page_num, _) in doc.get_pages() {
            match doc.extract_text(&[page_num]) {
                Ok(page_text) => pages.push(page_text),
                Err(e) => {
                    tracing::warn!("Skipping unreadable PDF page {}: {}", page_num, e);
                    pages.push(String::new());
                }
            }
        }
        Ok(pages.join(&PAGE_BREAK.to_string()))
    }

    fn supports(&self, format: DocumentFormat) -> bool {
        matches!(format, DocumentFormat::Pdf)
    }
}

pub struct DocxExtractor;

impl FormatExtractor for DocxExtractor {
    fn extract_text(&self, bytes: &[u8]) -> Result<String, ProcessError> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| ProcessError::DocxProcessing(format!("Failed to open DOCX: {}", e)))?;
        extract_docx_text(&mut archive)
    }

    fn supports(&self, format: DocumentFormat) -> bool {
        matches!(format, DocumentFormat::Docx)
    }
}

fn extract_docx_text<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> Result<String, ProcessError> {
    let mut document_xml = archive
        .by_name("word/document.xml")
        .map_err(|e| ProcessError::DocxProcessing(format!("Failed to find document.xml: {}", e)))?;

    let mut xml_content = String::new();
    document_xml
        .read_to_string(&mut xml_content)
        .map_err(|e| ProcessError::DocxProcessing(format!("Failed to read document.xml: {}", e)))?;

    parse_docx_xml(&xml_content)
}

/// Paragraphs become blank-line separated blocks; explicit page breaks
/// (`<w:br w:type="page"/>`) become [`PAGE_BREAK`].
fn parse_docx_xml(xml: &str) -> Result<String, ProcessError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut text = String::new();
    let mut in_text_element = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text_element = true;
                }
            }
            Ok(Event::Empty(ref e)) => {
                if e.local_name().as_ref() == b"br" {
                    let is_page_break = e.attributes().flatten().any(|a| {
                        a.key.local_name().as_ref() == b"type" && a.value.as_ref() == b"page"
                    });
                    if is_page_break {
                        text.push(PAGE_BREAK);
                    }
                }
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"t" => in_text_element = false,
                b"p" => text.push_str("\n\n"),
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_text_element {
                    let decoded = e.unescape().unwrap_or_default();
                    text.push_str(&decoded);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ProcessError::DocxProcessing(format!(
                    "XML parsing error: {}",
                    e
                )));
            }
            _ => {}
        }
    }

    Ok(text.trim_end().to_string())
}
