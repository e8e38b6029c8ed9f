//! Text extraction for uploaded documents, plus the memory guard that
//! bounds concurrent extraction.
//!
//! Supported content types: plain text and markdown (UTF-8 passthrough),
//! PDF, and DOCX. Corrupt or unsupported content is a permanent failure —
//! the pipeline dead-letters it without burning the retry budget.

use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::error::{Result, TidepoolError};

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Extraction buffers can exceed the source size (decompression, UTF-16
/// to UTF-8). Budgeted at this multiple of the input.
const EXTRACTION_MEMORY_FACTOR: usize = 4;

/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Extract plain UTF-8 text from document bytes.
pub fn extract_text(bytes: &[u8], content_type: &str) -> Result<String> {
    match content_type {
        MIME_TEXT | MIME_MARKDOWN => String::from_utf8(bytes.to_vec())
            .map_err(|e| TidepoolError::PermanentContent(format!("invalid utf-8: {e}"))),
        MIME_PDF => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| TidepoolError::PermanentContent(format!("pdf extraction failed: {e}"))),
        MIME_DOCX => extract_docx(bytes),
        other => Err(TidepoolError::PermanentContent(format!(
            "unsupported content type: {other}"
        ))),
    }
}

/// Pull the text runs out of `word/document.xml`. Paragraph ends become
/// blank lines so the chunker sees the document's structure.
fn extract_docx(bytes: &[u8]) -> Result<String> {
    let ooxml = |e: String| TidepoolError::PermanentContent(format!("docx extraction failed: {e}"));

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ooxml(e.to_string()))?;
    let mut doc_xml = Vec::new();
    {
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|e| ooxml(e.to_string()))?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)
            .map_err(|e| ooxml(e.to_string()))?;
    }
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ooxml("word/document.xml exceeds size limit".to_string()));
    }

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(doc_xml.as_slice());
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
                if e.local_name().as_ref() == b"p" && !out.is_empty() {
                    out.push_str("\n\n");
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

/// Bounds the bytes concurrently held by extraction. Acquiring past the
/// threshold fails with a retryable resource-exhaustion error; capacity
/// frees when in-flight extractions finish and their permits drop.
#[derive(Debug)]
pub struct MemoryGuard {
    in_flight: AtomicUsize,
    threshold: usize,
}

impl MemoryGuard {
    pub fn new(threshold: usize) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            threshold,
        }
    }

    pub fn acquire(self: &Arc<Self>, input_bytes: usize) -> Result<MemoryPermit> {
        let estimate = input_bytes.saturating_mul(EXTRACTION_MEMORY_FACTOR);
        let mut current = self.in_flight.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(estimate);
            if next > self.threshold {
                warn!(
                    in_flight = current,
                    requested = estimate,
                    threshold = self.threshold,
                    "extraction memory threshold exceeded"
                );
                return Err(TidepoolError::ResourceExhaustion(format!(
                    "extraction would hold {next} bytes, threshold is {}",
                    self.threshold
                )));
            }
            match self.in_flight.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Ok(MemoryPermit {
                        guard: Arc::clone(self),
                        amount: estimate,
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn in_flight_bytes(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

/// Releases its reservation on drop.
#[derive(Debug)]
pub struct MemoryPermit {
    guard: Arc<MemoryGuard>,
    amount: usize,
}

impl Drop for MemoryPermit {
    fn drop(&mut self) {
        self.guard.in_flight.fetch_sub(self.amount, Ordering::AcqRel);
    }
}
