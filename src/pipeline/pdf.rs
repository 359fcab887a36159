// src/pipeline/pdf.rs
//
// Synchronous file inspection and text extraction. Everything here is
// CPU-bound and is meant to run on the isolated executor.

use lopdf::Document as PdfDocument;

use crate::error::{ActivityError, TerminalKind};

/// File types the pipeline can extract text from.
pub const SUPPORTED_EXTENSIONS: [&str; 2] = ["pdf", "txt"];

const PDF_MAGIC: &[u8] = b"%PDF-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    PlainText,
}

fn looks_encrypted(bytes: &[u8]) -> bool {
    bytes.windows(b"/Encrypt".len()).any(|w| w == b"/Encrypt")
}

fn password_required(message: impl Into<String>) -> ActivityError {
    ActivityError::terminal(TerminalKind::PasswordRequired, message)
}

/// Decides the format from the extension and checks the bytes agree.
pub fn detect_format(bytes: &[u8], extension: Option<&str>) -> Result<DocumentFormat, ActivityError> {
    match extension {
        Some("pdf") => {
            if bytes.starts_with(PDF_MAGIC) {
                Ok(DocumentFormat::Pdf)
            } else {
                Err(ActivityError::terminal(
                    TerminalKind::CorruptFile,
                    "file has a .pdf extension but no PDF header",
                ))
            }
        }
        Some("txt") => Ok(DocumentFormat::PlainText),
        Some(other) => Err(ActivityError::terminal(
            TerminalKind::UnsupportedFormat,
            format!("unsupported file type '.{}'", other),
        )),
        None => Err(ActivityError::terminal(
            TerminalKind::UnsupportedFormat,
            "file has no extension",
        )),
    }
}

/// Loads a PDF, unlocking it with `password` when it is encrypted.
fn open_pdf(bytes: &[u8], password: Option<&str>) -> Result<PdfDocument, ActivityError> {
    let encrypted = looks_encrypted(bytes);
    if encrypted && password.is_none() {
        return Err(password_required("document is encrypted and no password was supplied"));
    }

    let mut document = match PdfDocument::load_mem(bytes) {
        Ok(document) => document,
        Err(e) if encrypted => {
            return Err(password_required(format!("encrypted document could not be opened: {}", e)))
        }
        Err(e) => {
            return Err(ActivityError::terminal(
                TerminalKind::CorruptFile,
                format!("unreadable PDF: {}", e),
            ))
        }
    };

    if document.is_encrypted() {
        let password = password.unwrap_or_default();
        document
            .decrypt(password)
            .map_err(|e| password_required(format!("password rejected: {}", e)))?;
    }
    Ok(document)
}

/// Checks that the file can be opened; returns its format.
pub fn inspect(
    bytes: &[u8],
    extension: Option<&str>,
    password: Option<&str>,
) -> Result<DocumentFormat, ActivityError> {
    let format = detect_format(bytes, extension)?;
    match format {
        DocumentFormat::Pdf => {
            let document = open_pdf(bytes, password)?;
            if document.get_pages().is_empty() {
                return Err(ActivityError::terminal(
                    TerminalKind::CorruptFile,
                    "PDF has no pages",
                ));
            }
        }
        DocumentFormat::PlainText => {
            std::str::from_utf8(bytes).map_err(|e| {
                ActivityError::terminal(
                    TerminalKind::UnsupportedFormat,
                    format!("text file is not valid UTF-8: {}", e),
                )
            })?;
        }
    }
    Ok(format)
}

/// Extracts the full text. Blank output is an `EmptyDocument` error.
pub fn extract_text(
    bytes: &[u8],
    format: DocumentFormat,
    password: Option<&str>,
) -> Result<String, ActivityError> {
    let text = match format {
        DocumentFormat::Pdf => {
            let document = open_pdf(bytes, password)?;
            let pages: Vec<u32> = document.get_pages().keys().copied().collect();
            document.extract_text(&pages).map_err(|e| {
                ActivityError::terminal(
                    TerminalKind::Unparseable,
                    format!("text extraction failed: {}", e),
                )
            })?
        }
        DocumentFormat::PlainText => String::from_utf8(bytes.to_vec()).map_err(|e| {
            ActivityError::terminal(
                TerminalKind::UnsupportedFormat,
                format!("text file is not valid UTF-8: {}", e),
            )
        })?,
    };

    if text.trim().is_empty() {
        return Err(ActivityError::terminal(
            TerminalKind::EmptyDocument,
            "no extractable text",
        ));
    }
    Ok(text)
}
