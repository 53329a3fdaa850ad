//! Document loading: file or directory → text [`Segment`]s.
//!
//! | Extension | Extraction | Page label |
//! |-----------|------------|------------|
//! | `.pdf` | `pdf-extract`, page by page | 1-based page number |
//! | `.docx` | `<w:t>` runs from `word/document.xml` | none |
//! | `.txt`, `.md` | UTF-8 text | none |
//!
//! Each page's text is split with [`chunk::split_text`](crate::chunk::split_text).
//! Directories are walked recursively; `*.tmp` files and ineligible
//! extensions are skipped. Files are loaded one at a time and the raw bytes of
//! a file are dropped before the next one is read.
//!
//! Extraction is blocking; async callers should run the loader inside
//! `tokio::task::spawn_blocking`.

use std::io::Read;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::chunk::split_text;
use crate::error::{Error, Result};
use crate::models::Segment;

/// Extensions the loader knows how to extract.
pub const ELIGIBLE_EXTENSIONS: &[&str] = &["pdf", "docx", "txt", "md"];

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("{0} is not valid UTF-8")]
    Encoding(String),
}

#[derive(Debug, Clone)]
pub struct DocumentLoader {
    max_tokens: usize,
}

impl DocumentLoader {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    /// Load a single file or every eligible file under a directory.
    ///
    /// A directory with no eligible files yields an empty vector.
    pub fn load(&self, path: &Path) -> Result<Vec<Segment>> {
        if !path.exists() {
            return Err(Error::NotFound(path.display().to_string()));
        }
        if path.is_dir() {
            return self.load_dir(path);
        }
        self.load_file(path)
    }

    /// Load one file. The segment source is the file's name on disk.
    pub fn load_file(&self, path: &Path) -> Result<Vec<Segment>> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let ext = extension_of(path).ok_or_else(|| ExtractError::Unsupported(name.clone()))?;

        let pages = {
            let bytes = std::fs::read(path)?;
            extract_pages(&bytes, &ext, &name)?
        };

        let mut segments = Vec::new();
        for (page, text) in pages {
            for piece in split_text(&text, self.max_tokens) {
                segments.push(Segment::new(piece, name.clone(), page));
            }
        }
        debug!(file = %name, segments = segments.len(), "loaded file");
        Ok(segments)
    }

    fn load_dir(&self, dir: &Path) -> Result<Vec<Segment>> {
        let mut files: Vec<_> = WalkDir::new(dir)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable directory entry");
                    None
                }
            })
            .filter(|e| e.file_type().is_file() && is_eligible(e.path()))
            .map(|e| e.into_path())
            .collect();
        files.sort();

        let mut segments = Vec::new();
        for file in files {
            segments.extend(self.load_file(&file)?);
        }
        Ok(segments)
    }
}

/// Whether the loader would pick up `path` during a directory walk.
pub fn is_eligible(path: &Path) -> bool {
    match extension_of(path) {
        Some(ext) if ext == "tmp" => false,
        Some(ext) => ELIGIBLE_EXTENSIONS.contains(&ext.as_str()),
        None => false,
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

/// Extract `(page label, text)` pairs from raw file bytes.
fn extract_pages(
    bytes: &[u8],
    ext: &str,
    name: &str,
) -> std::result::Result<Vec<(Option<u32>, String)>, ExtractError> {
    match ext {
        "pdf" => {
            let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
                .map_err(|e| ExtractError::Pdf(e.to_string()))?;
            Ok(pages
                .into_iter()
                .enumerate()
                .map(|(i, text)| (Some(i as u32 + 1), text))
                .collect())
        }
        "docx" => Ok(vec![(None, extract_docx(bytes)?)]),
        "txt" | "md" => {
            let text = std::str::from_utf8(bytes)
                .map_err(|_| ExtractError::Encoding(name.to_string()))?;
            Ok(vec![(None, text.to_string())])
        }
        _ => Err(ExtractError::Unsupported(name.to_string())),
    }
}

fn extract_docx(bytes: &[u8]) -> std::result::Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Ooxml("word/document.xml not found".to_string()))?;
    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    paragraph_text(&xml)
}

/// Concatenate `<w:t>` runs, one paragraph (`<w:p>`) per block.
fn paragraph_text(xml: &[u8]) -> std::result::Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" if !out.is_empty() && !out.ends_with("\n\n") => out.push_str("\n\n"),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}
