//! Extension-keyed document parsers.
//!
//! [`DocumentFormat`] is the closed set of supported formats. Each format has
//! one [`DocumentParser`] implementation; [`LoaderRegistry`] maps extension
//! strings (case-sensitive, leading dot included) to parsers. Files whose
//! extension is not registered are never discovered, so an unknown
//! extension is not a dispatch failure.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::ParseError;
use crate::extract;
use crate::models::RawDocument;

/// Metadata key recording which parser produced a document.
pub const FORMAT_KEY: &str = "format";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentFormat {
    Text,
    Markdown,
    Csv,
    Html,
    Pdf,
    Docx,
    Pptx,
    Xlsx,
}

impl DocumentFormat {
    pub const ALL: [DocumentFormat; 8] = [
        DocumentFormat::Text,
        DocumentFormat::Markdown,
        DocumentFormat::Csv,
        DocumentFormat::Html,
        DocumentFormat::Pdf,
        DocumentFormat::Docx,
        DocumentFormat::Pptx,
        DocumentFormat::Xlsx,
    ];

    /// Extensions handled by this format.
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            DocumentFormat::Text => &[".txt"],
            DocumentFormat::Markdown => &[".md"],
            DocumentFormat::Csv => &[".csv"],
            DocumentFormat::Html => &[".html", ".htm"],
            DocumentFormat::Pdf => &[".pdf"],
            DocumentFormat::Docx => &[".docx"],
            DocumentFormat::Pptx => &[".pptx"],
            DocumentFormat::Xlsx => &[".xlsx"],
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.extensions().iter().any(|e| *e == ext))
    }

    pub fn name(self) -> &'static str {
        match self {
            DocumentFormat::Text => "text",
            DocumentFormat::Markdown => "markdown",
            DocumentFormat::Csv => "csv",
            DocumentFormat::Html => "html",
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Docx => "docx",
            DocumentFormat::Pptx => "pptx",
            DocumentFormat::Xlsx => "xlsx",
        }
    }

    /// The built-in parser for this format.
    pub fn parser(self) -> Arc<dyn DocumentParser> {
        match self {
            DocumentFormat::Text | DocumentFormat::Markdown => Arc::new(PlainTextParser(self)),
            DocumentFormat::Csv => Arc::new(CsvParser),
            DocumentFormat::Html => Arc::new(HtmlParser),
            DocumentFormat::Pdf => Arc::new(PdfParser),
            DocumentFormat::Docx | DocumentFormat::Pptx | DocumentFormat::Xlsx => {
                Arc::new(OfficeParser(self))
            }
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Turns one file into one or more documents.
///
/// Parsers run on blocking worker threads and must not share mutable state.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<Vec<RawDocument>, ParseError>;
}

/// `.txt` / `.md`: the whole file as a single document. Bytes must be UTF-8.
pub struct PlainTextParser(DocumentFormat);

impl DocumentParser for PlainTextParser {
    fn parse(&self, path: &Path) -> Result<Vec<RawDocument>, ParseError> {
        let text = String::from_utf8(std::fs::read(path)?)?;
        Ok(vec![
            RawDocument::new(path, text).with_metadata(FORMAT_KEY, self.0.name())
        ])
    }
}

/// `.csv`: one document per record, rendered as `header: value` lines.
pub struct CsvParser;

impl DocumentParser for CsvParser {
    fn parse(&self, path: &Path) -> Result<Vec<RawDocument>, ParseError> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        let headers = reader.headers()?.clone();
        let mut docs = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let text = record
                .iter()
                .enumerate()
                .map(|(i, value)| match headers.get(i) {
                    Some(h) if !h.is_empty() => format!("{}: {}", h, value),
                    _ => value.to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n");
            docs.push(
                RawDocument::new(path, text)
                    .with_metadata(FORMAT_KEY, DocumentFormat::Csv.name())
                    .with_metadata("row", row.to_string()),
            );
        }
        Ok(docs)
    }
}

/// `.html` / `.htm`: markup rendered to plain text.
pub struct HtmlParser;

/// Wrap width for html2text; wide enough to leave prose lines intact.
const HTML_WIDTH: usize = 10_000;

impl DocumentParser for HtmlParser {
    fn parse(&self, path: &Path) -> Result<Vec<RawDocument>, ParseError> {
        let bytes = std::fs::read(path)?;
        let text = html2text::from_read(bytes.as_slice(), HTML_WIDTH)
            .map_err(|e| ParseError::Html(e.to_string()))?;
        Ok(vec![
            RawDocument::new(path, text).with_metadata(FORMAT_KEY, DocumentFormat::Html.name())
        ])
    }
}

/// `.pdf`: one document per non-empty page.
pub struct PdfParser;

impl DocumentParser for PdfParser {
    fn parse(&self, path: &Path) -> Result<Vec<RawDocument>, ParseError> {
        let bytes = std::fs::read(path)?;
        Ok(page_documents(path, extract::pdf_pages(&bytes)?))
    }
}

/// One document per non-blank page; `page` is the 1-based page number.
fn page_documents(path: &Path, pages: Vec<String>) -> Vec<RawDocument> {
    pages
        .into_iter()
        .enumerate()
        .filter(|(_, page)| !page.is_empty())
        .map(|(i, page)| {
            RawDocument::new(path, page)
                .with_metadata(FORMAT_KEY, DocumentFormat::Pdf.name())
                .with_metadata("page", (i + 1).to_string())
        })
        .collect()
}

/// `.docx` (one document), `.pptx` (one per slide), `.xlsx` (one per sheet).
pub struct OfficeParser(DocumentFormat);

impl DocumentParser for OfficeParser {
    fn parse(&self, path: &Path) -> Result<Vec<RawDocument>, ParseError> {
        let bytes = std::fs::read(path)?;
        let (unit, parts) = match self.0 {
            DocumentFormat::Docx => ("part", vec![extract::docx_text(&bytes)?]),
            DocumentFormat::Pptx => ("slide", extract::pptx_slides(&bytes)?),
            DocumentFormat::Xlsx => ("sheet", extract::xlsx_sheets(&bytes)?),
            other => return Err(ParseError::NotSupported(other.name().to_string())),
        };
        Ok(parts
            .into_iter()
            .enumerate()
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(i, text)| {
                RawDocument::new(path, text)
                    .with_metadata(FORMAT_KEY, self.0.name())
                    .with_metadata(unit, (i + 1).to_string())
            })
            .collect())
    }
}

/// Static mapping from extension to parser.
#[derive(Clone)]
pub struct LoaderRegistry {
    parsers: BTreeMap<&'static str, Arc<dyn DocumentParser>>,
}

impl LoaderRegistry {
    /// A registry with no parsers.
    pub fn empty() -> Self {
        Self {
            parsers: BTreeMap::new(),
        }
    }

    /// Replace (or add) the parser for `extension`.
    pub fn register(&mut self, extension: &'static str, parser: Arc<dyn DocumentParser>) {
        self.parsers.insert(extension, parser);
    }

    /// The parser for `extension`, or `None` when it is not supported.
    pub fn capability_for(&self, extension: &str) -> Option<Arc<dyn DocumentParser>> {
        self.parsers.get(extension).cloned()
    }

    pub fn supports(&self, extension: &str) -> bool {
        self.parsers.contains_key(extension)
    }

    pub fn extensions(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.parsers.keys().copied()
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for format in DocumentFormat::ALL {
            let parser = format.parser();
            for ext in format.extensions() {
                registry.register(ext, parser.clone());
            }
        }
        registry
    }
}

impl fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.parsers.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SOURCE_KEY;
    use tempfile::TempDir;

    #[test]
    fn extension_lookup_is_case_sensitive() {
        let registry = LoaderRegistry::default();
        assert!(registry.supports(".pdf"));
        assert!(registry.supports(".htm"));
        assert!(!registry.supports(".PDF"));
        assert!(!registry.supports("pdf"));
        assert!(registry.capability_for(".exe").is_none());
        assert_eq!(DocumentFormat::from_extension(".md"), Some(DocumentFormat::Markdown));
        assert_eq!(DocumentFormat::from_extension(".MD"), None);
    }

    #[test]
    fn blank_pdf_pages_keep_later_page_numbers() {
        let pages = vec!["intro".to_string(), String::new(), "results".to_string()];
        let docs = page_documents(Path::new("/paper.pdf"), pages);
        let numbered: Vec<(&str, &str)> = docs
            .iter()
            .map(|d| (d.text.as_str(), d.metadata["page"].as_str()))
            .collect();
        assert_eq!(numbered, vec![("intro", "1"), ("results", "3")]);
    }

    #[test]
    fn text_parser_reads_utf8() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.txt");
        std::fs::write(&path, "hello world").unwrap();

        let docs = LoaderRegistry::default()
            .capability_for(".txt")
            .unwrap()
            .parse(&path)
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].text, "hello world");
        assert_eq!(docs[0].metadata.get(FORMAT_KEY).unwrap(), "text");
        assert_eq!(
            docs[0].metadata.get(SOURCE_KEY).map(String::as_str),
            path.to_str()
        );
    }

    #[test]
    fn text_parser_rejects_invalid_utf8() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("b.txt");
        std::fs::write(&path, [0xff, 0xfe, 0x00, 0xc3, 0x28]).unwrap();

        let err = PlainTextParser(DocumentFormat::Text).parse(&path).unwrap_err();
        assert!(matches!(err, ParseError::Encoding(_)));
    }

    #[test]
    fn csv_parser_emits_one_document_per_row() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("people.csv");
        std::fs::write(&path, "name,role\nAda,engineer\nGrace,admiral\n").unwrap();

        let docs = CsvParser.parse(&path).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].text, "name: Ada\nrole: engineer");
        assert_eq!(docs[1].metadata.get("row").unwrap(), "1");
    }

    #[test]
    fn html_parser_strips_markup() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("page.html");
        std::fs::write(&path, "<html><body><p>Hello <b>there</b></p></body></html>").unwrap();

        let docs = HtmlParser.parse(&path).unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].text.contains("Hello"));
        assert!(!docs[0].text.contains("<p>"));
    }

    #[test]
    fn garbage_pdf_is_a_parse_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.pdf");
        std::fs::write(&path, b"definitely not a pdf").unwrap();
        assert!(PdfParser.parse(&path).is_err());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = PlainTextParser(DocumentFormat::Text)
            .parse(Path::new("/nonexistent/file.txt"))
            .unwrap_err();
        assert!(matches!(err, ParseError::Io(_)));
    }
}
