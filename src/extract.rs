//! Text extraction for binary formats (PDF, OOXML).
//!
//! Each extractor returns one string per natural unit of the document
//! (PDF page, slide, worksheet) so loaders can emit one
//! [`RawDocument`](crate::models::RawDocument) per unit. Errors never panic;
//! they surface as [`ParseError`] and the file is reported as failed.

use std::io::{Cursor, Read};

use quick_xml::events::Event;

use crate::error::ParseError;

/// Maximum worksheets read from an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells read per worksheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Page separator emitted by pdf-extract's plain text output.
const PDF_PAGE_BREAK: char = '\u{c}';

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

/// Text of each PDF page, in page order. Blank pages are kept as empty
/// strings so positions stay page numbers.
pub fn pdf_pages(bytes: &[u8]) -> Result<Vec<String>, ParseError> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| ParseError::Pdf(e.to_string()))?;
    Ok(split_pages(&text))
}

fn split_pages(text: &str) -> Vec<String> {
    let mut pages: Vec<String> = text
        .split(PDF_PAGE_BREAK)
        .map(|page| page.trim().to_string())
        .collect();
    // pdf-extract ends the last page with a break too.
    if pages.len() > 1 && pages.last().is_some_and(|p| p.is_empty()) {
        pages.pop();
    }
    pages
}

/// Body text of a Word document (`w:t` runs of `word/document.xml`).
pub fn docx_text(bytes: &[u8]) -> Result<String, ParseError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_entry(&mut archive, "word/document.xml")?;
    collect_runs(&xml, b"t", Some(b"p"))
}

/// Text of each slide, ordered by slide number.
pub fn pptx_slides(bytes: &[u8]) -> Result<Vec<String>, ParseError> {
    let mut archive = open_archive(bytes)?;
    let names = numbered_entries(&archive, "ppt/slides/slide", ".xml");
    let mut slides = Vec::with_capacity(names.len());
    for name in names {
        let xml = read_entry(&mut archive, &name)?;
        slides.push(collect_runs(&xml, b"t", Some(b"p"))?);
    }
    Ok(slides)
}

/// Shared-string cell text of each worksheet, ordered by sheet number.
pub fn xlsx_sheets(bytes: &[u8]) -> Result<Vec<String>, ParseError> {
    let mut archive = open_archive(bytes)?;
    let has_shared = archive
        .file_names()
        .any(|n| n == "xl/sharedStrings.xml");
    let shared = if has_shared {
        shared_strings(&read_entry(&mut archive, "xl/sharedStrings.xml")?)?
    } else {
        Vec::new()
    };
    let names = numbered_entries(&archive, "xl/worksheets/sheet", ".xml");
    let mut sheets = Vec::new();
    for name in names.into_iter().take(XLSX_MAX_SHEETS) {
        let xml = read_entry(&mut archive, &name)?;
        sheets.push(sheet_cells(&xml, &shared)?);
    }
    Ok(sheets)
}

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ParseError> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ParseError::Ooxml(e.to_string()))
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ParseError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ParseError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry.take(MAX_XML_ENTRY_BYTES).read_to_end(&mut out)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ParseError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Entries `<prefix>N<suffix>` sorted numerically by `N`.
fn numbered_entries(archive: &Archive<'_>, prefix: &str, suffix: &str) -> Vec<String> {
    let mut names: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|n| {
            let number = n.strip_prefix(prefix)?.strip_suffix(suffix)?.parse().ok()?;
            Some((number, n.to_string()))
        })
        .collect();
    names.sort();
    names.into_iter().map(|(_, n)| n).collect()
}

/// Concatenate the text content of every `<text_tag>` element. When
/// `block_tag` is given, a newline separates consecutive blocks.
fn collect_runs(xml: &[u8], text_tag: &[u8], block_tag: Option<&[u8]>) -> Result<String, ParseError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == text_tag => in_text = true,
            Ok(Event::Text(t)) if in_text => {
                let text = t.unescape().map_err(|e| ParseError::Ooxml(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == text_tag {
                    in_text = false;
                } else if block_tag == Some(name.as_ref()) && !out.ends_with('\n') && !out.is_empty() {
                    out.push('\n');
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, ParseError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                if let Some(s) = current.as_mut() {
                    let text = t.unescape().map_err(|e| ParseError::Ooxml(e.to_string()))?;
                    s.push_str(&text);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_text = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn sheet_cells(xml: &[u8], shared: &[String]) -> Result<String, ParseError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut cells: Vec<String> = Vec::new();
    let mut shared_cell = false;
    let mut in_value = false;
    loop {
        if cells.len() >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared_cell = e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(t)) if in_value => {
                let raw = t.unescape().map_err(|e| ParseError::Ooxml(e.to_string()))?;
                let value = raw.trim();
                if shared_cell {
                    if let Some(s) = value.parse::<usize>().ok().and_then(|i| shared.get(i)) {
                        cells.push(s.clone());
                    }
                } else if !value.is_empty() {
                    cells.push(value.to_string());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_value = false,
                b"c" => shared_cell = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
            for (name, body) in entries {
                zip.start_file(*name, zip::write::SimpleFileOptions::default())
                    .unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = pdf_pages(b"not a pdf").unwrap_err();
        assert!(matches!(err, ParseError::Pdf(_)));
    }

    #[test]
    fn page_breaks_keep_blank_pages() {
        assert_eq!(
            split_pages("one\u{c} \n\u{c}three\u{c}"),
            vec!["one".to_string(), String::new(), "three".to_string()]
        );
        assert_eq!(split_pages(""), vec![String::new()]);
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = docx_text(b"not a zip").unwrap_err();
        assert!(matches!(err, ParseError::Ooxml(_)));
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let bytes = zip_with(&[(
            "word/document.xml",
            r#"<w:document xmlns:w="x"><w:body><w:p><w:r><w:t>First</w:t></w:r><w:r><w:t> line</w:t></w:r></w:p><w:p><w:r><w:t>Second</w:t></w:r></w:p></w:body></w:document>"#,
        )]);
        assert_eq!(docx_text(&bytes).unwrap(), "First line\nSecond");
    }

    #[test]
    fn docx_without_body_is_an_error() {
        let bytes = zip_with(&[("other.xml", "<a/>")]);
        assert!(matches!(docx_text(&bytes), Err(ParseError::Ooxml(_))));
    }

    #[test]
    fn pptx_slides_sorted_numerically() {
        let slide = |t: &str| format!(r#"<p:sld xmlns:a="x" xmlns:p="y"><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:sld>"#, t);
        let s1 = slide("one");
        let s2 = slide("two");
        let s10 = slide("ten");
        let bytes = zip_with(&[
            ("ppt/slides/slide10.xml", s10.as_str()),
            ("ppt/slides/slide2.xml", s2.as_str()),
            ("ppt/slides/slide1.xml", s1.as_str()),
        ]);
        assert_eq!(pptx_slides(&bytes).unwrap(), vec!["one", "two", "ten"]);
    }

    #[test]
    fn xlsx_resolves_shared_strings_and_inline_values() {
        let bytes = zip_with(&[
            (
                "xl/sharedStrings.xml",
                r#"<sst><si><t>alpha</t></si><si><t>beta</t></si></sst>"#,
            ),
            (
                "xl/worksheets/sheet1.xml",
                r#"<worksheet><sheetData><row><c t="s"><v>1</v></c><c><v>42</v></c><c t="s"><v>0</v></c></row></sheetData></worksheet>"#,
            ),
        ]);
        assert_eq!(xlsx_sheets(&bytes).unwrap(), vec!["beta 42 alpha"]);
    }
}
