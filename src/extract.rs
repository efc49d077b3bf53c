//! Native text extraction for Office documents and plain text.
//!
//! OOXML containers (docx/pptx/xlsx) are ZIP archives of XML; the text
//! lives in `<w:t>`/`<a:t>` elements and the shared-strings table. Reads
//! are bounded per archive entry as zip-bomb protection.

use std::io::Read;
use std::path::Path;

use crate::error::{Error, Result};

/// Maximum decompressed bytes read from one ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Sheet and cell caps for spreadsheets.
const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;

fn extraction_err(path: &Path, message: impl std::fmt::Display) -> Error {
    Error::Extraction {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

/// Extract text from a non-PDF document file, dispatched by extension.
pub fn extract_document_text(path: &Path) -> Result<String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "docx" => extract_docx(path),
        "pptx" => extract_pptx(path),
        "xlsx" => extract_xlsx(path),
        _ => read_plain_text(path),
    }
}

/// Read a text file, requiring valid UTF-8.
pub fn read_plain_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    String::from_utf8(bytes).map_err(|_| extraction_err(path, "file is not valid UTF-8"))
}

/// Probe whether a file's head decodes as UTF-8 text. Used to classify
/// unknown extensions.
pub fn looks_like_text(path: &Path) -> bool {
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let mut buf = vec![0u8; 8192];
    let Ok(n) = file.read(&mut buf) else {
        return false;
    };
    if n == 0 {
        return true;
    }
    // Tolerate a code point cut at the sample edge.
    match std::str::from_utf8(&buf[..n]) {
        Ok(_) => true,
        Err(err) => err.valid_up_to() + 4 > n,
    }
}

fn open_archive(path: &Path) -> Result<zip::ZipArchive<std::fs::File>> {
    let file = std::fs::File::open(path)?;
    zip::ZipArchive::new(file).map_err(|e| extraction_err(path, e))
}

fn read_entry(
    archive: &mut zip::ZipArchive<std::fs::File>,
    path: &Path,
    name: &str,
) -> Result<Vec<u8>> {
    let entry = archive.by_name(name).map_err(|e| extraction_err(path, e))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| extraction_err(path, e))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(extraction_err(
            path,
            format!("ZIP entry {name} exceeds size limit"),
        ));
    }
    Ok(out)
}

fn extract_docx(path: &Path) -> Result<String> {
    let mut archive = open_archive(path)?;
    let xml = read_entry(&mut archive, path, "word/document.xml")?;
    collect_text_elements(&xml, b"t", b"p").map_err(|e| extraction_err(path, e))
}

fn extract_pptx(path: &Path) -> Result<String> {
    let mut archive = open_archive(path)?;

    let mut slide_names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|e| e.name().to_string()))
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .collect();
    slide_names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut slides = Vec::new();
    for name in slide_names {
        let xml = read_entry(&mut archive, path, &name)?;
        let text = collect_text_elements(&xml, b"t", b"p").map_err(|e| extraction_err(path, e))?;
        if !text.trim().is_empty() {
            slides.push(text);
        }
    }
    Ok(slides.join("\n\n"))
}

fn extract_xlsx(path: &Path) -> Result<String> {
    let mut archive = open_archive(path)?;

    let shared = match read_entry(&mut archive, path, "xl/sharedStrings.xml") {
        Ok(xml) => read_shared_strings(&xml).map_err(|e| extraction_err(path, e))?,
        // Sheets of pure numbers have no shared-strings part.
        Err(_) => Vec::new(),
    };

    let mut sheet_names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|e| e.name().to_string()))
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .collect();
    sheet_names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut parts = Vec::new();
    for name in sheet_names.into_iter().take(XLSX_MAX_SHEETS) {
        let xml = read_entry(&mut archive, path, &name)?;
        let text = extract_sheet_cells(&xml, &shared).map_err(|e| extraction_err(path, e))?;
        if !text.is_empty() {
            parts.push(text);
        }
    }
    Ok(parts.join("\n"))
}

/// Walk an OOXML body collecting the text of `<{text_tag}>` elements,
/// inserting a newline at each `</{para_tag}>` so paragraph structure
/// survives into chunking.
fn collect_text_elements(
    xml: &[u8],
    text_tag: &[u8],
    para_tag: &[u8],
) -> std::result::Result<String, quick_xml::Error> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            quick_xml::events::Event::Start(e) => {
                if e.local_name().as_ref() == text_tag {
                    in_text = true;
                }
            }
            quick_xml::events::Event::Text(t) if in_text => {
                out.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            quick_xml::events::Event::End(e) => {
                if e.local_name().as_ref() == text_tag {
                    in_text = false;
                } else if e.local_name().as_ref() == para_tag && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            quick_xml::events::Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(out.trim().to_string())
}

fn read_shared_strings(xml: &[u8]) -> std::result::Result<Vec<String>, quick_xml::Error> {
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_si = false;
    let mut in_t = false;
    let mut current = String::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            quick_xml::events::Event::Start(e) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" if in_si => in_t = true,
                _ => {}
            },
            quick_xml::events::Event::Text(t) if in_t => {
                current.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            quick_xml::events::Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" if in_si => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            quick_xml::events::Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(strings)
}

fn extract_sheet_cells(
    xml: &[u8],
    shared: &[String],
) -> std::result::Result<String, quick_xml::Error> {
    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut cell_is_shared = false;

    loop {
        if cells.len() >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf)? {
            quick_xml::events::Event::Start(e) => match e.local_name().as_ref() {
                b"c" => {
                    cell_is_shared = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                }
                b"v" => in_value = true,
                _ => {}
            },
            quick_xml::events::Event::Text(t) if in_value => {
                let raw = t.unescape().unwrap_or_default();
                let raw = raw.trim();
                if !raw.is_empty() {
                    if cell_is_shared {
                        if let Ok(i) = raw.parse::<usize>() {
                            if let Some(s) = shared.get(i) {
                                cells.push(s.clone());
                            }
                        }
                    } else {
                        cells.push(raw.to_string());
                    }
                }
                in_value = false;
            }
            quick_xml::events::Event::End(e) => match e.local_name().as_ref() {
                b"v" => in_value = false,
                b"c" => cell_is_shared = false,
                _ => {}
            },
            quick_xml::events::Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(cells.join(" "))
}
