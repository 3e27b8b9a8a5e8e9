//! Tabular decoding of uploaded lead files.
//!
//! Turns a delimited-text or spreadsheet file into a lazy stream of
//! [`RawRow`]s keyed by the header row. Rows shorter than the header are
//! padded with empty strings, cells past the last header are ignored, and
//! completely blank rows are skipped.

use crate::import::data_structures::RawRow;
use calamine::{Data, Reader, open_workbook_auto_from_rs};
use std::io::Cursor;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Delimiters tried when sniffing delimited text, in tie-break order.
const DELIMITER_CANDIDATES: [u8; 4] = [b'\t', b';', b',', b'|'];

/// Number of leading lines inspected when sniffing the delimiter.
const SNIFF_LINES: usize = 10;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed delimited text at record {record}: {message}")]
    Delimited { record: u64, message: String },
    #[error("failed to read spreadsheet: {0}")]
    Spreadsheet(String),
    #[error("file has no header columns")]
    NoHeaders,
    #[error("unsupported file format '{0}'")]
    UnsupportedFormat(String),
}

/// Declared kind of an input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// CSV/TSV and friends; the delimiter is sniffed.
    Delimited,
    /// xlsx, xlsm, xls, ods; only the first worksheet is read.
    Spreadsheet,
}

impl FileFormat {
    /// Infer the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" | "tsv" | "txt" => Some(FileFormat::Delimited),
            "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => Some(FileFormat::Spreadsheet),
            _ => None,
        }
    }
}

impl FromStr for FileFormat {
    type Err = DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "csv" | "tsv" | "delimited" | "text" => Ok(FileFormat::Delimited),
            "xlsx" | "xls" | "ods" | "spreadsheet" => Ok(FileFormat::Spreadsheet),
            other => Err(DecodeError::UnsupportedFormat(other.to_string())),
        }
    }
}

enum RowSource {
    Delimited(csv::StringRecordsIntoIter<Cursor<Vec<u8>>>),
    Spreadsheet(std::vec::IntoIter<Vec<String>>),
}

/// Lazy, finite, non-restartable sequence of decoded rows.
pub struct RowStream {
    headers: Vec<String>,
    source: RowSource,
    finished: bool,
}

impl RowStream {
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    fn build_row(&self, cells: impl Iterator<Item = String>) -> RawRow {
        let mut cells = cells;
        let pairs = self
            .headers
            .iter()
            .map(|header| (header.clone(), cells.next().unwrap_or_default()))
            .collect();
        RawRow::new(pairs)
    }
}

impl Iterator for RowStream {
    type Item = Result<RawRow, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            let cells: Vec<String> = match &mut self.source {
                RowSource::Delimited(records) => match records.next()? {
                    Ok(record) => record.iter().map(str::to_string).collect(),
                    Err(err) => {
                        self.finished = true;
                        let record = err.position().map(|p| p.record()).unwrap_or_default();
                        return Some(Err(DecodeError::Delimited {
                            record,
                            message: err.to_string(),
                        }));
                    }
                },
                RowSource::Spreadsheet(rows) => rows.next()?,
            };

            let row = self.build_row(cells.into_iter());
            if row.is_blank() {
                continue;
            }
            return Some(Ok(row));
        }
    }
}

/// Open `path` and start decoding it as `format`.
///
/// Fails up front when the file cannot be read or the header row is empty;
/// later record-level parse failures surface as `Err` items in the stream.
pub fn decode(path: &Path, format: FileFormat) -> Result<RowStream, DecodeError> {
    match format {
        FileFormat::Delimited => decode_delimited(path),
        FileFormat::Spreadsheet => decode_spreadsheet(path),
    }
}

fn decode_delimited(path: &Path) -> Result<RowStream, DecodeError> {
    let bytes = std::fs::read(path).map_err(|source| DecodeError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let content = bytes_to_utf8(bytes);
    let delimiter = sniff_delimiter(&content);

    log::debug!(
        "decoding {} as delimited text (delimiter {:?})",
        path.display(),
        delimiter as char
    );

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(Cursor::new(content.into_bytes()));

    let header_record = reader
        .headers()
        .map_err(|err| DecodeError::Delimited {
            record: 0,
            message: err.to_string(),
        })?
        .clone();
    let headers = clean_headers(header_record.iter().map(str::to_string))?;

    Ok(RowStream {
        headers,
        source: RowSource::Delimited(reader.into_records()),
        finished: false,
    })
}

/// The workbook kind is detected from the content, not the file name, so an
/// upload stored under the wrong suffix still opens.
fn decode_spreadsheet(path: &Path) -> Result<RowStream, DecodeError> {
    let bytes = std::fs::read(path).map_err(|source| DecodeError::Open {
        path: path.display().to_string(),
        source,
    })?;

    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|err| DecodeError::Spreadsheet(err.to_string()))?;

    let range = match workbook.worksheet_range_at(0) {
        Some(result) => result.map_err(|err| DecodeError::Spreadsheet(err.to_string()))?,
        None => return Err(DecodeError::NoHeaders),
    };

    log::debug!(
        "decoding {} as spreadsheet ({} rows x {} cols)",
        path.display(),
        range.height(),
        range.width()
    );

    let mut rows = range
        .rows()
        .map(|row| row.iter().map(cell_to_string).collect::<Vec<String>>());

    let header_cells = rows.next().ok_or(DecodeError::NoHeaders)?;
    let headers = clean_headers(header_cells.into_iter())?;
    let body: Vec<Vec<String>> = rows.collect();

    Ok(RowStream {
        headers,
        source: RowSource::Spreadsheet(body.into_iter()),
        finished: false,
    })
}

/// Trim headers, strip a UTF-8 BOM, and reject a header row with no names.
fn clean_headers(raw: impl Iterator<Item = String>) -> Result<Vec<String>, DecodeError> {
    let headers: Vec<String> = raw
        .enumerate()
        .map(|(idx, header)| {
            let header = if idx == 0 {
                header.trim_start_matches('\u{feff}').to_string()
            } else {
                header
            };
            header.trim().to_string()
        })
        .collect();

    if headers.iter().all(|h| h.is_empty()) {
        return Err(DecodeError::NoHeaders);
    }

    Ok(headers)
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        // Phone columns are frequently stored as numbers.
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        Data::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Decode bytes as UTF-8, falling back to Windows-1252 for legacy exports.
fn bytes_to_utf8(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(err) => {
            let bytes = err.into_bytes();
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(&bytes);
            decoded.into_owned()
        }
    }
}

/// Pick the delimiter that yields the most consistent field count (> 1)
/// across the first lines of the file.
fn sniff_delimiter(content: &str) -> u8 {
    let sample: Vec<&str> = content.lines().take(SNIFF_LINES).collect();
    if sample.is_empty() {
        return b',';
    }

    let mut best = b',';
    let mut best_score = 0u64;

    for &delim in &DELIMITER_CANDIDATES {
        let counts: Vec<usize> = sample
            .iter()
            .map(|line| {
                csv::ReaderBuilder::new()
                    .delimiter(delim)
                    .has_headers(false)
                    .flexible(true)
                    .from_reader(line.as_bytes())
                    .records()
                    .next()
                    .and_then(|r| r.ok())
                    .map(|r| r.len())
                    .unwrap_or(1)
            })
            .collect();

        let target = counts[0];
        if target <= 1 {
            continue;
        }

        let consistent = counts.iter().filter(|&&c| c == target).count() as u64;
        let score = consistent * target as u64;
        if score > best_score {
            best_score = score;
            best = delim;
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &[u8], suffix: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(suffix)
            .tempfile()
            .expect("temp file");
        file.write_all(content).expect("write fixture");
        file
    }

    #[test]
    fn test_decode_pads_short_rows_and_skips_blank_rows() {
        let file = write_temp(b"Nome,Telefone,Email\nAna,11999990000\n,,\n\nBeto,,beto@x.com\n", ".csv");
        let rows: Vec<RawRow> = decode(file.path(), FileFormat::Delimited)
            .expect("decode")
            .collect::<Result<_, _>>()
            .expect("rows");

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("Nome"), Some("Ana"));
        assert_eq!(rows[0].get("Email"), Some(""));
        assert_eq!(rows[1].get("Email"), Some("beto@x.com"));
    }

    #[test]
    fn test_decode_sniffs_semicolon_and_strips_bom() {
        let file = write_temp("\u{feff}Nome;Celular\nAna;(11) 98888-7777\n".as_bytes(), ".csv");
        let stream = decode(file.path(), FileFormat::Delimited).expect("decode");
        assert_eq!(stream.headers(), &["Nome".to_string(), "Celular".to_string()]);

        let rows: Vec<RawRow> = stream.collect::<Result<_, _>>().expect("rows");
        assert_eq!(rows[0].get("Celular"), Some("(11) 98888-7777"));
    }

    #[test]
    fn test_decode_falls_back_to_windows_1252() {
        // "Observações" encoded as Windows-1252
        let mut content = b"Nome,Observa".to_vec();
        content.extend_from_slice(&[0xE7, 0xF5]);
        content.extend_from_slice(b"es\nAna,ok\n");
        let file = write_temp(&content, ".csv");

        let stream = decode(file.path(), FileFormat::Delimited).expect("decode");
        assert_eq!(stream.headers()[1], "Observações");
    }

    #[test]
    fn test_decode_rejects_empty_header_row() {
        let file = write_temp(b"", ".csv");
        assert!(matches!(
            decode(file.path(), FileFormat::Delimited),
            Err(DecodeError::NoHeaders)
        ));

        let file = write_temp(b" , \nAna,1\n", ".csv");
        assert!(matches!(
            decode(file.path(), FileFormat::Delimited),
            Err(DecodeError::NoHeaders)
        ));
    }

    #[test]
    fn test_decode_missing_file() {
        let result = decode(Path::new("/nonexistent/leads.csv"), FileFormat::Delimited);
        assert!(matches!(result, Err(DecodeError::Open { .. })));
    }

    #[test]
    fn test_decode_spreadsheet_ignores_file_suffix() {
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "Nome").unwrap();
        sheet.write_string(0, 1, "Celular").unwrap();
        sheet.write_string(1, 0, "Ana").unwrap();
        sheet.write_number(1, 1, 11988887777.0).unwrap();
        let bytes = workbook.save_to_buffer().unwrap();

        for suffix in [".xls", ".ods", ".bin"] {
            let file = write_temp(&bytes, suffix);
            let rows: Vec<RawRow> = decode(file.path(), FileFormat::Spreadsheet)
                .expect("decode")
                .collect::<Result<_, _>>()
                .expect("rows");
            assert_eq!(rows[0].get("Celular"), Some("11988887777"), "suffix {suffix}");
        }
    }

    #[test]
    fn test_decode_spreadsheet_missing_file() {
        let result = decode(Path::new("/nonexistent/leads.xlsx"), FileFormat::Spreadsheet);
        assert!(matches!(result, Err(DecodeError::Open { .. })));
    }

    #[test]
    fn test_format_inference() {
        assert_eq!(
            FileFormat::from_path(Path::new("leads.XLSX")),
            Some(FileFormat::Spreadsheet)
        );
        assert_eq!(
            FileFormat::from_path(Path::new("leads.csv")),
            Some(FileFormat::Delimited)
        );
        assert_eq!(FileFormat::from_path(Path::new("leads.pdf")), None);
        assert!("spreadsheet".parse::<FileFormat>().is_ok());
        assert!("pdf".parse::<FileFormat>().is_err());
    }
}
