//! Structural validation of finished feed artifacts.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::de::IgnoredAny;
use serde::Serialize;
use serde_json::error::Category;

use super::{FeedFormat, Validator};
use crate::error::ValidationError;

/// Stop collecting after this many errors; the first few are what matter.
const MAX_ERRORS: usize = 20;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    /// Records found in the artifact.
    pub records: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, message: String) -> bool {
        if self.errors.len() < MAX_ERRORS {
            self.errors.push(message);
        }
        self.errors.len() < MAX_ERRORS
    }

    fn finish(mut self) -> Self {
        if self.records == 0 && self.errors.is_empty() {
            self.warnings.push("Feed contains no records".to_string());
        }
        self
    }
}

/// Checks that the artifact parses in its declared format.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatValidator;

impl FormatValidator {
    pub fn new() -> Self {
        Self
    }

    fn open(path: &Path) -> Result<BufReader<File>, ValidationError> {
        File::open(path)
            .map(BufReader::new)
            .map_err(|e| ValidationError::Read {
                path: path.to_path_buf(),
                source: e,
            })
    }

    fn validate_xml(path: &Path) -> Result<ValidationReport, ValidationError> {
        let mut reader = Reader::from_reader(Self::open(path)?);
        let mut report = ValidationReport::default();
        let mut buf = Vec::new();
        let mut depth: u32 = 0;
        let mut roots: u32 = 0;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(_)) => {
                    match depth {
                        0 => roots += 1,
                        1 => report.records += 1,
                        _ => {}
                    }
                    depth += 1;
                }
                Ok(Event::Empty(_)) => match depth {
                    0 => roots += 1,
                    1 => report.records += 1,
                    _ => {}
                },
                Ok(Event::End(_)) => depth = depth.saturating_sub(1),
                Ok(Event::Text(text)) if depth == 0 => {
                    if !text.iter().all(u8::is_ascii_whitespace) {
                        report.error("Text outside of the root element".to_string());
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    report.error(format!(
                        "XML error at byte {}: {}",
                        reader.buffer_position(),
                        e
                    ));
                    break;
                }
            }
            buf.clear();
        }

        if report.errors.is_empty() {
            if depth != 0 {
                report.error(format!("{} element(s) left unclosed", depth));
            }
            if roots != 1 {
                report.error(format!("Expected exactly one root element, found {}", roots));
            }
        }

        Ok(report.finish())
    }

    /// Records are skipped over as they are parsed, so memory stays flat
    /// however large the feed is.
    fn validate_json(path: &Path) -> Result<ValidationReport, ValidationError> {
        let mut report = ValidationReport::default();
        match serde_json::from_reader::<_, Vec<IgnoredAny>>(Self::open(path)?) {
            Ok(items) => report.records = items.len() as u64,
            Err(e) if e.classify() == Category::Data => {
                report.error(format!("Top-level JSON value is not an array: {}", e));
            }
            Err(e) => {
                report.error(format!("Invalid JSON: {}", e));
            }
        }
        Ok(report.finish())
    }

    fn validate_jsonl(path: &Path) -> Result<ValidationReport, ValidationError> {
        let mut report = ValidationReport::default();
        for (idx, line) in Self::open(path)?.lines().enumerate() {
            let line = line.map_err(|e| ValidationError::Read {
                path: path.to_path_buf(),
                source: e,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<IgnoredAny>(&line) {
                Ok(_) => report.records += 1,
                Err(e) => {
                    if !report.error(format!("Line {}: {}", idx + 1, e)) {
                        break;
                    }
                }
            }
        }
        Ok(report.finish())
    }

    fn validate_csv(path: &Path) -> Result<ValidationReport, ValidationError> {
        let mut report = ValidationReport::default();
        let mut splitter = CsvRecords::default();
        let mut header_fields: Option<usize> = None;

        for (idx, line) in Self::open(path)?.lines().enumerate() {
            let line = line.map_err(|e| ValidationError::Read {
                path: path.to_path_buf(),
                source: e,
            })?;
            let Some(fields) = splitter.push_line(&line) else {
                continue;
            };
            match header_fields {
                None => header_fields = Some(fields),
                Some(expected) if fields == expected => report.records += 1,
                Some(expected) => {
                    if !report.error(format!(
                        "Line {}: expected {} fields, found {}",
                        idx + 1,
                        expected,
                        fields
                    )) {
                        break;
                    }
                }
            }
        }

        if splitter.in_quotes {
            report.error("Unterminated quoted field at end of file".to_string());
        }
        if header_fields.is_none() {
            report.error("Missing CSV header".to_string());
        }

        Ok(report.finish())
    }
}

/// Counts fields per CSV record, letting quoted fields span lines.
#[derive(Debug, Default)]
struct CsvRecords {
    in_quotes: bool,
    fields: usize,
    started: bool,
}

impl CsvRecords {
    /// Feeds one physical line. Returns the field count once a record ends.
    fn push_line(&mut self, line: &str) -> Option<usize> {
        if !self.started {
            if line.is_empty() {
                return None;
            }
            self.started = true;
            self.fields = 1;
        }

        for c in line.chars() {
            match c {
                '"' => self.in_quotes = !self.in_quotes,
                ',' if !self.in_quotes => self.fields += 1,
                _ => {}
            }
        }

        if self.in_quotes {
            return None;
        }
        self.started = false;
        Some(self.fields)
    }
}

impl Validator for FormatValidator {
    fn validate(&self, path: &Path, format: FeedFormat) -> Result<ValidationReport, ValidationError> {
        match format {
            FeedFormat::Xml => Self::validate_xml(path),
            FeedFormat::Json => Self::validate_json(path),
            FeedFormat::Jsonl => Self::validate_jsonl(path),
            FeedFormat::Csv => Self::validate_csv(path),
        }
    }
}
