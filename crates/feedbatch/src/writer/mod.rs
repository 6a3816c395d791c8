//! Streaming output writer that survives being torn down between requests.
//!
//! A session is `open` → (`append_batch` → `pause` → `resume`)* → `close`.
//! `pause` flushes and drops the file handle and returns a serialisable
//! [`WriterState`]; `resume` reopens the file from that state. The state
//! records how many bytes were committed, so a batch torn by a crash between
//! writing and saving the job document is cut off on the next resume.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::WriterError;
use crate::feed::renderer::csv_field;
use crate::feed::{FeedDefinition, FeedFormat};

/// Persisted writer session, stored inside the job document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterState {
    pub path: PathBuf,
    pub format: FeedFormat,
    /// Written on `close`.
    pub footer: String,
    pub records_written: u64,
    /// Bytes known to be on disk and consistent.
    pub bytes_committed: u64,
    #[serde(default)]
    pub closed: bool,
}

pub struct OutputWriter {
    state: WriterState,
    file: BufWriter<File>,
}

fn header_and_footer(feed: &FeedDefinition) -> (String, String) {
    match feed.format {
        FeedFormat::Xml => (
            format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<{}>\n",
                feed.xml_root
            ),
            format!("</{}>\n", feed.xml_root),
        ),
        FeedFormat::Csv => {
            let header = feed
                .columns
                .iter()
                .map(|c| csv_field(c))
                .collect::<Vec<_>>()
                .join(",");
            (format!("{}\n", header), String::new())
        }
        FeedFormat::Json => ("[\n".to_string(), "\n]\n".to_string()),
        FeedFormat::Jsonl => (String::new(), String::new()),
    }
}

impl OutputWriter {
    /// Creates (or truncates) the artifact and writes the format's header.
    pub fn open(path: &Path, feed: &FeedDefinition) -> Result<Self, WriterError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WriterError::Open {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let file = File::create(path).map_err(|e| WriterError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;

        let (header, footer) = header_and_footer(feed);
        let mut writer = Self {
            state: WriterState {
                path: path.to_path_buf(),
                format: feed.format,
                footer,
                records_written: 0,
                bytes_committed: 0,
                closed: false,
            },
            file: BufWriter::new(file),
        };
        writer.write_str(&header)?;
        Ok(writer)
    }

    /// Reopens a paused session for appending.
    pub fn resume(state: &WriterState) -> Result<Self, WriterError> {
        if state.closed {
            return Err(WriterError::Closed(state.path.clone()));
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(&state.path)
            .map_err(|e| WriterError::Open {
                path: state.path.clone(),
                source: e,
            })?;

        let actual = file
            .metadata()
            .map_err(|e| WriterError::Open {
                path: state.path.clone(),
                source: e,
            })?
            .len();

        if actual < state.bytes_committed {
            return Err(WriterError::Truncated {
                path: state.path.clone(),
                expected: state.bytes_committed,
                actual,
            });
        }
        if actual > state.bytes_committed {
            tracing::warn!(
                file = %crate::sanitize::redact_path(&state.path),
                expected = state.bytes_committed,
                actual,
                "Discarding uncommitted bytes from an interrupted batch"
            );
            file.set_len(state.bytes_committed)
                .map_err(|e| WriterError::Write {
                    path: state.path.clone(),
                    source: e,
                })?;
        }

        file.seek(SeekFrom::Start(state.bytes_committed))
            .map_err(|e| WriterError::Open {
                path: state.path.clone(),
                source: e,
            })?;

        Ok(Self {
            state: state.clone(),
            file: BufWriter::new(file),
        })
    }

    pub fn state(&self) -> &WriterState {
        &self.state
    }

    fn write_str(&mut self, s: &str) -> Result<(), WriterError> {
        self.file
            .write_all(s.as_bytes())
            .map_err(|e| WriterError::Write {
                path: self.state.path.clone(),
                source: e,
            })?;
        self.state.bytes_committed += s.len() as u64;
        Ok(())
    }

    /// Appends rendered fragments, one record each.
    pub fn append_batch(&mut self, fragments: &[String]) -> Result<(), WriterError> {
        for fragment in fragments {
            let separator = match self.state.format {
                FeedFormat::Json if self.state.records_written > 0 => ",\n",
                _ => "",
            };
            let terminator = match self.state.format {
                FeedFormat::Json => "",
                _ => "\n",
            };
            self.write_str(separator)?;
            self.write_str(fragment)?;
            self.write_str(terminator)?;
            self.state.records_written += 1;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WriterError> {
        self.file.flush().map_err(|e| WriterError::Write {
            path: self.state.path.clone(),
            source: e,
        })?;
        self.file.get_ref().sync_data().map_err(|e| WriterError::Write {
            path: self.state.path.clone(),
            source: e,
        })
    }

    /// Flushes and releases the file handle.
    pub fn pause(mut self) -> Result<WriterState, WriterError> {
        self.flush()?;
        Ok(self.state)
    }

    /// Writes the footer and finishes the session.
    pub fn close(mut self) -> Result<WriterState, WriterError> {
        let footer = std::mem::take(&mut self.state.footer);
        self.write_str(&footer)?;
        self.flush()?;
        self.state.closed = true;
        Ok(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(format: FeedFormat) -> FeedDefinition {
        let mut def = FeedDefinition::new("t", format, "t.out");
        def.columns = vec!["id".into(), "title".into()];
        def
    }

    fn frags(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_xml_session_across_pauses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.xml.part");

        let writer = OutputWriter::open(&path, &feed(FeedFormat::Xml)).unwrap();
        let state = writer.pause().unwrap();

        let mut writer = OutputWriter::resume(&state).unwrap();
        writer.append_batch(&frags(&["<product>1</product>"])).unwrap();
        let state = writer.pause().unwrap();

        let mut writer = OutputWriter::resume(&state).unwrap();
        writer.append_batch(&frags(&["<product>2</product>"])).unwrap();
        let state = writer.close().unwrap();

        assert!(state.closed);
        assert_eq!(state.records_written, 2);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<products>\n\
             <product>1</product>\n<product>2</product>\n</products>\n"
        );
        assert_eq!(state.bytes_committed, content.len() as u64);
    }

    #[test]
    fn test_json_separators_span_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json.part");

        let mut writer = OutputWriter::open(&path, &feed(FeedFormat::Json)).unwrap();
        writer.append_batch(&frags(&["{\"id\":1}"])).unwrap();
        let state = writer.pause().unwrap();

        let mut writer = OutputWriter::resume(&state).unwrap();
        writer
            .append_batch(&frags(&["{\"id\":2}", "{\"id\":3}"]))
            .unwrap();
        writer.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_empty_json_feed_is_valid_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.json.part");
        OutputWriter::open(&path, &feed(FeedFormat::Json))
            .unwrap()
            .close()
            .unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed, serde_json::json!([]));
    }

    #[test]
    fn test_csv_header_from_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.csv.part");
        let mut writer = OutputWriter::open(&path, &feed(FeedFormat::Csv)).unwrap();
        writer.append_batch(&frags(&["1,Bowl"])).unwrap();
        writer.close().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "id,title\n1,Bowl\n");
    }

    #[test]
    fn test_resume_discards_torn_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.jsonl.part");

        let mut writer = OutputWriter::open(&path, &feed(FeedFormat::Jsonl)).unwrap();
        writer.append_batch(&frags(&["{\"id\":1}"])).unwrap();
        let committed = writer.pause().unwrap();

        // A later call wrote but crashed before its state was saved.
        let mut torn = OutputWriter::resume(&committed).unwrap();
        torn.append_batch(&frags(&["{\"id\":2}"])).unwrap();
        torn.pause().unwrap();

        let mut writer = OutputWriter::resume(&committed).unwrap();
        writer.append_batch(&frags(&["{\"id\":2}"])).unwrap();
        writer.close().unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "{\"id\":1}\n{\"id\":2}\n"
        );
    }

    #[test]
    fn test_resume_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.xml.part");
        let state = OutputWriter::open(&path, &feed(FeedFormat::Xml))
            .unwrap()
            .pause()
            .unwrap();
        std::fs::write(&path, "").unwrap();

        assert!(matches!(
            OutputWriter::resume(&state),
            Err(WriterError::Truncated { .. })
        ));
    }

    #[test]
    fn test_resume_closed_session_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.xml.part");
        let state = OutputWriter::open(&path, &feed(FeedFormat::Xml))
            .unwrap()
            .close()
            .unwrap();
        assert!(matches!(
            OutputWriter::resume(&state),
            Err(WriterError::Closed(_))
        ));
    }

    #[test]
    fn test_resume_missing_file() {
        let state = WriterState {
            path: PathBuf::from("/no/such/feed.part"),
            format: FeedFormat::Xml,
            footer: String::new(),
            records_written: 0,
            bytes_committed: 0,
            closed: false,
        };
        assert!(matches!(
            OutputWriter::resume(&state),
            Err(WriterError::Open { .. })
        ));
    }
}
