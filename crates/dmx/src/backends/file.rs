//! 📂 FileSource — reads a delimited flat file, one record per line.
//!
//! 🧠 Knowledge graph:
//! - Config lives next to the backend that uses it (`FileSourceConfig`).
//! - Lines are read as raw bytes so a non-UTF-8 line becomes a `RecordFormat` error with its
//!   line number, instead of an anonymous io error.
//! - Splitting and validation are `RawRecord::parse`'s job. This file only reads.
//! - Progress (bytes vs file size) goes to `ProgressMetrics`.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{
    fs::File,
    io::{self, AsyncBufReadExt},
};
use tracing::{debug, trace};

use crate::backends::Source;
use crate::common::RawRecord;
use crate::errors::PipelineError;
use crate::progress::ProgressMetrics;

// -- 📂 "It's just a file", said no sysadmin ever before the disk filled up.
#[derive(Debug, Deserialize, Clone)]
pub struct FileSourceConfig {
    /// 📍 Path to the flat file. Relative paths resolve against the working directory.
    pub file_name: String,
    /// 🔪 Field separator. One ASCII character. The pipe, traditionally.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

fn default_delimiter() -> char {
    '|'
}

impl FileSourceConfig {
    /// 🔪 The delimiter as the byte the splitter wants, or a config error if it won't fit.
    pub fn delimiter_byte(&self) -> Result<u8, PipelineError> {
        match self.delimiter {
            // -- ':' splits key from value, line endings split records; neither can split fields
            ':' | '\n' | '\r' => Err(PipelineError::Config(format!(
                "delimiter {:?} is already taken by the line format",
                self.delimiter
            ))),
            delimiter if delimiter.is_ascii() => Ok(delimiter as u8),
            delimiter => Err(PipelineError::Config(format!(
                "delimiter '{delimiter}' must be a single ASCII character"
            ))),
        }
    }
}

/// 📂 Reads the file line by line and hands out validated records.
///
/// 🧵 Async, non-blocking: a tokio `BufReader` over a tokio `File`.
/// ⚠️ If the file is being written to while we read it, the size estimate will be wrong.
///    The records will not. We only trust the records.
pub struct FileSource {
    buf_reader: io::BufReader<File>,
    source_config: FileSourceConfig,
    delimiter: u8,
    line_number: u64,
    progress: ProgressMetrics,
}

// 🐛 progress is left out: nobody debugging a FileSource wants to read a progress bar struct.
impl std::fmt::Debug for FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSource")
            .field("source_config", &self.source_config)
            .field("line_number", &self.line_number)
            .finish()
    }
}

impl FileSource {
    /// 🚀 Open the file and get ready to vend records.
    ///
    /// 💀 `SourceUnavailable` if the file won't open. `Config` if the delimiter isn't ASCII.
    pub async fn open(source_config: FileSourceConfig) -> Result<Self, PipelineError> {
        let delimiter = source_config.delimiter_byte()?;
        let (buf_reader, file_size) = Self::open_reader(&source_config.file_name).await?;
        let progress = ProgressMetrics::new(source_config.file_name.clone(), file_size);
        debug!(
            "📂 opened '{}' ({} bytes), splitting on '{}'",
            source_config.file_name, file_size, source_config.delimiter
        );

        Ok(Self {
            buf_reader,
            source_config,
            delimiter,
            line_number: 0,
            progress,
        })
    }

    async fn open_reader(file_name: &str) -> Result<(io::BufReader<File>, u64), PipelineError> {
        // -- 💀 The door. It's locked. Or it doesn't exist. Or the filesystem lied to you.
        let file_handle = File::open(file_name).await.map_err(|err| {
            PipelineError::source_unavailable(
                file_name,
                format!("the file would not open ({err}). Check the path, check the permissions, check the working directory."),
            )
        })?;
        // 📏 0 = unknown, the progress bar copes
        let file_size = file_handle.metadata().await.map(|m| m.len()).unwrap_or(0);
        Ok((io::BufReader::new(file_handle), file_size))
    }
}

#[async_trait]
impl Source for FileSource {
    async fn next_record(&mut self) -> Result<Option<RawRecord>, PipelineError> {
        let mut line = Vec::with_capacity(256);
        loop {
            line.clear();
            let bytes_read = self
                .buf_reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(|err| {
                    PipelineError::source_unavailable(
                        &self.source_config.file_name,
                        format!("read failed after line {}: {err}", self.line_number),
                    )
                })?;
            if bytes_read == 0 {
                // 🏁 EOF. The well is dry.
                self.progress.finish();
                return Ok(None);
            }
            self.line_number += 1;
            self.progress.update(bytes_read as u64, 1);

            // 🧹 strip \n and \r\n, read_until keeps them
            while matches!(line.last(), Some(b'\n' | b'\r')) {
                line.pop();
            }
            if line.is_empty() {
                trace!("🫥 skipping blank line {}", self.line_number);
                continue;
            }

            let text = match std::str::from_utf8(&line) {
                Ok(text) => text,
                Err(err) => {
                    return Err(PipelineError::record_format(
                        self.line_number,
                        String::from_utf8_lossy(&line),
                        format!("line is not valid UTF-8: {err}"),
                    ));
                }
            };
            return RawRecord::parse(self.line_number, text, self.delimiter).map(Some);
        }
    }

    async fn restart(&mut self) -> Result<(), PipelineError> {
        let (buf_reader, file_size) = Self::open_reader(&self.source_config.file_name).await?;
        self.buf_reader = buf_reader;
        self.line_number = 0;
        self.progress.finish();
        self.progress = ProgressMetrics::new(self.source_config.file_name.clone(), file_size);
        debug!("⏪ rewound '{}' for another pass", self.source_config.file_name);
        Ok(())
    }

    fn location(&self) -> &str {
        &self.source_config.file_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_source(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new()
            .expect("💀 Failed to create a temp file. The filesystem said 'new phone who dis'.");
        file.write_all(contents)
            .expect("💀 Failed to write the temp source file.");
        file
    }

    fn config_for(file: &tempfile::NamedTempFile) -> FileSourceConfig {
        FileSourceConfig {
            file_name: file.path().display().to_string(),
            delimiter: '|',
        }
    }

    #[tokio::test]
    async fn the_one_where_lines_become_records_with_their_line_numbers() {
        let file = write_source(b"2024-01-05|USD:1.08\r\n\n2024-01-06|JPY:160.2\n");
        let mut source = FileSource::open(config_for(&file)).await.expect("💀 open");

        let first = source.next_record().await.expect("💀 read").expect("💀 some");
        assert_eq!(first.offset, 1);
        assert_eq!(first.date(), "2024-01-05");

        // -- the blank line 2 is skipped but still counted
        let second = source.next_record().await.expect("💀 read").expect("💀 some");
        assert_eq!(second.offset, 3);
        assert_eq!(second.pairs().next(), Some(("JPY", "160.2")));

        assert!(source.next_record().await.expect("💀 read").is_none());
    }

    #[tokio::test]
    async fn the_one_where_restart_reads_it_all_again() {
        let file = write_source(b"2024-01-05|USD:1.08\n");
        let mut source = FileSource::open(config_for(&file)).await.expect("💀 open");
        assert!(source.next_record().await.expect("💀 read").is_some());
        assert!(source.next_record().await.expect("💀 read").is_none());

        source.restart().await.expect("💀 restart");
        let again = source.next_record().await.expect("💀 read").expect("💀 some");
        assert_eq!(again.offset, 1);
    }

    #[tokio::test]
    async fn the_one_where_the_file_is_not_there() {
        let err = FileSource::open(FileSourceConfig {
            file_name: "/definitely/not/a/real/rates.txt".into(),
            delimiter: '|',
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn the_one_where_garbage_bytes_abort_with_an_offset() {
        let file = write_source(b"2024-01-05|USD:1.08\n2024-01-06|\xff\xfe:1\n");
        let mut source = FileSource::open(config_for(&file)).await.expect("💀 open");
        assert!(source.next_record().await.expect("💀 read").is_some());
        match source.next_record().await {
            Err(PipelineError::RecordFormat { offset, .. }) => assert_eq!(offset, 2),
            other => panic!("💀 expected a RecordFormat error, got {other:?}"),
        }
    }

    #[test]
    fn the_one_where_a_fancy_delimiter_is_turned_away() {
        let config = FileSourceConfig {
            file_name: "whatever".into(),
            delimiter: '¦',
        };
        assert!(matches!(
            config.delimiter_byte(),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn the_one_where_the_delimiter_cannot_be_a_colon_or_a_newline() {
        for taken in [':', '\n', '\r'] {
            let config = FileSourceConfig {
                file_name: "whatever".into(),
                delimiter: taken,
            };
            assert!(
                matches!(config.delimiter_byte(), Err(PipelineError::Config(_))),
                "{taken:?} should be refused"
            );
        }
        let config = FileSourceConfig {
            file_name: "whatever".into(),
            delimiter: ';',
        };
        assert_eq!(config.delimiter_byte().expect("💀 semicolon is fine"), b';');
    }
}
