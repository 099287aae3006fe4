//! Appends messages to a file, one JSON document per line.
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use super::{MessageId, MessageSink};
use crate::error::QueueError;

/// File sink for runs without a queue. Existing content is kept, new lines go to the end.
pub struct JsonLinesFile {
    writer: BufWriter<File>,
    written: i64,
}

impl JsonLinesFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<JsonLinesFile, QueueError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(JsonLinesFile {
            writer: BufWriter::new(file),
            written: 0,
        })
    }
}

impl MessageSink for JsonLinesFile {
    /// Writes `body` as one line and flushes it. The id is the line number within this run.
    fn enqueue(&mut self, body: &[u8]) -> Result<MessageId, QueueError> {
        self.writer.write_all(body)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.written += 1;
        Ok(MessageId(self.written))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn writes_one_line_per_message() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data_output.json");

        let mut sink = JsonLinesFile::open(&path).unwrap();
        assert_eq!(sink.enqueue(b"{\"id\":1}").unwrap(), MessageId(1));
        assert_eq!(sink.enqueue(b"{\"id\":2}").unwrap(), MessageId(2));

        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"id\":1}\n{\"id\":2}\n");
    }

    #[test]
    fn keeps_existing_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data_output.json");
        fs::write(&path, "{\"id\":0}\n").unwrap();

        JsonLinesFile::open(&path).unwrap().enqueue(b"{\"id\":1}").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"id\":0}\n{\"id\":1}\n");
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempdir().unwrap();
        let result = JsonLinesFile::open(dir.path().join("missing").join("out.json"));
        assert!(matches!(result, Err(QueueError::Io(_))));
    }
}
