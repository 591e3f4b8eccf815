use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{
    Access, AttributeError, AttributeKey, AttributeSink, AttributeSource, AttributeValue, ValueKind,
};

/// Handle on one attribute file of a device folder.
///
/// The read side keeps its own file descriptor open for the lifetime of the
/// handle and rewinds it before every read, so each read reflects the value the
/// driver reports right now. Writes open the file for every commit because the
/// driver applies a value per `write(2)` on a freshly truncated file.
#[derive(Debug)]
pub struct SysfsAttribute {
    key: AttributeKey,
    path: PathBuf,
    kind: ValueKind,
    access: Access,
    reader: Option<File>,
    buffer: String,
}

impl SysfsAttribute {
    pub fn new(key: AttributeKey, path: PathBuf, kind: ValueKind, access: Access) -> Self {
        Self {
            key,
            path,
            kind,
            access,
            reader: None,
            buffer: String::with_capacity(32),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> AttributeError {
        AttributeError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn read_raw(&mut self) -> Result<&str, AttributeError> {
        if self.reader.is_none() {
            let file = File::open(&self.path).map_err(|e| self.io_error(e))?;
            self.reader = Some(file);
        }

        self.buffer.clear();
        let result = match self.reader.as_mut() {
            Some(file) => file
                .seek(SeekFrom::Start(0))
                .and_then(|_| file.read_to_string(&mut self.buffer)),
            None => Ok(0),
        };
        if let Err(e) = result {
            // Drop the descriptor so the next read reopens it
            self.reader = None;
            return Err(self.io_error(e));
        }

        Ok(self.buffer.trim_end())
    }
}

impl AttributeSource for SysfsAttribute {
    fn key(&self) -> &AttributeKey {
        &self.key
    }

    fn read(&mut self) -> Result<AttributeValue, AttributeError> {
        if !self.access.readable() {
            return Err(AttributeError::NotReadable(self.key.clone()));
        }

        let kind = self.kind;
        let raw = self.read_raw()?;
        match kind {
            ValueKind::Text => Ok(AttributeValue::Text(raw.to_string())),
            ValueKind::Int => match raw.trim().parse::<i64>() {
                Ok(v) => Ok(AttributeValue::Int(v)),
                Err(_) => {
                    let raw = raw.to_string();
                    Err(AttributeError::Parse {
                        key: self.key.clone(),
                        raw,
                    })
                }
            },
        }
    }
}

impl AttributeSink for SysfsAttribute {
    fn key(&self) -> &AttributeKey {
        &self.key
    }

    fn write(&mut self, value: &AttributeValue) -> Result<(), AttributeError> {
        if !self.access.writable() {
            return Err(AttributeError::NotWritable(self.key.clone()));
        }

        let text = match self.kind {
            // Integer attributes take whole numbers; fractions truncate toward zero
            ValueKind::Int => match value {
                AttributeValue::Int(v) => v.to_string(),
                other => (other.as_f64()?.trunc() as i64).to_string(),
            },
            ValueKind::Text => value.to_string(),
        };

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        file.write_all(text.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| self.io_error(e))
    }
}
