//! Optional side channel that keeps a copy of each canonical string and
//! signed document for offline comparison. Never affects a signing outcome.
use crate::document::DocumentKind;
use chrono::{DateTime, FixedOffset, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S%3f";
const MAX_CLAIM_ATTEMPTS: usize = 1000;

#[derive(Debug, Clone)]
pub struct DiagnosticsSink {
    dir: PathBuf,
    offset: FixedOffset,
}

impl DiagnosticsSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            offset: crate::clock::default_offset(),
        }
    }

    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `<stamp>-<kind>-cadena.txt` and `<stamp>-<kind>-signed.xml`.
    ///
    /// A pair already written for the same stamp and kind is never
    /// overwritten; the new pair gets a `-<n>` suffix after the kind.
    /// Returns the paths that were written; failures are logged and skipped.
    pub fn record(
        &self,
        kind: DocumentKind,
        at: DateTime<Utc>,
        canonical: &str,
        signed_xml: &str,
    ) -> Vec<PathBuf> {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), error = %e, "cannot create diagnostics directory");
            return Vec::new();
        }
        let stamp = at.with_timezone(&self.offset).format(STAMP_FORMAT);
        let stem = format!("{stamp}-{}", kind.as_str());

        let (base, mut cadena) = match self.claim(&stem) {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), stem = %stem, error = %e, "cannot claim diagnostics file name");
                return Vec::new();
            }
        };

        let mut written = Vec::with_capacity(2);
        let cadena_path = self.dir.join(format!("{base}-cadena.txt"));
        match cadena.write_all(canonical.as_bytes()) {
            Ok(()) => written.push(cadena_path),
            Err(e) => {
                tracing::warn!(path = %cadena_path.display(), error = %e, "failed to write diagnostics file")
            }
        }
        let signed_path = self.dir.join(format!("{base}-signed.xml"));
        match fs::write(&signed_path, signed_xml) {
            Ok(()) => written.push(signed_path),
            Err(e) => {
                tracing::warn!(path = %signed_path.display(), error = %e, "failed to write diagnostics file")
            }
        }
        written
    }

    /// First free `<stem>[-n]` base, reserved by creating its cadena file.
    fn claim(&self, stem: &str) -> io::Result<(String, File)> {
        for attempt in 0..MAX_CLAIM_ATTEMPTS {
            let base = match attempt {
                0 => stem.to_string(),
                n => format!("{stem}-{n}"),
            };
            let path = self.dir.join(format!("{base}-cadena.txt"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((base, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{MAX_CLAIM_ATTEMPTS} diagnostics pairs already exist for {stem}"),
        ))
    }
}
