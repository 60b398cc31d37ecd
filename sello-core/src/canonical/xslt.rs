use super::{CanonicalError, StagedStylesheet};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Applies a staged stylesheet to a document and returns the text output.
///
/// Closures with the same shape implement it, which is how tests swap in a
/// deterministic fake.
pub trait Transform: Send + Sync {
    fn apply(&self, stylesheet: &StagedStylesheet, xml: &str) -> Result<String, CanonicalError>;
}

impl<F> Transform for F
where
    F: Fn(&StagedStylesheet, &str) -> Result<String, CanonicalError> + Send + Sync,
{
    fn apply(&self, stylesheet: &StagedStylesheet, xml: &str) -> Result<String, CanonicalError> {
        self(stylesheet, xml)
    }
}

/// Runs a local `xsltproc` (XSLT 1.0) with network access disabled.
#[derive(Debug, Clone)]
pub struct Xsltproc {
    program: PathBuf,
}

impl Default for Xsltproc {
    fn default() -> Self {
        Self {
            program: PathBuf::from("xsltproc"),
        }
    }
}

impl Xsltproc {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

impl Transform for Xsltproc {
    fn apply(&self, stylesheet: &StagedStylesheet, xml: &str) -> Result<String, CanonicalError> {
        let unavailable = |detail: String| CanonicalError::Unavailable {
            kind: stylesheet.kind(),
            detail,
        };

        let mut child = Command::new(&self.program)
            .arg("--nonet")
            .arg(stylesheet.path())
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| unavailable(format!("failed to spawn {}: {e}", self.program.display())))?;

        let stdin = child.stdin.take();
        let (output, written) = std::thread::scope(|scope| {
            // Feed stdin from a second thread so a large result cannot stall
            // the child on a full stdout pipe.
            let writer = scope.spawn(move || match stdin {
                Some(mut stdin) => stdin.write_all(xml.as_bytes()),
                None => Ok(()),
            });
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));
            (output, written)
        });
        let output = output.map_err(|e| unavailable(format!("waiting for xsltproc failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(unavailable(format!(
                "xsltproc exited with {}: {stderr}",
                output.status
            )));
        }
        written.map_err(|e| unavailable(format!("writing document to xsltproc failed: {e}")))?;
        String::from_utf8(output.stdout)
            .map_err(|e| unavailable(format!("transformation output is not UTF-8: {e}")))
    }
}
