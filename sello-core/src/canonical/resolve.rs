use super::CanonicalError;
use crate::document::DocumentKind;
use libxml::parser::Parser;
use libxml::tree::{Node, NodeType};
use libxml::xpath;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const XSL_NS: &str = "http://www.w3.org/1999/XSL/Transform";
const PLACEHOLDER_NAME: &str = "sello-noop.xslt";
const PLACEHOLDER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform"/>
"#;
const TEMPLATE_XPATH: &str = "//xsl:template[@match]";
const MAX_DEPTH: usize = 16;
const SUB_TEMPLATE_XPATH: &str = "/xsl:stylesheet/xsl:include | /xsl:stylesheet/xsl:import \
    | /xsl:transform/xsl:include | /xsl:transform/xsl:import";

/// Searches an ordered list of directories for stylesheets; first hit wins.
#[derive(Debug, Clone)]
pub struct StylesheetResolver {
    roots: Vec<PathBuf>,
}

impl Default for StylesheetResolver {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl StylesheetResolver {
    /// Configured roots first, then `./xslt`, then `./resources/xslt`.
    pub fn new(configured: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut roots: Vec<PathBuf> = configured.into_iter().collect();
        roots.push(PathBuf::from("xslt"));
        roots.push(PathBuf::from("resources").join("xslt"));
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Look `name` up as given, then by its file-name component.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let as_given = Path::new(name);
        if as_given.is_absolute() {
            if as_given.is_file() {
                return Some(as_given.to_path_buf());
            }
        } else if let Some(hit) = self.roots.iter().map(|r| r.join(as_given)).find(|p| p.is_file()) {
            return Some(hit);
        }
        let file_name = as_given.file_name()?;
        self.roots
            .iter()
            .map(|root| root.join(file_name))
            .find(|path| path.is_file())
    }
}

/// A main stylesheet copied into a private directory together with every
/// sub-template it reaches, each reference pointing at a staged copy or the
/// no-op placeholder.
#[derive(Debug)]
pub struct StagedStylesheet {
    kind: DocumentKind,
    source: PathBuf,
    path: PathBuf,
    resolved: Vec<(String, PathBuf)>,
    placeholders: Vec<String>,
    covered: BTreeSet<String>,
    _dir: TempDir,
}

impl StagedStylesheet {
    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    /// The stylesheet the bundle was staged from.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// The staged, rewritten main stylesheet.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `(href, original file)` for every sub-template that was found, at any
    /// nesting depth.
    pub fn resolved(&self) -> &[(String, PathBuf)] {
        &self.resolved
    }

    /// `href`s that were not found and now point at the placeholder.
    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }

    /// Namespaces some staged stylesheet has a template `match` for.
    pub fn covered_namespaces(&self) -> impl Iterator<Item = &str> {
        self.covered.iter().map(String::as_str)
    }

    pub fn covers(&self, namespace: &str) -> bool {
        self.covered.contains(namespace)
    }
}

pub(super) fn stage(
    resolver: &StylesheetResolver,
    kind: DocumentKind,
    name: &str,
) -> Result<StagedStylesheet, CanonicalError> {
    let unavailable = |detail: String| CanonicalError::Unavailable { kind, detail };

    let source = resolver.resolve(name).ok_or_else(|| {
        unavailable(format!(
            "stylesheet {name} not found under {:?}",
            resolver.roots()
        ))
    })?;
    let source = source.canonicalize().unwrap_or(source);

    let dir = tempfile::Builder::new()
        .prefix("sello-xslt-")
        .tempdir()
        .map_err(|e| unavailable(format!("failed to create staging directory: {e}")))?;
    let placeholder = dir.path().join(PLACEHOLDER_NAME);
    fs::write(&placeholder, PLACEHOLDER)
        .map_err(|e| unavailable(format!("failed to write placeholder: {e}")))?;

    let file_name = source
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| name.into());
    let path = dir.path().join(file_name);

    let mut stager = Stager {
        resolver,
        kind,
        dir: dir.path(),
        placeholder,
        staged: HashMap::new(),
        resolved: Vec::new(),
        placeholders: Vec::new(),
        covered: BTreeSet::new(),
    };
    stager.staged.insert(source.clone(), path.clone());
    stager.stage_file(&source, &path, 0)?;
    let Stager {
        resolved,
        placeholders,
        covered,
        ..
    } = stager;

    tracing::info!(
        kind = kind.as_str(),
        stylesheet = %source.display(),
        resolved = resolved.len(),
        placeholders = placeholders.len(),
        covered = covered.len(),
        "staged canonicalization stylesheet"
    );
    Ok(StagedStylesheet {
        kind,
        source,
        path,
        resolved,
        placeholders,
        covered,
        _dir: dir,
    })
}

struct Stager<'a> {
    resolver: &'a StylesheetResolver,
    kind: DocumentKind,
    dir: &'a Path,
    placeholder: PathBuf,
    /// Original file to its staged copy; also breaks include cycles.
    staged: HashMap<PathBuf, PathBuf>,
    resolved: Vec<(String, PathBuf)>,
    placeholders: Vec<String>,
    covered: BTreeSet<String>,
}

impl Stager<'_> {
    fn unavailable(&self, detail: String) -> CanonicalError {
        CanonicalError::Unavailable {
            kind: self.kind,
            detail,
        }
    }

    /// Rewrites `source` into `target`, staging every sub-template it names
    /// first.
    fn stage_file(
        &mut self,
        source: &Path,
        target: &Path,
        depth: usize,
    ) -> Result<(), CanonicalError> {
        if depth > MAX_DEPTH {
            return Err(self.unavailable(format!(
                "sub-templates nest deeper than {MAX_DEPTH} levels at {}",
                source.display()
            )));
        }
        let source_str = source.to_string_lossy();
        let doc = Parser::default()
            .parse_file(&source_str)
            .map_err(|e| self.unavailable(format!("stylesheet {source_str} is not well-formed: {e:?}")))?;
        let ctx = xpath::Context::new(&doc)
            .map_err(|e| self.unavailable(format!("XPath context error: {e:?}")))?;
        ctx.register_namespace("xsl", XSL_NS)
            .map_err(|e| self.unavailable(format!("XPath context error: {e:?}")))?;

        let templates = ctx
            .evaluate(TEMPLATE_XPATH)
            .map_err(|e| self.unavailable(format!("XPath error: {e:?}")))?
            .get_nodes_as_vec();
        for template in &templates {
            self.covered.extend(matched_namespaces(template));
        }

        let nodes = ctx
            .evaluate(SUB_TEMPLATE_XPATH)
            .map_err(|e| self.unavailable(format!("XPath error: {e:?}")))?
            .get_nodes_as_vec();
        let source_dir = source.parent().map(Path::to_path_buf).unwrap_or_default();
        for mut node in nodes {
            let Some(href) = node.get_attribute("href") else {
                continue;
            };
            let staged = match resolve_sub_template(self.resolver, &source_dir, &href) {
                Some(found) => {
                    let found = found.canonicalize().unwrap_or(found);
                    tracing::debug!(href = %href, path = %found.display(), depth, "resolved sub-template");
                    self.resolved.push((href.clone(), found.clone()));
                    self.staged_copy(&found, depth)?
                }
                None => {
                    tracing::debug!(href = %href, depth, "sub-template not found, staging placeholder");
                    self.placeholders.push(href.clone());
                    self.placeholder.clone()
                }
            };
            node.set_attribute("href", &staged.to_string_lossy())
                .map_err(|e| self.unavailable(format!("failed to rewrite {href}: {e}")))?;
        }

        fs::write(target, doc.to_string())
            .map_err(|e| self.unavailable(format!("failed to write staged stylesheet: {e}")))
    }

    fn staged_copy(&mut self, found: &Path, depth: usize) -> Result<PathBuf, CanonicalError> {
        if let Some(existing) = self.staged.get(found) {
            return Ok(existing.clone());
        }
        let file_name = found
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = self
            .dir
            .join(format!("{:02}-{file_name}", self.staged.len()));
        self.staged.insert(found.to_path_buf(), target.clone());
        self.stage_file(found, &target, depth + 1)?;
        Ok(target)
    }
}

/// Namespace URIs whose prefixes appear in the template's `match` pattern.
fn matched_namespaces(template: &Node) -> Vec<String> {
    let Some(pattern) = template.get_attribute("match") else {
        return Vec::new();
    };
    let prefixes = pattern_prefixes(&pattern);
    if prefixes.is_empty() {
        return Vec::new();
    }

    let mut in_scope: HashMap<String, String> = HashMap::new();
    let mut current = Some(template.clone());
    while let Some(node) = current {
        if node.get_type() != Some(NodeType::ElementNode) {
            break;
        }
        for ns in node.get_namespace_declarations() {
            in_scope.entry(ns.get_prefix()).or_insert_with(|| ns.get_href());
        }
        current = node.get_parent();
    }
    prefixes
        .into_iter()
        .filter_map(|prefix| in_scope.get(prefix).cloned())
        .collect()
}

/// QName prefixes in an XSLT pattern, skipping `axis::` steps.
fn pattern_prefixes(pattern: &str) -> Vec<&str> {
    let bytes = pattern.as_bytes();
    let is_name = |b: u8| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.');
    let mut out = Vec::new();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b':' {
            continue;
        }
        let double = bytes.get(i + 1) == Some(&b':') || (i > 0 && bytes[i - 1] == b':');
        if double {
            continue;
        }
        let start = bytes[..i]
            .iter()
            .rposition(|&c| !is_name(c))
            .map_or(0, |p| p + 1);
        let prefix = &pattern[start..i];
        if prefix
            .as_bytes()
            .first()
            .is_some_and(|c| c.is_ascii_alphabetic() || *c == b'_')
            && !out.contains(&prefix)
        {
            out.push(prefix);
        }
    }
    out
}

/// Relative to the referring stylesheet first, then through the resolver by
/// file name. Remote references are only ever matched against local copies.
fn resolve_sub_template(
    resolver: &StylesheetResolver,
    source_dir: &Path,
    href: &str,
) -> Option<PathBuf> {
    let is_remote = href.contains("://");
    if !is_remote {
        let local = source_dir.join(href);
        if local.is_file() {
            return Some(local);
        }
    }
    let file_name = href.rsplit(['/', '\\']).next().filter(|n| !n.is_empty())?;
    resolver.resolve(file_name)
}

/// Whether a document declaring `namespaces` uses the extension an
/// unresolved `href` would implement.
pub(super) fn extension_used(href: &str, namespaces: &[&str]) -> bool {
    let file_name = href.rsplit(['/', '\\']).next().unwrap_or(href);
    let stem = alphanumeric_lower(file_name.rsplit_once('.').map_or(file_name, |(s, _)| s));
    if stem.is_empty() {
        return false;
    }
    namespaces.iter().any(|uri| {
        let segment = uri.trim_end_matches('/').rsplit('/').next().unwrap_or(uri);
        let segment = alphanumeric_lower(segment);
        !segment.is_empty() && (stem.starts_with(&segment) || segment.starts_with(&stem))
    })
}

fn alphanumeric_lower(input: &str) -> String {
    input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAIN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform">
  <xsl:include href="utilerias.xslt"/>
  <xsl:include href="http://www.sat.gob.mx/sitio_internet/cfd/Pagos/Pagos20.xslt"/>
  <xsl:include href="complementos/implocal.xslt"/>
  <xsl:output method="text"/>
</xsl:stylesheet>
"#;

    #[test]
    fn resolver_tries_configured_roots_then_file_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.xslt"), "x").unwrap();
        let resolver = StylesheetResolver::new(vec![dir.path().to_path_buf()]);
        assert_eq!(resolver.resolve("a.xslt"), Some(dir.path().join("a.xslt")));
        assert_eq!(
            resolver.resolve("some/where/a.xslt"),
            Some(dir.path().join("a.xslt"))
        );
        assert_eq!(resolver.resolve("missing.xslt"), None);
        assert!(resolver.roots().ends_with(&[
            PathBuf::from("xslt"),
            PathBuf::from("resources").join("xslt")
        ]));
    }

    #[test]
    fn staging_rewrites_found_and_missing_sub_templates() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.xslt"), MAIN).unwrap();
        fs::write(dir.path().join("utilerias.xslt"), PLACEHOLDER).unwrap();
        fs::write(dir.path().join("Pagos20.xslt"), PLACEHOLDER).unwrap();

        let resolver = StylesheetResolver::new(vec![dir.path().to_path_buf()]);
        let staged = stage(&resolver, DocumentKind::PaymentComplement, "main.xslt").unwrap();

        let hrefs: Vec<_> = staged.resolved().iter().map(|(h, _)| h.as_str()).collect();
        assert_eq!(
            hrefs,
            [
                "utilerias.xslt",
                "http://www.sat.gob.mx/sitio_internet/cfd/Pagos/Pagos20.xslt"
            ]
        );
        assert_eq!(staged.placeholders(), ["complementos/implocal.xslt"]);

        let written = fs::read_to_string(staged.path()).unwrap();
        assert!(!written.contains("http://www.sat.gob.mx/sitio_internet"));
        assert!(written.contains(PLACEHOLDER_NAME));
    }

    #[test]
    fn missing_main_stylesheet_is_unavailable() {
        let resolver = StylesheetResolver::new(Vec::new());
        let err = stage(&resolver, DocumentKind::Invoice, "nope-does-not-exist.xslt").unwrap_err();
        assert!(matches!(err, CanonicalError::Unavailable { .. }));
    }

    #[test]
    fn nested_sub_templates_are_staged_and_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let complements = dir.path().join("complementos");
        fs::create_dir(&complements).unwrap();
        fs::write(
            dir.path().join("main.xslt"),
            r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform">
  <xsl:include href="complementos/ecc12.xslt"/>
</xsl:stylesheet>"#,
        )
        .unwrap();
        fs::write(
            complements.join("ecc12.xslt"),
            r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform" xmlns:ecc12="http://www.sat.gob.mx/EstadoDeCuentaCombustible12">
  <xsl:include href="conceptos.xslt"/>
  <xsl:include href="ausente.xslt"/>
  <xsl:template match="ecc12:EstadoDeCuentaCombustible"/>
</xsl:stylesheet>"#,
        )
        .unwrap();
        fs::write(
            complements.join("conceptos.xslt"),
            r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform" xmlns:c="urn:conceptos">
  <xsl:include href="ecc12.xslt"/>
  <xsl:template match="child::c:Concepto | c:Traslado[@Impuesto]"/>
</xsl:stylesheet>"#,
        )
        .unwrap();

        let resolver = StylesheetResolver::new(vec![dir.path().to_path_buf()]);
        let staged = stage(&resolver, DocumentKind::Invoice, "main.xslt").unwrap();

        let hrefs: Vec<_> = staged.resolved().iter().map(|(h, _)| h.as_str()).collect();
        assert_eq!(hrefs, ["complementos/ecc12.xslt", "conceptos.xslt", "ecc12.xslt"]);
        assert_eq!(staged.placeholders(), ["ausente.xslt"]);
        assert!(staged.covers("http://www.sat.gob.mx/EstadoDeCuentaCombustible12"));
        assert!(staged.covers("urn:conceptos"));

        // Every reference in the bundle now points inside the staging directory.
        let staging = staged.path().parent().unwrap().to_path_buf();
        for entry in fs::read_dir(&staging).unwrap() {
            let text = fs::read_to_string(entry.unwrap().path()).unwrap();
            for line in text.lines().filter(|l| l.contains("xsl:include")) {
                assert!(line.contains(staging.to_string_lossy().as_ref()), "{line}");
            }
        }
    }

    #[test]
    fn pattern_prefixes_skip_axes() {
        assert_eq!(
            pattern_prefixes("cfdi:Comprobante/cfdi:Emisor | child::pago20:Pagos"),
            ["cfdi", "pago20"]
        );
        assert_eq!(pattern_prefixes("/"), Vec::<&str>::new());
        assert_eq!(pattern_prefixes("attribute::*"), Vec::<&str>::new());
    }

    #[test]
    fn extension_match_compares_stems_with_namespace_segments() {
        let ns = ["http://www.sat.gob.mx/cfd/4", "http://www.sat.gob.mx/Pagos20"];
        assert!(extension_used("Pagos20.xslt", &ns));
        assert!(extension_used("http://x/y/pagos.xslt", &ns));
        assert!(!extension_used("implocal.xslt", &ns));
        assert!(!extension_used(".xslt", &ns));
    }
}
