//! AndroidManifest.xml analysis.
//!
//! Parses a text manifest into component declarations and requested
//! permissions, then scores it:
//! - one document-level finding carrying the raw-byte entropy verdict and an
//!   identifier verdict per declared component
//! - one finding per suspicious `uses-permission`
//!
//! Entropy never depends on parsing, so undecodable or malformed manifests
//! still yield the document-level finding.

use crate::classify::ComponentKind;
use crate::entropy::calculate_entropy;
use crate::error::{AnalysisError, Result};
use crate::rules::SuspicionRules;
use crate::types::Finding;
use roxmltree::Document;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const ANDROID_NS: &str = "http://schemas.android.com/apk/res/android";

const COMPONENT_TAGS: &[&str] = &["activity", "service", "receiver", "provider", "application"];

/// A named component declaration (`<activity android:name=...>` etc.)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDecl {
    pub tag: String,
    pub name: String,
}

/// Structural view of a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestModel {
    /// `package` attribute of the root `<manifest>` element
    pub package: Option<String>,
    pub components: Vec<ComponentDecl>,
    /// Requested permissions in document order, without duplicates
    pub permissions: Vec<String>,
}

impl ManifestModel {
    /// Parse manifest text. Tolerates a missing `xmlns:android` declaration.
    pub fn parse(text: &str) -> Result<Self> {
        match Document::parse(text) {
            Ok(doc) => Ok(Self::from_document(&doc)),
            Err(roxmltree::Error::UnknownNamespace(prefix, _)) if prefix == "android" => {
                debug!("manifest lacks xmlns:android, retrying with a bound prefix");
                let wrapped = format!(
                    "<entrapk-wrapper xmlns:android=\"{ANDROID_NS}\">{}</entrapk-wrapper>",
                    strip_xml_declaration(text)
                );
                Document::parse(&wrapped)
                    .map(|doc| Self::from_document(&doc))
                    .map_err(|e| AnalysisError::parse(crate::classify::MANIFEST_NAME, e.to_string()))
            }
            Err(e) => Err(AnalysisError::parse(crate::classify::MANIFEST_NAME, e.to_string())),
        }
    }

    fn from_document(doc: &Document) -> Self {
        let mut model = ManifestModel {
            package: doc
                .descendants()
                .find(|n| n.has_tag_name("manifest"))
                .and_then(|n| n.attribute("package"))
                .map(str::to_string),
            ..Default::default()
        };

        for node in doc.descendants().filter(|n| n.is_element()) {
            let tag = node.tag_name().name();
            if COMPONENT_TAGS.contains(&tag) {
                if let Some(name) = name_attribute(&node) {
                    model.components.push(ComponentDecl { tag: tag.to_string(), name: name.to_string() });
                }
            } else if tag == "uses-permission" {
                if let Some(name) = name_attribute(&node) {
                    if !model.permissions.iter().any(|p| p == name) {
                        model.permissions.push(name.to_string());
                    }
                }
            }
        }

        model
    }
}

/// `android:name`, falling back to an unqualified `name`
fn name_attribute<'a>(node: &roxmltree::Node<'a, '_>) -> Option<&'a str> {
    node.attribute((ANDROID_NS, "name"))
        .or_else(|| node.attribute("name"))
        .filter(|name| !name.is_empty())
}

fn strip_xml_declaration(text: &str) -> &str {
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    if trimmed.starts_with("<?xml") {
        if let Some(end) = trimmed.find("?>") {
            return &trimmed[end + 2..];
        }
    }
    trimmed
}

/// Package name from a text manifest, if it parses and declares one
pub fn package_name_from_text(text: &str) -> Option<String> {
    ManifestModel::parse(text).ok().and_then(|m| m.package).filter(|p| !p.trim().is_empty())
}

/// Findings and recovered errors for one manifest
#[derive(Debug, Default)]
pub struct ManifestAnalysis {
    pub findings: Vec<Finding>,
    pub model: Option<ManifestModel>,
    /// Recovered errors (empty input, decode, parse)
    pub errors: Vec<AnalysisError>,
}

pub struct ManifestAnalyzer<'a> {
    rules: &'a SuspicionRules,
}

impl<'a> ManifestAnalyzer<'a> {
    pub fn new(rules: &'a SuspicionRules) -> Self {
        Self { rules }
    }

    /// Score one manifest entry's raw bytes.
    pub fn analyze(&self, package_name: &str, resource_name: &str, bytes: &[u8]) -> ManifestAnalysis {
        let mut analysis = ManifestAnalysis::default();

        let score = match calculate_entropy(bytes) {
            Ok(score) => score,
            Err(e) => {
                debug!("{}: empty manifest, nothing to score", package_name);
                analysis.errors.push(e);
                return analysis;
            }
        };

        let mut document = Finding::new(package_name, resource_name, ComponentKind::Manifest)
            .with_entropy(score)
            .with_verdict(self.rules.entropy_verdict(score.bits));

        let text = match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                // compiled (binary XML) manifests land here
                debug!("{}: manifest is not UTF-8 text ({}), scoring bytes only", package_name, e);
                analysis.errors.push(AnalysisError::decode(resource_name, e.to_string()));
                analysis.findings.push(document);
                return analysis;
            }
        };

        let model = match ManifestModel::parse(text) {
            Ok(model) => model,
            Err(e) => {
                warn!("{}: {}", package_name, e);
                analysis.errors.push(e);
                analysis.findings.push(document);
                return analysis;
            }
        };

        for component in &model.components {
            let verdict = self.rules.identifier_verdict(&component.name);
            if verdict.triggered {
                debug!("{}: suspicious {} name {}", package_name, component.tag, component.name);
            }
            document.push_verdict(verdict);
        }
        analysis.findings.push(document);

        for permission in &model.permissions {
            let verdict = self.rules.permission_verdict(permission);
            if verdict.triggered {
                debug!("{}: suspicious permission {}", package_name, permission);
                analysis.findings.push(
                    Finding::new(package_name, permission.as_str(), ComponentKind::Manifest).with_verdict(verdict),
                );
            }
        }

        analysis.model = Some(model);
        analysis
    }
}
