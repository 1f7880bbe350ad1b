//! Pre-load manifest and plugin directory validation.
//!
//! [`ManifestValidator::validate`] is a pure function of the plugin directory
//! contents and the host configuration. It never executes plugin code. The
//! manifest is inspected as raw JSON so that every problem is reported with
//! the field it concerns, instead of stopping at the first decode error.
//!
//! Checks, in order: manifest presence and syntax, required fields, id and
//! version formats, entry module, directory size, forbidden dependencies,
//! source security scan, permissions, intents, host-version compatibility.
//! Only the first three stop validation early.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};
use walkdir::WalkDir;

use crate::config::PluginsConfig;
use crate::error::Result;
use crate::manifest::{MANIFEST_FILE, PermissionAccess, PermissionType, ResourceOverrides};
use crate::security::{FindingKind, SecurityScanner};
use crate::version::{Compatibility, check_compatibility};

/// Entry module names tried, in order, when the manifest has no `main`.
pub const CONVENTIONAL_ENTRIES: &[&str] = &[
    "plugin.wasm",
    "main.wasm",
    "index.wasm",
    "plugin.wat",
    "main.wat",
    "index.wat",
];

/// Manifest fields that must be present and non-blank.
pub const REQUIRED_FIELDS: &[&str] = &["id", "name", "version", "description", "author"];

/// Share of the size ceiling at which a warning is raised.
const SIZE_WARNING_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    /// Stable machine-readable code, e.g. `MISSING_REQUIRED_FIELD`.
    pub code: &'static str,
    pub message: String,
    /// Manifest field or `file:line` the issue concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub severity: Severity,
}

impl ValidationIssue {
    fn new(code: &'static str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
            severity,
        }
    }

    fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

/// Verdict of one validation run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Whether any error carries `code`.
    pub fn has_error(&self, code: &str) -> bool {
        self.errors.iter().any(|e| e.code == code)
    }

    /// Whether any warning carries `code`.
    pub fn has_warning(&self, code: &str) -> bool {
        self.warnings.iter().any(|w| w.code == code)
    }

    /// Error messages, for aggregation into a load failure.
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.message.clone()).collect()
    }
}

#[derive(Default)]
struct Issues {
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
}

impl Issues {
    fn error(&mut self, issue: ValidationIssue) {
        self.errors.push(issue);
    }

    fn warn(&mut self, issue: ValidationIssue) {
        self.warnings.push(issue);
    }

    fn finish(self) -> ValidationResult {
        ValidationResult {
            valid: self.errors.is_empty(),
            errors: self.errors,
            warnings: self.warnings,
        }
    }
}

/// Static gatekeeper run before any plugin code is loaded.
///
/// Holds only immutable configuration, so one validator can serve concurrent
/// validations.
pub struct ManifestValidator {
    max_size_bytes: u64,
    supported_versions: Vec<String>,
    forbidden_dependencies: HashSet<String>,
    scanner: SecurityScanner,
}

impl ManifestValidator {
    /// Build a validator from the `[plugins]` configuration.
    ///
    /// Fails if a configured extra security pattern is not a valid regex.
    pub fn new(config: &PluginsConfig) -> Result<Self> {
        let scanner = SecurityScanner::with_extra_patterns(
            &config.extra_forbidden_patterns,
            &config.extra_suspicious_patterns,
        )?;
        Ok(Self {
            max_size_bytes: config.max_plugin_size_bytes(),
            supported_versions: config.supported_versions.clone(),
            forbidden_dependencies: config.forbidden_dependencies.iter().cloned().collect(),
            scanner,
        })
    }

    /// Validator with the default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(&PluginsConfig::default())
    }

    /// Validate the plugin directory at `plugin_path`.
    pub fn validate(&self, plugin_path: &Path) -> ValidationResult {
        let mut issues = Issues::default();

        if !plugin_path.is_dir() {
            issues.error(ValidationIssue::new(
                "PLUGIN_NOT_FOUND",
                Severity::Critical,
                format!("plugin directory {} does not exist", plugin_path.display()),
            ));
            return issues.finish();
        }

        let manifest_path = plugin_path.join(MANIFEST_FILE);
        let raw = match std::fs::read_to_string(&manifest_path) {
            Ok(raw) => raw,
            Err(_) => {
                issues.error(ValidationIssue::new(
                    "MISSING_MANIFEST",
                    Severity::Critical,
                    format!("{MANIFEST_FILE} not found in {}", plugin_path.display()),
                ));
                return issues.finish();
            }
        };

        let manifest = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                issues.error(ValidationIssue::new(
                    "INVALID_JSON",
                    Severity::Critical,
                    format!("{MANIFEST_FILE} must contain a JSON object"),
                ));
                return issues.finish();
            }
            Err(e) => {
                issues.error(ValidationIssue::new(
                    "INVALID_JSON",
                    Severity::Critical,
                    format!("{MANIFEST_FILE} is not valid JSON: {e}"),
                ));
                return issues.finish();
            }
        };

        if !self.check_required_fields(&manifest, &mut issues) {
            return issues.finish();
        }

        check_formats(&manifest, &mut issues);
        check_entry(plugin_path, &manifest, &mut issues);
        self.check_size(plugin_path, &mut issues);
        self.check_dependencies(&manifest, &mut issues);
        self.check_source(plugin_path, &mut issues);
        check_permissions(&manifest, &mut issues);
        check_intents(&manifest, &mut issues);
        self.check_host_version(&manifest, &mut issues);
        check_resources(&manifest, &mut issues);

        let result = issues.finish();
        tracing::debug!(
            path = %plugin_path.display(),
            valid = result.valid,
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            "plugin validated"
        );
        result
    }

    /// Returns `false` if any required field is missing.
    fn check_required_fields(&self, manifest: &Map<String, Value>, issues: &mut Issues) -> bool {
        let mut complete = true;
        for field in REQUIRED_FIELDS {
            let present = manifest
                .get(*field)
                .and_then(Value::as_str)
                .is_some_and(|s| !s.trim().is_empty());
            if !present {
                complete = false;
                issues.error(
                    ValidationIssue::new(
                        "MISSING_REQUIRED_FIELD",
                        Severity::Critical,
                        format!("missing required field `{field}`"),
                    )
                    .with_field(*field),
                );
            }
        }
        complete
    }

    fn check_size(&self, plugin_path: &Path, issues: &mut Issues) {
        let size = directory_size(plugin_path);
        if size > self.max_size_bytes {
            issues.error(ValidationIssue::new(
                "PLUGIN_TOO_LARGE",
                Severity::High,
                format!(
                    "plugin is {} bytes, exceeding the {} byte limit",
                    size, self.max_size_bytes
                ),
            ));
        } else if size as f64 >= self.max_size_bytes as f64 * SIZE_WARNING_RATIO {
            issues.warn(ValidationIssue::new(
                "PLUGIN_SIZE_WARNING",
                Severity::Low,
                format!(
                    "plugin is {} bytes, close to the {} byte limit",
                    size, self.max_size_bytes
                ),
            ));
        }
    }

    fn check_dependencies(&self, manifest: &Map<String, Value>, issues: &mut Issues) {
        let Some(deps) = manifest.get("dependencies") else {
            return;
        };
        let Some(deps) = deps.as_object() else {
            issues.error(
                ValidationIssue::new(
                    "INVALID_DEPENDENCIES",
                    Severity::Medium,
                    "`dependencies` must be an object of name to version",
                )
                .with_field("dependencies"),
            );
            return;
        };
        for name in deps.keys() {
            if self.forbidden_dependencies.contains(name) {
                issues.error(
                    ValidationIssue::new(
                        "FORBIDDEN_DEPENDENCY",
                        Severity::Critical,
                        format!("dependency `{name}` is not allowed"),
                    )
                    .with_field(format!("dependencies.{name}")),
                );
            }
        }
    }

    fn check_source(&self, plugin_path: &Path, issues: &mut Issues) {
        for finding in self.scanner.scan_dir(plugin_path) {
            let location = format!("{}:{}", finding.file, finding.line);
            match finding.kind {
                FindingKind::Forbidden => issues.error(
                    ValidationIssue::new(
                        "SECURITY_VIOLATION",
                        Severity::Critical,
                        format!("forbidden code ({}) at {location}", finding.rule),
                    )
                    .with_field(location),
                ),
                FindingKind::Suspicious => issues.warn(
                    ValidationIssue::new(
                        "SUSPICIOUS_CODE",
                        Severity::Medium,
                        format!("suspicious code ({}) at {location}", finding.rule),
                    )
                    .with_field(location),
                ),
            }
        }
    }

    fn check_host_version(&self, manifest: &Map<String, Value>, issues: &mut Issues) {
        let Some(range) = manifest.get("agentOSVersion").and_then(Value::as_str) else {
            issues.warn(
                ValidationIssue::new(
                    "MISSING_AGENTOS_VERSION",
                    Severity::Low,
                    "no `agentOSVersion` declared; compatibility is unknown",
                )
                .with_field("agentOSVersion"),
            );
            return;
        };
        let message = match check_compatibility(range, &self.supported_versions) {
            Compatibility::Compatible => return,
            Compatibility::Incompatible => format!(
                "`agentOSVersion` {range} matches none of the supported host versions [{}]",
                self.supported_versions.join(", ")
            ),
            Compatibility::Unrecognized => {
                format!("`agentOSVersion` {range} is not a recognized version range")
            }
        };
        issues.error(
            ValidationIssue::new("INCOMPATIBLE_VERSION", Severity::High, message)
                .with_field("agentOSVersion"),
        );
    }
}

fn check_formats(manifest: &Map<String, Value>, issues: &mut Issues) {
    // Required fields are known to be non-blank strings here.
    let id = manifest.get("id").and_then(Value::as_str).unwrap_or_default();
    if !is_valid_id(id) {
        issues.error(
            ValidationIssue::new(
                "INVALID_ID_FORMAT",
                Severity::High,
                format!("plugin id `{id}` must match [a-z0-9-_.]+"),
            )
            .with_field("id"),
        );
    }
    let version = manifest
        .get("version")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !is_valid_version(version) {
        issues.error(
            ValidationIssue::new(
                "INVALID_VERSION_FORMAT",
                Severity::High,
                format!("version `{version}` must be MAJOR.MINOR.PATCH[-prerelease]"),
            )
            .with_field("version"),
        );
    }
}

fn check_entry(plugin_path: &Path, manifest: &Map<String, Value>, issues: &mut Issues) {
    match manifest.get("main") {
        Some(Value::String(main)) => {
            if !is_contained(main) {
                issues.error(
                    ValidationIssue::new(
                        "INVALID_MAIN_PATH",
                        Severity::Critical,
                        format!("entry `{main}` must be a relative path inside the plugin directory"),
                    )
                    .with_field("main"),
                );
            } else if !plugin_path.join(main).is_file() {
                issues.error(
                    ValidationIssue::new(
                        "MAIN_FILE_NOT_FOUND",
                        Severity::High,
                        format!("entry `{main}` does not exist"),
                    )
                    .with_field("main"),
                );
            }
        }
        Some(_) => issues.error(
            ValidationIssue::new("INVALID_MAIN_PATH", Severity::High, "`main` must be a string")
                .with_field("main"),
        ),
        None => {
            if resolve_entry_path(plugin_path, None).is_none() {
                issues.error(ValidationIssue::new(
                    "MISSING_MAIN_FILE",
                    Severity::High,
                    format!(
                        "no `main` declared and none of {} exists",
                        CONVENTIONAL_ENTRIES.join(", ")
                    ),
                ));
            }
        }
    }
}

fn check_permissions(manifest: &Map<String, Value>, issues: &mut Issues) {
    let Some(perms) = manifest.get("permissions") else {
        return;
    };
    let Some(perms) = perms.as_array() else {
        issues.error(
            ValidationIssue::new("INVALID_PERMISSION", Severity::High, "`permissions` must be an array")
                .with_field("permissions"),
        );
        return;
    };

    for (i, perm) in perms.iter().enumerate() {
        let field = format!("permissions[{i}]");
        let kind_raw = perm.get("type").and_then(Value::as_str).unwrap_or_default();
        let access_raw = perm.get("access").and_then(Value::as_str).unwrap_or_default();
        let resource = perm.get("resource").and_then(Value::as_str).unwrap_or_default();

        let kind = PermissionType::parse(kind_raw);
        if kind.is_none() {
            issues.error(
                ValidationIssue::new(
                    "INVALID_PERMISSION_TYPE",
                    Severity::High,
                    format!("permission type `{kind_raw}` must be one of data, system, network, hardware"),
                )
                .with_field(format!("{field}.type")),
            );
        }
        let access = PermissionAccess::parse(access_raw);
        if access.is_none() {
            issues.error(
                ValidationIssue::new(
                    "INVALID_PERMISSION_ACCESS",
                    Severity::High,
                    format!("permission access `{access_raw}` must be one of read, write, execute"),
                )
                .with_field(format!("{field}.access")),
            );
        }
        if resource.trim().is_empty() {
            issues.error(
                ValidationIssue::new(
                    "INVALID_PERMISSION",
                    Severity::Medium,
                    "permission resource must not be empty",
                )
                .with_field(format!("{field}.resource")),
            );
        }
        if kind == Some(PermissionType::System) && access == Some(PermissionAccess::Execute) {
            issues.warn(
                ValidationIssue::new(
                    "SYSTEM_EXECUTE_PERMISSION",
                    Severity::High,
                    format!("plugin requests system execute access to `{resource}`"),
                )
                .with_field(field),
            );
        }
    }
}

fn check_intents(manifest: &Map<String, Value>, issues: &mut Issues) {
    let Some(intents) = manifest.get("intents") else {
        return;
    };
    let Some(intents) = intents.as_array() else {
        issues.error(
            ValidationIssue::new("INVALID_INTENT", Severity::High, "`intents` must be an array")
                .with_field("intents"),
        );
        return;
    };

    let mut seen = HashSet::new();
    for (i, intent) in intents.iter().enumerate() {
        let field = format!("intents[{i}].intentId");
        match intent.get("intentId").and_then(Value::as_str) {
            Some(id) if !id.trim().is_empty() => {
                if !seen.insert(id) {
                    issues.warn(
                        ValidationIssue::new(
                            "DUPLICATE_INTENT",
                            Severity::Low,
                            format!("intent `{id}` is declared more than once"),
                        )
                        .with_field(field),
                    );
                }
            }
            _ => issues.error(
                ValidationIssue::new(
                    "INVALID_INTENT",
                    Severity::High,
                    format!("intent #{i} has no `intentId`"),
                )
                .with_field(field),
            ),
        }
    }
}

fn check_resources(manifest: &Map<String, Value>, issues: &mut Issues) {
    let Some(resources) = manifest.get("resources") else {
        return;
    };
    if let Err(e) = serde_json::from_value::<ResourceOverrides>(resources.clone()) {
        issues.error(
            ValidationIssue::new(
                "INVALID_RESOURCES",
                Severity::Medium,
                format!("`resources` is malformed: {e}"),
            )
            .with_field("resources"),
        );
    }
}

/// Resolve the entry module of a plugin directory.
///
/// Uses `main` when given, else the first existing conventional entry name.
/// Returns `None` if nothing suitable exists or `main` escapes the directory.
pub fn resolve_entry_path(plugin_path: &Path, main: Option<&str>) -> Option<PathBuf> {
    match main {
        Some(main) => {
            if !is_contained(main) {
                return None;
            }
            let path = plugin_path.join(main);
            path.is_file().then_some(path)
        }
        None => CONVENTIONAL_ENTRIES
            .iter()
            .map(|name| plugin_path.join(name))
            .find(|path| path.is_file()),
    }
}

/// `^[a-z0-9\-_.]+$`
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
}

/// `^\d+\.\d+\.\d+(-[A-Za-z0-9-]+)?$`
pub fn is_valid_version(version: &str) -> bool {
    let (core, pre) = match version.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (version, None),
    };
    let parts: Vec<&str> = core.split('.').collect();
    let core_ok = parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    let pre_ok = pre.is_none_or(|p| {
        !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    core_ok && pre_ok
}

/// A relative path with no `..`, root, or prefix components.
fn is_contained(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn directory_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_plugin(dir: &Path, manifest: &Value) {
        std::fs::write(dir.join(MANIFEST_FILE), manifest.to_string()).unwrap();
        std::fs::write(dir.join("plugin.wat"), "(module)").unwrap();
    }

    fn good_manifest() -> Value {
        json!({
            "id": "weather",
            "name": "Weather",
            "version": "1.0.0",
            "description": "Forecasts",
            "author": "AgentOS",
            "agentOSVersion": "^1.0.0",
            "permissions": [{ "type": "data", "resource": "cache", "access": "read" }],
            "intents": [{ "intentId": "weather.get" }]
        })
    }

    fn validator() -> ManifestValidator {
        ManifestValidator::with_defaults().expect("default validator must build in tests")
    }

    #[test]
    fn well_formed_plugin_is_valid() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(tmp.path(), &good_manifest());
        let result = validator().validate(tmp.path());
        assert!(result.valid, "unexpected errors: {:?}", result.errors);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn missing_directory_and_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let gone = validator().validate(&tmp.path().join("nope"));
        assert!(gone.has_error("PLUGIN_NOT_FOUND"));

        let empty = validator().validate(tmp.path());
        assert!(!empty.valid);
        assert!(empty.has_error("MISSING_MANIFEST"));
    }

    #[test]
    fn malformed_json_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(MANIFEST_FILE), "{ not json").unwrap();
        let result = validator().validate(tmp.path());
        assert!(result.has_error("INVALID_JSON"));

        std::fs::write(tmp.path().join(MANIFEST_FILE), "[1, 2]").unwrap();
        assert!(validator().validate(tmp.path()).has_error("INVALID_JSON"));
    }

    #[test]
    fn each_missing_required_field_is_named() {
        for field in REQUIRED_FIELDS {
            let tmp = tempfile::tempdir().unwrap();
            let mut manifest = good_manifest();
            manifest.as_object_mut().unwrap().remove(*field);
            write_plugin(tmp.path(), &manifest);

            let result = validator().validate(tmp.path());
            assert!(!result.valid);
            let issue = result
                .errors
                .iter()
                .find(|e| e.code == "MISSING_REQUIRED_FIELD")
                .expect("missing field must be reported");
            assert_eq!(issue.field.as_deref(), Some(*field));
        }
    }

    #[test]
    fn blank_required_field_counts_as_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manifest = good_manifest();
        manifest["author"] = json!("   ");
        write_plugin(tmp.path(), &manifest);
        assert!(validator().validate(tmp.path()).has_error("MISSING_REQUIRED_FIELD"));
    }

    #[test]
    fn id_and_version_formats() {
        assert!(is_valid_id("weather.pro_v2-beta"));
        assert!(!is_valid_id("Weather"));
        assert!(!is_valid_id("has space"));
        assert!(is_valid_version("1.0.0"));
        assert!(is_valid_version("2.10.3-rc-1"));
        assert!(!is_valid_version("1.0"));
        assert!(!is_valid_version("1.0.0-"));
        assert!(!is_valid_version("1.0.0-beta.1"));

        let tmp = tempfile::tempdir().unwrap();
        let mut manifest = good_manifest();
        manifest["id"] = json!("Bad Id");
        manifest["version"] = json!("v1");
        write_plugin(tmp.path(), &manifest);
        let result = validator().validate(tmp.path());
        assert!(result.has_error("INVALID_ID_FORMAT"));
        assert!(result.has_error("INVALID_VERSION_FORMAT"));
    }

    #[test]
    fn entry_resolution() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manifest = good_manifest();
        manifest["main"] = json!("../outside.wasm");
        write_plugin(tmp.path(), &manifest);
        assert!(validator().validate(tmp.path()).has_error("INVALID_MAIN_PATH"));

        manifest["main"] = json!("build/plugin.wasm");
        write_plugin(tmp.path(), &manifest);
        assert!(validator().validate(tmp.path()).has_error("MAIN_FILE_NOT_FOUND"));

        let bare = tempfile::tempdir().unwrap();
        std::fs::write(bare.path().join(MANIFEST_FILE), good_manifest().to_string()).unwrap();
        assert!(validator().validate(bare.path()).has_error("MISSING_MAIN_FILE"));
    }

    #[test]
    fn size_limits() {
        let config = PluginsConfig {
            max_plugin_size_mb: 1,
            ..PluginsConfig::default()
        };
        let validator = ManifestValidator::new(&config).unwrap();

        let tmp = tempfile::tempdir().unwrap();
        write_plugin(tmp.path(), &good_manifest());
        std::fs::write(tmp.path().join("blob.bin"), vec![0u8; 900 * 1024]).unwrap();
        let near = validator.validate(tmp.path());
        assert!(near.valid);
        assert!(near.has_warning("PLUGIN_SIZE_WARNING"));

        std::fs::write(tmp.path().join("blob.bin"), vec![0u8; 2 * 1024 * 1024]).unwrap();
        assert!(validator.validate(tmp.path()).has_error("PLUGIN_TOO_LARGE"));
    }

    #[test]
    fn forbidden_dependency_blocks() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manifest = good_manifest();
        manifest["dependencies"] = json!({ "child_process": "^1.0.0", "lodash": "4.17.21" });
        write_plugin(tmp.path(), &manifest);
        let result = validator().validate(tmp.path());
        assert_eq!(
            result
                .errors
                .iter()
                .filter(|e| e.code == "FORBIDDEN_DEPENDENCY")
                .count(),
            1
        );
    }

    #[test]
    fn source_scan_feeds_errors_and_warnings() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(tmp.path(), &good_manifest());
        std::fs::write(tmp.path().join("helper.js"), "const k = process.env.KEY;\n").unwrap();
        let warned = validator().validate(tmp.path());
        assert!(warned.valid);
        assert!(warned.has_warning("SUSPICIOUS_CODE"));

        std::fs::write(tmp.path().join("helper.js"), "eval(userInput);\n").unwrap();
        let blocked = validator().validate(tmp.path());
        assert!(!blocked.valid);
        let issue = &blocked.errors[0];
        assert_eq!(issue.code, "SECURITY_VIOLATION");
        assert_eq!(issue.field.as_deref(), Some("helper.js:1"));
    }

    #[test]
    fn permission_checks() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manifest = good_manifest();
        manifest["permissions"] = json!([
            { "type": "filesystem", "resource": "x", "access": "read" },
            { "type": "data", "resource": "", "access": "delete" },
            { "type": "system", "resource": "shell", "access": "execute" }
        ]);
        write_plugin(tmp.path(), &manifest);
        let result = validator().validate(tmp.path());
        assert!(result.has_error("INVALID_PERMISSION_TYPE"));
        assert!(result.has_error("INVALID_PERMISSION_ACCESS"));
        assert!(result.has_error("INVALID_PERMISSION"));
        assert!(result.has_warning("SYSTEM_EXECUTE_PERMISSION"));
    }

    #[test]
    fn intent_checks() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manifest = good_manifest();
        manifest["intents"] = json!([
            { "intentId": "a" },
            { "intentId": "a" },
            { "parameters": {} }
        ]);
        write_plugin(tmp.path(), &manifest);
        let result = validator().validate(tmp.path());
        assert!(result.has_error("INVALID_INTENT"));
        assert!(result.has_warning("DUPLICATE_INTENT"));
    }

    #[test]
    fn host_version_checks() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manifest = good_manifest();
        manifest.as_object_mut().unwrap().remove("agentOSVersion");
        write_plugin(tmp.path(), &manifest);
        let missing = validator().validate(tmp.path());
        assert!(missing.valid);
        assert!(missing.has_warning("MISSING_AGENTOS_VERSION"));

        manifest["agentOSVersion"] = json!("^2.0.0");
        write_plugin(tmp.path(), &manifest);
        assert!(validator().validate(tmp.path()).has_error("INCOMPATIBLE_VERSION"));

        manifest["agentOSVersion"] = json!("1.x");
        write_plugin(tmp.path(), &manifest);
        assert!(validator().validate(tmp.path()).valid);
    }

    #[test]
    fn malformed_resources_are_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manifest = good_manifest();
        manifest["resources"] = json!({ "maxMemoryMB": "lots" });
        write_plugin(tmp.path(), &manifest);
        assert!(validator().validate(tmp.path()).has_error("INVALID_RESOURCES"));
    }

    #[test]
    fn result_serializes_for_reporting() {
        let tmp = tempfile::tempdir().unwrap();
        let result = validator().validate(tmp.path());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["valid"], json!(false));
        assert_eq!(json["errors"][0]["code"], json!("MISSING_MANIFEST"));
        assert_eq!(json["errors"][0]["severity"], json!("critical"));
    }
}
