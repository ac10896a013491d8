//! Builds an engine-ready configuration from a profile plus options overlay
//! and drops outbounds that cannot reach a remote server.

use std::ops::Range;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Deserialize;
use serde_json::Value;
use serde_json::value::RawValue;

use crate::engine::Engine;
use crate::error::ServiceError;

/// Server values that can never be an upstream proxy.
const LOCAL_SERVERS: [&str; 3] = ["127.0.0.1", "::1", "localhost"];

/// The two user-supplied inputs to a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileConfig {
    pub profile_path: String,
    pub options_overlay: String,
}

impl ProfileConfig {
    pub fn new(profile_path: impl Into<String>, options_overlay: impl Into<String>) -> Self {
        Self {
            profile_path: profile_path.into(),
            options_overlay: options_overlay.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.profile_path.trim().is_empty() {
            return Err(ServiceError::EmptyConfiguration(
                "no active profile selected".into(),
            ));
        }
        if self.options_overlay.trim().is_empty() {
            return Err(ServiceError::EmptyConfiguration(
                "configuration options are blank".into(),
            ));
        }
        Ok(())
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from(self.profile_path.trim())
    }
}

/// Projection of one `outbounds` entry used for filtering decisions only.
/// The entry itself is kept as raw JSON so unknown fields survive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OutboundEntry {
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub server: Option<String>,
    #[serde(alias = "server_port")]
    pub port: Option<u64>,
}

impl OutboundEntry {
    fn project(value: &Value) -> Self {
        // Entries with mistyped fields are judged by their server field alone.
        serde_json::from_value(value.clone()).unwrap_or_else(|_| Self {
            server: value
                .get("server")
                .map(|server| server.as_str().unwrap_or_default().to_string()),
            ..Self::default()
        })
    }

    /// Entries without a `server` field (direct, block, selector, ...)
    /// are never invalid.
    pub fn is_invalid(&self) -> bool {
        match &self.server {
            None => false,
            Some(server) => {
                let server = server.trim();
                server.is_empty()
                    || LOCAL_SERVERS
                        .iter()
                        .any(|local| server.eq_ignore_ascii_case(local))
            }
        }
    }
}

/// Merged configuration document. `text` is what the engine receives; the
/// outbound filter only ever rewrites the `outbounds` span of it.
#[derive(Debug, Clone)]
pub struct BuiltConfig {
    text: String,
    document: Value,
}

impl BuiltConfig {
    pub fn parse(text: String) -> Result<Self, ServiceError> {
        if text.trim().is_empty() {
            return Err(ServiceError::ConfigBuild(
                "engine returned an empty configuration".into(),
            ));
        }
        let document = serde_json::from_str(&text)
            .map_err(|e| ServiceError::ConfigBuild(format!("configuration is not JSON: {e}")))?;
        Ok(Self { text, document })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    pub fn into_text(self) -> String {
        self.text
    }

    pub fn outbounds(&self) -> Option<Vec<OutboundEntry>> {
        self.document
            .get("outbounds")
            .and_then(Value::as_array)
            .map(|entries| entries.iter().map(OutboundEntry::project).collect())
    }
}

pub fn build(engine: &dyn Engine, profile: &ProfileConfig) -> Result<BuiltConfig, ServiceError> {
    profile.validate()?;
    let text = engine
        .build_config(&profile.path(), &profile.options_overlay)
        .map_err(|e| ServiceError::ConfigBuild(e.to_string()))?;
    BuiltConfig::parse(text)
}

/// Removes every outbound whose server is blank or loopback.
///
/// Fails with `ConfigInvalid` when the array ends up empty. Only the bytes of
/// the `outbounds` value are rewritten; the rest of the text is kept as is.
pub fn filter_outbounds(config: BuiltConfig) -> Result<BuiltConfig, ServiceError> {
    let Some(entries) = config.document.get("outbounds").and_then(Value::as_array) else {
        debug!("Configuration has no outbounds array, passing through");
        return Ok(config);
    };

    let mut kept = Vec::with_capacity(entries.len());
    let mut removed = Vec::new();
    for value in entries {
        let entry = OutboundEntry::project(value);
        if entry.is_invalid() {
            removed.push(entry);
        } else {
            kept.push(value.clone());
        }
    }

    if kept.is_empty() {
        return Err(ServiceError::ConfigInvalid(format!(
            "all {} outbounds were removed",
            removed.len()
        )));
    }
    if removed.is_empty() {
        return Ok(config);
    }

    for entry in &removed {
        info!(
            "Dropping outbound {:?} ({}): unusable server {:?}",
            entry.tag,
            entry.kind,
            entry.server.as_deref().unwrap_or_default()
        );
    }

    let span = outbounds_span(&config.text).ok_or_else(|| {
        ServiceError::ConfigBuild("cannot locate the outbounds array".into())
    })?;
    let replacement = Value::Array(kept);
    let encoded =
        serde_json::to_string(&replacement).map_err(|e| ServiceError::ConfigBuild(e.to_string()))?;

    let BuiltConfig { mut text, mut document } = config;
    text.replace_range(span, &encoded);
    if let Some(root) = document.as_object_mut() {
        // With preserve_order, replacing an existing key keeps its position.
        root.insert("outbounds".to_string(), replacement);
    }
    Ok(BuiltConfig { text, document })
}

#[derive(Deserialize)]
struct OutboundsSlot<'a> {
    #[serde(borrow, default)]
    outbounds: Option<&'a RawValue>,
}

/// Byte range of the top-level `outbounds` value inside `text`.
fn outbounds_span(text: &str) -> Option<Range<usize>> {
    let slot: OutboundsSlot<'_> = serde_json::from_str(text).ok()?;
    let raw = slot.outbounds?.get();
    // The raw value borrows from `text`, so its address gives the offset.
    let start = (raw.as_ptr() as usize).checked_sub(text.as_ptr() as usize)?;
    let end = start + raw.len();
    (text.get(start..end) == Some(raw)).then_some(start..end)
}

/// Builds and filters in one step, the way a start attempt consumes it.
pub fn build_filtered(
    engine: &dyn Engine,
    profile: &ProfileConfig,
) -> Result<BuiltConfig, ServiceError> {
    filter_outbounds(build(engine, profile)?)
}

pub fn write_snapshot(config: &BuiltConfig, path: &Path) -> std::io::Result<()> {
    std::fs::write(path, config.as_str())
}
