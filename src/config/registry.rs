// src/config/registry.rs: where the external tools live and which versions they are pinned to

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::config::defs::{PICARD_JAR, PICARD_TAG, SAMTOOLS_TAG, TOOL_VERSIONS};

/// One external executable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEntry {
    pub program: PathBuf,
    /// Arguments placed before the subcommand, e.g. `-jar picard.jar`.
    #[serde(default)]
    pub prefix_args: Vec<String>,
    pub version: String,
    #[serde(default)]
    pub version_args: Vec<String>,
}

/// Maps logical tool tags to executables, injected into the orchestrator instead of
/// relying on whatever happens to be on PATH.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRegistry {
    #[serde(default)]
    tools: BTreeMap<String, ToolEntry>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        let mut tools = BTreeMap::new();
        tools.insert(
            SAMTOOLS_TAG.to_string(),
            ToolEntry {
                program: PathBuf::from(SAMTOOLS_TAG),
                prefix_args: Vec::new(),
                version: TOOL_VERSIONS[SAMTOOLS_TAG].to_string(),
                version_args: vec!["--version".to_string()],
            },
        );
        tools.insert(
            PICARD_TAG.to_string(),
            ToolEntry {
                program: PathBuf::from("java"),
                prefix_args: vec!["-jar".to_string(), PICARD_JAR.to_string()],
                version: TOOL_VERSIONS[PICARD_TAG].to_string(),
                version_args: vec!["MarkDuplicates".to_string(), "--version".to_string()],
            },
        );
        ToolRegistry { tools }
    }
}

impl ToolRegistry {
    pub fn with_tool(mut self, tag: &str, entry: ToolEntry) -> Self {
        self.tools.insert(tag.to_string(), entry);
        self
    }

    pub fn get(&self, tag: &str) -> Option<&ToolEntry> {
        self.tools.get(tag)
    }

    /// Loads a registry from TOML. Entries override the defaults tool by tool.
    ///
    /// ```toml
    /// [tools.samtools]
    /// program = "/opt/samtools/bin/samtools"
    /// version = "1.20"
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let parsed: ToolRegistry =
            toml::from_str(text).map_err(|e| anyhow!("Invalid tool registry: {}", e))?;
        let mut registry = ToolRegistry::default();
        registry.tools.extend(parsed.tools);
        for (tag, entry) in &registry.tools {
            if entry.program.as_os_str().is_empty() {
                return Err(anyhow!("Tool {} has an empty program path", tag));
            }
        }
        Ok(registry)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read tool registry {}: {}", path.display(), e))?;
        Self::from_toml_str(&text)
    }

    /// Pinned versions for the given tags, as reported in manifests.
    pub fn versions_for<'a>(
        &self,
        tags: impl IntoIterator<Item = &'a str>,
    ) -> BTreeMap<String, String> {
        tags.into_iter()
            .filter_map(|tag| self.get(tag).map(|e| (tag.to_string(), e.version.clone())))
            .collect()
    }
}
