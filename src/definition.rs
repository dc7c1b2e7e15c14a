//! Worker type definitions and their lookup store.
//!
//! Definitions are markdown files with a `---`-delimited front matter block
//! (`name`, `description`, `tools`, `model`) followed by the system prompt.
//! The core only ever consumes them through the [`DefinitionStore`] trait.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::RwLock;

/// Capability set assumed when a definition file does not declare one.
pub const DEFAULT_CAPABILITIES: &str = "read,grep,find,ls";

/// Model assumed when a definition file does not declare one.
pub const DEFAULT_MODEL: &str = "openrouter/google/gemini-3-flash-preview";

static FRONT_MATTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\A---\r?\n(.*?)\r?\n---\r?\n(.*)\z").expect("front matter pattern")
});

/// Immutable description of a worker type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDef {
    /// Type name; instances are keyed by its lowercase form.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Comma-delimited tool names granted to the worker.
    pub capabilities: String,
    /// Model identifier passed to the worker CLI.
    pub model: String,
    /// System prompt appended for every activation.
    pub system_prompt: String,
    /// File the definition was loaded from (empty for in-memory defs).
    pub source: PathBuf,
}

impl WorkerDef {
    /// Create a definition with stock defaults.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            capabilities: DEFAULT_CAPABILITIES.to_string(),
            model: DEFAULT_MODEL.to_string(),
            system_prompt: String::new(),
            source: PathBuf::new(),
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the capability set.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: impl Into<String>) -> Self {
        self.capabilities = capabilities.into();
        self
    }

    /// Set the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the system prompt.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }
}

/// Lookup interface the orchestration core consumes.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Resolve a definition by name (case-insensitive).
    async fn lookup(&self, name: &str) -> Option<Arc<WorkerDef>>;

    /// All known definitions, sorted by name.
    async fn all(&self) -> Vec<Arc<WorkerDef>>;

    /// Drop any cached state so the next lookup re-reads the source.
    async fn invalidate(&self);
}

/// Parse a single definition file's contents.
///
/// Returns `None` when the front matter is missing or declares no name;
/// unparseable files are simply not definitions.
pub fn parse_definition(path: &Path, raw: &str) -> Option<WorkerDef> {
    let caps = FRONT_MATTER.captures(raw)?;

    let mut fields: HashMap<&str, &str> = HashMap::new();
    for line in caps[1].lines() {
        if let Some(idx) = line.find(':') {
            if idx > 0 {
                fields.insert(line[..idx].trim(), line[idx + 1..].trim());
            }
        }
    }

    let name = fields.get("name").filter(|n| !n.is_empty())?;

    Some(WorkerDef {
        name: (*name).to_string(),
        description: fields.get("description").unwrap_or(&"").to_string(),
        capabilities: fields
            .get("tools")
            .filter(|t| !t.is_empty())
            .unwrap_or(&DEFAULT_CAPABILITIES)
            .to_string(),
        model: fields
            .get("model")
            .filter(|m| !m.is_empty())
            .unwrap_or(&DEFAULT_MODEL)
            .to_string(),
        system_prompt: caps[2].trim().to_string(),
        source: path.to_path_buf(),
    })
}

/// Read and parse a definition file from disk.
pub fn parse_definition_file(path: &Path) -> Option<WorkerDef> {
    let raw = std::fs::read_to_string(path).ok()?;
    parse_definition(path, &raw)
}

struct CachedDefs {
    loaded_at: Instant,
    defs: HashMap<String, Arc<WorkerDef>>,
}

/// Definition store backed by a directory of markdown files.
///
/// The directory scan is cached for a short TTL; a missing directory yields
/// an empty set rather than an error.
pub struct MarkdownDefinitionStore {
    dir: PathBuf,
    ttl: Duration,
    cache: RwLock<Option<CachedDefs>>,
}

impl MarkdownDefinitionStore {
    /// Create a store over `dir` with the given cache TTL.
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            cache: RwLock::new(None),
        }
    }

    async fn load_all(&self) -> HashMap<String, Arc<WorkerDef>> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.loaded_at.elapsed() < self.ttl {
                    return cached.defs.clone();
                }
            }
        }

        let mut defs = HashMap::new();
        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("md") {
                    continue;
                }
                if let Some(def) = parse_definition_file(&path) {
                    defs.insert(def.name.to_lowercase(), Arc::new(def));
                }
            }
        }

        tracing::debug!(count = defs.len(), dir = %self.dir.display(), "Loaded worker definitions");

        let mut cache = self.cache.write().await;
        *cache = Some(CachedDefs {
            loaded_at: Instant::now(),
            defs: defs.clone(),
        });
        defs
    }
}

#[async_trait]
impl DefinitionStore for MarkdownDefinitionStore {
    async fn lookup(&self, name: &str) -> Option<Arc<WorkerDef>> {
        self.load_all().await.get(&name.to_lowercase()).cloned()
    }

    async fn all(&self) -> Vec<Arc<WorkerDef>> {
        let mut defs: Vec<_> = self.load_all().await.into_values().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}

/// Fixed in-memory definition store (tests, embedders).
#[derive(Default)]
pub struct StaticDefinitionStore {
    defs: HashMap<String, Arc<WorkerDef>>,
}

impl StaticDefinitionStore {
    /// Build a store from a set of definitions.
    pub fn new(defs: impl IntoIterator<Item = WorkerDef>) -> Self {
        Self {
            defs: defs
                .into_iter()
                .map(|d| (d.name.to_lowercase(), Arc::new(d)))
                .collect(),
        }
    }
}

#[async_trait]
impl DefinitionStore for StaticDefinitionStore {
    async fn lookup(&self, name: &str) -> Option<Arc<WorkerDef>> {
        self.defs.get(&name.to_lowercase()).cloned()
    }

    async fn all(&self) -> Vec<Arc<WorkerDef>> {
        let mut defs: Vec<_> = self.defs.values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    async fn invalidate(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_front_matter() {
        let raw = "---\nname: scout\ndescription: Finds things\ntools: read,grep\nmodel: some/model\n---\nYou are a scout.";
        let def = parse_definition(Path::new("scout.md"), raw).unwrap();

        assert_eq!(def.name, "scout");
        assert_eq!(def.description, "Finds things");
        assert_eq!(def.capabilities, "read,grep");
        assert_eq!(def.model, "some/model");
        assert_eq!(def.system_prompt, "You are a scout.");
    }

    #[test]
    fn parse_applies_defaults() {
        let raw = "---\nname: coder\n---\nWrite code.";
        let def = parse_definition(Path::new("coder.md"), raw).unwrap();

        assert_eq!(def.capabilities, DEFAULT_CAPABILITIES);
        assert_eq!(def.model, DEFAULT_MODEL);
        assert_eq!(def.description, "");
    }

    #[test]
    fn parse_rejects_missing_name() {
        let raw = "---\ndescription: nameless\n---\nBody.";
        assert!(parse_definition(Path::new("x.md"), raw).is_none());
    }

    #[test]
    fn parse_rejects_missing_front_matter() {
        assert!(parse_definition(Path::new("x.md"), "Just a plain file.").is_none());
    }

    #[test]
    fn parse_ignores_malformed_field_lines() {
        let raw = "---\nname: scout\nno-colon-here\n: leading colon\n---\nBody.";
        let def = parse_definition(Path::new("x.md"), raw).unwrap();
        assert_eq!(def.name, "scout");
    }

    #[tokio::test]
    async fn markdown_store_scans_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("scout.md"),
            "---\nname: Scout\n---\nScout prompt.",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a definition").unwrap();
        std::fs::write(dir.path().join("broken.md"), "no front matter").unwrap();

        let store = MarkdownDefinitionStore::new(dir.path(), Duration::from_secs(5));

        let def = store.lookup("scout").await.unwrap();
        assert_eq!(def.name, "Scout");
        assert!(store.lookup("SCOUT").await.is_some());
        assert!(store.lookup("coder").await.is_none());
        assert_eq!(store.all().await.len(), 1);
    }

    #[tokio::test]
    async fn markdown_store_missing_directory_is_empty() {
        let store =
            MarkdownDefinitionStore::new("/nonexistent/definitely-not-here", Duration::from_secs(5));
        assert!(store.all().await.is_empty());
    }

    #[tokio::test]
    async fn markdown_store_invalidate_rereads() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkdownDefinitionStore::new(dir.path(), Duration::from_secs(3600));
        assert!(store.lookup("scout").await.is_none());

        std::fs::write(
            dir.path().join("scout.md"),
            "---\nname: scout\n---\nPrompt.",
        )
        .unwrap();

        // Cached empty scan still wins until invalidated.
        assert!(store.lookup("scout").await.is_none());
        store.invalidate().await;
        assert!(store.lookup("scout").await.is_some());
    }

    #[tokio::test]
    async fn static_store_is_case_insensitive() {
        let store = StaticDefinitionStore::new([WorkerDef::new("Scout")]);
        assert!(store.lookup("scout").await.is_some());
        assert!(store.lookup("sCoUt").await.is_some());
        assert!(store.lookup("coder").await.is_none());
    }
}
