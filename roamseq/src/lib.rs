//! Roam-to-Logseq conversion library.
//! The export is loaded into a page/block tree, rewritten in place by a fixed
//! sequence of whole-tree passes, and handed back to the serializer.

pub mod core {
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use serde_json::Value;
    use std::{fmt, path::PathBuf};

    /* ------------------------------- IDs ------------------------------- */

    /// Roam block uid. Opaque; only compared for equality.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct BlockUid(pub String);

    impl BlockUid {
        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl From<&str> for BlockUid {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    impl From<String> for BlockUid {
        fn from(s: String) -> Self {
            Self(s)
        }
    }

    impl fmt::Display for BlockUid {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Root container of the export: a titled page with top-level blocks.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Page {
        pub title: String,

        /// Top-level blocks; Roam omits the key for empty pages.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub children: Option<Vec<Block>>,

        /// Export fields we do not interpret (`uid`, `create-time`, ...), kept in order.
        #[serde(flatten)]
        pub extra: IndexMap<String, Value>,
    }

    impl Page {
        pub fn new(title: impl Into<String>) -> Self {
            Self {
                title: title.into(),
                children: None,
                extra: IndexMap::new(),
            }
        }

        pub fn with_children(mut self, children: Vec<Block>) -> Self {
            self.children = Some(children);
            self
        }
    }

    /// A text-bearing node. The uid is stable across every pass; text and
    /// children are rewritten in place.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Block {
        pub uid: BlockUid,

        /// Block text (Roam calls it `string`).
        pub string: String,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub children: Option<Vec<Block>>,

        #[serde(flatten)]
        pub extra: IndexMap<String, Value>,
    }

    impl Block {
        pub fn new(uid: impl Into<BlockUid>, string: impl Into<String>) -> Self {
            Self {
                uid: uid.into(),
                string: string.into(),
                children: None,
                extra: IndexMap::new(),
            }
        }

        pub fn with_children(mut self, children: Vec<Block>) -> Self {
            self.children = Some(children);
            self
        }

        pub fn has_children(&self) -> bool {
            self.children.as_ref().is_some_and(|c| !c.is_empty())
        }

        #[cfg(test)]
        pub fn child(&self, uid: &str) -> Option<&Block> {
            self.children
                .as_ref()
                .and_then(|c| c.iter().find(|b| b.uid.as_str() == uid))
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    /// Fatal failures raised while rewriting a block. Pattern misses are never errors.
    #[derive(Debug, thiserror::Error)]
    pub enum ConvertError {
        #[error("block {uid}: failed to download {url} to {}", .target.display())]
        Download {
            uid: BlockUid,
            url: String,
            target: PathBuf,
            #[source]
            source: anyhow::Error,
        },
        #[error("block {uid}: failed to sniff the content type of {}", .path.display())]
        Sniff {
            uid: BlockUid,
            path: PathBuf,
            #[source]
            source: anyhow::Error,
        },
        #[error("block {uid}: unknown content type for {}", .path.display())]
        UnknownFileType { uid: BlockUid, path: PathBuf },
        #[error("block {uid}: {action} {}", .path.display())]
        Io {
            uid: BlockUid,
            action: &'static str,
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("block {uid}: file name {file:?} from {url} is not a plain file name")]
        UnsafeFileName {
            uid: BlockUid,
            url: String,
            file: String,
        },
        #[error("block {uid}: invalid date {date:?} in {text:?}")]
        InvalidDate {
            uid: BlockUid,
            date: String,
            text: String,
        },
        #[error("invalid link pattern for host {host:?}")]
        Pattern {
            host: String,
            #[source]
            source: regex::Error,
        },
    }
}

pub mod config {
    //! Conversion settings.
    //!
    //! `defaults/roamseq.default.toml` is embedded into the binary; a user file and
    //! single-key overrides are layered on top through [`Loader`].

    use ::config::builder::DefaultState;
    use ::config::{Config, ConfigBuilder, ConfigError, File, FileFormat, ValueKind};
    use serde::Deserialize;
    use std::{
        collections::BTreeSet,
        path::{Path, PathBuf},
    };

    const DEFAULT_TOML: &str = include_str!("../defaults/roamseq.default.toml");

    #[derive(Debug, Clone, Deserialize)]
    pub struct ConvertConfig {
        pub attributes: AttributeConfig,
        pub assets: AssetConfig,
        pub schedule: ScheduleConfig,
        /// Ordered; the first rule whose tag occurs in a block wins.
        pub tasks: Vec<TaskRule>,
    }

    impl ConvertConfig {
        /// The embedded defaults with nothing layered on top.
        pub fn load_default() -> Result<Self, ConfigError> {
            Loader::new().build()
        }
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct AttributeConfig {
        /// Keys whose `key:: value` blocks may be folded into the parent block.
        pub relocatable: BTreeSet<String>,
        /// Copy the pair to the parent when the block itself has to stay.
        pub copy_if_unmovable: bool,
    }

    impl AttributeConfig {
        pub fn is_relocatable(&self, key: &str) -> bool {
            self.relocatable.contains(key)
        }
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct AssetConfig {
        /// Where downloaded files land.
        pub directory: PathBuf,
        /// Host substring that marks a block as carrying remote files.
        pub host: String,
        pub not_converted_tag: String,
        /// Path prefix used inside the rewritten links.
        pub link_prefix: String,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct ScheduleConfig {
        pub marker: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
    pub struct TaskRule {
        /// Roam page/tag name, matched as `#tag`, `#[[tag]]` or `[[tag]]`.
        pub tag: String,
        /// Logseq status keyword written in place of the marker.
        pub status: String,
        /// Whether the rule also rewrites blocks that are already DONE.
        pub override_done: bool,
    }

    impl TaskRule {
        pub fn new(tag: impl Into<String>, status: impl Into<String>, override_done: bool) -> Self {
            Self {
                tag: tag.into(),
                status: status.into(),
                override_done,
            }
        }
    }

    /// Layers user overrides over the built-in defaults.
    #[derive(Debug, Clone)]
    pub struct Loader {
        builder: ConfigBuilder<DefaultState>,
    }

    impl Loader {
        pub fn new() -> Self {
            let builder =
                Config::builder().add_source(File::from_str(DEFAULT_TOML, FileFormat::Toml));
            Self { builder }
        }

        /// Layer a configuration file. Missing files trigger an error on `build`.
        pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
            let source = File::from(path.as_ref())
                .format(FileFormat::Toml)
                .required(true);
            self.builder = self.builder.add_source(source);
            self
        }

        pub fn with_optional_file(mut self, path: impl AsRef<Path>) -> Self {
            let source = File::from(path.as_ref())
                .format(FileFormat::Toml)
                .required(false);
            self.builder = self.builder.add_source(source);
            self
        }

        /// Apply a single key/value override (CLI flags).
        pub fn set_override<I>(mut self, key: &str, value: I) -> Result<Self, ConfigError>
        where
            I: Into<ValueKind>,
        {
            self.builder = self.builder.set_override(key, value)?;
            Ok(self)
        }

        pub fn build(self) -> Result<ConvertConfig, ConfigError> {
            self.builder.build()?.try_deserialize()
        }
    }

    impl Default for Loader {
        fn default() -> Self {
            Self::new()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::fs;

        #[test]
        fn embedded_defaults_deserialize() {
            let config = ConvertConfig::load_default().expect("defaults");
            assert!(config.attributes.copy_if_unmovable);
            assert!(config.attributes.is_relocatable("source"));
            assert_eq!(config.assets.host, "firebasestorage.googleapis.com");
            assert_eq!(config.assets.not_converted_tag, "#notconverted");
            assert_eq!(config.schedule.marker, "[[📅]]");
            assert_eq!(
                config.tasks,
                vec![
                    TaskRule::new("canceled", "CANCELED", true),
                    TaskRule::new("Warte", "WAITING", false),
                ]
            );
        }

        #[test]
        fn user_file_replaces_selected_values() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("roamseq.toml");
            fs::write(
                &path,
                r#"
[attributes]
relocatable = ["author"]
copy_if_unmovable = false

[[tasks]]
tag = "later"
status = "LATER"
override_done = false
"#,
            )
            .expect("write config");

            let config = Loader::new().with_file(&path).build().expect("build");
            assert!(config.attributes.is_relocatable("author"));
            assert!(!config.attributes.is_relocatable("source"));
            assert!(!config.attributes.copy_if_unmovable);
            assert_eq!(config.tasks, vec![TaskRule::new("later", "LATER", false)]);
            // untouched sections keep their defaults
            assert_eq!(config.schedule.marker, "[[📅]]");
        }

        #[test]
        fn missing_optional_file_is_ignored() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let config = Loader::new()
                .with_optional_file(tmp.path().join("absent.toml"))
                .build()
                .expect("build");
            assert_eq!(config.assets.link_prefix, "../assets");
        }

        #[test]
        fn missing_required_file_fails() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let result = Loader::new().with_file(tmp.path().join("absent.toml")).build();
            assert!(result.is_err());
        }

        #[test]
        fn overrides_win_over_defaults() {
            let config = Loader::new()
                .set_override("assets.directory", "/tmp/graph/assets")
                .expect("override")
                .build()
                .expect("build");
            assert_eq!(config.assets.directory, PathBuf::from("/tmp/graph/assets"));
        }
    }
}

pub mod storage {
    //! Boundaries to the outside world: the export file, the network and file-type
    //! detection. Passes only see the traits so tests can swap in fakes.

    use super::core::Page;
    use anyhow::{Context, Result};
    use std::{
        fs,
        io::{BufReader, Write},
        path::Path,
    };
    use tempfile::NamedTempFile;

    /// Reads and writes a whole Roam export.
    pub trait ExportStore {
        fn load(&self, path: &Path) -> Result<Vec<Page>>;
        fn save(&self, path: &Path, pages: &[Page]) -> Result<()>;
    }

    /// Retrieves a remote resource and persists it at `target`.
    pub trait AssetFetcher {
        fn fetch(&self, url: &str, target: &Path) -> Result<()>;
    }

    /// Guesses a file extension (without the dot) from a file's bytes.
    pub trait ContentSniffer {
        fn extension(&self, path: &Path) -> Result<Option<String>>;
    }

    /// Roam's JSON export format: a top-level array of pages.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct JsonExport {
        pub pretty: bool,
    }

    impl ExportStore for JsonExport {
        fn load(&self, path: &Path) -> Result<Vec<Page>> {
            let file = fs::File::open(path).with_context(|| format!("opening {:?}", path))?;
            serde_json::from_reader(BufReader::new(file))
                .with_context(|| format!("parsing Roam export {:?}", path))
        }

        fn save(&self, path: &Path, pages: &[Page]) -> Result<()> {
            let json = if self.pretty {
                serde_json::to_string_pretty(pages)?
            } else {
                serde_json::to_string(pages)?
            };
            fs::write(path, json.as_bytes()).with_context(|| format!("writing {:?}", path))
        }
    }

    /// Whole-file download over HTTP(S). No retry; non-2xx responses are errors.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct HttpFetcher;

    impl AssetFetcher for HttpFetcher {
        fn fetch(&self, url: &str, target: &Path) -> Result<()> {
            let response = reqwest::blocking::get(url)
                .with_context(|| format!("requesting {url}"))?
                .error_for_status()
                .with_context(|| format!("fetching {url}"))?;
            let bytes = response
                .bytes()
                .with_context(|| format!("reading body of {url}"))?;
            write_replacing(target, &bytes)
        }
    }

    /// Write through a temporary file in the same directory; `target` only ever
    /// holds complete contents.
    pub fn write_replacing(target: &Path, bytes: &[u8]) -> Result<()> {
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut partial = NamedTempFile::new_in(dir)
            .with_context(|| format!("creating a temporary file in {:?}", dir))?;
        partial
            .write_all(bytes)
            .with_context(|| format!("writing {:?}", partial.path()))?;
        partial
            .persist(target)
            .with_context(|| format!("moving into {:?}", target))?;
        Ok(())
    }

    /// Magic-number detection via `infer`.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct MagicSniffer;

    impl ContentSniffer for MagicSniffer {
        fn extension(&self, path: &Path) -> Result<Option<String>> {
            let kind =
                infer::get_from_path(path).with_context(|| format!("reading {:?}", path))?;
            Ok(kind.map(|k| k.extension().to_string()))
        }
    }

}

pub mod walker {
    //! Tree traversal.
    //!
    //! `visit` hands out shared borrows for read-only passes. `walk_mut` hands the
    //! block out mutably together with a read-only view of its parent; a pass that
    //! wants to touch the parent returns an [`Effect`], which the walker applies to
    //! the live parent after the callback. Children are iterated over a snapshot of
    //! their uids, so detaching the current block never disturbs the iteration.

    use super::core::{Block, BlockUid, Page};

    /// Parent of the block being visited. Top-level blocks have none (pages carry no text).
    #[derive(Debug, Clone, Copy)]
    pub struct ParentRef<'a> {
        pub uid: &'a BlockUid,
        pub text: &'a str,
    }

    /// Requested change to the parent of the visited block.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct Effect {
        /// Appended to the parent's text as a new line.
        pub append_to_parent: Option<String>,
        /// Remove the visited block from the parent's children.
        pub detach: bool,
    }

    impl Effect {
        pub fn none() -> Self {
            Self::default()
        }

        pub fn copy_to_parent(line: String) -> Self {
            Self {
                append_to_parent: Some(line),
                detach: false,
            }
        }

        pub fn move_to_parent(line: String) -> Self {
            Self {
                append_to_parent: Some(line),
                detach: true,
            }
        }
    }

    /// Call `f` on every block of every page, parents before children.
    pub fn visit<'a, F>(pages: &'a [Page], f: &mut F)
    where
        F: FnMut(&'a Block, Option<&'a Block>),
    {
        for page in pages {
            for block in page.children.iter().flatten() {
                visit_block(block, None, f);
            }
        }
    }

    pub fn visit_block<'a, F>(block: &'a Block, parent: Option<&'a Block>, f: &mut F)
    where
        F: FnMut(&'a Block, Option<&'a Block>),
    {
        f(block, parent);
        for child in block.children.iter().flatten() {
            visit_block(child, Some(block), f);
        }
    }

    /// Call `f` on every block, mutably, and apply the returned effects.
    /// The first error stops the walk; earlier mutations stay in place.
    pub fn walk_mut<F, E>(pages: &mut [Page], f: &mut F) -> Result<(), E>
    where
        F: FnMut(&mut Block, Option<ParentRef<'_>>) -> Result<Effect, E>,
    {
        for page in pages.iter_mut() {
            if let Some(children) = page.children.as_mut() {
                let detached = walk_children(None, children, f)?;
                if detached > 0 && children.is_empty() {
                    page.children = None;
                }
            }
        }
        Ok(())
    }

    fn walk_children<F, E>(
        mut parent: Option<(&BlockUid, &mut String)>,
        children: &mut Vec<Block>,
        f: &mut F,
    ) -> Result<usize, E>
    where
        F: FnMut(&mut Block, Option<ParentRef<'_>>) -> Result<Effect, E>,
    {
        let snapshot: Vec<BlockUid> = children.iter().map(|b| b.uid.clone()).collect();
        let mut detached = 0;

        for uid in snapshot {
            let Some(pos) = children.iter().position(|b| b.uid == uid) else {
                continue;
            };

            let effect = {
                let view = parent.as_ref().map(|(uid, text)| ParentRef {
                    uid: *uid,
                    text: text.as_str(),
                });
                f(&mut children[pos], view)?
            };

            if let Some(line) = effect.append_to_parent {
                if let Some((_, text)) = parent.as_mut() {
                    text.push('\n');
                    text.push_str(&line);
                }
            }

            if effect.detach {
                children.remove(pos);
                detached += 1;
                continue;
            }

            let Block {
                uid,
                string,
                children: grandchildren,
                ..
            } = &mut children[pos];
            if let Some(nested) = grandchildren.as_mut() {
                let removed = walk_children(Some((&*uid, string)), nested, f)?;
                if removed > 0 && nested.is_empty() {
                    *grandchildren = None;
                }
            }
        }

        Ok(detached)
    }

}

pub mod index {
    //! Read-only indices built once before the mutating passes run.
    //!
    //! The reference index goes stale as soon as later passes add or remove
    //! `((uid))` references; it is only meant to answer "was this block
    //! referenced in the export".

    use super::core::{Block, BlockUid, Page};
    use super::walker;
    use once_cell::sync::Lazy;
    use regex::Regex;
    use serde::Serialize;
    use std::collections::{BTreeMap, BTreeSet, HashMap};

    static BLOCK_REF_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\(\(([0-9A-Za-z_-]+)\)\)").unwrap());

    /// Uids referenced with `((uid))` in `text`, in order of appearance.
    pub fn block_refs(text: &str) -> impl Iterator<Item = &str> {
        BLOCK_REF_RE
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
    }

    /// uid → block, borrowed from the tree.
    #[derive(Debug, Default)]
    pub struct BlockIndex<'a> {
        by_uid: HashMap<&'a BlockUid, &'a Block>,
    }

    impl<'a> BlockIndex<'a> {
        pub fn build(pages: &'a [Page]) -> Self {
            let mut by_uid = HashMap::new();
            walker::visit(pages, &mut |block: &'a Block, _| {
                by_uid.insert(&block.uid, block);
            });
            Self { by_uid }
        }

        pub fn get(&self, uid: &BlockUid) -> Option<&'a Block> {
            self.by_uid.get(uid).copied()
        }

        pub fn contains(&self, uid: &BlockUid) -> bool {
            self.by_uid.contains_key(uid)
        }

        pub fn len(&self) -> usize {
            self.by_uid.len()
        }

        pub fn is_empty(&self) -> bool {
            self.by_uid.is_empty()
        }
    }

    /// Referenced uid → uids of the blocks whose text references it.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    #[serde(transparent)]
    pub struct ReferenceIndex {
        refs: BTreeMap<BlockUid, BTreeSet<BlockUid>>,
    }

    impl ReferenceIndex {
        pub fn build(pages: &[Page]) -> Self {
            let mut index = Self::default();
            walker::visit(pages, &mut |block, _| {
                for target in block_refs(&block.string) {
                    index.add(BlockUid::from(target), block.uid.clone());
                }
            });
            index
        }

        pub fn add(&mut self, target: BlockUid, from: BlockUid) {
            self.refs.entry(target).or_default().insert(from);
        }

        pub fn referrers(&self, uid: &BlockUid) -> Option<&BTreeSet<BlockUid>> {
            self.refs.get(uid)
        }

        pub fn is_referenced(&self, uid: &BlockUid) -> bool {
            self.referrers(uid).is_some_and(|r| !r.is_empty())
        }

        pub fn iter(&self) -> impl Iterator<Item = (&BlockUid, &BTreeSet<BlockUid>)> {
            self.refs.iter()
        }

        /// Referenced uids with no block behind them.
        pub fn dangling<'s>(&'s self, blocks: &BlockIndex<'_>) -> Vec<&'s BlockUid> {
            self.refs.keys().filter(|uid| !blocks.contains(uid)).collect()
        }

        pub fn len(&self) -> usize {
            self.refs.len()
        }

        pub fn is_empty(&self) -> bool {
            self.refs.is_empty()
        }
    }

}

pub mod passes {
    pub mod catalog {
        //! Inventory of every `key:: value` attribute in the export. Only used to
        //! decide which keys are worth relocating; nothing downstream reads it.

        use crate::core::Page;
        use crate::passes::attributes::parse_attribute;
        use crate::walker;
        use indexmap::IndexMap;
        use serde::Serialize;

        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        #[serde(transparent)]
        pub struct AttributeCatalog {
            entries: IndexMap<String, Vec<String>>,
        }

        impl AttributeCatalog {
            pub fn build(pages: &[Page]) -> Self {
                let mut catalog = Self::default();
                walker::visit(pages, &mut |block, _| {
                    if let Some(attr) = parse_attribute(&block.string) {
                        catalog
                            .entries
                            .entry(attr.key.to_string())
                            .or_default()
                            .push(block.string.clone());
                    }
                });
                catalog
            }

            pub fn texts(&self, key: &str) -> Option<&[String]> {
                self.entries.get(key).map(Vec::as_slice)
            }

            pub fn keys(&self) -> impl Iterator<Item = &str> {
                self.entries.keys().map(String::as_str)
            }

            pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
                self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
            }

            pub fn len(&self) -> usize {
                self.entries.len()
            }

            pub fn is_empty(&self) -> bool {
                self.entries.is_empty()
            }
        }

        #[cfg(test)]
        mod tests {
            use super::*;
            use crate::core::Block;

            #[test]
            fn groups_raw_texts_by_key_in_first_seen_order() {
                let pages = vec![Page::new("P").with_children(vec![
                    Block::new("a", "source:: library").with_children(vec![Block::new(
                        "b",
                        "author:: Jane",
                    )]),
                    Block::new("c", "source:: shop\nsecond line"),
                    Block::new("d", "no attribute here"),
                ])];
                let catalog = AttributeCatalog::build(&pages);
                assert_eq!(catalog.keys().collect::<Vec<_>>(), vec!["source", "author"]);
                assert_eq!(
                    catalog.texts("source").expect("source"),
                    &["source:: library".to_string(), "source:: shop\nsecond line".to_string()]
                );
            }
        }
    }

    pub mod attributes {
        //! Roam attributes (`key:: value`) to Logseq.
        //!
        //! Relocatable keys on childless, unreferenced blocks become properties of
        //! the parent block and the child disappears. Every other attribute is
        //! rewritten to `[[key]]:value` so Logseq does not read it as a property.

        use crate::config::AttributeConfig;
        use crate::core::Block;
        use crate::index::ReferenceIndex;
        use crate::walker::{Effect, ParentRef};
        use once_cell::sync::Lazy;
        use regex::Regex;
        use tracing::debug;

        static ATTRIBUTE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([^\n`]*?)::(.*)").unwrap());

        /// `key::value` on the first line of a block, plus whatever follows that line.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct AttributeLine<'a> {
            pub key: &'a str,
            pub value: &'a str,
            /// Remaining text, starting with the newline that ends the attribute line.
            pub tail: &'a str,
        }

        pub fn parse_attribute(text: &str) -> Option<AttributeLine<'_>> {
            let caps = ATTRIBUTE_RE.captures(text)?;
            let whole = caps.get(0)?;
            Some(AttributeLine {
                key: caps.get(1)?.as_str(),
                value: caps.get(2)?.as_str(),
                tail: &text[whole.end()..],
            })
        }

        /// What happened to a block.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Relocation {
            /// No attribute, or the key carries page/block reference markup.
            Untouched,
            /// Rewritten in place to `[[key]]:value`.
            Tagged,
            /// Rewritten in place and the pair copied to the parent.
            Copied(String),
            /// Pair moved to the parent; the block is removed.
            Moved(String),
        }

        impl Relocation {
            pub fn effect(&self) -> Effect {
                match self {
                    Relocation::Untouched | Relocation::Tagged => Effect::none(),
                    Relocation::Copied(line) => Effect::copy_to_parent(line.clone()),
                    Relocation::Moved(line) => Effect::move_to_parent(line.clone()),
                }
            }
        }

        pub struct AttributeRelocator<'a> {
            config: &'a AttributeConfig,
            refs: &'a ReferenceIndex,
        }

        impl<'a> AttributeRelocator<'a> {
            pub fn new(config: &'a AttributeConfig, refs: &'a ReferenceIndex) -> Self {
                Self { config, refs }
            }

            pub fn relocate(&self, block: &mut Block, parent: Option<ParentRef<'_>>) -> Relocation {
                let Some(attr) = parse_attribute(&block.string) else {
                    return Relocation::Untouched;
                };
                if attr.key.contains("[[") || attr.key.contains("((") {
                    return Relocation::Untouched;
                }

                let line = format!("{}::{}", attr.key, attr.value);
                let tagged = format!("[[{}]]:{}{}", attr.key, attr.value, attr.tail);

                if self.config.is_relocatable(attr.key) {
                    if let Some(parent) = parent {
                        // Only a block that is nothing but the attribute line can be
                        // folded away without losing text.
                        let movable = !block.has_children()
                            && !self.refs.is_referenced(&block.uid)
                            && attr.tail.trim().is_empty();
                        if movable {
                            debug!(
                                uid = %block.uid,
                                parent = %parent.uid,
                                "moving attribute to parent"
                            );
                            return Relocation::Moved(line);
                        }
                        debug!(uid = %block.uid, "attribute block cannot be moved");
                        block.string = tagged;
                        return if self.config.copy_if_unmovable {
                            Relocation::Copied(line)
                        } else {
                            Relocation::Tagged
                        };
                    }
                }

                block.string = tagged;
                Relocation::Tagged
            }
        }

    }

    pub mod queries {
        //! Wraps `{{query ...}}` / `{{[[query]] ...}}` constructs in backticks so
        //! they end up as inert code.

        use crate::core::Block;
        use std::ops::Range;

        /// Byte ranges of the unfenced queries in `text`, in order, non-overlapping.
        pub fn find_queries(text: &str) -> Vec<Range<usize>> {
            let bytes = text.as_bytes();
            let mut spans = Vec::new();
            let mut i = 0;

            while let Some(offset) = text[i..].find("query") {
                let at = i + offset;
                let head = &text[..at];
                let open_len = if head.ends_with("{{") {
                    2
                } else if head.ends_with("{{[[") {
                    4
                } else {
                    i = at + 1;
                    continue;
                };
                let start = at - open_len;

                // the opener accounts for two levels
                let mut depth = 2usize;
                let mut end = None;
                for (j, b) in bytes.iter().enumerate().skip(at + 1) {
                    match b {
                        b'{' => depth += 1,
                        b'}' => {
                            depth -= 1;
                            if depth == 0 {
                                end = Some(j + 1);
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                let Some(end) = end else {
                    break;
                };

                let fenced = start > 0 && bytes[start - 1] == b'`' && bytes.get(end) == Some(&b'`');
                if !fenced {
                    spans.push(start..end);
                }
                i = end;
            }

            spans
        }

        /// `text` with every query fenced, or `None` when there is nothing to fence.
        pub fn fence_queries(text: &str) -> Option<String> {
            let spans = find_queries(text);
            if spans.is_empty() {
                return None;
            }
            let mut out = String::with_capacity(text.len() + spans.len() * 2);
            let mut last = 0;
            for span in spans {
                out.push_str(&text[last..span.start]);
                out.push('`');
                out.push_str(&text[span.clone()]);
                out.push('`');
                last = span.end;
            }
            out.push_str(&text[last..]);
            Some(out)
        }

        pub fn fence_block(block: &mut Block) -> bool {
            match fence_queries(&block.string) {
                Some(fenced) => {
                    block.string = fenced;
                    true
                }
                None => false,
            }
        }

    }

    pub mod assets {
        //! Files hosted on Roam's Firebase storage, relinked to local copies.
        //!
        //! Three link shapes are recognised, tried in order; the first shape with a
        //! match is applied to every occurrence in the block. A missing local file is
        //! downloaded unless exactly one file in the asset directory already starts
        //! with its name (a previous run renamed it, usually by adding an extension).

        use crate::config::AssetConfig;
        use crate::core::{Block, BlockUid, ConvertError};
        use crate::storage::{AssetFetcher, ContentSniffer};
        use regex::{Captures, Regex};
        use serde::Serialize;
        use std::{
            fs,
            ops::Range,
            path::{Component, Path, PathBuf},
        };
        use tracing::{debug, info, warn};

        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum LinkShape {
            /// `[name](url)` or `![name](url)`.
            Named,
            /// `{{pdf: url}}` / `{{[[pdf]]: url}}`.
            PdfEmbed,
            /// The URL on its own.
            Bare,
        }

        /// One remote file reference found in a block.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct AssetLink {
            pub shape: LinkShape,
            pub span: Range<usize>,
            /// `!` for embedded links, empty otherwise.
            pub prefix: String,
            pub name: String,
            pub url: String,
            /// Last `%2F` path component of the URL, up to the query string.
            pub file: String,
        }

        /// Compiled link patterns for one storage host.
        #[derive(Debug, Clone)]
        pub struct LinkPatterns {
            named: Regex,
            pdf: Regex,
            bare: Regex,
        }

        impl LinkPatterns {
            pub fn for_host(host: &str) -> Result<Self, regex::Error> {
                let url = format!(r"https?://{}", regex::escape(host));
                Ok(Self {
                    named: Regex::new(&format!(
                        r"(?P<prefix>!?)\[(?P<name>[^\]]*)\]\((?P<link>{url}[^)\s]*%2F(?P<file>[^?)\s]*)\?[^)\s]*)\)"
                    ))?,
                    pdf: Regex::new(&format!(
                        r"\{{\{{\[*pdf\]*:\s*(?P<link>{url}[^}}\s]*%2F(?P<file>[^?}}\s]*)\?[^}}\s]*)\}}\}}"
                    ))?,
                    bare: Regex::new(&format!(
                        r"(?P<link>{url}\S*%2F(?P<file>[^?\s]*)\?\S*)"
                    ))?,
                })
            }

            /// Links of the first shape that matches anywhere in `text`.
            pub fn find(&self, text: &str) -> Vec<AssetLink> {
                for (shape, re) in [
                    (LinkShape::Named, &self.named),
                    (LinkShape::PdfEmbed, &self.pdf),
                    (LinkShape::Bare, &self.bare),
                ] {
                    let links: Vec<_> = re
                        .captures_iter(text)
                        .filter_map(|caps| link_from_captures(shape, &caps))
                        .collect();
                    if !links.is_empty() {
                        return links;
                    }
                }
                Vec::new()
            }
        }

        fn link_from_captures(shape: LinkShape, caps: &Captures<'_>) -> Option<AssetLink> {
            let whole = caps.get(0)?;
            let group = |name: &str| caps.name(name).map(|m| m.as_str().to_string());
            let file = group("file").filter(|f| !f.is_empty())?;
            Some(AssetLink {
                shape,
                span: whole.range(),
                prefix: group("prefix").unwrap_or_default(),
                name: group("name").unwrap_or_default(),
                url: group("link")?,
                file,
            })
        }

        /// Counters reported at the end of a run.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
        pub struct RelinkStats {
            pub blocks_relinked: usize,
            pub downloaded: usize,
            pub reused: usize,
            pub not_converted: usize,
        }

        pub struct AssetRelinker<'a> {
            config: &'a AssetConfig,
            patterns: LinkPatterns,
            fetcher: &'a dyn AssetFetcher,
            sniffer: &'a dyn ContentSniffer,
            stats: RelinkStats,
        }

        impl<'a> AssetRelinker<'a> {
            pub fn new(
                config: &'a AssetConfig,
                fetcher: &'a dyn AssetFetcher,
                sniffer: &'a dyn ContentSniffer,
            ) -> Result<Self, ConvertError> {
                let patterns =
                    LinkPatterns::for_host(&config.host).map_err(|source| ConvertError::Pattern {
                        host: config.host.clone(),
                        source,
                    })?;
                Ok(Self {
                    config,
                    patterns,
                    fetcher,
                    sniffer,
                    stats: RelinkStats::default(),
                })
            }

            pub fn stats(&self) -> RelinkStats {
                self.stats
            }

            /// Rewrite the remote links of one block. Returns whether the text changed.
            pub fn relink(&mut self, block: &mut Block) -> Result<bool, ConvertError> {
                if !block.string.contains(&self.config.host) {
                    return Ok(false);
                }

                let links = self.patterns.find(&block.string);
                if links.is_empty() {
                    let tag = &self.config.not_converted_tag;
                    if block.string.contains(tag.as_str()) {
                        return Ok(false);
                    }
                    warn!(uid = %block.uid, "remote file reference could not be converted");
                    block.string.push(' ');
                    block.string.push_str(tag);
                    self.stats.not_converted += 1;
                    return Ok(true);
                }

                let text = &block.string;
                let mut out = String::with_capacity(text.len());
                let mut last = 0;
                for link in &links {
                    out.push_str(&text[last..link.span.start]);
                    out.push_str(&self.local_link(&block.uid, link)?);
                    last = link.span.end;
                }
                out.push_str(&text[last..]);

                debug!(uid = %block.uid, links = links.len(), "relinked remote files");
                block.string = out;
                self.stats.blocks_relinked += 1;
                Ok(true)
            }

            /// Make sure the file exists locally and build the Logseq link for it.
            fn local_link(
                &mut self,
                uid: &BlockUid,
                link: &AssetLink,
            ) -> Result<String, ConvertError> {
                let dir = self.config.directory.as_path();
                if !is_plain_file_name(&link.file) {
                    return Err(ConvertError::UnsafeFileName {
                        uid: uid.clone(),
                        url: link.url.clone(),
                        file: link.file.clone(),
                    });
                }
                let mut file = link.file.clone();
                let mut target = dir.join(&file);

                if target.is_file() {
                    self.stats.reused += 1;
                } else {
                    match renamed_candidates(uid, dir, &file)?.as_slice() {
                        [renamed] => {
                            debug!(%uid, from = %file, to = %renamed, "reusing renamed asset");
                            file = renamed.clone();
                            target = dir.join(&file);
                            self.stats.reused += 1;
                        }
                        _ => {
                            fs::create_dir_all(dir).map_err(|source| ConvertError::Io {
                                uid: uid.clone(),
                                action: "creating asset directory",
                                path: dir.to_path_buf(),
                                source,
                            })?;
                            info!(url = %link.url, "downloading");
                            self.fetcher.fetch(&link.url, &target).map_err(|source| {
                                ConvertError::Download {
                                    uid: uid.clone(),
                                    url: link.url.clone(),
                                    target: target.clone(),
                                    source,
                                }
                            })?;
                            self.stats.downloaded += 1;
                        }
                    }
                }

                let mut prefix = link.prefix.as_str();
                let extension = Path::new(&file)
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_owned);
                match extension {
                    Some(ext) if ext.eq_ignore_ascii_case("pdf") => prefix = "!",
                    Some(_) => {}
                    None => {
                        let ext = self.sniff(uid, &target)?;
                        let renamed = format!("{file}.{ext}");
                        let renamed_path = dir.join(&renamed);
                        fs::rename(&target, &renamed_path).map_err(|source| ConvertError::Io {
                            uid: uid.clone(),
                            action: "renaming",
                            path: target.clone(),
                            source,
                        })?;
                        file = renamed;
                    }
                }

                Ok(format!(
                    "{prefix}[{}]({}/{file})",
                    link.name, self.config.link_prefix
                ))
            }

            fn sniff(&self, uid: &BlockUid, path: &Path) -> Result<String, ConvertError> {
                self.sniffer
                    .extension(path)
                    .map_err(|source| ConvertError::Sniff {
                        uid: uid.clone(),
                        path: path.to_path_buf(),
                        source,
                    })?
                    .ok_or_else(|| ConvertError::UnknownFileType {
                        uid: uid.clone(),
                        path: path.to_path_buf(),
                    })
            }
        }

        /// A single normal path component, so joining it stays inside the asset directory.
        fn is_plain_file_name(file: &str) -> bool {
            let mut components = Path::new(file).components();
            matches!(
                (components.next(), components.next()),
                (Some(Component::Normal(_)), None)
            )
        }

        /// Files in `dir` whose name starts with `file`, sorted. A missing directory has none.
        fn renamed_candidates(
            uid: &BlockUid,
            dir: &Path,
            file: &str,
        ) -> Result<Vec<String>, ConvertError> {
            let io_err = |source| ConvertError::Io {
                uid: uid.clone(),
                action: "listing",
                path: dir.to_path_buf(),
                source,
            };
            if !dir.is_dir() {
                return Ok(Vec::new());
            }
            let mut out = Vec::new();
            for entry in fs::read_dir(dir).map_err(io_err)? {
                let entry = entry.map_err(io_err)?;
                let path: PathBuf = entry.path();
                if !path.is_file() {
                    continue;
                }
                if let Some(name) = entry.file_name().to_str() {
                    if name.starts_with(file) {
                        out.push(name.to_string());
                    }
                }
            }
            out.sort();
            Ok(out)
        }

        #[cfg(test)]
        mod tests {
            use super::*;
            use anyhow::bail;
            use std::cell::RefCell;

            const BASE: &str = "https://firebasestorage.googleapis.com/v0/b/app.appspot.com/o/imgs%2Fapp%2FGraph%2F";

            #[derive(Default)]
            struct FakeFetcher {
                calls: RefCell<Vec<String>>,
                fail: bool,
            }

            impl AssetFetcher for FakeFetcher {
                fn fetch(&self, url: &str, target: &Path) -> anyhow::Result<()> {
                    self.calls.borrow_mut().push(url.to_string());
                    if self.fail {
                        bail!("connection refused");
                    }
                    fs::write(target, b"payload")?;
                    Ok(())
                }
            }

            struct FixedSniffer(Option<&'static str>);

            impl ContentSniffer for FixedSniffer {
                fn extension(&self, _path: &Path) -> anyhow::Result<Option<String>> {
                    Ok(self.0.map(str::to_string))
                }
            }

            fn config(dir: &Path) -> AssetConfig {
                AssetConfig {
                    directory: dir.to_path_buf(),
                    host: "firebasestorage.googleapis.com".into(),
                    not_converted_tag: "#notconverted".into(),
                    link_prefix: "../assets".into(),
                }
            }

            fn url(file: &str) -> String {
                format!("{BASE}{file}?alt=media&token=0f1e2d")
            }

            #[test]
            fn finds_file_name_after_last_encoded_slash() {
                let patterns =
                    LinkPatterns::for_host("firebasestorage.googleapis.com").expect("patterns");
                let text = format!("![shot]({})", url("photo.png"));
                let links = patterns.find(&text);
                assert_eq!(links.len(), 1);
                assert_eq!(links[0].shape, LinkShape::Named);
                assert_eq!(links[0].prefix, "!");
                assert_eq!(links[0].name, "shot");
                assert_eq!(links[0].file, "photo.png");
                assert_eq!(links[0].span, 0..text.len());
            }

            #[test]
            fn named_links_are_downloaded_and_rewritten() {
                let tmp = tempfile::tempdir().expect("tempdir");
                let config = config(tmp.path());
                let fetcher = FakeFetcher::default();
                let sniffer = FixedSniffer(None);
                let mut relinker = AssetRelinker::new(&config, &fetcher, &sniffer).expect("relinker");

                let mut block = Block::new(
                    "b1",
                    format!("see ![img]({}) and [notes]({}) end", url("photo.png"), url("notes.txt")),
                );
                assert!(relinker.relink(&mut block).expect("relink"));
                assert_eq!(
                    block.string,
                    "see ![img](../assets/photo.png) and [notes](../assets/notes.txt) end"
                );
                assert_eq!(fetcher.calls.borrow().len(), 2);
                assert!(tmp.path().join("photo.png").is_file());
                assert_eq!(relinker.stats().downloaded, 2);
            }

            #[test]
            fn pdf_embeds_become_embedded_links() {
                let tmp = tempfile::tempdir().expect("tempdir");
                let config = config(tmp.path());
                let fetcher = FakeFetcher::default();
                let sniffer = FixedSniffer(None);
                let mut relinker = AssetRelinker::new(&config, &fetcher, &sniffer).expect("relinker");

                let mut block = Block::new("b1", format!("{{{{[[pdf]]: {}}}}}", url("Paper.PDF")));
                relinker.relink(&mut block).expect("relink");
                assert_eq!(block.string, "![](../assets/Paper.PDF)");
            }

            #[test]
            fn bare_links_get_a_sniffed_extension() {
                let tmp = tempfile::tempdir().expect("tempdir");
                let config = config(tmp.path());
                let fetcher = FakeFetcher::default();
                let sniffer = FixedSniffer(Some("png"));
                let mut relinker = AssetRelinker::new(&config, &fetcher, &sniffer).expect("relinker");

                let mut block = Block::new("b1", format!("scan {}\nnext line", url("scan")));
                relinker.relink(&mut block).expect("relink");
                assert_eq!(block.string, "scan [](../assets/scan.png)\nnext line");
                assert!(tmp.path().join("scan.png").is_file());
                assert!(!tmp.path().join("scan").exists());
            }

            #[test]
            fn relinking_twice_downloads_once() {
                let tmp = tempfile::tempdir().expect("tempdir");
                let config = config(tmp.path());
                let fetcher = FakeFetcher::default();
                let sniffer = FixedSniffer(Some("jpg"));
                let mut relinker = AssetRelinker::new(&config, &fetcher, &sniffer).expect("relinker");
                let original = format!("[pic]({})", url("holiday"));

                let mut first = Block::new("b1", original.clone());
                relinker.relink(&mut first).expect("first run");
                let mut second = Block::new("b1", original);
                relinker.relink(&mut second).expect("second run");

                assert_eq!(first.string, "[pic](../assets/holiday.jpg)");
                assert_eq!(second.string, first.string);
                assert_eq!(fetcher.calls.borrow().len(), 1);
                assert_eq!(relinker.stats().reused, 1);

                // already relinked text no longer mentions the host
                assert!(!relinker.relink(&mut first).expect("third run"));
            }

            #[test]
            fn ambiguous_renamed_files_trigger_a_download() {
                let tmp = tempfile::tempdir().expect("tempdir");
                fs::write(tmp.path().join("report.png"), b"a").expect("write");
                fs::write(tmp.path().join("report.jpg"), b"b").expect("write");
                let config = config(tmp.path());
                let fetcher = FakeFetcher::default();
                let sniffer = FixedSniffer(Some("gif"));
                let mut relinker = AssetRelinker::new(&config, &fetcher, &sniffer).expect("relinker");

                let mut block = Block::new("b1", format!("[r]({})", url("report")));
                relinker.relink(&mut block).expect("relink");
                assert_eq!(fetcher.calls.borrow().len(), 1);
                assert_eq!(block.string, "[r](../assets/report.gif)");
            }

            #[test]
            fn unmatched_host_mentions_are_tagged_once() {
                let tmp = tempfile::tempdir().expect("tempdir");
                let config = config(tmp.path());
                let fetcher = FakeFetcher::default();
                let sniffer = FixedSniffer(None);
                let mut relinker = AssetRelinker::new(&config, &fetcher, &sniffer).expect("relinker");

                let mut block = Block::new("b1", "hosted on firebasestorage.googleapis.com somewhere");
                assert!(relinker.relink(&mut block).expect("relink"));
                assert_eq!(block.string, "hosted on firebasestorage.googleapis.com somewhere #notconverted");
                assert!(!relinker.relink(&mut block).expect("relink again"));
                assert!(fetcher.calls.borrow().is_empty());
            }

            #[test]
            fn download_failures_name_the_block() {
                let tmp = tempfile::tempdir().expect("tempdir");
                let config = config(tmp.path());
                let fetcher = FakeFetcher {
                    fail: true,
                    ..Default::default()
                };
                let sniffer = FixedSniffer(None);
                let mut relinker = AssetRelinker::new(&config, &fetcher, &sniffer).expect("relinker");

                let original = format!("[a]({})", url("a.png"));
                let mut block = Block::new("xyz", original.clone());
                let err = relinker.relink(&mut block).expect_err("download fails");
                assert!(matches!(err, ConvertError::Download { ref uid, .. } if uid.as_str() == "xyz"));
                assert_eq!(block.string, original);
            }

            #[test]
            fn links_without_a_file_name_are_not_matched_to_local_files() {
                let tmp = tempfile::tempdir().expect("tempdir");
                fs::write(tmp.path().join("unrelated.png"), b"a").expect("write");
                let config = config(tmp.path());
                let fetcher = FakeFetcher::default();
                let sniffer = FixedSniffer(None);
                let mut relinker = AssetRelinker::new(&config, &fetcher, &sniffer).expect("relinker");

                let text = format!("[doc]({BASE}?alt=media)");
                let mut block = Block::new("b1", text.clone());
                relinker.relink(&mut block).expect("relink");
                assert_eq!(block.string, format!("{text} #notconverted"));
                assert!(fetcher.calls.borrow().is_empty());
                assert_eq!(relinker.stats().reused, 0);
            }

            #[test]
            fn file_names_cannot_leave_the_asset_directory() {
                let tmp = tempfile::tempdir().expect("tempdir");
                let assets = tmp.path().join("assets");
                let config = config(&assets);
                let fetcher = FakeFetcher::default();
                let sniffer = FixedSniffer(None);
                let mut relinker = AssetRelinker::new(&config, &fetcher, &sniffer).expect("relinker");

                let original = format!("[x]({})", url("../escaped.txt"));
                let mut block = Block::new("evil", original.clone());
                let err = relinker.relink(&mut block).expect_err("unsafe name");
                assert!(matches!(
                    err,
                    ConvertError::UnsafeFileName { ref uid, ref file, .. }
                        if uid.as_str() == "evil" && file == "../escaped.txt"
                ));
                assert_eq!(block.string, original);
                assert!(fetcher.calls.borrow().is_empty());
                assert!(!tmp.path().join("escaped.txt").exists());
            }

            #[test]
            fn unknown_content_type_is_fatal() {
                let tmp = tempfile::tempdir().expect("tempdir");
                let config = config(tmp.path());
                let fetcher = FakeFetcher::default();
                let sniffer = FixedSniffer(None);
                let mut relinker = AssetRelinker::new(&config, &fetcher, &sniffer).expect("relinker");

                let mut block = Block::new("b1", format!("[a]({})", url("mystery")));
                let err = relinker.relink(&mut block).expect_err("sniff fails");
                assert!(matches!(err, ConvertError::UnknownFileType { .. }));
            }
        }
    }

    pub mod tasks {
        //! Roam TODO/DONE blocks tagged with a task-management page (e.g. `#canceled`)
        //! become Logseq status keywords (`CANCELED ...`).

        use crate::config::TaskRule;
        use crate::core::Block;
        use nom::{
            IResult,
            branch::alt,
            bytes::complete::{tag, take_while1},
            character::complete::char,
            combinator::{not, opt, value},
            multi::count,
            sequence::delimited,
        };
        use std::ops::Range;
        use tracing::debug;

        type PResult<'a, T> = IResult<&'a str, T>;

        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum TaskKeyword {
            Todo,
            Done,
        }

        /// `{{[[TODO]]}}`-style marker at the start of a block.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct TaskMarker {
            pub keyword: TaskKeyword,
            /// End of the marker, including one trailing space if present.
            pub end: usize,
        }

        fn keyword(i: &str) -> PResult<'_, TaskKeyword> {
            delimited(
                tag("[["),
                alt((
                    value(TaskKeyword::Todo, tag("TODO")),
                    value(TaskKeyword::Done, tag("DONE")),
                )),
                tag("]]"),
            )(i)
        }

        fn marker(i: &str) -> PResult<'_, TaskKeyword> {
            let (i, opening) = take_while1(|c: char| c == '{')(i)?;
            let (i, kw) = keyword(i)?;
            let (i, _) = count(char('}'), opening.len())(i)?;
            let (i, _) = not(char('}'))(i)?;
            let (i, _) = opt(char(' '))(i)?;
            Ok((i, kw))
        }

        /// The marker at the very start of `text`; braces must balance exactly.
        pub fn parse_marker(text: &str) -> Option<TaskMarker> {
            let (rest, keyword) = marker(text).ok()?;
            Some(TaskMarker {
                keyword,
                end: text.len() - rest.len(),
            })
        }

        /// First occurrence of `name` at or after `from`, trying `#name`, `#[[name]]`
        /// and `[[name]]` in that order. One trailing space belongs to the span.
        pub fn find_tag(text: &str, name: &str, from: usize) -> Option<Range<usize>> {
            for form in [format!("#{name}"), format!("#[[{name}]]"), format!("[[{name}]]")] {
                let Some(offset) = text[from..].find(&form) else {
                    continue;
                };
                let start = from + offset;
                let mut end = start + form.len();
                if text[end..].starts_with(' ') {
                    end += 1;
                }
                return Some(start..end);
            }
            None
        }

        /// The rewritten text, or `None` when the block is left as is.
        pub fn translate(text: &str, rules: &[TaskRule]) -> Option<String> {
            let marker = parse_marker(text)?;
            for rule in rules {
                let Some(found) = find_tag(text, &rule.tag, marker.end) else {
                    continue;
                };
                if marker.keyword == TaskKeyword::Done && !rule.override_done {
                    return None;
                }
                let out = format!(
                    "{} {}{}",
                    rule.status,
                    &text[marker.end..found.start],
                    &text[found.end..]
                );
                return Some(out.trim().to_string());
            }
            None
        }

        pub fn translate_block(block: &mut Block, rules: &[TaskRule]) -> bool {
            match translate(&block.string, rules) {
                Some(text) => {
                    debug!(uid = %block.uid, "translated task marker");
                    block.string = text;
                    true
                }
                None => false,
            }
        }

    }

    pub mod schedule {
        //! Blocks carrying the scheduling marker and a daily-note reference such as
        //! `[[December 25th, 2023]]` get a Logseq `SCHEDULED:` line.

        use crate::config::ScheduleConfig;
        use crate::core::{Block, ConvertError};
        use chrono::NaiveDate;
        use nom::{
            IResult,
            branch::alt,
            bytes::complete::tag,
            character::complete::{char, digit1},
            combinator::{all_consuming, map_res, value},
            sequence::{preceded, terminated, tuple},
        };
        use once_cell::sync::Lazy;
        use regex::Regex;
        use tracing::debug;

        static DAILY_NOTE_RE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(
                r"\[\[(?P<date>(?:January|February|March|April|May|June|July|August|September|October|November|December) \d{1,2}(?:st|nd|rd|th), \d{4})\]\]",
            )
            .unwrap()
        });

        type PResult<'a, T> = IResult<&'a str, T>;

        fn month(i: &str) -> PResult<'_, u32> {
            alt((
                value(1, tag("January")),
                value(2, tag("February")),
                value(3, tag("March")),
                value(4, tag("April")),
                value(5, tag("May")),
                value(6, tag("June")),
                value(7, tag("July")),
                value(8, tag("August")),
                value(9, tag("September")),
                value(10, tag("October")),
                value(11, tag("November")),
                value(12, tag("December")),
            ))(i)
        }

        fn ordinal_day(i: &str) -> PResult<'_, u32> {
            terminated(
                map_res(digit1, str::parse::<u32>),
                alt((tag("st"), tag("nd"), tag("rd"), tag("th"))),
            )(i)
        }

        fn roam_date(i: &str) -> PResult<'_, (i32, u32, u32)> {
            let (i, (m, d, y)) = tuple((
                month,
                preceded(char(' '), ordinal_day),
                preceded(tag(", "), map_res(digit1, str::parse::<i32>)),
            ))(i)?;
            Ok((i, (y, m, d)))
        }

        /// Parse a daily-note title like `December 25th, 2023`.
        pub fn parse_roam_date(s: &str) -> Option<NaiveDate> {
            let (_, (y, m, d)) = all_consuming(roam_date)(s).ok()?;
            NaiveDate::from_ymd_opt(y, m, d)
        }

        pub fn scheduled_line(date: NaiveDate) -> String {
            format!("SCHEDULED: <{}>", date.format("%Y-%m-%d %a"))
        }

        pub struct ScheduleAnnotator<'a> {
            config: &'a ScheduleConfig,
        }

        impl<'a> ScheduleAnnotator<'a> {
            pub fn new(config: &'a ScheduleConfig) -> Self {
                Self { config }
            }

            /// Append the SCHEDULED line. Returns whether the block changed.
            pub fn annotate(&self, block: &mut Block) -> Result<bool, ConvertError> {
                let text = &block.string;
                if !text.contains(&self.config.marker) {
                    return Ok(false);
                }
                if text.lines().any(|l| l.trim_start().starts_with("SCHEDULED: <")) {
                    return Ok(false);
                }
                let first_line = text.split('\n').next().unwrap_or_default();
                let Some(caps) = DAILY_NOTE_RE.captures(first_line) else {
                    return Ok(false);
                };
                let raw = &caps["date"];
                let date = parse_roam_date(raw).ok_or_else(|| ConvertError::InvalidDate {
                    uid: block.uid.clone(),
                    date: raw.to_string(),
                    text: text.clone(),
                })?;

                debug!(uid = %block.uid, %date, "adding scheduled date");
                let line = scheduled_line(date);
                block.string.push('\n');
                block.string.push_str(&line);
                Ok(true)
            }
        }

    }
}

pub mod pipeline {
    //! Runs every pass over the whole tree in a fixed order. Queries are fenced
    //! before links are rewritten, and attributes are relocated before the
    //! schedule and task passes read the resulting text.

    use crate::config::ConvertConfig;
    use crate::core::{ConvertError, Page};
    use crate::index::{BlockIndex, ReferenceIndex};
    use crate::passes::{
        assets::{AssetRelinker, RelinkStats},
        attributes::{AttributeRelocator, Relocation},
        queries, schedule::ScheduleAnnotator, tasks,
    };
    use crate::storage::{AssetFetcher, ContentSniffer};
    use crate::walker::{self, Effect};
    use serde::Serialize;
    use tracing::{info, warn};

    /// What each pass did.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct ConversionReport {
        pub blocks: usize,
        pub referenced_blocks: usize,
        pub dangling_refs: usize,
        pub queries_fenced: usize,
        pub assets: RelinkStats,
        pub attributes_tagged: usize,
        pub attributes_copied: usize,
        pub attributes_moved: usize,
        pub scheduled: usize,
        pub tasks_translated: usize,
    }

    pub struct Converter<'a> {
        config: &'a ConvertConfig,
        fetcher: &'a dyn AssetFetcher,
        sniffer: &'a dyn ContentSniffer,
    }

    impl<'a> Converter<'a> {
        pub fn new(
            config: &'a ConvertConfig,
            fetcher: &'a dyn AssetFetcher,
            sniffer: &'a dyn ContentSniffer,
        ) -> Self {
            Self {
                config,
                fetcher,
                sniffer,
            }
        }

        /// Rewrite `pages` in place. On error the tree is left partially converted.
        pub fn run(&self, pages: &mut [Page]) -> Result<ConversionReport, ConvertError> {
            let mut report = ConversionReport::default();

            let refs = ReferenceIndex::build(pages);
            {
                let blocks = BlockIndex::build(pages);
                let dangling = refs.dangling(&blocks);
                for uid in &dangling {
                    warn!(%uid, "reference to a block that is not in the export");
                }
                report.blocks = blocks.len();
                report.referenced_blocks = refs.len() - dangling.len();
                report.dangling_refs = dangling.len();
            }
            info!(
                blocks = report.blocks,
                referenced = report.referenced_blocks,
                "indexed export"
            );

            walker::walk_mut(pages, &mut |block, _| -> Result<Effect, ConvertError> {
                if queries::fence_block(block) {
                    report.queries_fenced += 1;
                }
                Ok(Effect::none())
            })?;
            info!(fenced = report.queries_fenced, "fenced queries");

            let mut relinker = AssetRelinker::new(&self.config.assets, self.fetcher, self.sniffer)?;
            walker::walk_mut(pages, &mut |block, _| -> Result<Effect, ConvertError> {
                relinker.relink(block)?;
                Ok(Effect::none())
            })?;
            report.assets = relinker.stats();
            info!(
                downloaded = report.assets.downloaded,
                reused = report.assets.reused,
                not_converted = report.assets.not_converted,
                "relinked assets"
            );

            let relocator = AttributeRelocator::new(&self.config.attributes, &refs);
            walker::walk_mut(pages, &mut |block, parent| -> Result<Effect, ConvertError> {
                let outcome = relocator.relocate(block, parent);
                match &outcome {
                    Relocation::Untouched => {}
                    Relocation::Tagged => report.attributes_tagged += 1,
                    Relocation::Copied(_) => report.attributes_copied += 1,
                    Relocation::Moved(_) => report.attributes_moved += 1,
                }
                Ok(outcome.effect())
            })?;
            info!(
                tagged = report.attributes_tagged,
                copied = report.attributes_copied,
                moved = report.attributes_moved,
                "relocated attributes"
            );

            let annotator = ScheduleAnnotator::new(&self.config.schedule);
            walker::walk_mut(pages, &mut |block, _| -> Result<Effect, ConvertError> {
                if annotator.annotate(block)? {
                    report.scheduled += 1;
                }
                Ok(Effect::none())
            })?;
            info!(scheduled = report.scheduled, "annotated schedules");

            let rules = &self.config.tasks;
            walker::walk_mut(pages, &mut |block, _| -> Result<Effect, ConvertError> {
                if tasks::translate_block(block, rules) {
                    report.tasks_translated += 1;
                }
                Ok(Effect::none())
            })?;
            info!(translated = report.tasks_translated, "translated task markers");

            Ok(report)
        }
    }

}

pub use crate::config::{ConvertConfig, Loader};
pub use crate::core::{Block, BlockUid, ConvertError, Page};
pub use crate::pipeline::{ConversionReport, Converter};
