//! Fingerprint-keyed cache for generated declarations
//!
//! Each tool's signature is cached under a blake3 fingerprint of its name,
//! description and schemas, so changing one tool regenerates only that
//! tool. The assembled namespace is cached under the combined fingerprint of
//! the whole tool set.

use crate::signatures::{Declarations, ToolSignature};
use blake3::Hasher;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use toolscript_types::ToolDescriptor;

/// Content hash of a tool's declared shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub content_hash: [u8; 32],
}

impl Fingerprint {
    /// Fingerprint of one tool descriptor
    pub fn of_tool(tool: &ToolDescriptor) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(tool.name.as_bytes());
        hasher.update(&[0]);
        hasher.update(tool.description.as_bytes());
        hasher.update(&[0]);
        // serde_json maps are ordered, so this rendering is canonical.
        hasher.update(tool.input_schema.to_string().as_bytes());
        hasher.update(&[0]);
        if let Some(output) = &tool.output_schema {
            hasher.update(output.to_string().as_bytes());
        }
        Self {
            content_hash: *hasher.finalize().as_bytes(),
        }
    }

    /// Fingerprint of a namespace built from tool fingerprints
    pub fn of_set<'a>(namespace: &str, parts: impl IntoIterator<Item = &'a Fingerprint>) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(namespace.as_bytes());
        for part in parts {
            hasher.update(&part.content_hash);
        }
        Self {
            content_hash: *hasher.finalize().as_bytes(),
        }
    }

    pub fn to_hex(&self) -> String {
        self.content_hash.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Whole namespace served from cache
    pub hits: u64,
    /// Namespace had to be reassembled
    pub misses: u64,
    /// Tool signatures regenerated
    pub regenerated: u64,
    /// Tool signatures reused during reassembly
    pub reused: u64,
}

#[derive(Debug)]
struct CachedSignature {
    fingerprint: Fingerprint,
    signature: Arc<ToolSignature>,
}

/// Memoizes [`Declarations`] for a changing tool registry
#[derive(Debug)]
pub struct DeclarationCache {
    namespace: String,
    signatures: DashMap<String, CachedSignature>,
    assembled: Mutex<Option<(Fingerprint, Arc<Declarations>)>>,
    stats: Mutex<CacheStats>,
}

impl DeclarationCache {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            signatures: DashMap::new(),
            assembled: Mutex::new(None),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Declarations for `tools`, regenerating only what changed
    pub fn declarations<'a>(
        &self,
        tools: impl IntoIterator<Item = &'a ToolDescriptor>,
    ) -> Arc<Declarations> {
        let mut tools: Vec<&ToolDescriptor> = tools.into_iter().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        let fingerprints: Vec<Fingerprint> = tools.iter().map(|t| Fingerprint::of_tool(t)).collect();
        let combined = Fingerprint::of_set(&self.namespace, &fingerprints);

        let mut assembled = self.assembled.lock();
        if let Some((key, decls)) = assembled.as_ref() {
            if *key == combined {
                self.stats.lock().hits += 1;
                tracing::trace!(fingerprint = %combined.to_hex(), "declaration cache hit");
                return Arc::clone(decls);
            }
        }

        let mut regenerated = 0;
        let mut signatures = Vec::with_capacity(tools.len());
        for (tool, fingerprint) in tools.iter().zip(&fingerprints) {
            let cached = self
                .signatures
                .get(&tool.name)
                .filter(|entry| entry.fingerprint == *fingerprint)
                .map(|entry| Arc::clone(&entry.signature));
            let signature = match cached {
                Some(signature) => signature,
                None => {
                    regenerated += 1;
                    let signature = Arc::new(ToolSignature::generate(tool));
                    self.signatures.insert(
                        tool.name.clone(),
                        CachedSignature {
                            fingerprint: *fingerprint,
                            signature: Arc::clone(&signature),
                        },
                    );
                    signature
                }
            };
            signatures.push(signature);
        }
        self.signatures
            .retain(|name, _| tools.iter().any(|tool| &tool.name == name));

        let decls = Arc::new(Declarations::assemble(self.namespace.clone(), signatures));
        *assembled = Some((combined, Arc::clone(&decls)));

        let mut stats = self.stats.lock();
        stats.misses += 1;
        stats.regenerated += regenerated;
        stats.reused += (tools.len() as u64).saturating_sub(regenerated);
        tracing::trace!(
            fingerprint = %combined.to_hex(),
            regenerated,
            total = tools.len(),
            "declaration cache miss"
        );
        decls
    }

    /// Drop one tool's cached signature
    pub fn invalidate(&self, tool_name: &str) {
        self.signatures.remove(tool_name);
        *self.assembled.lock() = None;
    }

    pub fn clear(&self) {
        self.signatures.clear();
        *self.assembled.lock() = None;
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock()
    }
}
