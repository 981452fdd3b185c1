//! Descriptor registries and the iterative assembler.
//!
//! Two registries coexist. The *global* registry holds the canonical
//! well-known types (`Timestamp`, `Duration`, `Any`, `Empty`, `Struct`,
//! `FieldMask`, the wrappers, and the descriptor/type files). It is compiled
//! once at startup from the proto sources embedded in `protox` and is never
//! mutated afterwards. The *local* registry is rebuilt per connection from
//! the server's (repaired) file descriptors; it is seeded with the global
//! files so canonical dependencies always resolve.

use std::sync::LazyLock;

use prost_reflect::{DescriptorPool, EnumDescriptor, FileDescriptor, MessageDescriptor};
use prost_types::{FileDescriptorProto, FileDescriptorSet};

use crate::repair;

/// Canonical well-known-type files registered in the global registry.
const WELL_KNOWN_FILES: &[&str] = &[
    "google/protobuf/any.proto",
    "google/protobuf/api.proto",
    "google/protobuf/descriptor.proto",
    "google/protobuf/duration.proto",
    "google/protobuf/empty.proto",
    "google/protobuf/field_mask.proto",
    "google/protobuf/source_context.proto",
    "google/protobuf/struct.proto",
    "google/protobuf/timestamp.proto",
    "google/protobuf/type.proto",
    "google/protobuf/wrappers.proto",
];

static GLOBAL_REGISTRY: LazyLock<DescriptorPool> = LazyLock::new(|| {
    let set = protox::compile(WELL_KNOWN_FILES, ["."])
        .expect("well-known type sources embedded in protox compile");
    DescriptorPool::from_file_descriptor_set(set)
        .expect("well-known type descriptors are self-consistent")
});

/// The process-wide registry of canonical well-known types. Built on first
/// use, immutable thereafter.
pub fn global_registry() -> &'static DescriptorPool {
    &GLOBAL_REGISTRY
}

/// A message or enum found by name lookup.
#[derive(Debug, Clone)]
pub enum TypeDescriptor {
    Message(MessageDescriptor),
    Enum(EnumDescriptor),
}

impl TypeDescriptor {
    pub fn full_name(&self) -> &str {
        match self {
            TypeDescriptor::Message(d) => d.full_name(),
            TypeDescriptor::Enum(d) => d.full_name(),
        }
    }

    /// Path of the file that declares this type.
    pub fn parent_file_path(&self) -> String {
        match self {
            TypeDescriptor::Message(d) => d.parent_file().name().to_string(),
            TypeDescriptor::Enum(d) => d.parent_file().name().to_string(),
        }
    }
}

/// Name and path lookups over the local and global registries together.
///
/// The precedence is asymmetric on purpose: *names* resolve global-first so
/// a server-supplied duplicate of `google.protobuf.Timestamp` (or any other
/// canonical type) can never shadow the canonical definition, while *paths*
/// resolve local-first because servers may ship files whose non-canonical
/// paths collide with canonical ones in name only. A server that
/// legitimately extends `google.protobuf.*` is shadowed by this rule; that
/// trade-off is accepted.
pub struct CombinedResolver<'a> {
    local: &'a DescriptorPool,
}

impl<'a> CombinedResolver<'a> {
    pub fn new(local: &'a DescriptorPool) -> Self {
        CombinedResolver { local }
    }

    /// Look up a file by path: local registry first, then global.
    pub fn find_file_by_path(&self, path: &str) -> Option<FileDescriptor> {
        self.local
            .get_file_by_name(path)
            .or_else(|| global_registry().get_file_by_name(path))
    }

    /// Look up a message or enum by fully-qualified name: global registry
    /// first, then local.
    pub fn find_descriptor_by_name(&self, name: &str) -> Option<TypeDescriptor> {
        lookup_type(global_registry(), name).or_else(|| lookup_type(self.local, name))
    }

    /// Path of the file declaring the named type, if the name resolves.
    pub fn file_containing_symbol(&self, name: &str) -> Option<String> {
        self.find_descriptor_by_name(name)
            .map(|descriptor| descriptor.parent_file_path())
    }
}

fn lookup_type(pool: &DescriptorPool, name: &str) -> Option<TypeDescriptor> {
    pool.get_message_by_name(name)
        .map(TypeDescriptor::Message)
        .or_else(|| pool.get_enum_by_name(name).map(TypeDescriptor::Enum))
}

/// Outcome of assembling a set of file descriptors into a local registry.
pub struct Assembled {
    /// The local registry. Partial when some files failed; a partial
    /// registry is often enough to serve the currently-selected method.
    pub pool: DescriptorPool,
    /// Files that never built, with their final build errors.
    pub failures: Vec<(String, String)>,
}

/// Iteratively build a local registry from (repaired) file descriptors.
///
/// Dependents cannot register before their dependencies, and reflection
/// servers return files in arbitrary order, so registration loops until a
/// full pass makes no progress. A file that fails to build gets one
/// `fix_missing_imports` retry against the partially-built pool (types from
/// sibling files become resolvable as those siblings register), then is
/// deferred to the next pass. Files whose path is already registered are
/// skipped, which keeps canonical definitions authoritative.
///
/// Never fails: leftover files are logged with their final build errors and
/// reported in [`Assembled::failures`].
pub fn assemble(base: &DescriptorPool, files: Vec<FileDescriptorProto>) -> Assembled {
    let mut pool = base.clone();
    let mut pending: Vec<FileDescriptorProto> = files
        .into_iter()
        .filter(|fdp| {
            let path = fdp.name.as_deref().unwrap_or_default();
            pool.get_file_by_name(path).is_none()
                && global_registry().get_file_by_name(path).is_none()
        })
        .collect();

    let mut failures = Vec::new();
    loop {
        let mut progressed = false;
        let mut deferred: Vec<(FileDescriptorProto, String)> = Vec::new();

        for mut fdp in pending {
            let path = fdp.name.clone().unwrap_or_default();
            if pool.get_file_by_name(&path).is_some() {
                continue;
            }

            let error = match register_file(&mut pool, &fdp) {
                Ok(()) => {
                    progressed = true;
                    continue;
                }
                Err(error) => error,
            };

            let repaired = {
                let resolver = CombinedResolver::new(&pool);
                repair::fix_missing_imports(&mut fdp, &resolver)
            };
            if repaired && register_file(&mut pool, &fdp).is_ok() {
                progressed = true;
                continue;
            }

            deferred.push((fdp, error));
        }

        if deferred.is_empty() {
            break;
        }
        if !progressed {
            for (fdp, error) in deferred {
                let path = fdp.name.unwrap_or_else(|| "<unnamed>".into());
                tracing::warn!(file = %path, error = %error, "file descriptor could not be assembled");
                failures.push((path, error));
            }
            break;
        }
        pending = deferred.into_iter().map(|(fdp, _)| fdp).collect();
    }

    Assembled { pool, failures }
}

fn register_file(
    pool: &mut DescriptorPool,
    fdp: &FileDescriptorProto,
) -> std::result::Result<(), String> {
    let set = FileDescriptorSet {
        file: vec![fdp.clone()],
    };
    pool.add_file_descriptor_set(set).map_err(|e| e.to_string())
}
