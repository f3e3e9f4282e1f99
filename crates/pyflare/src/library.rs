//! Class libraries: compiled SWF/SWC files the compiler resolves imports
//! against.
//!
//! Loading a library extracts every DoABC tag, indexes the public names its
//! scripts publish, and distills each class into a self-contained
//! [`ClassRecord`]: qualified name, base, flags, and its method traits with
//! dispatch ids and metadata. Records are all the compiler needs (base
//! chains for class creation, method traits for override dispatch ids,
//! metadata for `@debuginfo`-style call rewriting) and, being plain
//! values, classes produced *by* compilation register back in through the
//! same type so later files can import them.
//!
//! Files are cached per path and re-read when their mtime changes. A
//! malformed library aborts only that file: the error surfaces later, as an
//! import failure at the first site that needs a missing class.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::abc::{AbcFile, InstanceFlags, Metadata, Multiname, Namespace, TraitKind};
use crate::error::Result;
use crate::swf::Movie;

/// What a public name denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PropKind {
    Class,
    Function,
}

/// A method trait retained from a class: enough to answer override and
/// metadata queries.
#[derive(Debug, Clone)]
pub struct MethodTrait {
    pub name: Multiname,
    pub disp_id: u32,
    pub metadata: Vec<Metadata>,
}

/// Distilled view of one class, from a library file or from compilation.
#[derive(Debug, Clone)]
pub struct ClassRecord {
    /// Fully qualified name; always a `QName`.
    pub name: Multiname,
    /// Base class name, or `Any` at the root of the hierarchy.
    pub super_name: Multiname,
    pub interface: bool,
    pub methods: Vec<MethodTrait>,
    /// Where the class came from, for diagnostics.
    pub source: String,
}

impl ClassRecord {
    /// The instance method trait with this exact qualified name.
    pub fn method_trait(&self, name: &Multiname) -> Option<&MethodTrait> {
        self.methods.iter().find(|m| &m.name == name)
    }

    /// The (package, name) pair of the base class, when there is one.
    pub fn super_key(&self) -> Option<(String, String)> {
        match &self.super_name {
            Multiname::QName { ns, name } => Some((ns.name().to_owned(), name.clone())),
            _ => None,
        }
    }
}

struct CachedFile {
    mtime: Option<SystemTime>,
    records: Vec<ClassRecord>,
    names: Vec<((String, String), PropKind)>,
}

/// The class-resolution set for one compilation.
#[derive(Default)]
pub struct Library {
    classes: HashMap<(String, String), ClassRecord>,
    names: HashMap<(String, String), PropKind>,
    cache: HashMap<PathBuf, CachedFile>,
}

impl Library {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an SWF or SWC file to the resolution set.
    pub fn add_file(&mut self, path: &Path) -> Result<()> {
        let mtime = fs::metadata(path).and_then(|m| m.modified()).ok();
        let fresh = match self.cache.get(path) {
            Some(entry) => entry.mtime != mtime || mtime.is_none(),
            None => true,
        };
        if fresh {
            let loaded = load_file(path)?;
            self.cache.insert(
                path.to_owned(),
                CachedFile {
                    mtime,
                    records: loaded.0,
                    names: loaded.1,
                },
            );
        } else {
            debug!(path = %path.display(), "library cache hit");
        }
        let entry = &self.cache[path];
        for record in &entry.records {
            if let Multiname::QName { ns, name } = &record.name {
                self.classes
                    .insert((ns.name().to_owned(), name.clone()), record.clone());
            }
        }
        for (key, kind) in &entry.names {
            self.names.insert(key.clone(), *kind);
        }
        Ok(())
    }

    /// Whether (package, name) denotes a class or a function, if known.
    pub fn property_type(&self, package: &str, name: &str) -> Option<PropKind> {
        self.names
            .get(&(package.to_owned(), name.to_owned()))
            .copied()
    }

    pub fn get_class(&self, package: &str, name: &str) -> Option<&ClassRecord> {
        self.classes.get(&(package.to_owned(), name.to_owned()))
    }

    /// The base-class chain starting at (package, name), root last.
    /// `None` when the class itself or any base is unknown.
    pub fn ancestor_chain(&self, package: &str, name: &str) -> Option<Vec<ClassRecord>> {
        let mut chain = Vec::new();
        let mut current = self.get_class(package, name)?.clone();
        loop {
            let super_key = current.super_key();
            chain.push(current);
            match super_key {
                Some((pkg, nm)) => current = self.get_class(&pkg, &nm)?.clone(),
                None => return Some(chain),
            }
        }
    }

    /// Register a class produced by compilation.
    pub fn add_class_record(&mut self, record: ClassRecord) {
        if let Multiname::QName { ns, name } = &record.name {
            let key = (ns.name().to_owned(), name.clone());
            self.names.insert(key.clone(), PropKind::Class);
            self.classes.insert(key, record);
        }
    }

    /// Register a public name announced by a source file (`@package`).
    pub fn add_name(&mut self, package: &str, name: &str, kind: PropKind) {
        self.names
            .insert((package.to_owned(), name.to_owned()), kind);
    }

    /// Every known (package, name) pair.
    pub fn public_names(&self) -> impl Iterator<Item = (&str, &str, PropKind)> {
        self.names
            .iter()
            .map(|((pkg, name), kind)| (pkg.as_str(), name.as_str(), *kind))
    }
}

type Loaded = (Vec<ClassRecord>, Vec<((String, String), PropKind)>);

fn load_file(path: &Path) -> Result<Loaded> {
    if path.extension().is_some_and(|ext| ext == "swc") {
        let file = fs::File::open(path)?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| crate::error::Error::malformed("swc", e.to_string()))?;
        let mut records = Vec::new();
        let mut names = Vec::new();
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| crate::error::Error::malformed("swc", e.to_string()))?;
            if !entry.name().ends_with(".swf") {
                continue;
            }
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            let source = format!("{}:{}", path.display(), entry.name());
            let (mut r, mut n) = load_swf(&data, &source)?;
            records.append(&mut r);
            names.append(&mut n);
        }
        Ok((records, names))
    } else {
        let data = fs::read(path)?;
        load_swf(&data, &path.display().to_string())
    }
}

fn load_swf(data: &[u8], source: &str) -> Result<Loaded> {
    let movie = Movie::read(data)?;
    let mut records = Vec::new();
    let mut names = Vec::new();
    for doabc in movie.abc_tags() {
        match doabc.parse_abc() {
            Ok(abc) => scan_abc(&abc, source, &mut records, &mut names),
            Err(err) => {
                warn!(%source, tag = %doabc.name, %err, "skipping malformed ABC tag");
            }
        }
    }
    Ok((records, names))
}

fn scan_abc(
    abc: &AbcFile,
    source: &str,
    records: &mut Vec<ClassRecord>,
    names: &mut Vec<((String, String), PropKind)>,
) {
    // The last script publishes the file's top-level names.
    if let Some(script) = abc.scripts.last() {
        for t in &script.traits {
            if let Multiname::QName {
                ns: Namespace::Package(pkg),
                name,
            } = &t.name
            {
                let kind = match &t.kind {
                    TraitKind::Class { .. } => Some(PropKind::Class),
                    TraitKind::Method { .. } | TraitKind::Function { .. } => {
                        Some(PropKind::Function)
                    }
                    _ => None,
                };
                if let Some(kind) = kind {
                    names.push(((pkg.clone(), name.clone()), kind));
                }
            }
        }
    }
    for (index, instance) in abc.instances.iter().enumerate() {
        if let Multiname::QName {
            ns: Namespace::Package(pkg),
            name,
        } = &instance.name
        {
            names.push(((pkg.clone(), name.clone()), PropKind::Class));
        }
        let mut methods = Vec::new();
        let mut collect = |traits: &[crate::abc::Trait]| {
            for t in traits {
                if let TraitKind::Method { disp_id, .. } = &t.kind {
                    let metadata = t
                        .metadata
                        .iter()
                        .filter_map(|id| abc.metadata.get(id.0 as usize).cloned())
                        .collect();
                    methods.push(MethodTrait {
                        name: t.name.clone(),
                        disp_id: *disp_id,
                        metadata,
                    });
                }
            }
        };
        collect(&instance.traits);
        collect(&abc.classes[index].traits);
        records.push(ClassRecord {
            name: instance.name.clone(),
            super_name: instance.super_name.clone(),
            interface: instance.flags.contains(InstanceFlags::INTERFACE),
            methods,
            source: source.to_owned(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pkg: &str, name: &str, base: Option<(&str, &str)>) -> ClassRecord {
        ClassRecord {
            name: Multiname::package(pkg, name),
            super_name: match base {
                Some((bp, bn)) => Multiname::package(bp, bn),
                None => Multiname::Any,
            },
            interface: false,
            methods: Vec::new(),
            source: "test".into(),
        }
    }

    #[test]
    fn ancestor_chain_walks_to_the_root() {
        let mut lib = Library::new();
        lib.add_class_record(record("", "Object", None));
        lib.add_class_record(record("flash.display", "Sprite", Some(("", "Object"))));
        lib.add_class_record(record("game", "Player", Some(("flash.display", "Sprite"))));
        let chain = lib.ancestor_chain("game", "Player").unwrap();
        let names: Vec<_> = chain.iter().map(|c| c.name.name().unwrap()).collect();
        assert_eq!(names, vec!["Player", "Sprite", "Object"]);
    }

    #[test]
    fn a_missing_base_breaks_the_chain() {
        let mut lib = Library::new();
        lib.add_class_record(record("game", "Player", Some(("flash.display", "Sprite"))));
        assert!(lib.ancestor_chain("game", "Player").is_none());
    }

    #[test]
    fn compiled_classes_become_importable() {
        let mut lib = Library::new();
        lib.add_class_record(record("game", "Main", None));
        assert_eq!(lib.property_type("game", "Main"), Some(PropKind::Class));
        assert!(lib.get_class("game", "Main").is_some());
        assert_eq!(lib.property_type("game", "Other"), None);
    }

    #[test]
    fn method_trait_lookup_is_by_qualified_name() {
        let mut rec = record("", "A", None);
        rec.methods.push(MethodTrait {
            name: Multiname::qname("update"),
            disp_id: 7,
            metadata: Vec::new(),
        });
        assert_eq!(
            rec.method_trait(&Multiname::qname("update")).unwrap().disp_id,
            7
        );
        assert!(rec
            .method_trait(&Multiname::package("other", "update"))
            .is_none());
    }
}
