//! The build driver: scan sources, resolve the dependency graph, build
//! each target from its sources in dependency order.
//!
//! A project is described by a TOML recipe: a `[global]` section (library
//! files, source search paths, the debug-filename mode) and one
//! `[targets.<output>]` table per SWF to produce. Each source file is
//! scanned for the names it imports and the `@package`-decorated names it
//! exports; matching exports to imports yields the dependency edges. A
//! metadata cache next to the recipe skips rescanning files whose mtime
//! has not changed.
//!
//! Circular imports are reported but not ordered; files unreachable from
//! any target are dropped from the graph.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use ruff_python_ast::{self as ast, Stmt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::compile::{self, FilenameMode, Options};
use crate::error::{Error, Result};
use crate::library::Library;
use crate::scope;

/// The `[global]` section of a recipe.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GlobalSection {
    #[serde(default)]
    pub libraries: Vec<PathBuf>,
    #[serde(default)]
    pub source_path: Vec<PathBuf>,
    #[serde(default)]
    pub debug_filename: Option<String>,
}

/// One `[targets.<name>]` table; the key is the output file name.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TargetSection {
    pub main_source: PathBuf,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
    pub main_class: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Recipe {
    #[serde(default)]
    pub global: GlobalSection,
    pub targets: BTreeMap<String, TargetSection>,
}

/// Scan result for one file, cached across runs keyed by mtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepInfo {
    pub time: u64,
    pub exports: Vec<(String, String)>,
    pub imports: Vec<(String, String)>,
}

fn mtime_of(path: &Path) -> Result<u64> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs())
}

fn system_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Collect `(package, name)` imports and `@package` exports of a module,
/// at any nesting depth.
fn scan_module(body: &[Stmt], imports: &mut Vec<(String, String)>, exports: &mut Vec<(String, String)>) {
    for stmt in body {
        match stmt {
            Stmt::ImportFrom(import) => {
                if let Some(module) = &import.module {
                    for alias in &import.names {
                        imports.push((module.to_string(), alias.name.to_string()));
                    }
                }
            }
            Stmt::FunctionDef(func) => {
                for dec in &func.decorator_list {
                    if scope::decorator_name(dec) == Some("package") {
                        if let Some(pkg) = scope::decorator_str_arg(dec) {
                            exports.push((pkg, func.name.to_string()));
                        }
                    }
                }
                scan_module(&func.body, imports, exports);
            }
            Stmt::ClassDef(class) => {
                for dec in &class.decorator_list {
                    if scope::decorator_name(dec) == Some("package") {
                        if let Some(pkg) = scope::decorator_str_arg(dec) {
                            exports.push((pkg, class.name.to_string()));
                        }
                    }
                }
                scan_module(&class.body, imports, exports);
            }
            Stmt::If(if_stmt) => {
                scan_module(&if_stmt.body, imports, exports);
                for clause in &if_stmt.elif_else_clauses {
                    scan_module(&clause.body, imports, exports);
                }
            }
            Stmt::Try(try_stmt) => {
                scan_module(&try_stmt.body, imports, exports);
                for handler in &try_stmt.handlers {
                    let ast::ExceptHandler::ExceptHandler(h) = handler;
                    scan_module(&h.body, imports, exports);
                }
                scan_module(&try_stmt.orelse, imports, exports);
            }
            Stmt::For(for_stmt) => scan_module(&for_stmt.body, imports, exports),
            Stmt::While(while_stmt) => scan_module(&while_stmt.body, imports, exports),
            _ => {}
        }
    }
}

/// Scan one file: a source for imports and exports, a library for its
/// public names.
pub fn scan_file(path: &Path) -> Result<DepInfo> {
    let time = mtime_of(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("py") => {
            let source = fs::read_to_string(path)?;
            let parsed = ruff_python_parser::parse_module(&source)
                .map_err(|e| Error::malformed("source", format!("{}: {e}", path.display())))?;
            let module = parsed.into_syntax();
            let mut imports = Vec::new();
            let mut exports = Vec::new();
            scan_module(&module.body, &mut imports, &mut exports);
            Ok(DepInfo {
                time,
                exports,
                imports,
            })
        }
        Some("swf") | Some("swc") => {
            let mut lib = Library::new();
            lib.add_file(path)?;
            let exports = lib
                .public_names()
                .map(|(pkg, name, _)| (pkg.to_owned(), name.to_owned()))
                .collect();
            Ok(DepInfo {
                time,
                exports,
                imports: Vec::new(),
            })
        }
        _ => Err(Error::malformed(
            "recipe",
            format!("cannot scan {}", path.display()),
        )),
    }
}

/// Build-run toggles.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    pub force: bool,
    pub dry_run: bool,
    pub no_cache: bool,
}

/// A loaded project: the recipe plus the directories everything is
/// resolved against.
pub struct Project {
    pub recipe: Recipe,
    pub dir: PathBuf,
    pub build_dir: PathBuf,
    cache_path: PathBuf,
}

impl Project {
    pub fn load(manifest: &Path, build_dir: &Path) -> Result<Self> {
        let text = fs::read_to_string(manifest)?;
        let recipe: Recipe = toml::from_str(&text)
            .map_err(|e| Error::malformed("recipe", e.to_string()))?;
        let dir = manifest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut cache_path = manifest.as_os_str().to_owned();
        cache_path.push(".dep.json");
        Ok(Self {
            recipe,
            dir,
            build_dir: build_dir.to_path_buf(),
            cache_path: PathBuf::from(cache_path),
        })
    }

    fn load_cache(&self) -> HashMap<PathBuf, DepInfo> {
        let Ok(text) = fs::read_to_string(&self.cache_path) else {
            return HashMap::new();
        };
        match serde_json::from_str(&text) {
            Ok(cache) => cache,
            Err(err) => {
                warn!(%err, "ignoring unreadable dependency cache");
                HashMap::new()
            }
        }
    }

    fn store_cache(&self, deps: &HashMap<PathBuf, DepInfo>) {
        match serde_json::to_string_pretty(deps) {
            Ok(text) => {
                if let Err(err) = fs::write(&self.cache_path, text) {
                    warn!(%err, "could not write the dependency cache");
                }
            }
            Err(err) => warn!(%err, "could not serialize the dependency cache"),
        }
    }

    fn resolve(&self, relative: &Path) -> PathBuf {
        if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            self.dir.join(relative)
        }
    }

    /// Refresh a file's scan result, reusing the cache when the mtime is
    /// unchanged.
    fn scan_cached(
        &self,
        path: &Path,
        deps: &mut HashMap<PathBuf, DepInfo>,
    ) -> Result<()> {
        if let Some(info) = deps.get(path) {
            if mtime_of(path).ok() == Some(info.time) {
                return Ok(());
            }
        }
        debug!(path = %path.display(), "scanning");
        let info = scan_file(path)?;
        deps.insert(path.to_path_buf(), info);
        Ok(())
    }

    /// Build every target.
    pub fn build(&self, options: &BuildOptions) -> Result<()> {
        let mut deps = if options.no_cache {
            HashMap::new()
        } else {
            self.load_cache()
        };

        // Seed the graph with every target's main source.
        let mut pending: Vec<PathBuf> = Vec::new();
        for target in self.recipe.targets.values() {
            pending.push(self.resolve(&target.main_source));
        }
        for path in &pending {
            self.scan_cached(path, &mut deps)?;
        }

        // Index exports, pulling in library files and then the source path
        // while imports stay unresolved.
        let mut exported_by: HashMap<(String, String), PathBuf> = HashMap::new();
        let index_exports = |deps: &HashMap<PathBuf, DepInfo>,
                                 exported_by: &mut HashMap<(String, String), PathBuf>| {
            for (path, info) in deps {
                for key in &info.exports {
                    if let Some(existing) = exported_by.get(key) {
                        if existing != path {
                            warn!(
                                "name {}:{} is exported by both {} and {}",
                                key.0,
                                key.1,
                                existing.display(),
                                path.display()
                            );
                        }
                    } else {
                        exported_by.insert(key.clone(), path.clone());
                    }
                }
            }
        };
        index_exports(&deps, &mut exported_by);

        let needed = |deps: &HashMap<PathBuf, DepInfo>,
                      exported_by: &HashMap<(String, String), PathBuf>| {
            deps.values()
                .flat_map(|info| info.imports.iter())
                .any(|key| !exported_by.contains_key(key))
        };

        if needed(&deps, &exported_by) {
            for library in &self.recipe.global.libraries {
                let path = self.resolve(library);
                if let Err(err) = self.scan_cached(&path, &mut deps) {
                    warn!(library = %path.display(), %err, "skipping unreadable library");
                }
            }
            index_exports(&deps, &mut exported_by);
        }
        if needed(&deps, &exported_by) {
            for dir in &self.recipe.global.source_path {
                for entry in WalkDir::new(self.resolve(dir))
                    .into_iter()
                    .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'))
                    .filter_map(|e| e.ok())
                {
                    if entry.path().extension().is_some_and(|e| e == "py") {
                        if let Err(err) = self.scan_cached(entry.path(), &mut deps) {
                            warn!(source = %entry.path().display(), %err, "skipping unparsable source");
                        }
                    }
                }
            }
            index_exports(&deps, &mut exported_by);
        }
        for (path, info) in &deps {
            for key in &info.imports {
                if !exported_by.contains_key(key) {
                    warn!(
                        "name {}:{} imported by {} was not found",
                        key.0,
                        key.1,
                        path.display()
                    );
                }
            }
        }

        // Dependency edges from import resolution.
        let edges: HashMap<PathBuf, Vec<PathBuf>> = deps
            .iter()
            .map(|(path, info)| {
                let mut targets: Vec<PathBuf> = info
                    .imports
                    .iter()
                    .filter_map(|key| exported_by.get(key))
                    .filter(|dep| *dep != path)
                    .cloned()
                    .collect();
                targets.sort();
                targets.dedup();
                (path.clone(), targets)
            })
            .collect();

        // Drop everything unreachable from a target.
        let mut reachable: HashSet<PathBuf> = HashSet::new();
        let mut queue = pending.clone();
        while let Some(path) = queue.pop() {
            if reachable.insert(path.clone()) {
                if let Some(next) = edges.get(&path) {
                    queue.extend(next.iter().cloned());
                }
            }
        }
        deps.retain(|path, _| reachable.contains(path));

        if !options.no_cache {
            self.store_cache(&deps);
        }

        for (output_name, target) in &self.recipe.targets {
            self.build_target(output_name, target, &edges, options)?;
        }
        Ok(())
    }

    /// Sources for one target, dependencies before dependents.
    fn target_sources(
        &self,
        main: &Path,
        edges: &HashMap<PathBuf, Vec<PathBuf>>,
    ) -> Vec<PathBuf> {
        fn visit(
            path: &Path,
            edges: &HashMap<PathBuf, Vec<PathBuf>>,
            seen: &mut HashSet<PathBuf>,
            on_stack: &mut HashSet<PathBuf>,
            out: &mut Vec<PathBuf>,
        ) {
            if !seen.insert(path.to_path_buf()) {
                return;
            }
            on_stack.insert(path.to_path_buf());
            if let Some(next) = edges.get(path) {
                for dep in next {
                    if on_stack.contains(dep) {
                        warn!(
                            "circular import between {} and {}",
                            path.display(),
                            dep.display()
                        );
                        continue;
                    }
                    visit(dep, edges, seen, on_stack, out);
                }
            }
            on_stack.remove(path);
            out.push(path.to_path_buf());
        }

        let mut out = Vec::new();
        visit(
            main,
            edges,
            &mut HashSet::new(),
            &mut HashSet::new(),
            &mut out,
        );
        out
    }

    fn build_target(
        &self,
        output_name: &str,
        target: &TargetSection,
        edges: &HashMap<PathBuf, Vec<PathBuf>>,
        options: &BuildOptions,
    ) -> Result<()> {
        let main = self.resolve(&target.main_source);
        let sources: Vec<PathBuf> = self
            .target_sources(&main, edges)
            .into_iter()
            .filter(|p| p.extension().is_some_and(|e| e == "py"))
            .collect();
        let output = self.build_dir.join(output_name);

        let mut stale = options.force || !output.exists();
        if !stale {
            let target_time = system_mtime(&output);
            stale = sources
                .iter()
                .any(|src| system_mtime(src) > target_time);
        }
        if !stale {
            debug!(output = output_name, "up to date");
            return Ok(());
        }
        if options.dry_run {
            info!(output = output_name, sources = sources.len(), "would build");
            return Ok(());
        }
        info!(output = output_name, sources = sources.len(), "building");

        let mut lib = Library::new();
        for library in &self.recipe.global.libraries {
            lib.add_file(&self.resolve(library))?;
        }
        let compile_options = Options {
            width: target.width.unwrap_or(500),
            height: target.height.unwrap_or(375),
            frame_rate: target.frame_rate.unwrap_or(15),
            main_class: target.main_class.clone().unwrap_or_else(|| "Main".into()),
            std_globals: true,
            debug_filename: match self.recipe.global.debug_filename.as_deref() {
                Some("basename") => FilenameMode::Basename,
                _ => FilenameMode::Full,
            },
        };
        compile::compile_files(&sources, &mut lib, &compile_options, &output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn scan_finds_imports_and_exports() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.py");
        fs::write(
            &path,
            "from flash.display import Sprite\n\n@package('game')\nclass Main(Sprite):\n    def __init__(self):\n        pass\n",
        )
        .unwrap();
        let info = scan_file(&path).unwrap();
        assert_eq!(
            info.imports,
            vec![("flash.display".to_owned(), "Sprite".to_owned())]
        );
        assert_eq!(info.exports, vec![("game".to_owned(), "Main".to_owned())]);
    }

    #[test]
    fn recipe_parses_targets_and_globals() {
        let recipe: Recipe = toml::from_str(
            r#"
[global]
libraries = ["playerglobal.swf"]
source-path = ["lib"]
debug-filename = "basename"

[targets."game.swf"]
main-source = "main.py"
width = 800
height = 600
frame-rate = 30
main-class = "Main"
"#,
        )
        .unwrap();
        assert_eq!(recipe.global.libraries.len(), 1);
        let target = &recipe.targets["game.swf"];
        assert_eq!(target.width, Some(800));
        assert_eq!(target.main_source, PathBuf::from("main.py"));
    }

    #[test]
    fn target_sources_order_dependencies_first() {
        let project = Project {
            recipe: Recipe {
                global: GlobalSection::default(),
                targets: BTreeMap::new(),
            },
            dir: PathBuf::from("."),
            build_dir: PathBuf::from("."),
            cache_path: PathBuf::from("x.dep.json"),
        };
        let a = PathBuf::from("a.py");
        let b = PathBuf::from("b.py");
        let c = PathBuf::from("c.py");
        let mut edges = HashMap::new();
        edges.insert(a.clone(), vec![b.clone(), c.clone()]);
        edges.insert(b.clone(), vec![c.clone()]);
        edges.insert(c.clone(), Vec::new());
        let order = project.target_sources(&a, &edges);
        assert_eq!(order, vec![c.clone(), b.clone(), a.clone()]);
    }

    #[test]
    fn cycles_are_reported_but_do_not_loop() {
        let project = Project {
            recipe: Recipe {
                global: GlobalSection::default(),
                targets: BTreeMap::new(),
            },
            dir: PathBuf::from("."),
            build_dir: PathBuf::from("."),
            cache_path: PathBuf::from("x.dep.json"),
        };
        let a = PathBuf::from("a.py");
        let b = PathBuf::from("b.py");
        let mut edges = HashMap::new();
        edges.insert(a.clone(), vec![b.clone()]);
        edges.insert(b.clone(), vec![a.clone()]);
        let order = project.target_sources(&a, &edges);
        assert_eq!(order, vec![b.clone(), a.clone()]);
    }
}
