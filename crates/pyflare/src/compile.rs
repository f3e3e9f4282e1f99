//! The compilation pipeline: sources in, one SWF out.
//!
//! Per file: parse (the external parser), analyze scopes, run the module
//! body as a `global`-mode fragment, publish its classes and functions as
//! script traits, and wrap the serialized ABC in a DoABC tag. The movie is
//! then a fixed code-only tag sequence (FileAttributes, one DoABC per
//! source, the SymbolClass binding frame 0 to the main class, ShowFrame,
//! End) zlib-compressed into the container.

use std::fs;
use std::path::Path;

use ruff_python_parser::parse_module;
use ruff_text_size::Ranged;

use crate::abc::{ConstValue, Multiname, Namespace, ScriptInfo, Trait, TraitKind};
use crate::codegen::{Binding, Builtin, CodeFragment, CompileUnit, FragmentSpec, Mode, Scopes};
use crate::diagnostic::LineIndex;
use crate::error::{Error, Location, Result};
use crate::library::{Library, PropKind};
use crate::scope;
use crate::swf::{DoAbc, FileAttributes, Header, Movie, Rect, Tag};

/// How filenames are written into `debugfile` instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilenameMode {
    #[default]
    Full,
    Basename,
}

/// Compilation options, mirrored by the CLI surface.
#[derive(Debug, Clone)]
pub struct Options {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub main_class: String,
    pub std_globals: bool,
    pub debug_filename: FilenameMode,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            width: 500,
            height: 375,
            frame_rate: 15,
            main_class: "Main".into(),
            std_globals: true,
            debug_filename: FilenameMode::Full,
        }
    }
}

/// The names every compilation starts with: constants, the loop and
/// inline builtins, the library's package-level public names, and (unless
/// disabled) the standard platform globals.
fn populate_globals(scopes: &mut Scopes, frame: usize, lib: &Library, std_globals: bool) {
    // True/False/None normally arrive as literals; the bindings cover the
    // odd corner where a library shadows nothing and a name read remains.
    scopes.insert(frame, "True", Binding::Const(ConstValue::True));
    scopes.insert(frame, "False", Binding::Const(ConstValue::False));
    scopes.insert(frame, "None", Binding::Const(ConstValue::Null));
    scopes.insert(frame, "undefined", Binding::Const(ConstValue::Undefined));
    for name in [
        "range",
        "keys",
        "values",
        "items",
        "abs",
        "min",
        "max",
        "len",
        "isinstance",
    ] {
        let builtin = Builtin::by_name(name).expect("the builtin table knows its own names");
        scopes.insert(frame, name, Binding::Builtin(builtin));
    }

    let mut package_names: Vec<(&str, PropKind)> = lib
        .public_names()
        .filter(|(pkg, _, _)| pkg.is_empty())
        .map(|(_, name, kind)| (name, kind))
        .collect();
    package_names.sort_unstable();
    for (name, kind) in package_names {
        let binding = match kind {
            PropKind::Class => match lib.get_class("", name) {
                Some(record) => Binding::Class(Box::new(record.clone())),
                None => Binding::Property(Multiname::qname(name)),
            },
            PropKind::Function => Binding::Property(Multiname::qname(name)),
        };
        scopes.insert(frame, name, binding);
    }

    if std_globals {
        for name in ["String", "Number", "Array", "Boolean", "Math", "Error"] {
            if scopes.frame(frame).contains_key(name) {
                continue;
            }
            let binding = match lib.get_class("", name) {
                Some(record) => Binding::Class(Box::new(record.clone())),
                None => Binding::Property(Multiname::qname(name)),
            };
            scopes.insert(frame, name, binding);
        }
        for (alias, class_name) in [
            ("str", "String"),
            ("float", "Number"),
            ("list", "Array"),
            ("bool", "Boolean"),
        ] {
            if let Some(record) = lib.get_class("", class_name) {
                scopes.insert(frame, alias, Binding::Class(Box::new(record.clone())));
            }
        }
    }
    for name in ["print", "trace"] {
        if !scopes.frame(frame).contains_key(name) {
            scopes.insert(frame, name, Binding::Property(Multiname::qname(name)));
        }
    }
}

/// Compile one source file into a DoABC tag. Classes and public names the
/// file declares register into `lib` so later files can import them.
pub fn compile_source(
    source: &str,
    path: &str,
    lib: &mut Library,
    options: &Options,
) -> Result<DoAbc> {
    let parsed = parse_module(source).map_err(|e| {
        let lines = LineIndex::new(source);
        let (line, column) = lines.line_col(e.range().start().to_u32() as usize);
        Error::Syntax {
            message: e.to_string(),
            location: Location::new(path, line, column),
        }
    })?;
    let module = parsed.into_syntax();
    let scope_map = scope::analyze_module(&module.body);

    let filename = match options.debug_filename {
        FilenameMode::Full => path.to_owned(),
        FilenameMode::Basename => Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_owned()),
    };
    let mut unit = CompileUnit::new(source, filename.clone(), path.to_owned(), scope_map);
    let globals_frame = unit.scopes.new_frame();
    populate_globals(&mut unit.scopes, globals_frame, lib, options.std_globals);

    let spec = FragmentSpec {
        mode: Mode::Global,
        parent_chain: vec![globals_frame],
        arguments: vec![None],
        vararg: None,
        classmethod: false,
        enclosing_class: None,
        display_name: String::new(),
        first_line: 1,
        info: unit.scope_map.module().clone(),
    };
    let fragment = CodeFragment::compile(&mut unit, lib, &module.body, spec)?;
    let (init, frame) = fragment.finish(&mut unit, Vec::new())?;

    // The script publishes the module's classes, top-level functions, and
    // file-private properties.
    let mut traits = Vec::new();
    for (_, binding) in unit.scopes.frame(frame) {
        match binding {
            Binding::NewClass { qname, class } => {
                traits.push(Trait::new(
                    qname.clone(),
                    TraitKind::Class {
                        slot_id: 0,
                        class: *class,
                    },
                ));
            }
            Binding::NewFunction { qname, method } => {
                traits.push(Trait::new(
                    qname.clone(),
                    TraitKind::Method {
                        disp_id: 0,
                        method: *method,
                    },
                ));
            }
            Binding::Property(qname) => {
                if matches!(
                    qname,
                    Multiname::QName {
                        ns: Namespace::Private(_),
                        ..
                    }
                ) {
                    traits.push(Trait::new(qname.clone(), TraitKind::slot()));
                }
            }
            _ => {}
        }
    }
    unit.abc.scripts.push(ScriptInfo { init, traits });

    DoAbc::from_abc(&filename, &unit.abc)
}

/// Compile sources into SWF bytes: the fixed code-only tag sequence inside
/// a compressed container. Stage size is given in pixels (twips on the
/// wire); the frame rate is fixed-point 8.8.
pub fn compile_to_swf(
    inputs: &[(String, String)],
    lib: &mut Library,
    options: &Options,
) -> Result<Vec<u8>> {
    let mut tags = vec![Tag::FileAttributes(FileAttributes::default())];
    for (path, source) in inputs {
        tags.push(Tag::DoAbc(compile_source(source, path, lib, options)?));
    }
    tags.push(Tag::SymbolClass(vec![(0, options.main_class.clone())]));
    tags.push(Tag::ShowFrame);
    tags.push(Tag::End);

    let movie = Movie {
        header: Header {
            compressed: true,
            version: 10,
            frame_size: Rect::new(options.width * 20, options.height * 20),
            frame_rate: (options.frame_rate * 256).min(u16::MAX as u32) as u16,
            frame_count: 1,
        },
        tags,
    };
    movie.write()
}

/// Compile source files from disk and write the SWF to `output`.
pub fn compile_files(
    paths: &[impl AsRef<Path>],
    lib: &mut Library,
    options: &Options,
    output: &Path,
) -> Result<()> {
    let mut inputs = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        let source = fs::read_to_string(path)?;
        inputs.push((path.display().to_string(), source));
    }
    let bytes = compile_to_swf(&inputs, lib, options)?;
    fs::write(output, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_plain_module_compiles_to_one_script() {
        let mut lib = Library::new();
        let doabc = compile_source("x = 1\n", "m.py", &mut lib, &Options::default()).unwrap();
        let abc = doabc.parse_abc().unwrap();
        assert_eq!(abc.scripts.len(), 1);
        assert_eq!(abc.bodies.len(), 1);
    }

    #[test]
    fn unknown_names_error_with_a_location() {
        let mut lib = Library::new();
        let err = compile_source("x = missing\n", "m.py", &mut lib, &Options::default())
            .unwrap_err();
        match err {
            Error::Name { name, location } => {
                assert_eq!(name, "missing");
                assert_eq!(location.line, 1);
                assert_eq!(location.file, "m.py");
            }
            other => panic!("expected a name error, got {other}"),
        }
    }

    #[test]
    fn parse_errors_carry_a_location() {
        let mut lib = Library::new();
        let err =
            compile_source("def broken(:\n", "m.py", &mut lib, &Options::default()).unwrap_err();
        assert!(matches!(err, Error::Syntax { .. }));
        assert!(err.location().is_some());
    }

    #[test]
    fn compiling_twice_is_byte_identical() {
        let source = "@package('app')\ndef go(n):\n    return n + 1\n".to_owned();
        let options = Options::default();
        let inputs = vec![("m.py".to_owned(), source)];
        let mut lib_a = Library::new();
        let mut lib_b = Library::new();
        let first = compile_to_swf(&inputs, &mut lib_a, &options).unwrap();
        let second = compile_to_swf(&inputs, &mut lib_b, &options).unwrap();
        assert_eq!(first, second);
    }
}
