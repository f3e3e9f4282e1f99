//! Round-trip properties: parsing an emitted file and re-serializing it
//! reproduces the bytes; libraries load back what the model wrote.

use std::io::Write as _;

use pretty_assertions::assert_eq;
use pyflare::abc::{
    AbcFile, ClassInfo, InstanceFlags, InstanceInfo, Metadata, MethodBody, MethodInfo, Multiname,
    ScriptInfo, Trait, TraitKind,
};
use pyflare::compile::{compile_source, compile_to_swf, Options};
use pyflare::library::{ClassRecord, Library, MethodTrait};
use pyflare::ops::Op;
use pyflare::swf::{DoAbc, Header, Movie, Tag};

/// A small but complete library file: Object at the root, a Sprite with a
/// method trait, and a script publishing both.
fn build_library_abc() -> AbcFile {
    let mut abc = AbcFile::new();

    let script_init = abc.add_method(MethodInfo::default());
    abc.add_body(MethodBody {
        method: script_init,
        max_stack: 1,
        local_count: 1,
        init_scope_depth: 0,
        max_scope_depth: 1,
        code: vec![Op::GetLocal0, Op::PushScope, Op::ReturnVoid],
        exceptions: Vec::new(),
        traits: Vec::new(),
    });

    let object_iinit = abc.add_method(MethodInfo::default());
    let object_cinit = abc.add_method(MethodInfo::default());
    let object_id = abc.add_class(
        InstanceInfo {
            name: Multiname::qname("Object"),
            super_name: Multiname::Any,
            flags: InstanceFlags::empty(),
            protected_ns: None,
            interfaces: Vec::new(),
            iinit: object_iinit,
            traits: Vec::new(),
        },
        ClassInfo {
            cinit: object_cinit,
            traits: Vec::new(),
        },
    );

    let sprite_iinit = abc.add_method(MethodInfo::default());
    let sprite_cinit = abc.add_method(MethodInfo::default());
    let update = abc.add_method(MethodInfo {
        name: "Sprite/update".into(),
        ..MethodInfo::default()
    });
    let sprite_id = abc.add_class(
        InstanceInfo {
            name: Multiname::package("flash.display", "Sprite"),
            super_name: Multiname::qname("Object"),
            flags: InstanceFlags::empty(),
            protected_ns: None,
            interfaces: Vec::new(),
            iinit: sprite_iinit,
            traits: vec![Trait::new(
                Multiname::qname("update"),
                TraitKind::Method {
                    disp_id: 7,
                    method: update,
                },
            )],
        },
        ClassInfo {
            cinit: sprite_cinit,
            traits: Vec::new(),
        },
    );

    abc.scripts.push(ScriptInfo {
        init: script_init,
        traits: vec![
            Trait::new(
                Multiname::qname("Object"),
                TraitKind::Class {
                    slot_id: 0,
                    class: object_id,
                },
            ),
            Trait::new(
                Multiname::package("flash.display", "Sprite"),
                TraitKind::Class {
                    slot_id: 0,
                    class: sprite_id,
                },
            ),
        ],
    });
    abc
}

fn build_library_swf() -> Vec<u8> {
    let abc = build_library_abc();
    let movie = Movie {
        header: Header::default(),
        tags: vec![
            Tag::DoAbc(DoAbc::from_abc("library", &abc).unwrap()),
            Tag::ShowFrame,
            Tag::End,
        ],
    };
    movie.write().unwrap()
}

#[test]
fn abc_reserializes_byte_identically_with_the_read_pool() {
    let abc = build_library_abc();
    let bytes = abc.write().unwrap();
    let reread = AbcFile::read(&bytes).unwrap();
    let again = reread.write_with_pool().unwrap();
    assert_eq!(bytes, again);
}

#[test]
fn compiled_output_reserializes_byte_identically() {
    let mut lib = Library::new();
    lib.add_name("", "g", pyflare::library::PropKind::Function);
    lib.add_class_record(ClassRecord {
        name: Multiname::qname("E"),
        super_name: Multiname::Any,
        interface: false,
        methods: Vec::new(),
        source: "test".into(),
    });
    let source = "def f(n):\n    total = 0.5\n    for i in range(n):\n        try:\n            g(total)\n        except E as e:\n            total = total + 1\n    return total\n";
    let doabc = compile_source(source, "m.py", &mut lib, &Options::default()).unwrap();
    let reread = AbcFile::read(&doabc.data).unwrap();
    let again = reread.write_with_pool().unwrap();
    assert_eq!(doabc.data, again);
}

#[test]
fn library_classes_survive_the_swf_container() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lib.swf");
    std::fs::write(&path, build_library_swf()).unwrap();

    let mut lib = Library::new();
    lib.add_file(&path).unwrap();

    assert!(lib.get_class("", "Object").is_some());
    let chain = lib.ancestor_chain("flash.display", "Sprite").unwrap();
    let names: Vec<_> = chain.iter().map(|c| c.name.name().unwrap()).collect();
    assert_eq!(names, vec!["Sprite", "Object"]);

    let sprite = lib.get_class("flash.display", "Sprite").unwrap();
    let update = sprite.method_trait(&Multiname::qname("update")).unwrap();
    assert_eq!(update.disp_id, 7);

    // Re-adding the unchanged file is served from the cache.
    lib.add_file(&path).unwrap();
    assert!(lib.get_class("flash.display", "Sprite").is_some());
}

#[test]
fn swc_archives_are_unpacked() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lib.swc");
    let file = std::fs::File::create(&path).unwrap();
    let mut archive = zip::ZipWriter::new(file);
    archive
        .start_file("library.swf", zip::write::SimpleFileOptions::default())
        .unwrap();
    archive.write_all(&build_library_swf()).unwrap();
    archive.finish().unwrap();

    let mut lib = Library::new();
    lib.add_file(&path).unwrap();
    assert!(lib.get_class("flash.display", "Sprite").is_some());
}

#[test]
fn malformed_library_files_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.swf");
    std::fs::write(&path, b"not an swf at all").unwrap();
    let mut lib = Library::new();
    assert!(lib.add_file(&path).is_err());
}

#[test]
fn the_compiled_movie_has_the_code_only_tag_sequence() {
    let mut lib = Library::new();
    let options = Options {
        main_class: "Game".into(),
        width: 640,
        height: 480,
        frame_rate: 30,
        ..Options::default()
    };
    let inputs = vec![("m.py".to_owned(), "x = 1\n".to_owned())];
    let bytes = compile_to_swf(&inputs, &mut lib, &options).unwrap();

    let movie = Movie::read(&bytes).unwrap();
    assert!(matches!(movie.tags[0], Tag::FileAttributes(_)));
    assert!(matches!(movie.tags[1], Tag::DoAbc(_)));
    match &movie.tags[2] {
        Tag::SymbolClass(assoc) => assert_eq!(assoc[0], (0, "Game".to_owned())),
        other => panic!("expected SymbolClass, found {other:?}"),
    }
    assert_eq!(movie.tags[3], Tag::ShowFrame);
    assert_eq!(*movie.tags.last().unwrap(), Tag::End);
    // Stage size is carried in twips.
    assert_eq!(movie.header.frame_size.x_max, 640 * 20);
    assert_eq!(movie.header.frame_size.y_max, 480 * 20);
    assert_eq!(movie.header.frame_rate, 30 << 8);

    // The embedded ABC parses back.
    let doabc = movie.abc_tags().next().unwrap();
    let abc = doabc.parse_abc().unwrap();
    assert_eq!(abc.scripts.len(), 1);
}

#[test]
fn clean_metadata_strips_debug_information() {
    let mut abc = build_library_abc();
    let id = abc.add_metadata(Metadata {
        name: "pyflare".into(),
        items: vec![("debuginfo".into(), "file,line".into())],
    });
    abc.instances[1].traits[0].metadata.push(id);
    abc.methods[0].param_names.push("arg".into());

    abc.clean_metadata();
    assert!(abc.metadata.is_empty());
    assert!(abc.instances[1].traits[0].metadata.is_empty());
    assert!(abc.methods[0].param_names.is_empty());

    let bytes = abc.write().unwrap();
    let reread = AbcFile::read(&bytes).unwrap();
    assert!(reread.metadata.is_empty());
}
