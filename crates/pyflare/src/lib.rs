//! pyflare: a compiler from a Python-syntax language to ActionScript 3
//! bytecode packaged in SWF.
//!
//! Source files are parsed (with the ruff Python parser), statically
//! analyzed for scope, lowered to the stack-based ABC instruction set, and
//! emitted as ABC structures inside a DoABC tag in a compressed SWF
//! container. Classes resolve against libraries (existing SWF/SWC files),
//! and classes produced by compilation are immediately importable by later
//! files of the same build.
//!
//! # Quick start
//!
//! ```no_run
//! use pyflare::{compile, Library, Options};
//!
//! let mut lib = Library::new();
//! lib.add_file("playerglobal.swf".as_ref()).unwrap();
//! compile::compile_files(
//!     &["main.py"],
//!     &mut lib,
//!     &Options::default(),
//!     "main.swf".as_ref(),
//! )
//! .unwrap();
//! ```
//!
//! # Layout
//!
//! - [`stream`], [`swf`]: the byte- and bit-level container codecs
//! - [`abc`], [`pool`]: the ABC entity model and its two-pass pool indexer
//! - [`ops`], [`asm`]: the instruction set, assembler and disassembler
//! - [`scope`], [`codegen`], [`verify`]: the compiler front end
//! - [`library`]: SWF/SWC class resolution
//! - [`compile`], [`driver`]: the per-file pipeline and the build graph

pub mod abc;
pub mod asm;
pub mod codegen;
pub mod compile;
pub mod diagnostic;
pub mod driver;
pub mod error;
pub mod library;
pub mod ops;
pub mod pool;
pub mod scope;
pub mod stream;
pub mod swf;
pub mod verify;

pub use compile::{FilenameMode, Options};
pub use error::{Error, Location, Result};
pub use library::Library;
