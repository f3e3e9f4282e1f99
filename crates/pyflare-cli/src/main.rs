//! Command line interface for the pyflare compiler.
//!
//! The default invocation compiles one or more sources into a single SWF;
//! the `build` subcommand drives a whole project from a TOML recipe.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use pyflare::driver::{BuildOptions, Project};
use pyflare::{diagnostic, Library, Options};

#[derive(Parser)]
#[command(name = "pyflare", version, about = "Compile Python-syntax sources to SWF")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    compile: CompileArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Build every target of a project recipe.
    Build(BuildArgs),
    /// Inspect or rewrite a compiled SWF.
    Swf(SwfArgs),
}

#[derive(Args, Default)]
struct CompileArgs {
    /// Source files to compile, in dependency order.
    sources: Vec<PathBuf>,

    /// Add an SWF or SWC to the class-resolution set (repeatable).
    #[arg(short, long = "library", value_name = "PATH")]
    library: Vec<PathBuf>,

    /// Destination SWF; defaults to the first input with a .swf extension.
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Class bound to frame-0 symbol 0.
    #[arg(short, long, value_name = "NAME", default_value = "Main")]
    main_class: String,

    /// Stage width in pixels.
    #[arg(short, long, default_value_t = 600)]
    width: u32,

    /// Stage height in pixels.
    #[arg(short = 't', long, default_value_t = 600)]
    height: u32,

    /// Frame rate in frames per second.
    #[arg(short, long, default_value_t = 15)]
    frame_rate: u32,

    /// Skip the auto-populated standard globals.
    #[arg(short = 'n', long)]
    no_std_globals: bool,

    /// Filename form written into debugfile instructions.
    #[arg(long, value_enum, default_value_t = FilenameArg::Full)]
    debug_filename: FilenameArg,
}

#[derive(Clone, Copy, Default, ValueEnum)]
enum FilenameArg {
    #[default]
    Full,
    Basename,
}

#[derive(Args)]
struct BuildArgs {
    /// Project recipe file.
    #[arg(short = 'f', long, value_name = "FILE", default_value = "Pyflare.toml")]
    manifest: PathBuf,

    /// Directory to place output files.
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Rebuild even when nothing changed.
    #[arg(short = 'F', long)]
    force: bool,

    /// Do not read or write the dependency cache.
    #[arg(short = 'D', long)]
    no_cache: bool,

    /// Scan dependencies and report what would be built.
    #[arg(short = 'n', long)]
    dry_run: bool,
}

#[derive(Args)]
struct SwfArgs {
    /// The SWF file to inspect.
    file: PathBuf,

    /// Print the tag list while decoding.
    #[arg(short, long)]
    print_tags: bool,

    /// Print a bytecode listing for every method body.
    #[arg(short = 'd', long)]
    disassemble: bool,

    /// Drop every tag a code-only movie does not need.
    #[arg(short, long)]
    strip: bool,

    /// Strip debug metadata from the embedded ABC files.
    #[arg(short = 'c', long)]
    clean_metadata: bool,

    /// Write the (possibly rewritten) movie to FILE.
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

fn run_swf(args: SwfArgs) -> pyflare::Result<()> {
    use pyflare::swf::{Movie, Tag};

    let data = std::fs::read(&args.file)?;
    let mut movie = Movie::read(&data)?;

    if args.print_tags {
        let header = &movie.header;
        println!(
            "{} v{} {}x{} twips, {} frame(s)",
            if header.compressed { "CWS" } else { "FWS" },
            header.version,
            header.frame_size.x_max,
            header.frame_size.y_max,
            header.frame_count,
        );
        for tag in &movie.tags {
            match tag {
                Tag::DoAbc(doabc) => println!("DoABC {:?} ({} bytes)", doabc.name, doabc.data.len()),
                Tag::SymbolClass(assoc) => println!("SymbolClass {assoc:?}"),
                other => println!("tag {}", other.code()),
            }
        }
    }

    if args.disassemble {
        for doabc in movie.abc_tags() {
            let abc = doabc.parse_abc()?;
            for body in &abc.bodies {
                let method = abc.method(body.method);
                println!(
                    "method {:?} max_stack={} local_count={}",
                    method.name, body.max_stack, body.local_count
                );
                for op in &body.code {
                    println!("    {op:?}");
                }
            }
        }
    }

    if let Some(output) = &args.output {
        if args.clean_metadata {
            for tag in &mut movie.tags {
                if let Tag::DoAbc(doabc) = tag {
                    let mut abc = doabc.parse_abc()?;
                    abc.clean_metadata();
                    doabc.data = abc.write()?;
                }
            }
        }
        if args.strip {
            movie.tags.retain(|tag| {
                matches!(
                    tag,
                    Tag::DoAbc(_)
                        | Tag::SymbolClass(_)
                        | Tag::ShowFrame
                        | Tag::FileAttributes(_)
                        | Tag::End
                )
            });
        }
        std::fs::write(output, movie.write()?)?;
    }
    Ok(())
}

fn run_compile(args: CompileArgs) -> pyflare::Result<()> {
    if args.sources.is_empty() {
        return Err(pyflare::Error::malformed(
            "arguments",
            "at least one source file expected",
        ));
    }
    let mut lib = Library::new();
    for path in &args.library {
        lib.add_file(path)?;
    }
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| args.sources[0].with_extension("swf"));
    let options = Options {
        width: args.width,
        height: args.height,
        frame_rate: args.frame_rate,
        main_class: args.main_class.clone(),
        std_globals: !args.no_std_globals,
        debug_filename: match args.debug_filename {
            FilenameArg::Full => pyflare::FilenameMode::Full,
            FilenameArg::Basename => pyflare::FilenameMode::Basename,
        },
    };
    pyflare::compile::compile_files(&args.sources, &mut lib, &options, &output)
}

fn run_build(args: BuildArgs) -> pyflare::Result<()> {
    let project = Project::load(&args.manifest, &args.output_dir)?;
    project.build(&BuildOptions {
        force: args.force,
        dry_run: args.dry_run,
        no_cache: args.no_cache,
    })
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Command::Build(args)) => run_build(args),
        Some(Command::Swf(args)) => run_swf(args),
        None => run_compile(cli.compile),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprint!("{}", diagnostic::render_error(&err));
            ExitCode::FAILURE
        }
    }
}
