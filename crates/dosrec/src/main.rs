//! dosrec - function recovery for 16-bit real-mode DOS programs
//!
//! Usage:
//!   dosrec <image>                      Recover functions from 0000:0000
//!   dosrec <image> --entry 1000:0010    Start somewhere else
//!   dosrec <manifest.json> --manifest   Multi-segment program with overlays
//!   dosrec <image> --library clib.json  Bind statically linked library code
//!   dosrec <image> --json | --dot       Machine-readable output
//!   dosrec <image> --flow sub_3         Control flow of one function as DOT

mod manifest;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{info, Level};

use dosrec_analysis::{
    AnalysisConfig, AnalysisStats, CallGraph, CallKind, NormalizePass, NormalizerConfig, Program,
    Resolver,
};
use dosrec_core::output::{function_flow, DotConfig};
use dosrec_core::{
    CodeAddress, Function, FunctionId, FunctionListing, GlobalVariable, SegOff, SegmentId,
};
use dosrec_signatures::ObjectLibrary;

use crate::manifest::{LoadedProgram, ProgramManifest};

#[derive(Parser)]
#[command(name = "dosrec")]
#[command(about = "Recover functions from 16-bit real-mode DOS programs", version, long_about = None)]
struct Cli {
    /// Program image, or a JSON manifest with --manifest
    input: PathBuf,

    /// Treat the input as a JSON program manifest
    #[arg(short, long)]
    manifest: bool,

    /// Entry point of a raw image as SEG:OFF (hex)
    #[arg(short, long, value_parser = parse_seg_off, default_value = "0000:0000")]
    entry: SegOff,

    /// Object library (JSON) to match statically linked routines against
    #[arg(short, long)]
    library: Option<PathBuf>,

    /// Skip a normalization pass (repeatable)
    #[arg(long = "skip-pass", value_parser = parse_pass)]
    skip_pass: Vec<NormalizePass>,

    /// Accept framed functions that return without tearing the frame down
    #[arg(long)]
    lenient_frames: bool,

    /// Print instruction sizes in listings
    #[arg(long)]
    sizes: bool,

    /// Emit the recovered program as JSON
    #[arg(long, conflicts_with = "dot")]
    json: bool,

    /// Emit the call graph in DOT format
    #[arg(long, conflicts_with = "flow")]
    dot: bool,

    /// Emit the control flow of the named function in DOT format
    #[arg(long, value_name = "FUNCTION", conflicts_with = "json")]
    flow: Option<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_seg_off(s: &str) -> Result<SegOff, String> {
    s.parse::<SegOff>().map_err(|e| e.to_string())
}

fn parse_pass(s: &str) -> Result<NormalizePass, String> {
    NormalizePass::from_name(s).ok_or_else(|| {
        let names: Vec<_> = NormalizePass::all().iter().map(|p| p.name()).collect();
        format!("unknown pass '{}' (expected one of: {})", s, names.join(", "))
    })
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let loaded = if cli.manifest {
        let manifest = ProgramManifest::load(&cli.input)?;
        let base = cli.input.parent().unwrap_or_else(|| Path::new("."));
        manifest.build(base)?
    } else {
        let image = fs::read(&cli.input)
            .with_context(|| format!("Failed to read image: {}", cli.input.display()))?;
        LoadedProgram::raw(image, cli.entry)?
    };

    let library = cli
        .library
        .as_deref()
        .map(|path| {
            ObjectLibrary::load_json(path)
                .with_context(|| format!("Failed to load library: {}", path.display()))
        })
        .transpose()?;

    let normalizer = cli
        .skip_pass
        .iter()
        .fold(NormalizerConfig::all(), |config, pass| config.disable_pass(*pass));
    let config = loaded.configure(
        AnalysisConfig::default()
            .with_normalizer(normalizer)
            .with_strict_frames(!cli.lenient_frames),
    );

    let LoadedProgram {
        mut program,
        entries,
        ..
    } = loaded;
    let graph = recover(&mut program, &config, library.as_ref(), &entries)?;

    if cli.json {
        let report = Report::new(&program, &graph);
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if let Some(name) = &cli.flow {
        let Some(function) = program.functions().find(|f| f.display_name() == *name) else {
            bail!("no function named {}", name);
        };
        print!("{}", function_flow(function, &DotConfig::default()));
    } else if cli.dot {
        print!("{}", graph.to_dot(&program, &DotConfig::default()));
    } else {
        print_listing(&program, &graph, cli.sizes);
    }
    Ok(())
}

fn recover(
    program: &mut Program,
    config: &AnalysisConfig,
    library: Option<&ObjectLibrary>,
    entries: &[CodeAddress],
) -> Result<CallGraph> {
    let mut resolver = Resolver::new(program, config);
    if let Some(library) = library {
        resolver = resolver.with_library(library);
    }
    for entry in entries {
        resolver
            .add_entry_point(entry.segment, entry.offset)
            .with_context(|| format!("Invalid entry point {}", entry))?;
    }
    resolver.run().context("Analysis failed")?;
    let graph = resolver.into_call_graph();

    let stats = &program.stats;
    info!(
        functions = program.function_count(),
        library = stats.library_functions,
        switches = stats.switches,
        unresolved_switches = stats.unresolved_switches,
        "recovery finished"
    );
    Ok(graph)
}

fn print_listing(program: &Program, graph: &CallGraph, sizes: bool) {
    for function in program.functions() {
        if let Some(source) = program.source_name(function.id) {
            println!("; source: {}", source);
        }
        let call_names: BTreeMap<u16, String> = graph
            .callees(function.id)
            .filter_map(|(callee, site)| {
                let name = program.function(callee)?.display_name();
                Some((site.offset, name))
            })
            .collect();
        print!(
            "{}",
            FunctionListing::new(function)
                .with_call_names(call_names)
                .with_sizes(sizes)
        );
        println!();
    }

    for segment in program.segments() {
        for global in segment.globals.values() {
            let array = if global.is_array { " ; array" } else { "" };
            println!(
                "{} = {}:{:04X} ; {} bytes{}",
                global.name, segment.id, global.offset, global.size, array
            );
        }
    }

    let stats = &program.stats;
    println!(
        "; {} functions ({} library), {} call edges, {} switches, {} unresolved switches, {} unknown opcodes",
        program.function_count(),
        stats.library_functions,
        graph.edge_count(),
        stats.switches,
        stats.unresolved_switches,
        stats.unknown_opcodes
    );
}

#[derive(Serialize)]
struct FunctionReport<'a> {
    #[serde(flatten)]
    function: &'a Function,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_name: Option<&'a str>,
}

#[derive(Serialize)]
struct CallReport {
    caller: FunctionId,
    callee: FunctionId,
    offset: u16,
    kind: CallKind,
}

#[derive(Serialize)]
struct GlobalReport<'a> {
    segment: SegmentId,
    #[serde(flatten)]
    variable: &'a GlobalVariable,
}

#[derive(Serialize)]
struct Report<'a> {
    functions: Vec<FunctionReport<'a>>,
    calls: Vec<CallReport>,
    unresolved_calls: &'a [(FunctionId, u16)],
    globals: Vec<GlobalReport<'a>>,
    stats: &'a AnalysisStats,
}

impl<'a> Report<'a> {
    fn new(program: &'a Program, graph: &'a CallGraph) -> Self {
        let functions = program
            .functions()
            .map(|function| FunctionReport {
                function,
                source_name: program.source_name(function.id),
            })
            .collect();
        let calls = program
            .functions()
            .flat_map(|function| graph.callees(function.id))
            .map(|(callee, site)| CallReport {
                caller: site.caller,
                callee,
                offset: site.offset,
                kind: site.kind,
            })
            .collect();
        let globals = program
            .segments()
            .flat_map(|segment| {
                segment.globals.values().map(move |variable| GlobalReport {
                    segment: segment.id,
                    variable,
                })
            })
            .collect();
        Self {
            functions,
            calls,
            unresolved_calls: graph.unresolved_calls(),
            globals,
            stats: &program.stats,
        }
    }
}
