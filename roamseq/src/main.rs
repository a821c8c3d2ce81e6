use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use roamseq::index::{BlockIndex, ReferenceIndex};
use roamseq::passes::catalog::AttributeCatalog;
use roamseq::storage::{ExportStore, HttpFetcher, JsonExport, MagicSniffer};
use roamseq::{ConversionReport, ConvertConfig, Converter, Loader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "roamseq",
    about = "Convert a Roam Research JSON export for use with Logseq",
    version
)]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence).
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Rewrite an export and download its hosted files.
    Convert(ConvertArgs),

    /// List every `key:: value` attribute in an export, grouped by key.
    Attributes(AttributesArgs),

    /// Show which blocks are referenced, and references to missing blocks.
    Refs(InspectArgs),
}

#[derive(Debug, Args)]
struct ConvertArgs {
    /// Roam JSON export to convert.
    input: PathBuf,
    /// Where to write the converted JSON.
    #[arg(long, short)]
    output: PathBuf,
    /// TOML file layered over the built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory for downloaded files (overrides `assets.directory`).
    #[arg(long)]
    assets_dir: Option<PathBuf>,
    /// Pretty-print the output JSON.
    #[arg(long)]
    pretty: bool,
}

#[derive(Debug, Args)]
struct AttributesArgs {
    /// Roam JSON export to inspect.
    input: PathBuf,
    /// Only list blocks carrying this attribute key.
    #[arg(long)]
    key: Option<String>,
    /// Emit JSON instead of a human-readable listing.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct InspectArgs {
    /// Roam JSON export to inspect.
    input: PathBuf,
    /// Emit JSON instead of a human-readable listing.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.command {
        Commands::Convert(args) => handle_convert(args),
        Commands::Attributes(args) => handle_attributes(args),
        Commands::Refs(args) => handle_refs(args),
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(config: Option<&Path>, assets_dir: Option<&Path>) -> Result<ConvertConfig> {
    let mut loader = Loader::new();
    if let Some(path) = config {
        loader = loader.with_file(path);
    }
    if let Some(dir) = assets_dir {
        loader = loader
            .set_override("assets.directory", dir.display().to_string())
            .context("applying --assets-dir")?;
    }
    loader.build().context("loading configuration")
}

fn handle_convert(args: ConvertArgs) -> Result<()> {
    let ConvertArgs {
        input,
        output,
        config,
        assets_dir,
        pretty,
    } = args;

    if same_file(&input, &output) {
        anyhow::bail!("refusing to overwrite the input export {:?}", input);
    }

    let config = load_config(config.as_deref(), assets_dir.as_deref())?;
    let store = JsonExport { pretty };
    let mut pages = store.load(&input)?;
    info!(pages = pages.len(), "loaded {:?}", input);

    let report = Converter::new(&config, &HttpFetcher, &MagicSniffer)
        .run(&mut pages)
        .with_context(|| format!("converting {:?}", input))?;

    store.save(&output, &pages)?;
    print!("{}", summarize(&report));
    println!("Wrote converted export to {:?}", output);
    Ok(())
}

fn handle_attributes(args: AttributesArgs) -> Result<()> {
    let AttributesArgs { input, key, json } = args;
    let pages = JsonExport::default().load(&input)?;
    let catalog = AttributeCatalog::build(&pages);

    if let Some(key) = key {
        let texts = lookup_key(&catalog, &key)?;
        if json {
            println!("{}", serde_json::to_string_pretty(texts)?);
        } else {
            for text in texts {
                println!("{text}");
            }
        }
    } else if json {
        println!("{}", serde_json::to_string_pretty(&catalog)?);
    } else if catalog.is_empty() {
        eprintln!("No attributes found in {:?}.", input);
    } else {
        print!("{}", format_catalog(&catalog));
    }
    Ok(())
}

fn handle_refs(args: InspectArgs) -> Result<()> {
    let InspectArgs { input, json } = args;
    let pages = JsonExport::default().load(&input)?;
    let blocks = BlockIndex::build(&pages);
    let refs = ReferenceIndex::build(&pages);

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            references: &'a ReferenceIndex,
            dangling: Vec<&'a roamseq::BlockUid>,
        }

        let payload = JsonOutput {
            references: &refs,
            dangling: refs.dangling(&blocks),
        };
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print!("{}", format_refs(&blocks, &refs));
    }
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn summarize(report: &ConversionReport) -> String {
    let mut s = String::new();
    let _ = writeln!(
        s,
        "{} blocks ({} referenced, {} dangling references)",
        report.blocks, report.referenced_blocks, report.dangling_refs
    );
    let _ = writeln!(s, "queries fenced:     {}", report.queries_fenced);
    let _ = writeln!(
        s,
        "assets:             {} downloaded, {} reused, {} not converted",
        report.assets.downloaded, report.assets.reused, report.assets.not_converted
    );
    let _ = writeln!(
        s,
        "attributes:         {} moved, {} copied, {} tagged",
        report.attributes_moved, report.attributes_copied, report.attributes_tagged
    );
    let _ = writeln!(s, "scheduled:          {}", report.scheduled);
    let _ = writeln!(s, "task markers:       {}", report.tasks_translated);
    s
}

fn lookup_key<'a>(catalog: &'a AttributeCatalog, key: &str) -> Result<&'a [String]> {
    catalog.texts(key).with_context(|| {
        let known = catalog.keys().collect::<Vec<_>>().join(", ");
        format!("no block carries the attribute {key:?} (known keys: {known})")
    })
}

fn format_catalog(catalog: &AttributeCatalog) -> String {
    let mut s = String::new();
    for (key, texts) in catalog.iter() {
        let _ = writeln!(s, "{key} ({})", texts.len());
        for text in texts {
            let first_line = text.lines().next().unwrap_or_default();
            let _ = writeln!(s, "    {first_line}");
        }
    }
    s
}

fn format_refs(blocks: &BlockIndex<'_>, refs: &ReferenceIndex) -> String {
    let mut s = String::new();
    for (uid, referrers) in refs.iter() {
        let label = match blocks.get(uid) {
            Some(block) => block.string.lines().next().unwrap_or_default().to_string(),
            None => "<missing>".to_string(),
        };
        let from = referrers
            .iter()
            .map(|u| u.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(s, "(({uid})) {label} <- {from}");
    }
    s
}
