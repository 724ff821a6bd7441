use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nestcache::config::load_settings;
use nestcache::language::{RegexEmbeddingProvider, TextStats, TextStatsParser};
use nestcache::{
    LanguageRegistry, ParseError, ParseResult, ParserManager, ParserResult, ResultIterator, Task,
};
use url::Url;

/// Inspect the embedded-language structure of a file
#[derive(Parser)]
#[command(name = "nestcache")]
#[command(version)]
#[command(about = "Inspect the embedded-language structure of a file")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a file and report its embeddings
    Inspect {
        /// The file to inspect
        file: PathBuf,

        /// Language of the file (default: the file extension)
        #[arg(long)]
        language: Option<String>,

        /// Byte offset to resolve to its deepest embedding
        #[arg(long)]
        offset: Option<usize>,

        /// Settings file layered on top of user and project settings
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegionReport {
    language: String,
    depth: usize,
    original_range: Option<(usize, usize)>,
    /// Embedded text; omitted for the root document
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    stats: Option<TextStats>,
    embeddings: Vec<RegionReport>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OffsetReport {
    offset: usize,
    language: String,
    depth: usize,
    embedded_offset: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    file: String,
    root: RegionReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    at_offset: Option<OffsetReport>,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect {
            file,
            language,
            offset,
            config,
            json,
        } => {
            if let Err(err) = inspect(&file, language, offset, config.as_deref(), json).await {
                eprintln!("Error: {}: {}", file.display(), err);
                std::process::exit(1);
            }
        }
    }
}

async fn inspect(
    file: &Path,
    language: Option<String>,
    offset: Option<usize>,
    config: Option<&Path>,
    json: bool,
) -> ParseResult<()> {
    let text = std::fs::read_to_string(file)?;
    let path = std::fs::canonicalize(file)?;
    let uri = Url::from_file_path(&path)
        .map_err(|_| ParseError::internal(format!("Not an absolute path: {}", path.display())))?;
    let language = language
        .or_else(|| {
            file.extension()
                .and_then(|ext| ext.to_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "text".to_string());

    let project_root = path.parent();
    let outcome = load_settings(project_root, config);
    for event in &outcome.events {
        event.log();
    }

    let registry = LanguageRegistry::new();
    registry.set_fallback_parser(TextStatsParser::factory());
    if language == "html" {
        register_html_defaults(&registry)?;
    }
    let manager = Arc::new(ParserManager::from_settings(registry, outcome.settings)?);
    manager.open(uri.clone(), language, text);

    let report = manager
        .parse_async(uri.clone(), Task::user(), move |iterator| {
            let root = region_report(iterator)?;
            let at_offset = match offset {
                Some(offset) => Some(offset_report(iterator, offset)?),
                None => None,
            };
            Ok(Report {
                file: uri.to_string(),
                root,
                at_offset,
            })
        })
        .await?;

    if json {
        let rendered =
            serde_json::to_string_pretty(&report).map_err(|e| ParseError::internal(e.to_string()))?;
        println!("{}", rendered);
    } else {
        print_region(&report.root, 0);
        if let Some(at) = &report.at_offset {
            println!(
                "offset {} -> {} (depth {}, embedded offset {:?})",
                at.offset, at.language, at.depth, at.embedded_offset
            );
        }
    }
    Ok(())
}

fn register_html_defaults(registry: &LanguageRegistry) -> ParseResult<()> {
    registry.add_embedder(
        "html",
        RegexEmbeddingProvider::new(r"(?s)<script[^>]*>(?P<content>.*?)</script>", "javascript")?,
    );
    registry.add_embedder(
        "html",
        RegexEmbeddingProvider::new(r"(?s)<style[^>]*>(?P<content>.*?)</style>", "css")?,
    );
    Ok(())
}

fn region_report(iterator: &mut ResultIterator) -> ParseResult<RegionReport> {
    let result = iterator.parser_result()?;
    let mut report = describe(&result);
    let embeddings = iterator.embeddings()?;
    for embedding in embeddings.iter() {
        let child = region_report(iterator.result_iterator(embedding))?;
        report.embeddings.push(child);
    }
    Ok(report)
}

fn offset_report(iterator: &mut ResultIterator, offset: usize) -> ParseResult<OffsetReport> {
    let result = iterator.parser_result_at(offset)?;
    let snapshot = result.snapshot();
    Ok(OffsetReport {
        offset,
        language: snapshot.language().to_string(),
        depth: snapshot.depth(),
        embedded_offset: snapshot.embedded_offset(offset),
    })
}

fn describe(result: &ParserResult) -> RegionReport {
    let snapshot = result.snapshot();
    RegionReport {
        language: snapshot.language().to_string(),
        depth: snapshot.depth(),
        original_range: snapshot.original_range().map(|range| (range.start, range.end)),
        text: (snapshot.depth() > 0).then(|| snapshot.text().to_string()),
        stats: result.payload::<TextStats>().copied(),
        embeddings: Vec::new(),
    }
}

fn print_region(region: &RegionReport, indent: usize) {
    let range = region
        .original_range
        .map(|(start, end)| format!("{}..{}", start, end))
        .unwrap_or_else(|| "-".to_string());
    let stats = region
        .stats
        .map(|s| format!("{} bytes, {} lines, {} words", s.bytes, s.lines, s.words))
        .unwrap_or_default();
    println!("{:indent$}{} [{}] {}", "", region.language, range, stats, indent = indent * 2);
    if let Some(text) = &region.text {
        println!("{:indent$}  {:?}", "", text, indent = indent * 2);
    }
    for child in &region.embeddings {
        print_region(child, indent + 1);
    }
}
