use std::process::ExitCode;
use clap::Parser;
use log::{error, info, warn};

use sift::analysis::dict::DictSettings;
use sift::core::config::{Config, IndexConfig};
use sift::core::error::{Error, Result};
use sift::index::reader::SearchIndex;
use sift::index::segment::{
    rename_segment, DocinfoMode, IndexSettings, SegmentPaths, CHECKPOINT_EVERY,
};
use sift::indexer::{
    build_stopwords, merge_indexes, IndexBuilder, IndexPhase, MergeOptions,
};
use sift::schema::attr::AttrType;
use sift::schema::schema::Schema;
use sift::source::{DocumentSource, TsvSource};

/// Offline index builder.
#[derive(Parser, Debug)]
#[command(name = "indexer", version, about = "sift offline indexer")]
struct Args {
    /// Configuration file path.
    #[arg(long, default_value = "sift.json")]
    config: String,

    /// Build every configured index.
    #[arg(long)]
    all: bool,

    /// Indexes to build.
    indexes: Vec<String>,

    /// Write `.new` segment files and signal the running searchd.
    #[arg(long)]
    rotate: bool,

    /// Suppress all output but errors.
    #[arg(long)]
    quiet: bool,

    /// Suppress progress output.
    #[arg(long)]
    noprogress: bool,

    /// Build a stopword list instead of an index: output file and count.
    #[arg(long, num_args = 2, value_names = ["FILE", "N"])]
    buildstops: Option<Vec<String>>,

    /// Include frequencies in the stopword list output.
    #[arg(long)]
    buildfreqs: bool,

    /// Merge two indexes: destination and source.
    #[arg(long, num_args = 2, value_names = ["DST", "SRC"])]
    merge: Option<Vec<String>>,

    /// Keep only destination docs with ATTR in [MIN, MAX] while merging.
    #[arg(long, num_args = 3, value_names = ["ATTR", "MIN", "MAX"])]
    merge_dst_range: Option<Vec<String>>,

    /// Merge both killlists instead of keeping the source's.
    #[arg(long)]
    merge_killlists: bool,
}

fn source_schema(config: &Config, source_name: &str) -> Result<Schema> {
    let source = config
        .sources
        .get(source_name)
        .ok_or_else(|| Error::config(format!("unknown source '{}'", source_name)))?;
    let mut schema = Schema::new();
    for field in &source.fields {
        schema.add_field(field)?;
    }
    for attr in &source.attrs {
        let (kind, bits) = AttrType::from_config(&attr.kind, attr.bits)?;
        schema.add_attr(&attr.name, kind, bits)?;
    }
    schema.finalize()?;
    Ok(schema)
}

fn build_sources(config: &Config, index: &IndexConfig) -> Result<Vec<Box<dyn DocumentSource>>> {
    let mut sources: Vec<Box<dyn DocumentSource>> = Vec::new();
    for name in &index.sources {
        let source_config = config
            .sources
            .get(name)
            .ok_or_else(|| Error::config(format!("unknown source '{}'", name)))?;
        let schema = source_schema(config, name)?;
        match source_config.kind.as_str() {
            "tsv" => sources.push(Box::new(TsvSource::new(
                schema,
                source_config.path.clone(),
                source_config.kill_list.clone(),
            ))),
            other => {
                return Err(Error::config(format!(
                    "source '{}': unknown type '{}'", name, other)));
            }
        }
    }
    Ok(sources)
}

fn index_settings(index: &IndexConfig) -> IndexSettings {
    IndexSettings {
        min_word_len: index.min_word_len,
        dict: DictSettings {
            min_word_len: index.min_word_len,
            morphology: index.morphology.clone(),
            stopwords_file: index.stopwords.clone(),
            wordforms_file: index.wordforms.clone(),
        },
        checkpoint_every: CHECKPOINT_EVERY,
    }
}

fn build_one(
    config: &Config,
    name: &str,
    index: &IndexConfig,
    args: &Args,
) -> Result<()> {
    let sources = build_sources(config, index)?;
    let paths = if args.rotate {
        SegmentPaths::new_variant(&index.path)
    } else {
        SegmentPaths::new(&index.path)
    };
    let mut builder = IndexBuilder::new(
        paths,
        DocinfoMode::from_config(&index.docinfo)?,
        index_settings(index),
    );
    builder.mem_limit = config.mem_limit();
    builder.rotate = args.rotate;

    let show_progress = !args.quiet && !args.noprogress;
    let progress = |phase: IndexPhase| {
        if show_progress {
            let label = match phase {
                IndexPhase::CollectDocs => "collecting documents",
                IndexPhase::SortHits => "sorting hits",
                IndexPhase::CollectMva => "collecting multi-values",
                IndexPhase::SortMva => "sorting multi-values",
                IndexPhase::Merge => "merging runs",
            };
            println!("index '{}': {}...", name, label);
        }
    };

    let started = std::time::Instant::now();
    let stats = builder.build(sources, Some(&progress))?;
    if !args.quiet {
        println!(
            "index '{}': {} docs, {} bytes, {} runs, {:.1} sec",
            name,
            stats.documents,
            stats.bytes,
            stats.runs,
            started.elapsed().as_secs_f32(),
        );
    }
    Ok(())
}

fn run_buildstops(config: &Config, names: &[String], args: &Args) -> Result<()> {
    let spec = args.buildstops.as_ref().unwrap();
    let out_path = &spec[0];
    let top_n: usize = spec[1]
        .parse()
        .map_err(|_| Error::config(format!("bad --buildstops count '{}'", spec[1])))?;

    let mut sources = Vec::new();
    let mut min_word_len = usize::MAX;
    for name in names {
        let index = config
            .indexes
            .get(name)
            .ok_or_else(|| Error::config(format!("unknown index '{}'", name)))?;
        sources.extend(build_sources(config, index)?);
        min_word_len = min_word_len.min(index.min_word_len);
    }
    let words = build_stopwords(sources, min_word_len.max(1), top_n)?;

    let mut text = String::new();
    for (word, freq) in &words {
        if args.buildfreqs {
            text.push_str(&format!("{} {}\n", word, freq));
        } else {
            text.push_str(word);
            text.push('\n');
        }
    }
    std::fs::write(out_path, text)
        .map_err(|e| Error::io(format!("failed to write {}: {}", out_path, e)))?;
    info!("wrote {} stopwords to {}", words.len(), out_path);
    Ok(())
}

fn run_merge(config: &Config, args: &Args) -> Result<()> {
    let spec = args.merge.as_ref().unwrap();
    let (dst_name, src_name) = (&spec[0], &spec[1]);
    let dst_config = config
        .indexes
        .get(dst_name)
        .ok_or_else(|| Error::config(format!("unknown index '{}'", dst_name)))?;
    let src_config = config
        .indexes
        .get(src_name)
        .ok_or_else(|| Error::config(format!("unknown index '{}'", src_name)))?;

    if !args.rotate
        && sift::index::lock::FileLock::is_held(&SegmentPaths::new(&dst_config.path).lock())
    {
        return Err(Error::io(format!(
            "index '{}' is locked by a running server", dst_name)));
    }

    let dst = SearchIndex::open(SegmentPaths::new(&dst_config.path), false)?;
    let src = SearchIndex::open(SegmentPaths::new(&src_config.path), false)?;

    let mut options = MergeOptions {
        merge_killlists: args.merge_killlists,
        ..Default::default()
    };
    if let Some(range) = &args.merge_dst_range {
        let min = range[1]
            .parse()
            .map_err(|_| Error::config(format!("bad range min '{}'", range[1])))?;
        let max = range[2]
            .parse()
            .map_err(|_| Error::config(format!("bad range max '{}'", range[2])))?;
        options.dst_range = Some((range[0].clone(), min, max));
    }

    // merge into a scratch variant, then move it into place
    let tmp = SegmentPaths::tmp_variant(&dst_config.path);
    let stats = merge_indexes(&dst, &src, tmp.clone(), &options)?;
    drop(dst);
    drop(src);

    let target = if args.rotate {
        SegmentPaths::new_variant(&dst_config.path)
    } else {
        SegmentPaths::new(&dst_config.path)
    };
    rename_segment(&tmp, &target)?;
    if !args.quiet {
        println!("merged '{}' into '{}': {} docs", src_name, dst_name, stats.documents);
    }
    Ok(())
}

fn signal_searchd(config: &Config) {
    let pid_text = match std::fs::read_to_string(&config.searchd.pid_file) {
        Ok(text) => text,
        Err(_) => {
            warn!("rotate: cannot read pid file {}", config.searchd.pid_file);
            return;
        }
    };
    match pid_text.trim().parse::<i32>() {
        Ok(pid) => {
            #[cfg(unix)]
            unsafe {
                if libc::kill(pid, libc::SIGHUP) == 0 {
                    info!("rotating indices: sent SIGHUP to searchd (pid {})", pid);
                } else {
                    warn!("rotate: failed to signal pid {}", pid);
                }
            }
        }
        Err(_) => warn!("rotate: bad pid file contents"),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if args.quiet {
            log::LevelFilter::Error
        } else {
            log::LevelFilter::Info
        })
        .init();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let names: Vec<String> = if args.all {
        let mut names: Vec<String> = config
            .indexes
            .iter()
            .filter(|(_, c)| c.kind != "distributed")
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    } else {
        args.indexes.clone()
    };

    if args.merge.is_some() {
        return match run_merge(&config, &args) {
            Ok(()) => {
                if args.rotate {
                    signal_searchd(&config);
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("merge failed: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    if args.buildstops.is_some() {
        return match run_buildstops(&config, &names, &args) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("buildstops failed: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    if names.is_empty() {
        error!("nothing to do: no indexes given (try --all)");
        return ExitCode::FAILURE;
    }

    // a failing index aborts itself only; the tool moves on
    let mut succeeded = 0usize;
    for name in &names {
        let Some(index) = config.indexes.get(name) else {
            error!("unknown index '{}', skipping", name);
            continue;
        };
        if index.kind == "distributed" {
            warn!("index '{}' is distributed, skipping", name);
            continue;
        }
        match build_one(&config, name, index, &args) {
            Ok(()) => succeeded += 1,
            Err(e) => error!("index '{}': {}", name, e),
        }
    }

    if succeeded > 0 && args.rotate {
        signal_searchd(&config);
    }
    if succeeded > 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
