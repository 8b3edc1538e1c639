use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use log::{error, info};
use simplelog::{Config, LevelFilter, WriteLogger};

use timetable_sync::category::Category;
use timetable_sync::panic_handler::initialize_panic_handler;
use timetable_sync::render::{DocumentDecoder, Region, RenderEngine, RenderError, RenderOptions};
use timetable_sync::settings;
use timetable_sync::sync::{
    DocumentCache, HttpTransferEngine, KeyValueConfig, RemoteConfig, StaticConfig, SyncParts,
    SyncResult, SyncStateMachine, SyncUpdate, TcpProbe, TransferCoordinator,
};

const LOG_FILENAME: &str = "timetable-sync.log";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file to use instead of the platform config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level regardless of settings
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring a category's document up to date
    Refresh {
        #[arg(short, long)]
        category: Option<Category>,
    },
    /// Select a category and refresh it
    Switch { category: Category },
    /// Render the cached document to a PNG file
    Render {
        #[arg(short, long)]
        category: Option<Category>,
        /// Output width before zoom, in pixels
        #[arg(long, default_value_t = 1240)]
        width: u32,
        #[arg(long, default_value_t = 1.0)]
        zoom: f32,
        /// Force dark mode on
        #[arg(long, conflicts_with = "light")]
        dark: bool,
        /// Force dark mode off
        #[arg(long)]
        light: bool,
        /// Render only x,y,w,h of the page laid out at `--scale`
        #[arg(long, value_parser = parse_region)]
        region: Option<Region>,
        /// Page scale the region is expressed in
        #[arg(long, default_value_t = 1.0, requires = "region")]
        scale: f32,
        #[arg(long, default_value_t = 1, requires = "region")]
        sample_size: u32,
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Show selection, results and cached files
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Delete cached documents
    Clear {
        #[arg(short, long)]
        category: Option<Category>,
    },
    /// Drop everything cached because the published documents changed
    ContentChanged,
    /// Persist the dark mode preference
    DarkMode {
        #[arg(action = ArgAction::Set)]
        enabled: bool,
    },
}

fn parse_region(value: &str) -> Result<Region, String> {
    let parts: Vec<u32> = value
        .split(',')
        .map(|part| part.trim().parse::<u32>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("expected x,y,w,h: {e}"))?;
    match parts.as_slice() {
        [x, y, w, h] => Ok(Region::new(*x, *y, *w, *h)),
        _ => Err(format!("expected 4 values, got {}", parts.len())),
    }
}

/// Stands in for the PDF decoder when built without the `pdf` feature.
#[cfg(not(feature = "pdf"))]
struct MissingDecoder;

#[cfg(not(feature = "pdf"))]
impl DocumentDecoder for MissingDecoder {
    fn open(
        &self,
        _path: &Path,
    ) -> Result<Box<dyn timetable_sync::render::PageDecoder>, timetable_sync::render::DecodeError>
    {
        Err(timetable_sync::render::DecodeError::generic(
            "built without the `pdf` feature",
        ))
    }
}

fn document_decoder() -> Arc<dyn DocumentDecoder> {
    #[cfg(feature = "pdf")]
    {
        Arc::new(timetable_sync::render::MupdfDecoder::new())
    }
    #[cfg(not(feature = "pdf"))]
    {
        Arc::new(MissingDecoder)
    }
}

fn config_service() -> Result<Arc<dyn KeyValueConfig>> {
    let documents: HashMap<String, String> = settings::get_documents().into_iter().collect();
    Ok(match settings::get_config_endpoint() {
        Some(endpoint) => Arc::new(
            RemoteConfig::new(endpoint, settings::get_min_fetch_interval())
                .context("Failed to create config client")?
                .with_defaults(documents),
        ),
        None => Arc::new(StaticConfig::new(documents)),
    })
}

fn build_machine(cache: DocumentCache) -> Result<SyncStateMachine> {
    let engine = Arc::new(HttpTransferEngine::new().context("Failed to create HTTP client")?);
    let renderer = Arc::new(RenderEngine::new(
        cache.clone(),
        document_decoder(),
        RenderOptions {
            max_pixels: settings::get_max_bitmap_pixels(),
            bitmap_cache_capacity: settings::get_bitmap_cache_capacity(),
        },
    ));

    Ok(SyncStateMachine::new(
        SyncParts {
            config: config_service()?,
            cache,
            transfers: TransferCoordinator::new(engine, settings::get_background_policy()),
            reachability: Arc::new(TcpProbe::new(settings::get_reachability_probe())),
            renderer,
        },
        settings::get_selected_category(),
    ))
}

fn describe(update: &SyncUpdate) -> String {
    match update.result {
        SyncResult::Loading {
            indeterminate: true,
            ..
        } => format!("{}: loading", update.category),
        SyncResult::Loading { progress, .. } => format!("{}: loading {progress}%", update.category),
        SyncResult::Success => format!("{}: up to date", update.category),
        SyncResult::Fail { reason } => format!("{}: failed ({reason:?})", update.category),
    }
}

/// Print published updates while `body` runs, then shut the machine down.
fn with_progress<T>(machine: &SyncStateMachine, body: impl FnOnce(&SyncStateMachine) -> T) -> T {
    let subscription = machine.subscribe();
    let printer = thread::spawn(move || {
        while let Some(update) = subscription.recv() {
            println!("{}", describe(&update));
        }
    });

    let result = body(machine);
    machine.shutdown();
    if printer.join().is_err() {
        error!("Progress printer panicked");
    }
    result
}

fn run(cli: Cli, cache: DocumentCache) -> Result<()> {
    match cli.command {
        Commands::Refresh { category } => {
            let category = category.unwrap_or_else(settings::get_selected_category);
            let machine = build_machine(cache)?;
            let result = with_progress(&machine, |m| {
                m.preload(category);
                m.refresh(category)
            });
            match result {
                Some(SyncResult::Fail { reason }) => bail!("Refresh of {category} failed: {reason:?}"),
                Some(_) | None => Ok(()),
            }
        }

        Commands::Switch { category } => {
            let machine = build_machine(cache)?;
            with_progress(&machine, |m| {
                if m.selected() == category {
                    m.refresh(category);
                } else {
                    m.switch_category(category);
                    m.join_background();
                }
            });
            settings::set_selected_category(category);
            Ok(())
        }

        Commands::Render {
            category,
            width,
            zoom,
            dark,
            light,
            region,
            scale,
            sample_size,
            out,
        } => {
            if !cfg!(feature = "pdf") {
                bail!("Rendering needs a build with the `pdf` feature");
            }
            let category = category.unwrap_or_else(settings::get_selected_category);
            let dark_mode = dark || (!light && settings::is_dark_mode());
            let machine = build_machine(cache)?;
            let renderer = machine.renderer();

            let rendered = match region {
                Some(region) => renderer.render_region(category, region, scale, sample_size, dark_mode),
                None => renderer.render_page(category, width, zoom, dark_mode),
            };
            let bitmap = match rendered {
                Ok(bitmap) => bitmap,
                Err(RenderError::NoCachedFile(category)) => {
                    bail!("Nothing cached for {category}; run `timetable-sync refresh` first")
                }
                Err(e) => return Err(e).context("Render failed"),
            };

            bitmap
                .save_png(&out)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!(
                "{}x{} {} -> {}",
                bitmap.width(),
                bitmap.height(),
                if dark_mode { "dark" } else { "light" },
                out.display()
            );
            Ok(())
        }

        Commands::Status { json } => {
            let machine = build_machine(cache)?;
            for category in Category::ALL {
                machine.preload(category);
            }
            let status = machine.status();
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                for entry in &status {
                    let marker = if entry.selected { "*" } else { " " };
                    let cached = match (&entry.cached_file, entry.cached_at) {
                        (Some(path), Some(at)) => format!("{} ({})", path.display(), at.to_rfc3339()),
                        (Some(path), None) => path.display().to_string(),
                        _ => "nothing cached".to_string(),
                    };
                    println!("{marker} {:<9} {:?}  {cached}", entry.category, entry.phase);
                }
            }
            Ok(())
        }

        Commands::Clear { category } => {
            match category {
                Some(category) => cache
                    .clear(category)
                    .with_context(|| format!("Failed to clear {category}"))?,
                None => cache.clear_all().context("Failed to clear cache")?,
            }
            println!("Cache cleared");
            Ok(())
        }

        Commands::ContentChanged => {
            let machine = build_machine(cache)?;
            with_progress(&machine, |m| {
                m.content_changed();
                m.join_background();
            });
            Ok(())
        }

        Commands::DarkMode { enabled } => {
            settings::set_dark_mode(enabled);
            println!("Dark mode {}", if enabled { "on" } else { "off" });
            Ok(())
        }
    }
}

fn init_logging(cache_root: &Path, verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        settings::get_log_level()
    };
    WriteLogger::init(
        level,
        Config::default(),
        File::create(cache_root.join(LOG_FILENAME))?,
    )?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.config {
        Some(path) => settings::load_settings_from(path),
        None => settings::load_settings(),
    }

    let cache_root = settings::get_cache_dir().context("Could not determine a cache directory")?;
    fs::create_dir_all(&cache_root)
        .with_context(|| format!("Failed to create {}", cache_root.display()))?;

    init_logging(&cache_root, cli.verbose)?;
    initialize_panic_handler();

    info!("Starting timetable-sync");
    let cache = DocumentCache::new(&cache_root).context("Failed to open document cache")?;
    let result = run(cli, cache);
    if let Err(e) = &result {
        error!("{e:?}");
    }
    info!("Shutting down timetable-sync");
    result
}
