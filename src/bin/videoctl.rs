#![forbid(unsafe_code)]

//! Operator CLI for the VideyLite catalog.
//!
//! Registers local files as videos, toggles publication and removes entries.
//! It talks to the same database and blob directory the server uses, so it
//! can run while the server is up.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use videylite::{
    blobs::{BlobStore, content_filename},
    catalog::{CatalogStore, NewVideo, Video, open_database, slugify},
    config::{RuntimeOverrides, resolve_runtime_settings},
    security::ensure_not_root,
    views::ViewLedger,
};

const DEFAULT_LOG_FILTER: &str = "videylite=info,videoctl=info";
const FALLBACK_VIDEO_MIME: &str = "video/mp4";
/// Container formats browsers can play through `/stream`.
const ALLOWED_VIDEO_MIMES: [&str; 4] = [
    "video/mp4",
    "video/webm",
    "video/x-matroska",
    "video/quicktime",
];
const RECENT_VIEWS_DAYS: i64 = 7;

#[derive(Parser, Debug)]
#[command(name = "videoctl", version, about = "Manage the VideyLite video catalog")]
struct Cli {
    /// Directory holding `videos/` and `catalog.db` (env: MEDIA_ROOT).
    #[arg(long, global = true)]
    media_root: Option<PathBuf>,
    /// Alternate `.env` file.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy a video file into the media root and register it.
    Add(AddArgs),
    /// Make a video visible.
    Publish { id: i64 },
    /// Hide a video from every public surface.
    Unpublish { id: i64 },
    /// List every video, published or not.
    List,
    /// Delete a video, its view log and (if unshared) its blob.
    Remove { id: i64 },
    /// Catalog totals and views counted over the last week.
    Stats,
}

#[derive(Args, Debug)]
struct AddArgs {
    file: PathBuf,
    #[arg(long)]
    title: String,
    /// Defaults to a slug of the title.
    #[arg(long)]
    slug: Option<String>,
    #[arg(long)]
    description: Option<String>,
    /// Comma separated.
    #[arg(long)]
    tags: Option<String>,
    /// Defaults to a guess from the file extension.
    #[arg(long)]
    mime: Option<String>,
    /// Register without publishing.
    #[arg(long)]
    unpublished: bool,
}

struct Catalog {
    store: CatalogStore,
    ledger: ViewLedger,
    blobs: BlobStore,
    max_upload_bytes: u64,
}

#[derive(Debug, PartialEq, Eq)]
struct Stats {
    videos: u64,
    published: u64,
    views: u64,
    recent_views: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    ensure_not_root("videoctl")?;

    let settings = resolve_runtime_settings(RuntimeOverrides {
        media_root: cli.media_root,
        env_path: cli.env_file,
        ..RuntimeOverrides::default()
    })?;
    let conn = open_database(&settings.catalog_path()).await?;
    let catalog = Catalog {
        store: CatalogStore::new(conn.clone()),
        ledger: ViewLedger::new(conn),
        blobs: BlobStore::new(settings.videos_dir()),
        max_upload_bytes: settings.max_upload_bytes(),
    };

    match cli.command {
        Command::Add(args) => {
            let video = catalog.add(args).await?;
            println!("added {} ({}) as /stream/{}", video.slug, video.title, video.id);
        }
        Command::Publish { id } => catalog.set_published(id, true).await?,
        Command::Unpublish { id } => catalog.set_published(id, false).await?,
        Command::List => {
            for video in catalog.store.list_all().await? {
                println!("{}", format_row(&video));
            }
        }
        Command::Remove { id } => {
            let video = catalog.remove(id).await?;
            println!("removed {} ({})", video.id, video.slug);
        }
        Command::Stats => {
            let stats = catalog.stats().await?;
            println!("videos:        {}", stats.videos);
            println!("published:     {}", stats.published);
            println!("total views:   {}", stats.views);
            println!("views ({RECENT_VIEWS_DAYS} days): {}", stats.recent_views);
        }
    }
    Ok(())
}

impl Catalog {
    async fn add(&self, args: AddArgs) -> Result<Video> {
        let source = args.file;
        if !source.is_file() {
            bail!("{} is not a regular file", source.display());
        }
        let title = args.title.trim();
        if title.is_empty() {
            bail!("--title must not be empty");
        }

        let mime = args
            .mime
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| guess_mime(&source));
        if !ALLOWED_VIDEO_MIMES.contains(&mime.as_str()) {
            bail!(
                "unsupported video format {mime}; expected one of {}",
                ALLOWED_VIDEO_MIMES.join(", ")
            );
        }
        let source_size = std::fs::metadata(&source)
            .with_context(|| format!("reading {}", source.display()))?
            .len();
        if source_size > self.max_upload_bytes {
            bail!(
                "{} is {source_size} bytes, over the {} byte limit (MAX_UPLOAD_MB)",
                source.display(),
                self.max_upload_bytes
            );
        }

        let base_slug = slugify(args.slug.as_deref().unwrap_or(title));
        let slug = self.store.unique_slug(&base_slug).await?;
        let filename = content_filename(&source)?;
        let size = self
            .blobs
            .import(&source, &filename)
            .with_context(|| format!("importing {}", source.display()))?;

        let new_video = NewVideo {
            title: title.to_string(),
            slug,
            description: args.description.filter(|value| !value.trim().is_empty()),
            tags: args.tags.filter(|value| !value.trim().is_empty()),
            filename,
            mime,
            size_bytes: i64::try_from(size).context("file too large")?,
            is_published: !args.unpublished,
        };
        let video = match self.store.insert_video(&new_video).await {
            Ok(video) => video,
            Err(err) => {
                self.discard_blob(&new_video.filename).await;
                return Err(err);
            }
        };
        info!(id = video.id, slug = %video.slug, size, "video registered");
        Ok(video)
    }

    /// Drops a freshly imported blob after a failed insert, unless an older
    /// row already points at the same content.
    async fn discard_blob(&self, filename: &str) {
        match self.store.filename_in_use(filename).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(err) = self.blobs.remove(filename) {
                    warn!(filename, error = %format!("{err:#}"), "failed to remove orphaned blob");
                }
            }
            Err(err) => {
                warn!(filename, error = %format!("{err:#}"), "could not check blob references");
            }
        }
    }

    async fn stats(&self) -> Result<Stats> {
        let totals = self.store.totals().await?;
        let recent_views = self
            .ledger
            .count_since(Utc::now() - Duration::days(RECENT_VIEWS_DAYS))
            .await?;
        Ok(Stats {
            videos: totals.videos,
            published: totals.published,
            views: totals.views,
            recent_views,
        })
    }

    async fn set_published(&self, id: i64, published: bool) -> Result<()> {
        if !self.store.set_published(id, published).await? {
            bail!("video {id} not found");
        }
        info!(id, published, "publication updated");
        Ok(())
    }

    async fn remove(&self, id: i64) -> Result<Video> {
        let video = self
            .store
            .delete_video(id)
            .await?
            .with_context(|| format!("video {id} not found"))?;
        if self.store.filename_in_use(&video.filename).await? {
            info!(id, filename = %video.filename, "blob shared with another video; kept");
        } else if !self.blobs.remove(&video.filename)? {
            warn!(id, filename = %video.filename, "blob was already missing");
        }
        Ok(video)
    }
}

fn guess_mime(path: &Path) -> String {
    mime_guess::from_path(path)
        .first()
        .map(|mime| mime.essence_str().to_string())
        .unwrap_or_else(|| FALLBACK_VIDEO_MIME.to_string())
}

fn format_row(video: &Video) -> String {
    let mut row = format!(
        "{:>5}  {:<11}  {:>8}  {:<16}  {}  ({})",
        video.id,
        if video.is_published { "published" } else { "unpublished" },
        video.views,
        video.mime,
        video.slug,
        video.title,
    );
    let tags = video.tag_list();
    if !tags.is_empty() {
        row.push_str(&format!("  [{}]", tags.join(", ")));
    }
    row
}
